//! Text row returned by queries

use std::ops::Deref;

use crate::error::{Error, Result};

/// A single result tuple.
///
/// Fields are text and addressed by position, in the order of the
/// `SELECT` / `RETURNING` clause. SQL NULL reads as the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Row {
    fields: Vec<String>,
}

impl Row {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }

    /// Get a field by position.
    pub fn get(&self, index: usize) -> Result<&str> {
        self.fields
            .get(index)
            .map(String::as_str)
            .ok_or(Error::FieldOutOfRange)
    }

    pub fn into_fields(self) -> Vec<String> {
        self.fields
    }
}

impl Deref for Row {
    type Target = [String];

    fn deref(&self) -> &[String] {
        &self.fields
    }
}

impl From<Vec<String>> for Row {
    fn from(fields: Vec<String>) -> Self {
        Self::new(fields)
    }
}

impl FromIterator<String> for Row {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<const N: usize> PartialEq<[&str; N]> for Row {
    fn eq(&self, other: &[&str; N]) -> bool {
        self.fields.len() == N && self.fields.iter().zip(other).all(|(a, b)| a == b)
    }
}

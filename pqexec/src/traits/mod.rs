//! Core traits for pqexec

mod queryable;
mod transaction;

pub use queryable::Queryable;
pub use transaction::{IsolationLevel, Transactional};

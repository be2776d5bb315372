//! Cooperative query execution on a blocking native client

use tracing::trace;

use crate::driver::{NativeClient, NativeResult};
use crate::error::{Error, Result};

/// Send `query` and wait for it to finish without blocking the scheduler.
///
/// The result cursor is always drained to the end so the client is ready for
/// the next query. When a query produces several results the first error
/// result is returned, otherwise the last one.
pub(crate) async fn execute(
    client: &mut dyn NativeClient,
    query: &str,
    params: &[&str],
) -> Result<Box<dyn NativeResult>> {
    client.send_query(query, params)?;
    flush(client).await?;

    let mut failed: Option<Box<dyn NativeResult>> = None;
    let mut last: Option<Box<dyn NativeResult>> = None;
    let mut polls = 0usize;

    while let Some(result) = next_result(client, &mut polls).await? {
        if failed.is_none() && result.status().is_error() {
            failed = Some(result);
        } else {
            last = Some(result);
        }
    }

    trace!(polls, "query drained");

    failed
        .or(last)
        .ok_or_else(|| Error::ResultError(format!("no result returned for query {query:?}")))
}

/// Wait until the whole query has been written. A large query or parameter
/// set may not fit in the socket buffer in one go.
async fn flush(client: &mut dyn NativeClient) -> Result<()> {
    let mut polls = 0usize;
    while !client.flush()? {
        // The server may be waiting for us to read before it accepts more.
        client.consume_input()?;
        polls += 1;
        tokio::task::yield_now().await;
    }
    if polls > 0 {
        trace!(polls, "query flushed");
    }
    Ok(())
}

async fn next_result(
    client: &mut dyn NativeClient,
    polls: &mut usize,
) -> Result<Option<Box<dyn NativeResult>>> {
    loop {
        client.consume_input()?;
        if !client.is_busy() {
            return Ok(client.get_result());
        }
        *polls += 1;
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::MemoryDriver;
    use crate::driver::{Driver, ExecStatus, NativeError};

    #[tokio::test]
    async fn test_execute_waits_out_latency() {
        let driver = MemoryDriver::new().with_latency(5);
        let mut client = driver.connect("memory").unwrap();

        let result = execute(client.as_mut(), "SELECT $1, 'b'", &["a"]).await.unwrap();
        assert_eq!(result.status(), ExecStatus::TuplesOk);
        assert_eq!(result.get_value(0, 0).unwrap(), "a");
        assert_eq!(result.get_value(0, 1).unwrap(), "b");
        assert_eq!(driver.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_execute_leaves_client_reusable() {
        let driver = MemoryDriver::new().with_latency(1);
        let mut client = driver.connect("memory").unwrap();

        execute(client.as_mut(), "CREATE TABLE t (id int)", &[])
            .await
            .unwrap();
        let result = execute(client.as_mut(), "SELECT COUNT(*) FROM t", &[])
            .await
            .unwrap();
        assert_eq!(result.get_value(0, 0).unwrap(), "0");
    }

    #[tokio::test]
    async fn test_execute_error_result() {
        let driver = MemoryDriver::new();
        let mut client = driver.connect("memory").unwrap();

        let result = execute(client.as_mut(), "SELECT * FROM missing", &[])
            .await
            .unwrap();
        assert_eq!(result.status(), ExecStatus::FatalError);
        assert!(result.error_message().contains("does not exist"));
    }

    /// Reports a would-block flush a fixed number of times.
    struct SlowWriter {
        inner: Box<dyn NativeClient>,
        pending: usize,
        flushes: usize,
    }

    impl NativeClient for SlowWriter {
        fn send_query(
            &mut self,
            query: &str,
            params: &[&str],
        ) -> std::result::Result<(), NativeError> {
            self.inner.send_query(query, params)
        }

        fn flush(&mut self) -> std::result::Result<bool, NativeError> {
            self.flushes += 1;
            if self.pending == 0 {
                return Ok(true);
            }
            self.pending -= 1;
            Ok(false)
        }

        fn consume_input(&mut self) -> std::result::Result<(), NativeError> {
            self.inner.consume_input()
        }

        fn is_busy(&self) -> bool {
            self.inner.is_busy()
        }

        fn get_result(&mut self) -> Option<Box<dyn NativeResult>> {
            self.inner.get_result()
        }

        fn finish(self: Box<Self>) {
            self.inner.finish()
        }
    }

    #[tokio::test]
    async fn test_execute_flushes_until_sent() {
        let driver = MemoryDriver::new();
        let mut client = SlowWriter {
            inner: driver.connect("memory").unwrap(),
            pending: 3,
            flushes: 0,
        };

        let result = execute(&mut client, "SELECT $1", &["x"]).await.unwrap();
        assert_eq!(result.get_value(0, 0).unwrap(), "x");
        assert_eq!(client.flushes, 4);
    }

    #[tokio::test]
    async fn test_execute_flush_failure() {
        struct Severed(Box<dyn NativeClient>);

        impl NativeClient for Severed {
            fn send_query(
            &mut self,
            query: &str,
            params: &[&str],
        ) -> std::result::Result<(), NativeError> {
                self.0.send_query(query, params)
            }

            fn flush(&mut self) -> std::result::Result<bool, NativeError> {
                Err(NativeError::ConnectionFailure("server closed the connection".into()))
            }

            fn consume_input(&mut self) -> std::result::Result<(), NativeError> {
                self.0.consume_input()
            }

            fn is_busy(&self) -> bool {
                self.0.is_busy()
            }

            fn get_result(&mut self) -> Option<Box<dyn NativeResult>> {
                self.0.get_result()
            }

            fn finish(self: Box<Self>) {
                self.0.finish()
            }
        }

        let driver = MemoryDriver::new();
        let mut client = Severed(driver.connect("memory").unwrap());
        let err = execute(&mut client, "SELECT 1", &[]).await.err();
        assert!(matches!(err, Some(Error::ConnectionFailure(_))));
    }

    #[tokio::test]
    async fn test_execute_send_failure() {
        let driver = MemoryDriver::new();
        let mut client = driver.connect("memory").unwrap();
        driver.break_connections();

        let err = execute(client.as_mut(), "SELECT 1", &[]).await.err();
        assert!(matches!(err, Some(Error::ConnectionFailure(_))));
    }
}

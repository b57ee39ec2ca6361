//! The SQL execution port.
//!
//! The gateway never talks to the columnar store directly; everything goes
//! through this trait. The production implementation wraps the database
//! client and its connection pool, tests plug in canned or deliberately
//! slow doubles.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use lumber_common::Result;
use lumber_query::QueryResultRow;

#[async_trait]
pub trait DatabasePort: Send + Sync {
    /// Executes one rendered SELECT and returns its rows. Implementations
    /// are expected to abort within their own timeout once `cancel` fires.
    async fn query_rows(&self, sql: &str, cancel: &CancellationToken) -> Result<Vec<QueryResultRow>>;

    /// `SELECT count(*)` over one table.
    async fn count(&self, table: &str, cancel: &CancellationToken) -> Result<i64>;
}

#[cfg(test)]
pub mod testing {
    //! Port doubles for tests.

    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use lumber_common::Error;

    /// Serves canned rows keyed by an SQL substring, so answers stay
    /// correct however jobs interleave. Records every statement it sees.
    pub struct CannedPort {
        responses: Mutex<Vec<(String, Vec<QueryResultRow>)>>,
        pub seen_sql: Mutex<Vec<String>>,
        pub count_value: i64,
    }

    impl CannedPort {
        pub fn new(responses: Vec<(&str, Vec<QueryResultRow>)>) -> Self {
            Self {
                responses: Mutex::new(
                    responses.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
                ),
                seen_sql: Mutex::new(Vec::new()),
                count_value: 0,
            }
        }
    }

    #[async_trait]
    impl DatabasePort for CannedPort {
        async fn query_rows(
            &self,
            sql: &str,
            _cancel: &CancellationToken,
        ) -> Result<Vec<QueryResultRow>> {
            self.seen_sql.lock().unwrap().push(sql.to_string());
            let mut responses = self.responses.lock().unwrap();
            match responses.iter().position(|(key, _)| sql.contains(key.as_str())) {
                Some(i) => Ok(responses.remove(i).1),
                None => Ok(Vec::new()),
            }
        }

        async fn count(&self, _table: &str, _cancel: &CancellationToken) -> Result<i64> {
            Ok(self.count_value)
        }
    }

    /// Sleeps before answering; cancellation wins the race.
    pub struct SlowPort {
        pub delay: Duration,
        pub rows: Vec<QueryResultRow>,
    }

    #[async_trait]
    impl DatabasePort for SlowPort {
        async fn query_rows(
            &self,
            _sql: &str,
            cancel: &CancellationToken,
        ) -> Result<Vec<QueryResultRow>> {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => Ok(self.rows.clone()),
                _ = cancel.cancelled() => {
                    Err(Error::Database("query cancelled".to_string()))
                }
            }
        }

        async fn count(&self, _table: &str, cancel: &CancellationToken) -> Result<i64> {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => Ok(0),
                _ = cancel.cancelled() => Err(Error::Database("query cancelled".to_string())),
            }
        }
    }

    /// Always fails; used for sibling-cancellation tests.
    pub struct FailingPort;

    #[async_trait]
    impl DatabasePort for FailingPort {
        async fn query_rows(
            &self,
            _sql: &str,
            _cancel: &CancellationToken,
        ) -> Result<Vec<QueryResultRow>> {
            Err(Error::Database("boom".to_string()))
        }

        async fn count(&self, _table: &str, _cancel: &CancellationToken) -> Result<i64> {
            Err(Error::Database("boom".to_string()))
        }
    }
}

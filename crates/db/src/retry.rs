use std::{future::Future, time::Duration};

use crate::store::StoreError;

const MAX_RETRIES: usize = 3;
const INITIAL_BACKOFF_MS: u64 = 50;
const MAX_BACKOFF_MS: u64 = 1_000;

pub(crate) async fn retry_on_sqlite_busy<T, F, Fut>(mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut backoff = Duration::from_millis(INITIAL_BACKOFF_MS);
    for attempt in 0..=MAX_RETRIES {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_sqlite_busy(&err) && attempt < MAX_RETRIES => {
                tracing::debug!(attempt, backoff_ms = backoff.as_millis() as u64, "SQLite busy; retrying");
                tokio::time::sleep(backoff).await;
                let next_ms = (backoff.as_millis() as u64)
                    .saturating_mul(2)
                    .min(MAX_BACKOFF_MS);
                backoff = Duration::from_millis(next_ms);
            }
            Err(err) => return Err(err),
        }
    }

    unreachable!("retry loop returns on success or error")
}

fn is_sqlite_busy(err: &StoreError) -> bool {
    let StoreError::Database(db_err) = err else {
        return false;
    };

    let message = db_err.to_string();
    message.contains("database is locked")
        || message.contains("database is busy")
        || message.contains("(code: 5)")
        || message.contains("(code: 6)")
}

use common::RetrySettings;
use sql_client::{ClientError, SqlErrorKind};
use std::thread;

use crate::progress::{ProgressEvent, ProgressManager, ProgressState};

/// Connection class 08, timeout HYT00/HYT01, concurrency class 40, and
/// SQLite's "database is locked" are transient; everything else (syntax
/// errors, constraint violations, missing objects, ...) is fatal. Spec §4.2.
pub fn is_transient(err: &ClientError) -> bool {
    matches!(err.kind(), SqlErrorKind::Connection | SqlErrorKind::Timeout | SqlErrorKind::Concurrency | SqlErrorKind::Locked)
}

/// Retries `func` on transient errors with exponential backoff, reporting
/// each retry as a Warning progress event. Reattempts at most `max_retries`
/// times beyond the first call (spec §8.7: at most `maxRetries + 1`
/// invocations total).
pub fn retry_on_transient_error<T>(
    mut func: impl FnMut() -> Result<T, ClientError>,
    settings: &RetrySettings,
    progress: &dyn ProgressManager,
    operation: &str,
) -> Result<T, ClientError> {
    let mut attempts = 0u32;
    loop {
        match func() {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_transient(&err) || attempts >= settings.max_retries {
                    return Err(err);
                }
                progress.update(ProgressEvent {
                    state: ProgressState::Warning,
                    table_name: operation.to_string(),
                    current_rows: 0,
                    total_rows: None,
                    message: format!("Transient error, retry {}/{}: {err}", attempts + 1, settings.max_retries),
                });
                thread::sleep(settings.delay_for_attempt(attempts));
                attempts += 1;
            }
        }
    }
}

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{ApiError, ExternalAction};

/// Invoke one remote operation and normalize its outcome.
///
/// `action` only tags diagnostics. Every failure is returned to the caller
/// unchanged; `tolerates_missing` merely demotes a 404 from a warning to a
/// debug log, since the caller may be waiting for exactly that. No retries
/// happen here.
pub async fn call_external_action<T, Fut>(action: ExternalAction, call: Fut, tolerates_missing: bool) -> Result<T, ApiError>
where
    Fut: Future<Output = Result<T, ApiError>>,
{
    debug!(%action, "calling external action");
    let (result, elapsed) = timed(call).await;
    let elapsed_ms = elapsed.as_millis() as u64;
    match &result {
        Ok(_) => debug!(%action, elapsed_ms, "external action succeeded"),
        Err(error) if tolerates_missing && error.is_not_found() => {
            debug!(%action, elapsed_ms, "external action found no resource (tolerated)")
        }
        Err(error) => warn!(%action, elapsed_ms, %error, "external action failed"),
    }
    result
}

/// Await `fut` and report how long it took on the runtime clock.
pub async fn timed<F: Future>(fut: F) -> (F::Output, Duration) {
    let started = Instant::now();
    let output = fut.await;
    (output, started.elapsed())
}

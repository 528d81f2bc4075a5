use std::sync::Arc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::dispatch::call_external_action;
use crate::config::RuntimeConfig;
use crate::providers::{DiskApi, UiState};
use crate::{ApiDiskAttachment, ApiError, DiskAttachmentQuery, DiskStatus, ExternalAction};

/// Result of one `disk_attachment` fetch, as seen by predicates.
pub type FetchResult = Result<ApiDiskAttachment, ApiError>;

/// How a poll loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The predicate matched on the `attempts`-th fetch.
    Converged { attempts: u32 },
    /// `max_attempts` fetches were made without a match.
    AttemptsExhausted { attempts: u32 },
    /// `max_duration` elapsed without a match.
    TimedOut { attempts: u32 },
    /// The owning task was cancelled.
    Cancelled { attempts: u32 },
}

impl PollOutcome {
    pub fn is_converged(&self) -> bool {
        matches!(self, PollOutcome::Converged { .. })
    }

    pub fn attempts(&self) -> u32 {
        match *self {
            PollOutcome::Converged { attempts }
            | PollOutcome::AttemptsExhausted { attempts }
            | PollOutcome::TimedOut { attempts }
            | PollOutcome::Cancelled { attempts } => attempts,
        }
    }
}

/// Disk payload present with a status other than `locked`.
pub fn is_unlocked(result: &FetchResult) -> bool {
    match result {
        Ok(attachment) => attachment
            .disk
            .as_ref()
            .and_then(|d| d.status)
            .is_some_and(|s| s != DiskStatus::Locked),
        Err(_) => false,
    }
}

/// The fetch failed with a not-found status, i.e. the resource is gone.
pub fn is_not_found(result: &FetchResult) -> bool {
    matches!(result, Err(e) if e.is_not_found())
}

/// Repeatedly fetches one attachment until a predicate matches.
///
/// Every successful fetch is translated and pushed to the UI state store
/// before the predicate runs, so observers stay current while the loop waits.
/// Fetch errors never end the loop by themselves; they are handed to the
/// predicate like any other result.
#[derive(Clone)]
pub struct PollEngine {
    api: Arc<dyn DiskApi>,
    ui: Arc<dyn UiState>,
    config: RuntimeConfig,
}

impl PollEngine {
    pub fn new(api: Arc<dyn DiskApi>, ui: Arc<dyn UiState>, config: RuntimeConfig) -> Self {
        Self { api, ui, config }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub async fn poll_until<P>(
        &self,
        query: &DiskAttachmentQuery,
        mut predicate: P,
        tolerates_missing: bool,
        cancel: &CancellationToken,
    ) -> PollOutcome
    where
        P: FnMut(&FetchResult) -> bool,
    {
        let mut backoff = Backoff::new(&self.config.backoff);
        let deadline = self.config.poll.max_duration().map(|d| Instant::now() + d);
        let max_attempts = self.config.poll.max_attempts;
        let mut attempts = 0u32;

        loop {
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.abandoned(query, PollOutcome::Cancelled { attempts }),
                _ = until_deadline(deadline) => return self.abandoned(query, PollOutcome::TimedOut { attempts }),
                r = call_external_action(
                    ExternalAction::DiskAttachment,
                    self.api.disk_attachment(query),
                    tolerates_missing,
                ) => r,
            };
            attempts += 1;

            if let Ok(attachment) = &fetched
                && let Some(vm_id) = &query.vm_id
            {
                let disk = self.api.attachment_to_internal(attachment);
                self.ui.notify_disk_updated(vm_id, disk);
            }

            if predicate(&fetched) {
                info!(
                    attachment_id = %query.attachment_id,
                    vm_id = ?query.vm_id,
                    attempts,
                    "disk attachment converged"
                );
                return PollOutcome::Converged { attempts };
            }

            if max_attempts.is_some_and(|max| attempts >= max) {
                return self.abandoned(query, PollOutcome::AttemptsExhausted { attempts });
            }
            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                return self.abandoned(query, PollOutcome::TimedOut { attempts });
            }

            let delay = backoff.next_delay();
            let wake_at = match deadline {
                Some(d) => (now + delay).min(d),
                None => now + delay,
            };
            debug!(
                attachment_id = %query.attachment_id,
                attempts,
                delay_ms = delay.as_millis() as u64,
                "disk attachment not converged; waiting"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.abandoned(query, PollOutcome::Cancelled { attempts }),
                _ = sleep_until(wake_at) => {}
            }
        }
    }

    fn abandoned(&self, query: &DiskAttachmentQuery, outcome: PollOutcome) -> PollOutcome {
        warn!(
            attachment_id = %query.attachment_id,
            vm_id = ?query.vm_id,
            ?outcome,
            "stopped waiting for disk attachment"
        );
        outcome
    }
}

// Never resolves without a deadline.
async fn until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => std::future::pending().await,
    }
}

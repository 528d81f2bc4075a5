use std::sync::Arc;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span};

use crate::config::RuntimeConfig;
use crate::providers::{DiskApi, UiState};
use crate::{
    ApiError, CreateDiskRequest, Disk, DiskAction, DiskAttachmentQuery, EditableDisk, ExternalAction, NewDisk,
    RemoveDiskRequest, UpdateDiskAttachmentRequest,
};

pub mod backoff;
pub mod dispatch;
pub mod poll;
pub mod registry;

use dispatch::call_external_action;
use poll::{PollEngine, PollOutcome};
use registry::PendingTaskRegistry;

/// How a flow ended. Flows never fail outward; every remote error is
/// recovered inside the flow and reported here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowOutcome {
    /// The mutation was accepted and the disk reached the awaited state.
    Converged,
    /// The mutation itself was rejected; nothing was polled.
    MutationFailed(ApiError),
    /// The mutation was accepted but polling stopped before convergence.
    Abandoned(PollOutcome),
    /// The flow task went away without reporting (aborted or panicked).
    Aborted,
}

impl From<PollOutcome> for FlowOutcome {
    fn from(outcome: PollOutcome) -> Self {
        if outcome.is_converged() {
            FlowOutcome::Converged
        } else {
            FlowOutcome::Abandoned(outcome)
        }
    }
}

/// Handle to a flow started with `DiskRuntime::dispatch`.
pub struct FlowHandle {
    action: &'static str,
    cancel: CancellationToken,
    outcome: oneshot::Receiver<FlowOutcome>,
}

impl FlowHandle {
    pub fn action(&self) -> &'static str {
        self.action
    }

    /// Stop the flow at its next suspension point. A removal still clears its
    /// pending marker.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) -> FlowOutcome {
        self.outcome.await.unwrap_or(FlowOutcome::Aborted)
    }
}

/// Runs disk lifecycle flows against a `DiskApi`, reporting to a `UiState`.
///
/// One runtime corresponds to one client session: flows spawned through
/// `dispatch` are children of the session and are all cancelled by
/// `shutdown`.
pub struct DiskRuntime {
    api: Arc<dyn DiskApi>,
    ui: Arc<dyn UiState>,
    pending: PendingTaskRegistry,
    engine: PollEngine,
    session: CancellationToken,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl DiskRuntime {
    /// Start a runtime with a fresh pending-task registry.
    pub fn start(api: Arc<dyn DiskApi>, ui: Arc<dyn UiState>, config: RuntimeConfig) -> Arc<Self> {
        Self::start_with_registry(api, ui, PendingTaskRegistry::new(), config)
    }

    /// Start a runtime sharing a caller-owned registry, e.g. one the UI also reads.
    pub fn start_with_registry(
        api: Arc<dyn DiskApi>,
        ui: Arc<dyn UiState>,
        pending: PendingTaskRegistry,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        // Default subscriber; no-op when one is already installed
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        let engine = PollEngine::new(api.clone(), ui.clone(), config);
        Arc::new(Self {
            api,
            ui,
            pending,
            engine,
            session: CancellationToken::new(),
            joins: Mutex::new(Vec::new()),
        })
    }

    pub fn pending_tasks(&self) -> &PendingTaskRegistry {
        &self.pending
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.engine.config()
    }

    /// Spawn the flow handling `action` as an independent task.
    pub async fn dispatch(self: &Arc<Self>, action: DiskAction) -> FlowHandle {
        let name = action.name();
        let cancel = self.session.child_token();
        let (tx, rx) = oneshot::channel();
        let rt = self.clone();
        let token = cancel.clone();
        let span = info_span!("disk_flow", action = name);
        let handle = tokio::spawn(
            async move {
                let outcome = rt.run(action, &token).await;
                let _ = tx.send(outcome);
            }
            .instrument(span),
        );
        let mut joins = self.joins.lock().await;
        joins.retain(|h| !h.is_finished());
        joins.push(handle);
        FlowHandle {
            action: name,
            cancel,
            outcome: rx,
        }
    }

    /// Run the flow handling `action` on the current task.
    pub async fn run(&self, action: DiskAction, cancel: &CancellationToken) -> FlowOutcome {
        debug!(action = action.name(), "running disk flow");
        match action {
            DiskAction::CreateDiskForVm { vm_id, disk } => self.create_disk_for_vm(&vm_id, disk, cancel).await,
            DiskAction::RemoveDisk {
                disk_id,
                vm_to_refresh_id,
            } => self.remove_disk(&disk_id, vm_to_refresh_id.as_deref(), cancel).await,
            DiskAction::EditVmDisk { vm_id, disk } => self.edit_disk_on_vm(&vm_id, &disk, cancel).await,
        }
    }

    /// Create a disk on `vm_id` and wait until the backend unlocks it.
    ///
    /// The only flow that reports failures to the user: a rejected create
    /// sets the dialog error text. The in-progress indicator is cleared on
    /// every path.
    pub async fn create_disk_for_vm(&self, vm_id: &str, disk: NewDisk, cancel: &CancellationToken) -> FlowOutcome {
        self.ui.set_in_progress(true);
        let request = CreateDiskRequest {
            vm_id: vm_id.to_string(),
            disk,
        };
        let outcome = match call_external_action(
            ExternalAction::AddDiskAttachment,
            self.api.add_disk_attachment(&request),
            false,
        )
        .await
        {
            Err(error) => {
                let text = self.ui.extract_error_text(&error);
                self.ui.set_error_text(text);
                FlowOutcome::MutationFailed(error)
            }
            Ok(created) => {
                info!(vm_id, attachment_id = %created.attachment_id, "disk created; waiting for unlock");
                self.refresh_vm(vm_id).await;
                let polled = self
                    .wait_for_disk_to_be_unlocked(Some(vm_id), &created.attachment_id, cancel)
                    .await;
                if !matches!(polled, PollOutcome::Cancelled { .. }) {
                    self.ui.set_done();
                }
                polled.into()
            }
        };
        self.ui.set_in_progress(false);
        outcome
    }

    /// Remove a disk and wait until the backend no longer knows it.
    ///
    /// A rejected removal is dropped silently here. While waiting, the disk id
    /// is held in the pending-task registry.
    pub async fn remove_disk(
        &self,
        disk_id: &str,
        vm_to_refresh_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> FlowOutcome {
        let request = RemoveDiskRequest {
            disk_id: disk_id.to_string(),
        };
        if let Err(error) = call_external_action(ExternalAction::RemoveDisk, self.api.remove_disk(&request), false).await
        {
            return FlowOutcome::MutationFailed(error);
        }

        let pending = self.pending.hold_removal(disk_id);
        let query = DiskAttachmentQuery {
            vm_id: vm_to_refresh_id.map(str::to_string),
            attachment_id: disk_id.to_string(),
        };
        let polled = self.engine.poll_until(&query, poll::is_not_found, true, cancel).await;
        pending.release();

        if polled.is_converged()
            && let Some(vm_id) = vm_to_refresh_id
        {
            self.refresh_vm(vm_id).await;
        }
        polled.into()
    }

    /// Rename or resize a disk on `vm_id`.
    ///
    /// Only the `EditableDisk` fields of `disk` are sent. A rejected update is
    /// dropped silently here.
    pub async fn edit_disk_on_vm(&self, vm_id: &str, disk: &Disk, cancel: &CancellationToken) -> FlowOutcome {
        let request = UpdateDiskAttachmentRequest {
            vm_id: vm_id.to_string(),
            disk: EditableDisk::from(disk),
        };
        if let Err(error) = call_external_action(
            ExternalAction::UpdateDiskAttachment,
            self.api.update_disk_attachment(&request),
            false,
        )
        .await
        {
            return FlowOutcome::MutationFailed(error);
        }

        let polled = self
            .wait_for_disk_to_be_unlocked(Some(vm_id), &request.disk.attachment_id, cancel)
            .await;
        if !matches!(polled, PollOutcome::Cancelled { .. }) {
            self.refresh_vm(vm_id).await;
        }
        polled.into()
    }

    async fn wait_for_disk_to_be_unlocked(
        &self,
        vm_id: Option<&str>,
        attachment_id: &str,
        cancel: &CancellationToken,
    ) -> PollOutcome {
        let query = DiskAttachmentQuery {
            vm_id: vm_id.map(str::to_string),
            attachment_id: attachment_id.to_string(),
        };
        self.engine.poll_until(&query, poll::is_unlocked, false, cancel).await
    }

    async fn refresh_vm(&self, vm_id: &str) {
        self.ui.request_collection_refresh(&[vm_id.to_string()]).await;
    }

    /// Cancel every dispatched flow and wait for them to finish.
    pub async fn shutdown(&self) {
        self.session.cancel();
        let joins: Vec<JoinHandle<()>> = std::mem::take(&mut *self.joins.lock().await);
        for j in joins {
            let _ = j.await;
        }
    }
}

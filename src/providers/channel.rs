use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::{UiEvent, UiState};
use crate::Disk;

/// `UiState` that forwards every signal as a `UiEvent` onto an unbounded
/// channel consumed by the state store. Sends to a closed channel are dropped.
#[derive(Clone)]
pub struct ChannelUiState {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl ChannelUiState {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn from_sender(tx: mpsc::UnboundedSender<UiEvent>) -> Self {
        Self { tx }
    }

    fn emit(&self, event: UiEvent) {
        if self.tx.send(event).is_err() {
            debug!("ui event receiver closed; dropping event");
        }
    }
}

#[async_trait]
impl UiState for ChannelUiState {
    fn notify_disk_updated(&self, vm_id: &str, disk: Disk) {
        self.emit(UiEvent::DiskUpdated {
            vm_id: vm_id.to_string(),
            disk,
        });
    }

    async fn request_collection_refresh(&self, vm_ids: &[String]) {
        self.emit(UiEvent::RefreshRequested {
            vm_ids: vm_ids.to_vec(),
        });
    }

    fn set_in_progress(&self, in_progress: bool) {
        self.emit(UiEvent::InProgress(in_progress));
    }

    fn set_error_text(&self, text: String) {
        self.emit(UiEvent::ErrorText(text));
    }

    fn set_done(&self) {
        self.emit(UiEvent::Done);
    }
}

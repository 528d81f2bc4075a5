use async_trait::async_trait;

use crate::{
    AddDiskAttachmentResponse, ApiDiskAttachment, ApiError, CreateDiskRequest, Disk, DiskAttachmentQuery,
    RemoveDiskRequest, UpdateDiskAttachmentRequest,
};

pub mod channel;
pub mod in_memory;

/// Client of the disk management API. Mutations return once the backend has
/// accepted them; convergence is observed through `disk_attachment`.
#[async_trait]
pub trait DiskApi: Send + Sync {
    /// Create a disk and attach it to a VM.
    async fn add_disk_attachment(&self, request: &CreateDiskRequest) -> Result<AddDiskAttachmentResponse, ApiError>;

    async fn remove_disk(&self, request: &RemoveDiskRequest) -> Result<(), ApiError>;

    async fn update_disk_attachment(&self, request: &UpdateDiskAttachmentRequest) -> Result<(), ApiError>;

    /// Fetch one attachment together with its disk payload.
    async fn disk_attachment(&self, query: &DiskAttachmentQuery) -> Result<ApiDiskAttachment, ApiError>;

    /// Translate an attachment response into the internal disk record.
    fn attachment_to_internal(&self, attachment: &ApiDiskAttachment) -> Disk {
        attachment_to_internal(attachment)
    }
}

/// Default translation of the attachment and its nested disk into a `Disk`.
/// A missing disk payload yields a record carrying only attachment fields.
pub fn attachment_to_internal(attachment: &ApiDiskAttachment) -> Disk {
    let mut disk = Disk {
        attachment_id: attachment.id.clone(),
        id: attachment.id.clone(),
        active: attachment.active,
        bootable: attachment.bootable,
        iface: attachment.interface.clone(),
        ..Disk::default()
    };
    if let Some(api_disk) = &attachment.disk {
        disk.id = api_disk.id.clone();
        disk.name = api_disk.name.clone();
        disk.provisioned_size = api_disk.provisioned_size;
        disk.status = api_disk.status;
        disk.storage_domain_id = api_disk.storage_domain_id.clone();
        disk.format = api_disk.format.clone();
        disk.disk_type = api_disk.storage_type.clone();
    }
    disk
}

/// Signals sent to the UI state store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    DiskUpdated { vm_id: String, disk: Disk },
    RefreshRequested { vm_ids: Vec<String> },
    InProgress(bool),
    ErrorText(String),
    Done,
}

/// The UI state store as seen by the flows. The create-dialog signals
/// (`set_in_progress`, `set_error_text`, `set_done`) are only used by the
/// create flow.
#[async_trait]
pub trait UiState: Send + Sync {
    /// Called on every successful poll, not only on convergence.
    fn notify_disk_updated(&self, vm_id: &str, disk: Disk);

    /// Reload the disk collections of the given VMs.
    async fn request_collection_refresh(&self, vm_ids: &[String]);

    fn set_in_progress(&self, in_progress: bool);

    fn set_error_text(&self, text: String);

    fn set_done(&self);

    /// Render an API failure for display.
    fn extract_error_text(&self, error: &ApiError) -> String {
        match error {
            ApiError::Http { message, .. } if !message.trim().is_empty() => message.clone(),
            other => other.to_string(),
        }
    }
}

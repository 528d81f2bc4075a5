//! Client-side lifecycle flows for disks attached to virtual machines.
//!
//! The management API only offers eventually-consistent mutations: a create,
//! remove or update call returns as soon as the backend accepts it, and the
//! disk converges in the background. This crate drives the client side of
//! that protocol:
//!
//! - Data model: `ApiDiskAttachment`, `ApiDisk`, the internal `Disk` record
//!   and its narrowed `EditableDisk` projection
//! - Flows: `DiskRuntime` runs the create, remove and edit flows, each of
//!   which mutates, polls until converged and then refreshes the UI
//! - Polling: `runtime::poll::PollEngine` with a restartable backoff schedule
//! - Collaborators: the `DiskApi` and `UiState` traits in `providers`
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod config;
pub mod providers;
pub mod runtime;

pub use config::{BackoffConfig, ConfigError, PollConfig, RuntimeConfig};
pub use providers::{DiskApi, UiEvent, UiState};
pub use runtime::poll::{PollEngine, PollOutcome};
pub use runtime::registry::{PendingRemoval, PendingTaskRegistry};
pub use runtime::{DiskRuntime, FlowHandle, FlowOutcome};

/// Failure reported by the management API or the transport underneath it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// The backend answered with a non-success HTTP-like status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    /// The request never produced a response.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ApiError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        ApiError::Http {
            status,
            message: message.into(),
        }
    }

    pub fn not_found() -> Self {
        Self::http(404, "Not Found")
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            ApiError::Transport(_) => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

/// Remote operations the flows invoke. Used to tag diagnostics only; calls
/// are made through the strongly-typed `DiskApi` methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternalAction {
    AddDiskAttachment,
    RemoveDisk,
    UpdateDiskAttachment,
    DiskAttachment,
}

impl ExternalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalAction::AddDiskAttachment => "addDiskAttachment",
            ExternalAction::RemoveDisk => "removeDisk",
            ExternalAction::UpdateDiskAttachment => "updateDiskAttachment",
            ExternalAction::DiskAttachment => "diskAttachment",
        }
    }
}

impl std::fmt::Display for ExternalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Disk status as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskStatus {
    Ok,
    Locked,
    Illegal,
    #[serde(other)]
    Unknown,
}

/// Disk payload nested in an attachment response.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApiDisk {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub provisioned_size: Option<u64>,
    #[serde(default)]
    pub status: Option<DiskStatus>,
    #[serde(default)]
    pub storage_domain_id: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub storage_type: Option<String>,
}

/// The join entity linking a disk to a VM, as returned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApiDiskAttachment {
    pub id: String,
    #[serde(default)]
    pub vm_id: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub bootable: bool,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub disk: Option<ApiDisk>,
}

/// Internal disk record kept by the UI state store.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    pub attachment_id: String,
    pub id: String,
    pub name: String,
    pub provisioned_size: Option<u64>,
    pub status: Option<DiskStatus>,
    pub active: bool,
    pub bootable: bool,
    pub iface: Option<String>,
    pub storage_domain_id: Option<String>,
    pub format: Option<String>,
    pub disk_type: Option<String>,
}

/// The only fields of a disk an edit may change or reference. Anything else on
/// the source record is dropped before an update request is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditableDisk {
    pub attachment_id: String,
    pub id: String,
    pub name: String,
    /// Only meaningful for image disks.
    pub provisioned_size: Option<u64>,
}

impl From<&Disk> for EditableDisk {
    fn from(disk: &Disk) -> Self {
        EditableDisk {
            attachment_id: disk.attachment_id.clone(),
            id: disk.id.clone(),
            name: disk.name.clone(),
            provisioned_size: disk.provisioned_size,
        }
    }
}

/// Parameters of a disk to create and attach.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NewDisk {
    pub name: String,
    pub provisioned_size: u64,
    #[serde(default)]
    pub storage_domain_id: Option<String>,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub bootable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDiskRequest {
    pub vm_id: String,
    pub disk: NewDisk,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddDiskAttachmentResponse {
    pub attachment_id: String,
    pub disk_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveDiskRequest {
    pub disk_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDiskAttachmentRequest {
    pub vm_id: String,
    pub disk: EditableDisk,
}

/// Identifies the attachment a poll loop watches. `vm_id` is absent for
/// disks that are not attached to any VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskAttachmentQuery {
    pub vm_id: Option<String>,
    pub attachment_id: String,
}

/// UI-originated requests, each handled by one flow of `DiskRuntime`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskAction {
    CreateDiskForVm {
        vm_id: String,
        disk: NewDisk,
    },
    RemoveDisk {
        disk_id: String,
        vm_to_refresh_id: Option<String>,
    },
    EditVmDisk {
        vm_id: String,
        disk: Disk,
    },
}

impl DiskAction {
    pub fn name(&self) -> &'static str {
        match self {
            DiskAction::CreateDiskForVm { .. } => "create_disk_for_vm",
            DiskAction::RemoveDisk { .. } => "remove_disk",
            DiskAction::EditVmDisk { .. } => "edit_vm_disk",
        }
    }
}

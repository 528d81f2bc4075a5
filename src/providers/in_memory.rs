use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::debug;

use super::DiskApi;
use crate::{
    AddDiskAttachmentResponse, ApiDisk, ApiDiskAttachment, ApiError, CreateDiskRequest, DiskAttachmentQuery,
    DiskStatus, ExternalAction, RemoveDiskRequest, UpdateDiskAttachmentRequest,
};

/// One request received by `InMemoryDiskApi`, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    AddDiskAttachment(CreateDiskRequest),
    RemoveDisk(RemoveDiskRequest),
    UpdateDiskAttachment(UpdateDiskAttachmentRequest),
    DiskAttachment(DiskAttachmentQuery),
}

type FetchHook = Box<dyn Fn(&DiskAttachmentQuery) + Send + Sync>;

struct SimAttachment {
    attachment: ApiDiskAttachment,
    // polls left that still report the disk as locked
    locked_polls: u32,
    // polls left before a removed disk disappears
    removal_polls: Option<u32>,
}

#[derive(Default)]
struct Inner {
    attachments: HashMap<String, SimAttachment>,
    failures: HashMap<ExternalAction, VecDeque<ApiError>>,
    calls: Vec<ApiCall>,
    next_id: u64,
}

/// Eventually-consistent backend simulator.
///
/// Created or updated disks report `locked` for `lock_polls` fetches before
/// turning `ok`; removed disks stay visible (locked) for `removal_polls`
/// fetches and then answer 404. Failures can be queued per action.
pub struct InMemoryDiskApi {
    inner: Mutex<Inner>,
    lock_polls: u32,
    removal_polls: u32,
    fetch_hook: Mutex<Option<FetchHook>>,
}

impl Default for InMemoryDiskApi {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl InMemoryDiskApi {
    pub fn new(lock_polls: u32, removal_polls: u32) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            lock_polls,
            removal_polls,
            fetch_hook: Mutex::new(None),
        }
    }

    /// Seed an existing, unlocked disk attached to `vm_id`. Returns its attachment id.
    pub fn insert_disk(&self, vm_id: Option<&str>, disk: ApiDisk) -> String {
        let id = disk.id.clone();
        let attachment = ApiDiskAttachment {
            id: id.clone(),
            vm_id: vm_id.map(str::to_string),
            active: true,
            bootable: false,
            interface: Some("virtio_scsi".to_string()),
            disk: Some(ApiDisk {
                status: Some(DiskStatus::Ok),
                ..disk
            }),
        };
        self.inner.lock().unwrap().attachments.insert(
            id.clone(),
            SimAttachment {
                attachment,
                locked_polls: 0,
                removal_polls: None,
            },
        );
        id
    }

    /// Make the next call of `action` fail with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, action: ExternalAction, error: ApiError) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .entry(action)
            .or_default()
            .push_back(error);
    }

    /// Run `hook` at the start of every `disk_attachment` call.
    pub fn set_fetch_hook(&self, hook: impl Fn(&DiskAttachmentQuery) + Send + Sync + 'static) {
        *self.fetch_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Number of `disk_attachment` calls made for `attachment_id`.
    pub fn fetch_count(&self, attachment_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| matches!(c, ApiCall::DiskAttachment(q) if q.attachment_id == attachment_id))
            .count()
    }

    pub fn contains(&self, attachment_id: &str) -> bool {
        self.inner.lock().unwrap().attachments.contains_key(attachment_id)
    }

    /// Current stored view of an attachment, without consuming a poll.
    pub fn snapshot(&self, attachment_id: &str) -> Option<ApiDiskAttachment> {
        self.inner
            .lock()
            .unwrap()
            .attachments
            .get(attachment_id)
            .map(|a| a.attachment.clone())
    }

    fn record(inner: &mut Inner, action: ExternalAction, call: ApiCall) -> Result<(), ApiError> {
        inner.calls.push(call);
        match inner.failures.get_mut(&action).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn set_status(attachment: &mut ApiDiskAttachment, status: DiskStatus) {
    if let Some(disk) = attachment.disk.as_mut() {
        disk.status = Some(status);
    }
}

#[async_trait]
impl DiskApi for InMemoryDiskApi {
    async fn add_disk_attachment(&self, request: &CreateDiskRequest) -> Result<AddDiskAttachmentResponse, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        Self::record(
            &mut inner,
            ExternalAction::AddDiskAttachment,
            ApiCall::AddDiskAttachment(request.clone()),
        )?;
        inner.next_id += 1;
        let id = format!("disk-{}", inner.next_id);
        let attachment = ApiDiskAttachment {
            id: id.clone(),
            vm_id: Some(request.vm_id.clone()),
            active: true,
            bootable: request.disk.bootable,
            interface: request.disk.interface.clone(),
            disk: Some(ApiDisk {
                id: id.clone(),
                name: request.disk.name.clone(),
                provisioned_size: Some(request.disk.provisioned_size),
                status: Some(DiskStatus::Locked),
                storage_domain_id: request.disk.storage_domain_id.clone(),
                format: Some("cow".to_string()),
                storage_type: Some("image".to_string()),
            }),
        };
        inner.attachments.insert(
            id.clone(),
            SimAttachment {
                attachment,
                locked_polls: self.lock_polls,
                removal_polls: None,
            },
        );
        debug!(attachment_id = %id, vm_id = %request.vm_id, "simulated disk created");
        Ok(AddDiskAttachmentResponse {
            attachment_id: id.clone(),
            disk_id: id,
        })
    }

    async fn remove_disk(&self, request: &RemoveDiskRequest) -> Result<(), ApiError> {
        let mut inner = self.inner.lock().unwrap();
        Self::record(&mut inner, ExternalAction::RemoveDisk, ApiCall::RemoveDisk(request.clone()))?;
        let entry = inner
            .attachments
            .values_mut()
            .find(|a| a.attachment.disk.as_ref().is_some_and(|d| d.id == request.disk_id))
            .ok_or_else(ApiError::not_found)?;
        set_status(&mut entry.attachment, DiskStatus::Locked);
        entry.removal_polls = Some(self.removal_polls);
        Ok(())
    }

    async fn update_disk_attachment(&self, request: &UpdateDiskAttachmentRequest) -> Result<(), ApiError> {
        let mut inner = self.inner.lock().unwrap();
        Self::record(
            &mut inner,
            ExternalAction::UpdateDiskAttachment,
            ApiCall::UpdateDiskAttachment(request.clone()),
        )?;
        let entry = inner
            .attachments
            .get_mut(&request.disk.attachment_id)
            .ok_or_else(ApiError::not_found)?;
        if let Some(disk) = entry.attachment.disk.as_mut() {
            disk.name = request.disk.name.clone();
            if request.disk.provisioned_size.is_some() {
                disk.provisioned_size = request.disk.provisioned_size;
            }
            disk.status = Some(DiskStatus::Locked);
        }
        entry.locked_polls = self.lock_polls;
        Ok(())
    }

    async fn disk_attachment(&self, query: &DiskAttachmentQuery) -> Result<ApiDiskAttachment, ApiError> {
        if let Some(hook) = self.fetch_hook.lock().unwrap().as_ref() {
            hook(query);
        }
        let mut inner = self.inner.lock().unwrap();
        Self::record(&mut inner, ExternalAction::DiskAttachment, ApiCall::DiskAttachment(query.clone()))?;
        let entry = match inner.attachments.get_mut(&query.attachment_id) {
            Some(entry) if query.vm_id.is_none() || entry.attachment.vm_id == query.vm_id => entry,
            _ => return Err(ApiError::not_found()),
        };
        let removal_polls = entry.removal_polls;
        match removal_polls {
            Some(0) => {
                inner.attachments.remove(&query.attachment_id);
                return Err(ApiError::not_found());
            }
            Some(left) => {
                entry.removal_polls = Some(left - 1);
                return Ok(entry.attachment.clone());
            }
            None => {}
        }
        if entry.locked_polls > 0 {
            entry.locked_polls -= 1;
            set_status(&mut entry.attachment, DiskStatus::Locked);
        } else {
            set_status(&mut entry.attachment, DiskStatus::Ok);
        }
        Ok(entry.attachment.clone())
    }
}

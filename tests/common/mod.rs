#![allow(dead_code)]
use disk_flows::providers::channel::ChannelUiState;
use disk_flows::providers::in_memory::InMemoryDiskApi;
use disk_flows::{BackoffConfig, DiskRuntime, PollConfig, RuntimeConfig, UiEvent};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// Fast schedule with the default ten-minute ceiling on a single loop.
pub fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        backoff: BackoffConfig {
            initial_ms: 10,
            multiplier: 2,
            max_ms: 80,
        },
        poll: PollConfig::default(),
    }
}

pub struct Harness {
    pub api: Arc<InMemoryDiskApi>,
    pub rt: Arc<DiskRuntime>,
    pub events: UnboundedReceiver<UiEvent>,
}

pub fn harness(api: InMemoryDiskApi, config: RuntimeConfig) -> Harness {
    let api = Arc::new(api);
    let (ui, events) = ChannelUiState::new();
    let rt = DiskRuntime::start(api.clone(), Arc::new(ui), config);
    Harness { api, rt, events }
}

/// Everything emitted so far, in order.
pub fn drain(events: &mut UnboundedReceiver<UiEvent>) -> Vec<UiEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = events.try_recv() {
        out.push(ev);
    }
    out
}

/// Events with the per-poll `DiskUpdated` notifications filtered out.
pub fn signals(events: &[UiEvent]) -> Vec<UiEvent> {
    events
        .iter()
        .filter(|e| !matches!(e, UiEvent::DiskUpdated { .. }))
        .cloned()
        .collect()
}

pub fn disk_updates(events: &[UiEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, UiEvent::DiskUpdated { .. }))
        .count()
}

pub fn refreshes_for(events: &[UiEvent], vm_id: &str) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, UiEvent::RefreshRequested { vm_ids } if vm_ids.len() == 1 && vm_ids[0] == vm_id))
        .count()
}

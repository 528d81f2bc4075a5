use disk_flows::providers::DiskApi;
use disk_flows::providers::channel::ChannelUiState;
use disk_flows::providers::in_memory::InMemoryDiskApi;
use disk_flows::runtime::poll::{is_not_found, is_unlocked};
use disk_flows::{
    AddDiskAttachmentResponse, ApiDisk, ApiDiskAttachment, ApiError, CreateDiskRequest, DiskAttachmentQuery, DiskStatus, ExternalAction, NewDisk, PollConfig,
    PollEngine, PollOutcome, RemoveDiskRequest, RuntimeConfig, UiEvent, UpdateDiskAttachmentRequest,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
mod common;

fn engine(api: &Arc<InMemoryDiskApi>, config: RuntimeConfig) -> (PollEngine, UnboundedReceiver<UiEvent>) {
    let (ui, events) = ChannelUiState::new();
    (PollEngine::new(api.clone(), Arc::new(ui), config), events)
}

fn query(vm_id: Option<&str>, attachment_id: &str) -> DiskAttachmentQuery {
    DiskAttachmentQuery {
        vm_id: vm_id.map(str::to_string),
        attachment_id: attachment_id.to_string(),
    }
}

fn seed(api: &InMemoryDiskApi, id: &str) -> String {
    api.insert_disk(
        Some("vm1"),
        ApiDisk {
            id: id.into(),
            name: format!("{id}-name"),
            provisioned_size: Some(1 << 30),
            ..ApiDisk::default()
        },
    )
}

async fn create_locked(api: &InMemoryDiskApi) -> String {
    api.add_disk_attachment(&CreateDiskRequest {
        vm_id: "vm1".into(),
        disk: NewDisk {
            name: "scratch".into(),
            provisioned_size: 1 << 30,
            ..NewDisk::default()
        },
    })
    .await
    .unwrap()
    .attachment_id
}

// Predicate true on the first fetch: one fetch, no sleep.
#[tokio::test(start_paused = true)]
async fn converges_on_first_fetch_without_sleeping() {
    let api = Arc::new(InMemoryDiskApi::new(0, 0));
    let id = seed(&api, "d1");
    let (engine, mut events) = engine(&api, common::test_config());

    let started = Instant::now();
    let outcome = engine
        .poll_until(&query(Some("vm1"), &id), is_unlocked, false, &CancellationToken::new())
        .await;
    assert_eq!(outcome, PollOutcome::Converged { attempts: 1 });
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(api.fetch_count(&id), 1);
    assert_eq!(common::disk_updates(&common::drain(&mut events)), 1);
}

// Each successful fetch notifies exactly once, converged or not.
#[tokio::test(start_paused = true)]
async fn every_successful_fetch_is_propagated() {
    let api = Arc::new(InMemoryDiskApi::new(3, 0));
    let id = create_locked(&api).await;
    let (engine, mut events) = engine(&api, common::test_config());

    let outcome = engine
        .poll_until(&query(Some("vm1"), &id), is_unlocked, false, &CancellationToken::new())
        .await;
    assert_eq!(outcome, PollOutcome::Converged { attempts: 4 });

    let events = common::drain(&mut events);
    let statuses: Vec<Option<DiskStatus>> = events
        .iter()
        .map(|e| match e {
            UiEvent::DiskUpdated { vm_id, disk } => {
                assert_eq!(vm_id, "vm1");
                assert_eq!(disk.attachment_id, id);
                disk.status
            }
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            Some(DiskStatus::Locked),
            Some(DiskStatus::Locked),
            Some(DiskStatus::Locked),
            Some(DiskStatus::Ok)
        ]
    );
}

// Waits follow the backoff schedule: 10, 20, 40, 80, 80 ms.
#[tokio::test(start_paused = true)]
async fn waits_follow_backoff_schedule() {
    let api = Arc::new(InMemoryDiskApi::new(5, 0));
    let id = create_locked(&api).await;
    let (engine, _events) = engine(&api, common::test_config());

    let started = Instant::now();
    let outcome = engine
        .poll_until(&query(Some("vm1"), &id), is_unlocked, false, &CancellationToken::new())
        .await;
    assert_eq!(outcome, PollOutcome::Converged { attempts: 6 });
    assert_eq!(started.elapsed(), Duration::from_millis(230));
}

// Tolerated missing: 404 converges regardless of earlier errors and successes.
#[tokio::test(start_paused = true)]
async fn not_found_converges_after_transient_errors() {
    let api = Arc::new(InMemoryDiskApi::new(0, 2));
    let id = seed(&api, "d1");
    api.remove_disk(&RemoveDiskRequest { disk_id: id.clone() }).await.unwrap();
    api.fail_next(ExternalAction::DiskAttachment, ApiError::http(500, "internal"));
    api.fail_next(ExternalAction::DiskAttachment, ApiError::Transport("connection reset".into()));
    let (engine, mut events) = engine(&api, common::test_config());

    let outcome = engine
        .poll_until(&query(Some("vm1"), &id), is_not_found, true, &CancellationToken::new())
        .await;
    // 500, transport error, present, present, 404
    assert_eq!(outcome, PollOutcome::Converged { attempts: 5 });
    assert!(!api.contains(&id));
    assert_eq!(common::disk_updates(&common::drain(&mut events)), 2);
}

// Without a VM there is no state to propagate to.
#[tokio::test(start_paused = true)]
async fn no_propagation_without_vm() {
    let api = Arc::new(InMemoryDiskApi::new(0, 0));
    let id = api.insert_disk(
        None,
        ApiDisk {
            id: "floating".into(),
            name: "floating".into(),
            ..ApiDisk::default()
        },
    );
    let (engine, mut events) = engine(&api, common::test_config());
    let outcome = engine
        .poll_until(&query(None, &id), is_unlocked, false, &CancellationToken::new())
        .await;
    assert!(outcome.is_converged());
    assert!(common::drain(&mut events).is_empty());
}

// A predicate that ignores errors keeps polling through them.
#[tokio::test(start_paused = true)]
async fn errors_do_not_end_an_unlock_wait() {
    let api = Arc::new(InMemoryDiskApi::new(0, 0));
    let id = seed(&api, "d1");
    for _ in 0..3 {
        api.fail_next(ExternalAction::DiskAttachment, ApiError::http(503, "unavailable"));
    }
    let (engine, _events) = engine(&api, common::test_config());
    let outcome = engine
        .poll_until(&query(Some("vm1"), &id), is_unlocked, false, &CancellationToken::new())
        .await;
    assert_eq!(outcome, PollOutcome::Converged { attempts: 4 });
}

#[tokio::test(start_paused = true)]
async fn attempt_limit_stops_a_stuck_loop() {
    let api = Arc::new(InMemoryDiskApi::new(u32::MAX, 0));
    let id = create_locked(&api).await;
    let mut config = common::test_config();
    config.poll = PollConfig {
        max_attempts: Some(3),
        max_duration_ms: None,
    };
    let (engine, _events) = engine(&api, config);

    let outcome = engine
        .poll_until(&query(Some("vm1"), &id), is_unlocked, false, &CancellationToken::new())
        .await;
    assert_eq!(outcome, PollOutcome::AttemptsExhausted { attempts: 3 });
    assert!(!outcome.is_converged());
    assert_eq!(api.fetch_count(&id), 3);
}

#[tokio::test(start_paused = true)]
async fn duration_limit_stops_a_stuck_loop() {
    let api = Arc::new(InMemoryDiskApi::new(u32::MAX, 0));
    let id = create_locked(&api).await;
    let mut config = common::test_config();
    config.poll = PollConfig {
        max_attempts: None,
        max_duration_ms: Some(1_000),
    };
    let (engine, _events) = engine(&api, config);

    let started = Instant::now();
    let outcome = engine
        .poll_until(&query(Some("vm1"), &id), is_unlocked, false, &CancellationToken::new())
        .await;
    assert!(matches!(outcome, PollOutcome::TimedOut { .. }), "got {outcome:?}");
    assert_eq!(started.elapsed(), Duration::from_millis(1_000));
    assert_eq!(api.fetch_count(&id) as u32, outcome.attempts());
}

/// Backend whose fetches stop answering after the first one.
struct HangingApi {
    inner: InMemoryDiskApi,
    fetches: AtomicUsize,
}

#[async_trait::async_trait]
impl DiskApi for HangingApi {
    async fn add_disk_attachment(&self, request: &CreateDiskRequest) -> Result<AddDiskAttachmentResponse, ApiError> {
        self.inner.add_disk_attachment(request).await
    }

    async fn remove_disk(&self, request: &RemoveDiskRequest) -> Result<(), ApiError> {
        self.inner.remove_disk(request).await
    }

    async fn update_disk_attachment(&self, request: &UpdateDiskAttachmentRequest) -> Result<(), ApiError> {
        self.inner.update_disk_attachment(request).await
    }

    async fn disk_attachment(&self, query: &DiskAttachmentQuery) -> Result<ApiDiskAttachment, ApiError> {
        if self.fetches.fetch_add(1, Ordering::SeqCst) > 0 {
            std::future::pending::<()>().await;
        }
        self.inner.disk_attachment(query).await
    }
}

// The duration limit also bounds a fetch that never returns.
#[tokio::test(start_paused = true)]
async fn duration_limit_bounds_a_hung_fetch() {
    let api = HangingApi {
        inner: InMemoryDiskApi::new(u32::MAX, 0),
        fetches: AtomicUsize::new(0),
    };
    let id = create_locked(&api.inner).await;
    let mut config = common::test_config();
    config.poll = PollConfig {
        max_attempts: None,
        max_duration_ms: Some(1_000),
    };
    let (ui, _events) = ChannelUiState::new();
    let engine = PollEngine::new(Arc::new(api), Arc::new(ui), config);

    let started = Instant::now();
    let outcome = tokio::time::timeout(
        Duration::from_secs(3_600),
        engine.poll_until(&query(Some("vm1"), &id), is_unlocked, false, &CancellationToken::new()),
    )
    .await
    .expect("poll loop outlived its duration limit");
    assert_eq!(outcome, PollOutcome::TimedOut { attempts: 1 });
    assert_eq!(started.elapsed(), Duration::from_millis(1_000));
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_polling() {
    let api = Arc::new(InMemoryDiskApi::new(u32::MAX, 0));
    let id = create_locked(&api).await;
    let mut config = common::test_config();
    config.poll = PollConfig::unbounded();
    let (engine, _events) = engine(&api, config);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let outcome = engine
        .poll_until(&query(Some("vm1"), &id), is_unlocked, false, &cancel)
        .await;
    // fetches at 0, 10, 30, 70 ms; cancelled while waiting for 150 ms
    assert_eq!(outcome, PollOutcome::Cancelled { attempts: 4 });

    let already = CancellationToken::new();
    already.cancel();
    let before = api.fetch_count(&id);
    let outcome = engine
        .poll_until(&query(Some("vm1"), &id), is_unlocked, false, &already)
        .await;
    assert_eq!(outcome, PollOutcome::Cancelled { attempts: 0 });
    assert_eq!(api.fetch_count(&id), before);
}

// Concurrent loops each run their own schedule.
#[tokio::test(start_paused = true)]
async fn concurrent_loops_do_not_share_backoff() {
    let api = Arc::new(InMemoryDiskApi::new(2, 0));
    let a = create_locked(&api).await;
    let b = create_locked(&api).await;
    let (engine, _events) = engine(&api, common::test_config());
    let cancel = CancellationToken::new();

    let started = Instant::now();
    let qa = query(Some("vm1"), &a);
    let qb = query(Some("vm1"), &b);
    let (ra, rb) = tokio::join!(
        engine.poll_until(&qa, is_unlocked, false, &cancel),
        engine.poll_until(&qb, is_unlocked, false, &cancel),
    );
    assert_eq!(ra, PollOutcome::Converged { attempts: 3 });
    assert_eq!(rb, PollOutcome::Converged { attempts: 3 });
    // both wait 10 + 20 ms, side by side
    assert_eq!(started.elapsed(), Duration::from_millis(30));
}

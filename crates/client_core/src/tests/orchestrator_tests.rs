use super::*;

use std::{collections::BTreeMap, sync::Mutex as StdMutex};

use async_trait::async_trait;
use shared::{
    domain::{ResourceKey, SimulationStatus},
    error::ErrorKind,
    protocol::{
        DispatchReceipt, DispatchRequest, ErrorCounters, HealthStatus, LocationRecord,
        ResetParams, ResourceRequest, SimulateStatus,
    },
};
use storage::MemoryStore;
use tokio::sync::broadcast::error::TryRecvError;

struct FakeWorld {
    status: SimulationStatus,
    active_calls: u32,
    calls: Vec<EmergencyCall>,
    resources: BTreeMap<ResourceType, Vec<EmergencyResource>>,
    resets: Vec<ResetParams>,
    stops: u32,
    next_calls: u32,
    dispatches: Vec<DispatchRequest>,
    fail_reads: bool,
    dispatch_error: Option<ErrorKind>,
}

struct FakeBackend {
    world: StdMutex<FakeWorld>,
}

fn fake_error(kind: ErrorKind, path: &str) -> ApiError {
    ApiError {
        kind,
        message: format!("{kind:?} from fake backend"),
        url: path.to_string(),
        method: Method::GET,
        status: None,
        retries: 0,
        cause: None,
    }
}

impl FakeBackend {
    fn seeded() -> Arc<Self> {
        let troy = EmergencyCall {
            city: "Troy".into(),
            county: "Rensselaer".into(),
            latitude: 42.73,
            longitude: -73.69,
            requests: vec![ResourceRequest {
                resource_type: ResourceType::Fire,
                quantity: 3,
            }],
            dispatched: BTreeMap::new(),
        };
        let albany = EmergencyResource {
            resource_type: ResourceType::Fire,
            city: "Albany".into(),
            county: "Albany".into(),
            latitude: 42.65,
            longitude: -73.75,
            quantity: 10,
        };
        Arc::new(Self {
            world: StdMutex::new(FakeWorld {
                status: SimulationStatus::Idle,
                active_calls: 1,
                calls: vec![troy],
                resources: BTreeMap::from([(ResourceType::Fire, vec![albany])]),
                resets: Vec::new(),
                stops: 0,
                next_calls: 0,
                dispatches: Vec::new(),
                fail_reads: false,
                dispatch_error: None,
            }),
        })
    }

    fn world(&self) -> std::sync::MutexGuard<'_, FakeWorld> {
        self.world.lock().expect("world")
    }

    fn read_guard(&self, path: &str) -> Result<(), ApiError> {
        if self.world().fail_reads {
            return Err(fake_error(ErrorKind::Network, path));
        }
        Ok(())
    }
}

#[async_trait]
impl SimulationBackend for FakeBackend {
    async fn locations(&self) -> Result<Vec<LocationRecord>, ApiError> {
        self.read_guard("/locations")?;
        Ok(vec![LocationRecord {
            city: "Albany".into(),
            county: "Albany".into(),
            latitude: 42.65,
            longitude: -73.75,
        }])
    }

    async fn search_resources(
        &self,
        resource_type: ResourceType,
    ) -> Result<Vec<EmergencyResource>, ApiError> {
        self.read_guard("/search")?;
        Ok(self
            .world()
            .resources
            .get(&resource_type)
            .cloned()
            .unwrap_or_default())
    }

    async fn call_queue(&self) -> Result<Vec<EmergencyCall>, ApiError> {
        self.read_guard("/calls/queue")?;
        Ok(self.world().calls.clone())
    }

    async fn next_call(&self) -> Result<(), ApiError> {
        self.read_guard("/calls/next")?;
        self.world().next_calls += 1;
        Ok(())
    }

    async fn control_status(&self) -> Result<ControlStatus, ApiError> {
        self.read_guard("/control/status")?;
        let world = self.world();
        Ok(ControlStatus {
            status: world.status,
            active_calls: world.active_calls,
            total_dispatches: world.dispatches.len() as u32,
            target_dispatches: 10,
            max_active_calls: 5,
            distance: 0.0,
            penalty: 0.0,
            http_requests: 0,
            errors: ErrorCounters::default(),
            seed: Some("default".into()),
            signature: None,
            checksum: None,
        })
    }

    async fn reset(&self, params: &ResetParams) -> Result<(), ApiError> {
        let mut world = self.world();
        world.resets.push(params.clone());
        world.status = SimulationStatus::Running;
        Ok(())
    }

    async fn stop(&self) -> Result<(), ApiError> {
        let mut world = self.world();
        world.stops += 1;
        world.status = SimulationStatus::Stopped;
        Ok(())
    }

    async fn dispatch(
        &self,
        resource_type: ResourceType,
        request: &DispatchRequest,
    ) -> Result<DispatchReceipt, ApiError> {
        let mut world = self.world();
        if let Some(kind) = world.dispatch_error {
            return Err(fake_error(kind, "/dispatch"));
        }
        if let Some(resource) = world
            .resources
            .get_mut(&resource_type)
            .and_then(|resources| {
                resources
                    .iter_mut()
                    .find(|resource| resource.city == request.source_city)
            })
        {
            resource.quantity -= request.quantity;
        }
        world.dispatches.push(request.clone());
        Ok(DispatchReceipt {
            distance: Some(1.5),
            message: None,
        })
    }
}

#[derive(Default)]
struct FakeAuto {
    starts: StdMutex<Vec<SimulateRequest>>,
    stops: StdMutex<u32>,
}

#[async_trait]
impl AutoDispatchBackend for FakeAuto {
    async fn start(&self, request: &SimulateRequest) -> Result<(), ApiError> {
        self.starts.lock().expect("starts").push(request.clone());
        Ok(())
    }

    async fn stop(&self) -> Result<(), ApiError> {
        *self.stops.lock().expect("stops") += 1;
        Ok(())
    }

    async fn status(&self) -> Result<SimulateStatus, ApiError> {
        Ok(SimulateStatus::default())
    }

    async fn health(&self) -> Result<HealthStatus, ApiError> {
        Ok(HealthStatus {
            status: "ok".into(),
        })
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    backend: Arc<FakeBackend>,
    auto: Arc<FakeAuto>,
    store: Arc<dyn KeyValueStore>,
}

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        data_interval: Duration::from_millis(200),
        status_interval: Duration::from_millis(100),
        auto_fetch_interval: Duration::from_secs(1),
        elapsed_interval: Duration::from_secs(1),
        ..OrchestratorConfig::default()
    }
}

fn harness_with(backend: Arc<FakeBackend>, store: Arc<dyn KeyValueStore>) -> Harness {
    let auto = Arc::new(FakeAuto::default());
    let orchestrator = Orchestrator::new(
        backend.clone(),
        auto.clone(),
        Arc::clone(&store),
        fast_config(),
    );
    Harness {
        orchestrator,
        backend,
        auto,
        store,
    }
}

fn harness() -> Harness {
    harness_with(FakeBackend::seeded(), Arc::new(MemoryStore::new()))
}

fn params(mode: RunMode) -> StartParams {
    StartParams {
        seed: "default".into(),
        target_dispatches: 10,
        max_active_calls: 5,
        mode,
    }
}

fn fire_from_albany_to_troy(quantity: i64) -> DispatchOrder {
    DispatchOrder {
        source: ResourceKey::new("Albany", "Albany", ResourceType::Fire),
        target: CallKey::new("Troy", "Rensselaer"),
        quantity,
    }
}

fn drain(events: &mut broadcast::Receiver<DashboardEvent>) -> Vec<DashboardEvent> {
    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => seen.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return seen,
        }
    }
}

async fn snapshot(store: &Arc<dyn KeyValueStore>) -> Option<SessionSnapshot> {
    SessionRecovery::new(Arc::clone(store))
        .load()
        .await
        .expect("load")
}

#[tokio::test(start_paused = true)]
async fn reset_then_dispatch_applies_effects_before_next_poll() {
    let h = harness();
    h.orchestrator
        .start_simulation(params(RunMode::Manual))
        .await
        .expect("start");
    assert_eq!(
        h.backend.world().resets,
        vec![ResetParams {
            seed: "default".into(),
            target_dispatches: 10,
            max_active_calls: 5,
        }]
    );

    assert_eq!(h.orchestrator.status_tick().await, TickControl::Continue);
    let view = h.orchestrator.view().await;
    assert_eq!(
        view.status.as_ref().map(|status| status.status),
        Some(SimulationStatus::Running)
    );

    let applied = h
        .orchestrator
        .dispatch(fire_from_albany_to_troy(2))
        .await
        .expect("dispatch");
    assert_eq!(applied.remaining, 1);
    assert!((applied.distance - 3.0).abs() < f64::EPSILON);

    let view = h.orchestrator.view().await;
    let albany = ResourceKey::new("Albany", "Albany", ResourceType::Fire);
    let troy = CallKey::new("Troy", "Rensselaer");
    assert_eq!(view.resource(&albany).map(|resource| resource.quantity), Some(8));
    let call = view.call(&troy).expect("troy");
    assert_eq!(call.demand[0].dispatched, 2);
    assert_eq!(call.remaining(ResourceType::Fire), 1);

    let saved = snapshot(&h.store).await.expect("snapshot");
    assert_eq!(saved.dispatched, 2);
    assert!((saved.distance - 3.0).abs() < f64::EPSILON);

    h.orchestrator.refresh_data().await;
    let view = h.orchestrator.view().await;
    assert_eq!(view.resource(&albany).map(|resource| resource.quantity), Some(8));
    assert_eq!(view.call(&troy).expect("troy").demand[0].dispatched, 2);

    h.orchestrator.shutdown();
}

#[tokio::test(start_paused = true)]
async fn failed_dispatch_changes_nothing_locally() {
    let h = harness();
    h.orchestrator
        .start_simulation(params(RunMode::Manual))
        .await
        .expect("start");
    h.backend.world().dispatch_error = Some(ErrorKind::Timeout);

    let err = h
        .orchestrator
        .dispatch(fire_from_albany_to_troy(2))
        .await
        .expect_err("dispatch times out");
    assert!(err.is_timeout());

    let view = h.orchestrator.view().await;
    let albany = ResourceKey::new("Albany", "Albany", ResourceType::Fire);
    assert_eq!(view.resource(&albany).map(|resource| resource.quantity), Some(10));
    assert_eq!(
        view.call(&CallKey::new("Troy", "Rensselaer"))
            .expect("troy")
            .demand[0]
            .dispatched,
        0
    );
    assert_eq!(view.totals.dispatched, 0);
    assert_eq!(snapshot(&h.store).await.expect("snapshot").dispatched, 0);

    h.orchestrator.shutdown();
}

#[tokio::test(start_paused = true)]
async fn invalid_dispatch_is_rejected_before_reaching_the_backend() {
    let h = harness();
    let err = h
        .orchestrator
        .dispatch(fire_from_albany_to_troy(0))
        .await
        .expect_err("zero units");
    assert_eq!(err.kind, ErrorKind::Validation);
    assert!(err.url.ends_with("/fire/dispatch"));
    assert!(h.backend.world().dispatches.is_empty());
}

#[tokio::test(start_paused = true)]
async fn status_leaving_running_stops_every_poller_within_one_tick() {
    let h = harness();
    h.orchestrator
        .start_simulation(params(RunMode::Manual))
        .await
        .expect("start");
    assert_eq!(
        h.orchestrator.pollers(),
        PollerStates {
            data: true,
            status: true,
            auto_fetch: true,
            elapsed: true,
        }
    );
    let mut events = h.orchestrator.subscribe();

    tokio::time::sleep(Duration::from_millis(150)).await;
    h.backend.world().status = SimulationStatus::Stopped;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!h.orchestrator.pollers().any());
    assert!(!h.orchestrator.is_active().await);
    assert!(h.orchestrator.view().await.status.is_none());
    assert!(snapshot(&h.store).await.is_none());
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, DashboardEvent::SimulationEnded)));
}

#[tokio::test(start_paused = true)]
async fn status_that_was_never_running_does_not_end_the_session() {
    let h = harness();
    h.orchestrator
        .start_simulation(params(RunMode::Manual))
        .await
        .expect("start");
    h.backend.world().status = SimulationStatus::Idle;

    assert_eq!(h.orchestrator.status_tick().await, TickControl::Continue);
    assert!(h.orchestrator.is_active().await);
    assert!(h.orchestrator.pollers().data);
    h.orchestrator.shutdown();
}

#[tokio::test(start_paused = true)]
async fn failed_status_read_is_not_a_transition() {
    let h = harness();
    h.orchestrator
        .start_simulation(params(RunMode::Manual))
        .await
        .expect("start");
    assert_eq!(h.orchestrator.status_tick().await, TickControl::Continue);

    h.backend.world().fail_reads = true;
    assert_eq!(h.orchestrator.status_tick().await, TickControl::Continue);
    assert!(h.orchestrator.is_active().await);
    assert_eq!(
        h.orchestrator
            .view()
            .await
            .status
            .map(|status| status.status),
        Some(SimulationStatus::Running)
    );
    h.orchestrator.shutdown();
}

#[tokio::test(start_paused = true)]
async fn auto_fetch_requests_next_call_only_below_capacity() {
    let h = harness();
    h.orchestrator
        .start_simulation(params(RunMode::Manual))
        .await
        .expect("start");
    h.orchestrator.shutdown();

    h.backend.world().active_calls = 5;
    assert_eq!(h.orchestrator.auto_fetch_tick().await, TickControl::Continue);
    assert_eq!(h.backend.world().next_calls, 0);

    h.backend.world().active_calls = 2;
    assert_eq!(h.orchestrator.auto_fetch_tick().await, TickControl::Continue);
    assert_eq!(h.backend.world().next_calls, 1);

    h.backend.world().status = SimulationStatus::Stopped;
    assert_eq!(h.orchestrator.auto_fetch_tick().await, TickControl::Stop);
    assert_eq!(h.backend.world().next_calls, 1);
}

#[tokio::test(start_paused = true)]
async fn auto_fetch_interval_is_validated_and_restarts_live_poller() {
    let h = harness();
    for seconds in [0, 31] {
        let err = h
            .orchestrator
            .set_auto_fetch_interval(seconds)
            .await
            .expect_err("out of range");
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    h.orchestrator
        .start_simulation(params(RunMode::Manual))
        .await
        .expect("start");
    assert_eq!(h.orchestrator.auto_fetch_period(), Some(Duration::from_secs(1)));
    h.orchestrator
        .set_auto_fetch_interval(10)
        .await
        .expect("valid");
    assert_eq!(h.orchestrator.auto_fetch_period(), Some(Duration::from_secs(10)));

    h.orchestrator.set_auto_fetch_enabled(false).await;
    assert!(!h.orchestrator.pollers().auto_fetch);
    h.orchestrator.set_auto_fetch_enabled(true).await;
    assert_eq!(h.orchestrator.auto_fetch_period(), Some(Duration::from_secs(10)));
    h.orchestrator.shutdown();
}

#[tokio::test(start_paused = true)]
async fn read_failures_keep_previous_state_and_report_degraded() {
    let h = harness();
    h.orchestrator
        .start_simulation(params(RunMode::Manual))
        .await
        .expect("start");
    h.orchestrator.shutdown();
    let mut events = h.orchestrator.subscribe();

    h.backend.world().fail_reads = true;
    h.orchestrator.refresh_data().await;

    let view = h.orchestrator.view().await;
    assert_eq!(view.calls.len(), 1);
    assert_eq!(view.locations.len(), 1);
    let degraded: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            DashboardEvent::Degraded { operation, .. } => Some(operation),
            _ => None,
        })
        .collect();
    assert!(degraded.contains(&"call_queue"));
    assert!(degraded.contains(&"search_resources"));
}

#[tokio::test(start_paused = true)]
async fn empty_dashboard_falls_back_to_cached_payloads() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let backend = FakeBackend::seeded();
    let first = harness_with(backend.clone(), Arc::clone(&store));
    first
        .orchestrator
        .start_simulation(params(RunMode::Manual))
        .await
        .expect("start");
    first.orchestrator.shutdown();

    backend.world().fail_reads = true;
    let second = harness_with(backend, store);
    second.orchestrator.refresh_data().await;

    let view = second.orchestrator.view().await;
    assert_eq!(view.calls.len(), 1);
    assert_eq!(
        view.resource(&ResourceKey::new("Albany", "Albany", ResourceType::Fire))
            .map(|resource| resource.quantity),
        Some(10)
    );
    assert!(view.status.is_none());
}

#[tokio::test(start_paused = true)]
async fn cache_fallback_keeps_counts_patched_by_an_earlier_dispatch() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let backend = FakeBackend::seeded();
    let first = harness_with(backend.clone(), Arc::clone(&store));
    first
        .orchestrator
        .start_simulation(params(RunMode::Manual))
        .await
        .expect("start");
    first
        .orchestrator
        .dispatch(fire_from_albany_to_troy(2))
        .await
        .expect("dispatch");
    first.orchestrator.shutdown();

    backend.world().fail_reads = true;
    let second = harness_with(backend, store);
    second.orchestrator.refresh_data().await;

    let view = second.orchestrator.view().await;
    let troy = view
        .call(&CallKey::new("Troy", "Rensselaer"))
        .expect("troy from cache");
    let fire = troy
        .demand
        .iter()
        .find(|line| line.resource_type == ResourceType::Fire)
        .expect("fire demand");
    assert_eq!(fire.dispatched, 2);
    assert_eq!(fire.remaining, 1);
}

#[tokio::test(start_paused = true)]
async fn resume_against_running_backend_skips_reset_and_restores_counters() {
    let h = harness();
    h.backend.world().status = SimulationStatus::Running;
    let started = Utc::now() - chrono::Duration::minutes(20);
    let mut saved = SessionSnapshot::begin(&params(RunMode::Manual), started);
    saved.dispatched = 4;
    saved.distance = 9.0;
    saved.last_updated = Utc::now() - chrono::Duration::minutes(5);
    h.orchestrator.recovery().save(&saved).await.expect("save");

    let offered = h
        .orchestrator
        .offer_resume()
        .await
        .expect("offer")
        .expect("fresh snapshot");
    let resumed = h
        .orchestrator
        .resolve_resume(
            offered,
            async { Some(ResumeDecision::Resume) },
            Duration::from_secs(30),
        )
        .await
        .expect("resolve");
    assert!(resumed);

    assert!(h.backend.world().resets.is_empty());
    let view = h.orchestrator.view().await;
    assert_eq!(view.totals.dispatched, 4);
    assert_eq!(view.started_at, Some(started));
    assert!(h.orchestrator.pollers().status);
    assert!(h.orchestrator.pollers().data);
    assert!(h.orchestrator.offer_resume().await.expect("offer").is_none());
    h.orchestrator.shutdown();
}

#[tokio::test(start_paused = true)]
async fn resume_against_stopped_backend_resets_with_snapshot_parameters() {
    let h = harness();
    let mut saved = SessionSnapshot::begin(&params(RunMode::Manual), Utc::now());
    saved.seed = "replay".into();
    h.orchestrator.resume(saved).await.expect("resume");

    let resets = h.backend.world().resets.clone();
    assert_eq!(resets.len(), 1);
    assert_eq!(resets[0].seed, "replay");
    assert!(h.orchestrator.is_active().await);
    h.orchestrator.shutdown();
}

#[tokio::test(start_paused = true)]
async fn auto_mode_starts_secondary_backend_without_data_polling() {
    let h = harness();
    h.orchestrator
        .start_simulation(params(RunMode::Auto))
        .await
        .expect("start");

    assert_eq!(h.auto.starts.lock().expect("starts").len(), 1);
    let pollers = h.orchestrator.pollers();
    assert!(pollers.status && pollers.elapsed);
    assert!(!pollers.data && !pollers.auto_fetch);

    h.orchestrator.stop_simulation().await.expect("stop");
    assert_eq!(h.backend.world().stops, 1);
    assert_eq!(*h.auto.stops.lock().expect("stops"), 1);
    assert!(!h.orchestrator.pollers().any());
    assert!(snapshot(&h.store).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn selection_clears_when_call_leaves_the_queue() {
    let h = harness();
    h.orchestrator
        .start_simulation(params(RunMode::Manual))
        .await
        .expect("start");
    h.orchestrator.shutdown();

    assert!(h.orchestrator.select_call(CallKey::new("Troy", "Rensselaer")).await);
    assert!(h.orchestrator.view().await.selected.is_some());

    h.backend.world().calls.clear();
    h.orchestrator.refresh_queue().await;
    assert!(h.orchestrator.view().await.selected.is_none());
}

#[tokio::test(start_paused = true)]
async fn elapsed_tick_publishes_formatted_duration() {
    let h = harness();
    h.orchestrator
        .start_simulation(params(RunMode::Manual))
        .await
        .expect("start");
    h.orchestrator.shutdown();
    let mut events = h.orchestrator.subscribe();

    h.orchestrator.elapsed_tick().await;
    let elapsed = drain(&mut events).into_iter().find_map(|event| match event {
        DashboardEvent::Elapsed(text) => Some(text),
        _ => None,
    });
    let elapsed = elapsed.expect("elapsed event");
    assert!(elapsed.starts_with("00:00:0"), "unexpected {elapsed}");
}

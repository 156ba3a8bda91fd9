use super::*;

use std::{collections::BTreeMap, sync::{Arc, Mutex}};

use async_trait::async_trait;
use chrono::Utc;
use client_core::{RunMode, SessionSnapshot, StartParams};
use shared::{
    domain::{CallKey, ResourceKey, ResourceType},
    error::ErrorKind,
    protocol::{
        ControlStatus, DispatchReceipt, DispatchRequest, EmergencyCall, EmergencyResource,
        HealthStatus, LocationRecord, ResetParams, ResourceRequest, SimulateStatus,
    },
};
use storage::{KeyValueStore, MemoryStore};

#[derive(Default)]
struct Calls {
    stops: u32,
    dispatches: Vec<DispatchRequest>,
}

struct FakeControl {
    calls: Mutex<Calls>,
    receipt_distance: Option<f64>,
    fail: bool,
}

impl FakeControl {
    fn new(receipt_distance: Option<f64>) -> Self {
        Self {
            calls: Mutex::new(Calls::default()),
            receipt_distance,
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(None)
        }
    }

    fn fail_if_asked(&self, path: &str) -> Result<(), ApiError> {
        if !self.fail {
            return Ok(());
        }
        Err(ApiError {
            kind: ErrorKind::Server,
            message: "control unavailable".into(),
            url: path.to_string(),
            method: Method::POST,
            status: None,
            retries: 2,
            cause: None,
        })
    }
}

#[async_trait]
impl SimulationBackend for FakeControl {
    async fn locations(&self) -> Result<Vec<LocationRecord>, ApiError> {
        Ok(Vec::new())
    }

    async fn search_resources(
        &self,
        resource_type: ResourceType,
    ) -> Result<Vec<EmergencyResource>, ApiError> {
        Ok(vec![EmergencyResource {
            resource_type,
            city: "Albany".into(),
            county: "Albany".into(),
            latitude: 42.65,
            longitude: -73.75,
            quantity: 10,
        }])
    }

    async fn call_queue(&self) -> Result<Vec<EmergencyCall>, ApiError> {
        Ok(vec![EmergencyCall {
            city: "Troy".into(),
            county: "Rensselaer".into(),
            latitude: 42.73,
            longitude: -73.69,
            requests: vec![ResourceRequest {
                resource_type: ResourceType::Fire,
                quantity: 3,
            }],
            dispatched: BTreeMap::new(),
        }])
    }

    async fn next_call(&self) -> Result<(), ApiError> {
        Ok(())
    }

    async fn control_status(&self) -> Result<ControlStatus, ApiError> {
        self.fail_if_asked("/control/status")?;
        Err(ApiError::unavailable(Method::GET, "/control/status", "not used"))
    }

    async fn reset(&self, _params: &ResetParams) -> Result<(), ApiError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), ApiError> {
        self.fail_if_asked("/control/stop")?;
        self.calls.lock().expect("calls").stops += 1;
        Ok(())
    }

    async fn dispatch(
        &self,
        _resource_type: ResourceType,
        request: &DispatchRequest,
    ) -> Result<DispatchReceipt, ApiError> {
        self.fail_if_asked("/fire/dispatch")?;
        self.calls
            .lock()
            .expect("calls")
            .dispatches
            .push(request.clone());
        Ok(DispatchReceipt {
            distance: self.receipt_distance,
            message: None,
        })
    }
}

#[derive(Default)]
struct FakeAuto {
    stops: Mutex<u32>,
}

#[async_trait]
impl AutoDispatchBackend for FakeAuto {
    async fn start(&self, _request: &shared::protocol::SimulateRequest) -> Result<(), ApiError> {
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

async fn recovery_with_session() -> SessionRecovery {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let recovery = SessionRecovery::new(store);
    let params = StartParams {
        seed: "default".into(),
        target_dispatches: 10,
        max_active_calls: 5,
        mode: RunMode::Manual,
    };
    recovery
        .save(&SessionSnapshot::begin(&params, Utc::now()))
        .await
        .expect("save snapshot");
    recovery
}

fn fire_order(quantity: i64) -> DispatchOrder {
    DispatchOrder {
        source: ResourceKey::new("Albany", "Albany", ResourceType::Fire),
        target: CallKey::new("Troy", "Rensselaer"),
        quantity,
    }
}

#[tokio::test]
async fn stop_discards_the_stored_session() {
    let control = FakeControl::new(None);
    let auto = FakeAuto::default();
    let recovery = recovery_with_session().await;

    stop_once(&control, &auto, &recovery)
        .await
        .expect("stop succeeds");

    assert_eq!(control.calls.lock().expect("calls").stops, 1);
    assert_eq!(*auto.stops.lock().expect("stops"), 1);
    assert!(recovery.load().await.expect("load").is_none());
}

#[tokio::test]
async fn failed_stop_keeps_the_stored_session() {
    let control = FakeControl::failing();
    let auto = FakeAuto::default();
    let recovery = recovery_with_session().await;

    let error = stop_once(&control, &auto, &recovery)
        .await
        .expect_err("control stop fails");

    assert_eq!(error.kind, ErrorKind::Server);
    assert_eq!(*auto.stops.lock().expect("stops"), 0);
    assert!(recovery.load().await.expect("load").is_some());
}

#[tokio::test]
async fn dispatch_adds_to_stored_session_counters() {
    let control = FakeControl::new(Some(1.5));
    let recovery = recovery_with_session().await;

    let first = dispatch_once(&control, &recovery, &fire_order(2))
        .await
        .expect("first dispatch");
    assert!(first.snapshot_updated);
    assert_eq!(first.distance, 3.0);

    dispatch_once(&control, &recovery, &fire_order(1))
        .await
        .expect("second dispatch");

    let snapshot = recovery.load().await.expect("load").expect("snapshot kept");
    assert_eq!(snapshot.dispatched, 3);
    assert!((snapshot.distance - 4.5).abs() < 1e-9);
    assert_eq!(control.calls.lock().expect("calls").dispatches.len(), 2);
}

#[tokio::test]
async fn dispatch_without_reported_distance_measures_between_coordinates() {
    let control = FakeControl::new(None);
    let recovery = recovery_with_session().await;

    let outcome = dispatch_once(&control, &recovery, &fire_order(2))
        .await
        .expect("dispatch");

    // Albany to Troy is roughly ten kilometres.
    assert!(outcome.distance > 18.0 && outcome.distance < 24.0, "{}", outcome.distance);
    let snapshot = recovery.load().await.expect("load").expect("snapshot kept");
    assert!((snapshot.distance - outcome.distance).abs() < 1e-9);
}

#[tokio::test]
async fn dispatch_without_a_session_leaves_the_store_empty() {
    let control = FakeControl::new(Some(1.0));
    let recovery = SessionRecovery::new(Arc::new(MemoryStore::new()));

    let outcome = dispatch_once(&control, &recovery, &fire_order(1))
        .await
        .expect("dispatch");

    assert!(!outcome.snapshot_updated);
    assert!(recovery.load().await.expect("load").is_none());
}

#[tokio::test]
async fn rejected_quantity_never_reaches_the_backend() {
    let control = FakeControl::new(Some(1.0));
    let recovery = recovery_with_session().await;

    let error = dispatch_once(&control, &recovery, &fire_order(0))
        .await
        .expect_err("zero quantity rejected");

    assert_eq!(error.kind, ErrorKind::Validation);
    assert_eq!(error.url, "/fire/dispatch");
    assert!(control.calls.lock().expect("calls").dispatches.is_empty());
    let snapshot = recovery.load().await.expect("load").expect("snapshot kept");
    assert_eq!(snapshot.dispatched, 0);
}

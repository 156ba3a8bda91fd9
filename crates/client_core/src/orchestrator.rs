//! Owns the four dashboard timers and sequences every state change: polls
//! land in the reconciler, dispatches are applied optimistically, and the
//! session snapshot follows along. Consumers only subscribe to events.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use reqwest::Method;
use shared::{
    domain::{CallKey, ResourceType},
    error::ValidationError,
    protocol::{ControlStatus, EmergencyCall, EmergencyResource, SimulateRequest},
};
use storage::KeyValueStore;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    backend::{AutoDispatchBackend, SimulationBackend},
    cache::{resources_key, LocalCache, EMERGENCIES_KEY},
    error::ApiError,
    poller::{Poller, TickControl},
    reconciler::{DispatchApplied, DispatchEffect, DispatchState, PollOutcome},
    recovery::{ResumeDecision, SessionRecovery, SessionSnapshot},
    types::{format_elapsed, DashboardEvent, DashboardView, DispatchOrder, RunMode, StartParams},
};

pub const AUTO_FETCH_MIN_SECS: u64 = 1;
pub const AUTO_FETCH_MAX_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub data_interval: Duration,
    pub status_interval: Duration,
    pub auto_fetch_interval: Duration,
    pub elapsed_interval: Duration,
    pub auto_fetch_enabled: bool,
    pub cache_fallback: bool,
    pub cache_ttl: chrono::Duration,
    pub freshness_window: chrono::Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            data_interval: Duration::from_millis(2_000),
            status_interval: Duration::from_millis(500),
            auto_fetch_interval: Duration::from_secs(5),
            elapsed_interval: Duration::from_millis(1_000),
            auto_fetch_enabled: true,
            cache_fallback: true,
            cache_ttl: chrono::Duration::seconds(crate::cache::DEFAULT_CACHE_TTL_SECS),
            freshness_window: chrono::Duration::seconds(crate::recovery::DEFAULT_FRESHNESS_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollerStates {
    pub data: bool,
    pub status: bool,
    pub auto_fetch: bool,
    pub elapsed: bool,
}

impl PollerStates {
    pub fn any(&self) -> bool {
        self.data || self.status || self.auto_fetch || self.elapsed
    }
}

struct SessionState {
    params: Option<StartParams>,
    /// Set once a status read has shown Running for the current session.
    was_running: bool,
    auto_fetch_enabled: bool,
    auto_fetch_interval: Duration,
}

pub struct Orchestrator {
    backend: Arc<dyn SimulationBackend>,
    auto_backend: Arc<dyn AutoDispatchBackend>,
    cache: Option<LocalCache>,
    recovery: SessionRecovery,
    config: OrchestratorConfig,
    state: Mutex<DispatchState>,
    session: Mutex<SessionState>,
    data_poller: Poller,
    status_poller: Poller,
    auto_fetch_poller: Poller,
    elapsed_poller: Poller,
    events: broadcast::Sender<DashboardEvent>,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn SimulationBackend>,
        auto_backend: Arc<dyn AutoDispatchBackend>,
        store: Arc<dyn KeyValueStore>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let cache = config
            .cache_fallback
            .then(|| LocalCache::with_ttl(Arc::clone(&store), config.cache_ttl));
        Arc::new(Self {
            backend,
            auto_backend,
            cache,
            recovery: SessionRecovery::with_window(store, config.freshness_window),
            session: Mutex::new(SessionState {
                params: None,
                was_running: false,
                auto_fetch_enabled: config.auto_fetch_enabled,
                auto_fetch_interval: config.auto_fetch_interval,
            }),
            config,
            state: Mutex::new(DispatchState::new()),
            data_poller: Poller::new("data"),
            status_poller: Poller::new("status"),
            auto_fetch_poller: Poller::new("auto-fetch"),
            elapsed_poller: Poller::new("elapsed"),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.events.subscribe()
    }

    pub fn recovery(&self) -> &SessionRecovery {
        &self.recovery
    }

    pub async fn view(&self) -> DashboardView {
        self.state.lock().await.view()
    }

    pub fn pollers(&self) -> PollerStates {
        PollerStates {
            data: self.data_poller.is_running(),
            status: self.status_poller.is_running(),
            auto_fetch: self.auto_fetch_poller.is_running(),
            elapsed: self.elapsed_poller.is_running(),
        }
    }

    pub fn auto_fetch_period(&self) -> Option<Duration> {
        self.auto_fetch_poller.period()
    }

    pub async fn is_active(&self) -> bool {
        self.session.lock().await.params.is_some()
    }

    pub async fn start_simulation(self: &Arc<Self>, params: StartParams) -> Result<(), ApiError> {
        params
            .validate()
            .map_err(|error| ApiError::validation(Method::POST, "/control/reset", error))?;
        self.stop_pollers();

        let reset = params.reset_params();
        self.backend.reset(&reset).await?;
        if params.mode == RunMode::Auto {
            self.auto_backend.start(&SimulateRequest::from(&reset)).await?;
        }

        let now = Utc::now();
        if let Some(cache) = &self.cache {
            if let Err(error) = cache.clear().await {
                warn!(%error, "orchestrator: cache clear failed");
            }
        }
        if let Err(error) = self.recovery.save(&SessionSnapshot::begin(&params, now)).await {
            warn!(%error, "orchestrator: snapshot save failed");
        }
        self.state.lock().await.reset(Some(now));

        info!(seed = %params.seed, target = params.target_dispatches, max_active = params.max_active_calls, mode = ?params.mode, "orchestrator: simulation started");
        self.attach(params, false).await;
        Ok(())
    }

    /// Reattaches to a session from a snapshot. A backend that is still
    /// running is left alone; otherwise it is reset with the snapshot's
    /// parameters.
    pub async fn resume(self: &Arc<Self>, mut snapshot: SessionSnapshot) -> Result<(), ApiError> {
        self.stop_pollers();
        let params = snapshot.start_params();

        let still_running = match self.backend.control_status().await {
            Ok(status) => status.status.is_running(),
            Err(error) => {
                warn!(%error, "orchestrator: status unknown on resume, resetting");
                false
            }
        };
        if !still_running {
            let reset = snapshot.reset_params();
            self.backend.reset(&reset).await?;
            if params.mode == RunMode::Auto {
                self.auto_backend.start(&SimulateRequest::from(&reset)).await?;
            }
        }

        {
            let mut state = self.state.lock().await;
            state.reset(Some(snapshot.started_at));
            state.restore_totals(snapshot.totals(), snapshot.started_at);
        }
        snapshot.last_updated = Utc::now();
        if let Err(error) = self.recovery.save(&snapshot).await {
            warn!(%error, "orchestrator: snapshot save failed");
        }

        info!(session = %snapshot.session_id, dispatched = snapshot.dispatched, reset = !still_running, "orchestrator: simulation resumed");
        self.attach(params, true).await;
        Ok(())
    }

    /// Returns a snapshot the operator may resume, at most once per run.
    pub async fn offer_resume(&self) -> Result<Option<SessionSnapshot>> {
        self.recovery.offer(Utc::now()).await
    }

    /// Waits for the operator's decision and resumes on acceptance. Returns
    /// whether the session was resumed.
    pub async fn resolve_resume<F>(
        self: &Arc<Self>,
        snapshot: SessionSnapshot,
        decision: F,
        timeout: Duration,
    ) -> Result<bool>
    where
        F: std::future::Future<Output = Option<ResumeDecision>>,
    {
        match self.recovery.resolve_prompt(snapshot, decision, timeout).await? {
            Some(snapshot) => {
                self.resume(snapshot).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn attach(self: &Arc<Self>, params: StartParams, resumed: bool) {
        let mode = params.mode;
        let (auto_fetch_enabled, auto_fetch_interval) = {
            let mut session = self.session.lock().await;
            session.params = Some(params);
            session.was_running = false;
            (session.auto_fetch_enabled, session.auto_fetch_interval)
        };

        self.refresh_data().await;

        self.spawn_status_poller();
        self.spawn_elapsed_poller();
        if mode == RunMode::Manual {
            self.spawn_data_poller();
            if auto_fetch_enabled {
                self.spawn_auto_fetch_poller(auto_fetch_interval);
            }
        }

        let _ = self
            .events
            .send(DashboardEvent::SimulationStarted { mode, resumed });
        self.publish_view().await;
    }

    pub async fn stop_simulation(&self) -> Result<(), ApiError> {
        let mode = self
            .session
            .lock()
            .await
            .params
            .as_ref()
            .map(|params| params.mode);

        self.backend.stop().await?;
        if mode == Some(RunMode::Auto) {
            self.auto_backend.stop().await?;
        }
        info!("orchestrator: simulation stopped by operator");
        self.end_session(true).await;
        Ok(())
    }

    /// Stops every timer without touching the backends.
    pub fn shutdown(&self) {
        self.stop_pollers();
    }

    fn stop_pollers(&self) {
        self.data_poller.stop();
        self.status_poller.stop();
        self.auto_fetch_poller.stop();
        self.elapsed_poller.stop();
    }

    /// Tears the session down. The status tick passes `false` and ends its
    /// own loop by returning [`TickControl::Stop`] instead.
    async fn end_session(&self, stop_status_poller: bool) {
        self.data_poller.stop();
        self.auto_fetch_poller.stop();
        self.elapsed_poller.stop();
        if stop_status_poller {
            self.status_poller.stop();
        }
        {
            let mut session = self.session.lock().await;
            session.params = None;
            session.was_running = false;
        }
        self.state.lock().await.apply_status(None);
        if let Err(error) = self.recovery.clear().await {
            warn!(%error, "orchestrator: snapshot clear failed");
        }
        let _ = self.events.send(DashboardEvent::StatusChanged(None));
        let _ = self.events.send(DashboardEvent::SimulationEnded);
        self.publish_view().await;
    }

    pub async fn dispatch(&self, order: DispatchOrder) -> Result<DispatchApplied, ApiError> {
        let resource_type = order.source.resource_type;
        let path = format!("/{}/dispatch", resource_type.path_segment());
        let quantity = order
            .validate()
            .map_err(|error| ApiError::validation(Method::POST, path.as_str(), error))?;

        let receipt = self
            .backend
            .dispatch(resource_type, &order.request(quantity))
            .await?;

        let applied = self.state.lock().await.apply_dispatch(&DispatchEffect {
            resource: order.source.clone(),
            target: order.target.clone(),
            quantity,
            distance_per_unit: receipt.distance,
        });
        info!(
            source = %order.source,
            target = %order.target,
            quantity,
            distance = applied.distance,
            remaining = applied.remaining,
            "orchestrator: dispatch applied"
        );

        if let Some(cache) = &self.cache {
            let source = order.source.clone();
            if let Err(error) = cache
                .update_one(
                    &resources_key(resource_type),
                    |resource: &EmergencyResource| resource.matches(&source),
                    |resource: &mut EmergencyResource| {
                        resource.quantity = resource.quantity.saturating_sub(quantity)
                    },
                )
                .await
            {
                warn!(%error, "orchestrator: cached resource update failed");
            }
            let target = order.target.clone();
            if let Err(error) = cache
                .update_one(
                    EMERGENCIES_KEY,
                    |call: &EmergencyCall| call.matches(&target),
                    |call: &mut EmergencyCall| {
                        let dispatched = call.dispatched.entry(resource_type).or_insert(0);
                        *dispatched = dispatched.saturating_add(quantity);
                    },
                )
                .await
            {
                warn!(%error, "orchestrator: cached call update failed");
            }
        }

        if let Err(error) = self
            .recovery
            .record_progress(applied.totals, Utc::now())
            .await
        {
            warn!(%error, "orchestrator: snapshot progress failed");
        }

        let _ = self.events.send(DashboardEvent::DispatchApplied {
            source: order.source,
            target: order.target,
            quantity,
            distance: applied.distance,
        });
        self.publish_view().await;
        Ok(applied)
    }

    /// One data-poller pass: locations, queue, every resource type and
    /// status, fetched concurrently.
    pub async fn refresh_data(&self) {
        let (queue_ticket, resource_tickets) = {
            let mut state = self.state.lock().await;
            let queue_ticket = state.issue_ticket();
            let resource_tickets = ResourceType::ALL.map(|resource_type| (resource_type, state.issue_ticket()));
            (queue_ticket, resource_tickets)
        };

        let searches = join_all(
            resource_tickets
                .iter()
                .map(|(resource_type, _)| self.backend.search_resources(*resource_type)),
        );
        let (locations, queue, searches, status) = tokio::join!(
            self.backend.locations(),
            self.backend.call_queue(),
            searches,
            self.backend.control_status(),
        );

        if let Some(locations) = self.read("locations", locations) {
            self.state.lock().await.apply_locations(locations);
        }
        self.land_queue(queue_ticket, queue).await;
        for ((resource_type, ticket), result) in resource_tickets.into_iter().zip(searches) {
            self.land_resources(resource_type, ticket, result).await;
        }
        if let Some(status) = self.read("control_status", status) {
            self.state.lock().await.apply_status(Some(status));
        }
        self.publish_view().await;
    }

    pub async fn refresh_queue(&self) {
        let ticket = self.state.lock().await.issue_ticket();
        let queue = self.backend.call_queue().await;
        self.land_queue(ticket, queue).await;
        self.publish_view().await;
    }

    async fn land_queue(&self, ticket: u64, result: Result<Vec<EmergencyCall>, ApiError>) {
        let live = result.is_ok();
        let calls = match self.read("call_queue", result) {
            Some(calls) => calls,
            None => match self.cache_fallback_calls().await {
                Some(calls) => calls,
                None => return,
            },
        };
        let outcome = self.state.lock().await.apply_queue(ticket, calls);
        if live && outcome == PollOutcome::Applied {
            self.cache_current_calls().await;
        }
    }

    async fn land_resources(
        &self,
        resource_type: ResourceType,
        ticket: u64,
        result: Result<Vec<EmergencyResource>, ApiError>,
    ) {
        let live = result.is_ok();
        let resources = match self.read("search_resources", result) {
            Some(resources) => resources,
            None => match self.cache_fallback_resources(resource_type).await {
                Some(resources) => resources,
                None => return,
            },
        };
        let cached = live.then(|| resources.clone());
        let outcome = self
            .state
            .lock()
            .await
            .apply_resources(ticket, resource_type, resources);
        if let (PollOutcome::Applied, Some(cache), Some(resources)) = (outcome, &self.cache, cached) {
            if let Err(error) = cache.save_resources(resource_type, &resources).await {
                warn!(%error, %resource_type, "orchestrator: cache save failed");
            }
        }
    }

    async fn cache_fallback_calls(&self) -> Option<Vec<EmergencyCall>> {
        let cache = self.cache.as_ref()?;
        if self.state.lock().await.has_calls() {
            return None;
        }
        let calls = cache.emergencies().await?;
        debug!(calls = calls.len(), "orchestrator: queue served from cache");
        Some(calls)
    }

    async fn cache_fallback_resources(
        &self,
        resource_type: ResourceType,
    ) -> Option<Vec<EmergencyResource>> {
        let cache = self.cache.as_ref()?;
        if self.state.lock().await.has_resources(resource_type) {
            return None;
        }
        let resources = cache.resources(resource_type).await?;
        debug!(%resource_type, "orchestrator: resources served from cache");
        Some(resources)
    }

    async fn cache_current_calls(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        let calls = self.state.lock().await.calls().to_vec();
        if let Err(error) = cache.save_emergencies(&calls).await {
            warn!(%error, "orchestrator: cache save failed");
        }
    }

    /// Status-poller tick. The only place a Running to not-Running
    /// transition ends the session.
    pub async fn status_tick(&self) -> TickControl {
        let result = self.backend.control_status().await;
        let Some(status) = self.read("control_status", result) else {
            return TickControl::Continue;
        };
        let running = status.status.is_running();
        self.apply_status(status).await;

        {
            let mut session = self.session.lock().await;
            if running {
                session.was_running = true;
                return TickControl::Continue;
            }
            if !session.was_running {
                return TickControl::Continue;
            }
        }

        info!("orchestrator: simulation ended, stopping pollers");
        self.end_session(false).await;
        TickControl::Stop
    }

    async fn apply_status(&self, status: ControlStatus) {
        self.state.lock().await.apply_status(Some(status.clone()));
        let _ = self.events.send(DashboardEvent::StatusChanged(Some(status)));
    }

    /// Auto-fetch tick: pulls the next call only while the backend is
    /// running below the active-call limit.
    pub async fn auto_fetch_tick(&self) -> TickControl {
        let result = self.backend.control_status().await;
        let Some(status) = self.read("control_status", result) else {
            return TickControl::Continue;
        };
        if !status.status.is_running() {
            debug!(status = ?status.status, "orchestrator: auto-fetch stopping, simulation not running");
            return TickControl::Stop;
        }

        let limit = self
            .session
            .lock()
            .await
            .params
            .as_ref()
            .map(|params| params.max_active_calls)
            .unwrap_or(status.max_active_calls);
        if status.active_calls >= limit {
            debug!(active = status.active_calls, limit, "orchestrator: auto-fetch at capacity");
            return TickControl::Continue;
        }

        let next = self.backend.next_call().await;
        if self.read("next_call", next).is_some() {
            self.refresh_queue().await;
        }
        TickControl::Continue
    }

    pub async fn elapsed_tick(&self) -> TickControl {
        let Some(started_at) = self.state.lock().await.started_at() else {
            return TickControl::Continue;
        };
        let _ = self
            .events
            .send(DashboardEvent::Elapsed(format_elapsed(started_at, Utc::now())));
        TickControl::Continue
    }

    pub async fn set_auto_fetch_interval(self: &Arc<Self>, seconds: u64) -> Result<(), ApiError> {
        if !(AUTO_FETCH_MIN_SECS..=AUTO_FETCH_MAX_SECS).contains(&seconds) {
            return Err(ApiError::validation(
                Method::GET,
                "/calls/next",
                ValidationError::OutOfRange {
                    field: "auto_fetch_interval",
                    min: AUTO_FETCH_MIN_SECS,
                    max: AUTO_FETCH_MAX_SECS,
                    value: seconds,
                },
            ));
        }
        let interval = Duration::from_secs(seconds);
        self.session.lock().await.auto_fetch_interval = interval;
        if self.auto_fetch_poller.is_running() {
            self.spawn_auto_fetch_poller(interval);
        }
        Ok(())
    }

    /// Turns auto-fetch on or off. Takes effect immediately when a manual
    /// simulation is running.
    pub async fn set_auto_fetch_enabled(self: &Arc<Self>, enabled: bool) {
        let (interval, manual_session) = {
            let mut session = self.session.lock().await;
            session.auto_fetch_enabled = enabled;
            let manual = session
                .params
                .as_ref()
                .is_some_and(|params| params.mode == RunMode::Manual);
            (session.auto_fetch_interval, manual)
        };
        if !enabled {
            self.auto_fetch_poller.stop();
        } else if manual_session && !self.auto_fetch_poller.is_running() {
            self.spawn_auto_fetch_poller(interval);
        }
    }

    pub async fn select_call(&self, key: CallKey) -> bool {
        let selected = self.state.lock().await.select(key);
        if selected {
            self.publish_view().await;
        }
        selected
    }

    pub async fn clear_selection(&self) {
        self.state.lock().await.clear_selection();
        self.publish_view().await;
    }

    fn read<T>(&self, operation: &'static str, result: Result<T, ApiError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                warn!(operation, kind = ?error.kind, error = %error, "orchestrator: read failed, keeping previous state");
                let _ = self.events.send(DashboardEvent::Degraded {
                    operation,
                    message: error.message,
                });
                None
            }
        }
    }

    async fn publish_view(&self) {
        let view = self.state.lock().await.view();
        let _ = self.events.send(DashboardEvent::ViewUpdated(Box::new(view)));
    }

    fn spawn_data_poller(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.data_poller.start(self.config.data_interval, move || {
            with_orchestrator(weak.clone(), |orchestrator| async move {
                orchestrator.refresh_data().await;
                TickControl::Continue
            })
        });
    }

    fn spawn_status_poller(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.status_poller.start(self.config.status_interval, move || {
            with_orchestrator(weak.clone(), |orchestrator| async move {
                orchestrator.status_tick().await
            })
        });
    }

    fn spawn_auto_fetch_poller(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        self.auto_fetch_poller.start(interval, move || {
            with_orchestrator(weak.clone(), |orchestrator| async move {
                orchestrator.auto_fetch_tick().await
            })
        });
    }

    fn spawn_elapsed_poller(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.elapsed_poller.start(self.config.elapsed_interval, move || {
            with_orchestrator(weak.clone(), |orchestrator| async move {
                orchestrator.elapsed_tick().await
            })
        });
    }
}

/// Ticks hold a weak reference so a dropped orchestrator ends its loops.
async fn with_orchestrator<F, Fut>(weak: Weak<Orchestrator>, tick: F) -> TickControl
where
    F: FnOnce(Arc<Orchestrator>) -> Fut,
    Fut: std::future::Future<Output = TickControl>,
{
    match weak.upgrade() {
        Some(orchestrator) => tick(orchestrator).await,
        None => TickControl::Stop,
    }
}

#[cfg(test)]
#[path = "tests/orchestrator_tests.rs"]
mod tests;

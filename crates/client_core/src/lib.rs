//! Client-side core of the dispatch dashboard: a retrying request engine,
//! typed backend clients, a TTL cache, the dispatch-state reconciler, the
//! polling orchestrator, and session recovery.

pub mod backend;
pub mod cache;
pub mod error;
pub mod orchestrator;
pub mod poller;
pub mod reconciler;
pub mod recovery;
pub mod telemetry;
pub mod transport;
pub mod types;

pub use backend::{
    AutoDispatchBackend, HttpAutoDispatchBackend, HttpSimulationBackend,
    MissingAutoDispatchBackend, SimulationBackend,
};
pub use cache::LocalCache;
pub use error::ApiError;
pub use orchestrator::{Orchestrator, OrchestratorConfig, PollerStates};
pub use poller::{Poller, TickControl};
pub use reconciler::{remaining_needed, DispatchState};
pub use recovery::{ResumeDecision, SessionRecovery, SessionSnapshot};
pub use telemetry::{ErrorTracker, PerfRecorder};
pub use transport::{ApiRequest, ApiResponse, RequestEngine, RequestOptions, RetryPolicy};
pub use types::{DashboardEvent, DashboardView, DispatchOrder, RunMode, StartParams};

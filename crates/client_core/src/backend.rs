//! Typed clients for the two REST backends. The orchestrator talks to these
//! through traits so tests can substitute in-memory fakes.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use shared::{
    domain::ResourceType,
    protocol::{
        ControlStatus, DispatchReceipt, DispatchRequest, EmergencyCall, EmergencyResource,
        HealthStatus, LocationRecord, ResetParams, ResourceRecord, SimulateRequest,
        SimulateStatus,
    },
};
use tracing::debug;

use crate::{
    error::ApiError,
    transport::{ApiRequest, RequestEngine, RequestOptions},
};

#[async_trait]
pub trait SimulationBackend: Send + Sync {
    async fn locations(&self) -> Result<Vec<LocationRecord>, ApiError>;
    async fn search_resources(
        &self,
        resource_type: ResourceType,
    ) -> Result<Vec<EmergencyResource>, ApiError>;
    async fn call_queue(&self) -> Result<Vec<EmergencyCall>, ApiError>;
    async fn next_call(&self) -> Result<(), ApiError>;
    async fn control_status(&self) -> Result<ControlStatus, ApiError>;
    async fn reset(&self, params: &ResetParams) -> Result<(), ApiError>;
    async fn stop(&self) -> Result<(), ApiError>;
    async fn dispatch(
        &self,
        resource_type: ResourceType,
        request: &DispatchRequest,
    ) -> Result<DispatchReceipt, ApiError>;
}

/// Secondary backend that runs dispatch decisions on its own loop.
#[async_trait]
pub trait AutoDispatchBackend: Send + Sync {
    async fn start(&self, request: &SimulateRequest) -> Result<(), ApiError>;
    async fn stop(&self) -> Result<(), ApiError>;
    async fn status(&self) -> Result<SimulateStatus, ApiError>;
    async fn health(&self) -> Result<HealthStatus, ApiError>;
}

pub struct MissingAutoDispatchBackend;

impl MissingAutoDispatchBackend {
    fn unavailable(method: Method, path: &str) -> ApiError {
        ApiError::unavailable(method, path, "auto-dispatch backend is not configured")
    }
}

#[async_trait]
impl AutoDispatchBackend for MissingAutoDispatchBackend {
    async fn start(&self, _request: &SimulateRequest) -> Result<(), ApiError> {
        Err(Self::unavailable(Method::POST, "/simulate"))
    }

    async fn stop(&self) -> Result<(), ApiError> {
        Err(Self::unavailable(Method::POST, "/simulate/stop"))
    }

    async fn status(&self) -> Result<SimulateStatus, ApiError> {
        Err(Self::unavailable(Method::GET, "/simulate/status"))
    }

    async fn health(&self) -> Result<HealthStatus, ApiError> {
        Err(Self::unavailable(Method::GET, "/health"))
    }
}

pub struct HttpSimulationBackend {
    engine: RequestEngine,
    write_options: Option<RequestOptions>,
}

impl HttpSimulationBackend {
    pub fn new(engine: RequestEngine) -> Self {
        Self {
            engine,
            write_options: None,
        }
    }

    /// Overrides deadline/retry for dispatch, reset and stop.
    pub fn with_write_options(mut self, options: RequestOptions) -> Self {
        self.write_options = Some(options);
        self
    }

    fn write(&self, request: ApiRequest) -> ApiRequest {
        match self.write_options {
            Some(options) => request.options(options),
            None => request,
        }
    }
}

#[async_trait]
impl SimulationBackend for HttpSimulationBackend {
    async fn locations(&self) -> Result<Vec<LocationRecord>, ApiError> {
        Ok(self
            .engine
            .execute(&ApiRequest::get("/locations"))
            .await?
            .data)
    }

    async fn search_resources(
        &self,
        resource_type: ResourceType,
    ) -> Result<Vec<EmergencyResource>, ApiError> {
        let path = format!("/{}/search", resource_type.path_segment());
        let records: Vec<ResourceRecord> = self.engine.execute(&ApiRequest::get(path)).await?.data;
        Ok(records
            .into_iter()
            .map(|record| EmergencyResource::from_record(resource_type, record))
            .collect())
    }

    async fn call_queue(&self) -> Result<Vec<EmergencyCall>, ApiError> {
        Ok(self
            .engine
            .execute(&ApiRequest::get("/calls/queue"))
            .await?
            .data)
    }

    async fn next_call(&self) -> Result<(), ApiError> {
        self.engine
            .execute::<Value>(&ApiRequest::get("/calls/next"))
            .await?;
        Ok(())
    }

    async fn control_status(&self) -> Result<ControlStatus, ApiError> {
        Ok(self
            .engine
            .execute(&ApiRequest::get("/control/status"))
            .await?
            .data)
    }

    async fn reset(&self, params: &ResetParams) -> Result<(), ApiError> {
        let request = self.write(ApiRequest::post("/control/reset").query(params.query_pairs()));
        self.engine.execute::<Value>(&request).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), ApiError> {
        let request = self.write(ApiRequest::post("/control/stop"));
        self.engine.execute::<Value>(&request).await?;
        Ok(())
    }

    async fn dispatch(
        &self,
        resource_type: ResourceType,
        request: &DispatchRequest,
    ) -> Result<DispatchReceipt, ApiError> {
        let path = format!("/{}/dispatch", resource_type.path_segment());
        let api_request = self.write(ApiRequest::post(path).json(request)?);
        let body: Value = self.engine.execute(&api_request).await?.data;
        // Some deployments answer with a bare message string.
        match body {
            Value::String(message) => Ok(DispatchReceipt {
                distance: None,
                message: Some(message),
            }),
            other => match serde_json::from_value(other) {
                Ok(receipt) => Ok(receipt),
                Err(error) => {
                    debug!(%error, %resource_type, "backend: dispatch receipt undecodable, using an empty one");
                    Ok(DispatchReceipt::default())
                }
            },
        }
    }
}

pub struct HttpAutoDispatchBackend {
    engine: RequestEngine,
}

impl HttpAutoDispatchBackend {
    pub fn new(engine: RequestEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl AutoDispatchBackend for HttpAutoDispatchBackend {
    async fn start(&self, request: &SimulateRequest) -> Result<(), ApiError> {
        let api_request = ApiRequest::post("/simulate").json(request)?;
        self.engine.execute::<Value>(&api_request).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), ApiError> {
        self.engine
            .execute::<Value>(&ApiRequest::post("/simulate/stop"))
            .await?;
        Ok(())
    }

    async fn status(&self) -> Result<SimulateStatus, ApiError> {
        Ok(self
            .engine
            .execute(&ApiRequest::get("/simulate/status"))
            .await?
            .data)
    }

    async fn health(&self) -> Result<HealthStatus, ApiError> {
        Ok(self
            .engine
            .execute(&ApiRequest::get("/health"))
            .await?
            .data)
    }
}

#[cfg(test)]
#[path = "tests/backend_tests.rs"]
mod tests;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{CallKey, GeoPoint, ResourceKey, ResourceType, SimulationStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    #[serde(alias = "name")]
    pub city: String,
    pub county: String,
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "long", alias = "lng")]
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(rename = "type", alias = "resourceType")]
    pub resource_type: ResourceType,
    pub quantity: u32,
}

/// A call as held by the dashboard. `dispatched` is never sent by the
/// backend; it is tracked locally and carried forward across polls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyCall {
    pub city: String,
    pub county: String,
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "long", alias = "lng")]
    pub longitude: f64,
    #[serde(default)]
    pub requests: Vec<ResourceRequest>,
    #[serde(default)]
    pub dispatched: BTreeMap<ResourceType, u32>,
}

impl EmergencyCall {
    pub fn key(&self) -> CallKey {
        CallKey::new(&self.city, &self.county)
    }

    pub fn matches(&self, key: &CallKey) -> bool {
        self.city == key.city && self.county == key.county
    }

    pub fn position(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    pub fn requested(&self, resource_type: ResourceType) -> u32 {
        self.requests
            .iter()
            .filter(|request| request.resource_type == resource_type)
            .map(|request| request.quantity)
            .sum()
    }

    pub fn dispatched_of(&self, resource_type: ResourceType) -> u32 {
        self.dispatched.get(&resource_type).copied().unwrap_or(0)
    }
}

/// One supply group as returned by `GET /{type}/search`. The resource type
/// is implied by the endpoint and attached by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub city: String,
    pub county: String,
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "long", alias = "lng")]
    pub longitude: f64,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyResource {
    pub resource_type: ResourceType,
    pub city: String,
    pub county: String,
    pub latitude: f64,
    pub longitude: f64,
    pub quantity: u32,
}

impl EmergencyResource {
    pub fn from_record(resource_type: ResourceType, record: ResourceRecord) -> Self {
        Self {
            resource_type,
            city: record.city,
            county: record.county,
            latitude: record.latitude,
            longitude: record.longitude,
            quantity: record.quantity,
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.city, &self.county, self.resource_type)
    }

    pub fn matches(&self, key: &ResourceKey) -> bool {
        self.resource_type == key.resource_type
            && self.city == key.city
            && self.county == key.county
    }

    pub fn position(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorCounters {
    #[serde(default)]
    pub missed: u32,
    #[serde(default, alias = "overDispatched")]
    pub over_dispatched: u32,
}

/// `GET /control/status`. `signature` and `checksum` are passed through
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlStatus {
    pub status: SimulationStatus,
    #[serde(default)]
    pub active_calls: u32,
    #[serde(default)]
    pub total_dispatches: u32,
    #[serde(default)]
    pub target_dispatches: u32,
    #[serde(default)]
    pub max_active_calls: u32,
    #[serde(default)]
    pub distance: f64,
    #[serde(default)]
    pub penalty: f64,
    #[serde(default)]
    pub http_requests: u64,
    #[serde(default)]
    pub errors: ErrorCounters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetParams {
    pub seed: String,
    pub target_dispatches: u32,
    pub max_active_calls: u32,
}

impl ResetParams {
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        vec![
            ("seed".to_string(), self.seed.clone()),
            (
                "targetDispatches".to_string(),
                self.target_dispatches.to_string(),
            ),
            (
                "maxActiveCalls".to_string(),
                self.max_active_calls.to_string(),
            ),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub source_county: String,
    pub source_city: String,
    pub target_county: String,
    pub target_city: String,
    pub quantity: u32,
}

/// `POST /{type}/dispatch` response. Only `distance` is interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchReceipt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulateRequest {
    pub seed: String,
    pub target_dispatches: u32,
    pub max_active_calls: u32,
}

impl From<&ResetParams> for SimulateRequest {
    fn from(params: &ResetParams) -> Self {
        Self {
            seed: params.seed.clone(),
            target_dispatches: params.target_dispatches,
            max_active_calls: params.max_active_calls,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulateStatus {
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub dispatched: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self.status.to_ascii_lowercase().as_str(), "ok" | "healthy")
    }
}

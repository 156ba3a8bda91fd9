use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{CallKey, ResourceKey, ResourceType},
    error::{require_non_empty, ValidationError},
    protocol::{ControlStatus, DispatchRequest, EmergencyResource, LocationRecord, ResetParams},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Manual,
    /// The secondary backend makes dispatch decisions on its own loop.
    Auto,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartParams {
    pub seed: String,
    pub target_dispatches: u32,
    pub max_active_calls: u32,
    pub mode: RunMode,
}

impl StartParams {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("seed", &self.seed)?;
        require_positive("target_dispatches", self.target_dispatches)?;
        require_positive("max_active_calls", self.max_active_calls)
    }

    pub fn reset_params(&self) -> ResetParams {
        ResetParams {
            seed: self.seed.clone(),
            target_dispatches: self.target_dispatches,
            max_active_calls: self.max_active_calls,
        }
    }
}

fn require_positive(field: &'static str, value: u32) -> Result<(), ValidationError> {
    if value == 0 {
        return Err(ValidationError::OutOfRange {
            field,
            min: 1,
            max: u64::from(u32::MAX),
            value: 0,
        });
    }
    Ok(())
}

/// Operator request to move `quantity` units from `source` to `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOrder {
    pub source: ResourceKey,
    pub target: CallKey,
    pub quantity: i64,
}

impl DispatchOrder {
    pub fn validate(&self) -> Result<u32, ValidationError> {
        require_non_empty("source city", &self.source.city)?;
        require_non_empty("source county", &self.source.county)?;
        require_non_empty("target city", &self.target.city)?;
        require_non_empty("target county", &self.target.county)?;
        if self.quantity <= 0 {
            return Err(ValidationError::NonPositiveQuantity(self.quantity));
        }
        u32::try_from(self.quantity).map_err(|_| ValidationError::OutOfRange {
            field: "quantity",
            min: 1,
            max: u64::from(u32::MAX),
            value: self.quantity.unsigned_abs(),
        })
    }

    pub fn request(&self, quantity: u32) -> DispatchRequest {
        DispatchRequest {
            source_county: self.source.county.clone(),
            source_city: self.source.city.clone(),
            target_county: self.target.county.clone(),
            target_city: self.target.city.clone(),
            quantity,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchTotals {
    pub dispatched: u64,
    pub distance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DemandLine {
    pub resource_type: ResourceType,
    pub requested: u32,
    pub dispatched: u32,
    pub remaining: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallView {
    pub key: CallKey,
    pub latitude: f64,
    pub longitude: f64,
    pub demand: Vec<DemandLine>,
}

impl CallView {
    pub fn remaining(&self, resource_type: ResourceType) -> u32 {
        self.demand
            .iter()
            .filter(|line| line.resource_type == resource_type)
            .map(|line| line.remaining)
            .sum()
    }

    pub fn is_satisfied(&self) -> bool {
        self.demand.iter().all(|line| line.remaining == 0)
    }
}

/// Immutable copy of everything the dashboard renders.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DashboardView {
    pub calls: Vec<CallView>,
    pub resources: BTreeMap<ResourceType, Vec<EmergencyResource>>,
    pub locations: Vec<LocationRecord>,
    pub selected: Option<CallKey>,
    pub totals: DispatchTotals,
    pub status: Option<ControlStatus>,
    pub started_at: Option<DateTime<Utc>>,
}

impl DashboardView {
    pub fn call(&self, key: &CallKey) -> Option<&CallView> {
        self.calls.iter().find(|call| &call.key == key)
    }

    pub fn resource(&self, key: &ResourceKey) -> Option<&EmergencyResource> {
        self.resources
            .get(&key.resource_type)?
            .iter()
            .find(|resource| resource.matches(key))
    }

    /// Fraction of the target dispatch count reached, if a target is known.
    pub fn progress(&self) -> Option<f64> {
        let target = self.status.as_ref()?.target_dispatches;
        if target == 0 {
            return None;
        }
        Some((self.totals.dispatched as f64 / f64::from(target)).min(1.0))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DashboardEvent {
    ViewUpdated(Box<DashboardView>),
    StatusChanged(Option<ControlStatus>),
    Elapsed(String),
    DispatchApplied {
        source: ResourceKey,
        target: CallKey,
        quantity: u32,
        distance: f64,
    },
    SimulationStarted {
        mode: RunMode,
        resumed: bool,
    },
    SimulationEnded,
    /// A read path failed and the previous state was kept.
    Degraded {
        operation: &'static str,
        message: String,
    },
}

/// `HH:MM:SS`; hours are not wrapped at 24.
pub fn format_elapsed(started_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let total = (now - started_at).num_seconds().max(0);
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn elapsed_is_zero_padded_and_never_negative() {
        let start = Utc::now();
        assert_eq!(format_elapsed(start, start), "00:00:00");
        assert_eq!(
            format_elapsed(start, start + Duration::seconds(3_723)),
            "01:02:03"
        );
        assert_eq!(
            format_elapsed(start, start + Duration::hours(27)),
            "27:00:00"
        );
        assert_eq!(
            format_elapsed(start, start - Duration::seconds(5)),
            "00:00:00"
        );
    }

    #[test]
    fn dispatch_order_rejects_non_positive_quantity_before_any_request() {
        let order = DispatchOrder {
            source: ResourceKey::new("Albany", "Albany", ResourceType::Fire),
            target: CallKey::new("Troy", "Rensselaer"),
            quantity: 0,
        };
        assert_eq!(
            order.validate(),
            Err(ValidationError::NonPositiveQuantity(0))
        );

        let missing = DispatchOrder {
            source: ResourceKey::new("", "Albany", ResourceType::Fire),
            quantity: 1,
            ..order
        };
        assert_eq!(
            missing.validate(),
            Err(ValidationError::EmptyField {
                field: "source city"
            })
        );
    }

    #[test]
    fn start_params_require_seed_and_positive_limits() {
        let params = StartParams {
            seed: " ".into(),
            target_dispatches: 10,
            max_active_calls: 5,
            mode: RunMode::Manual,
        };
        assert!(params.validate().is_err());
        let ok = StartParams {
            seed: "default".into(),
            ..params
        };
        assert!(ok.validate().is_ok());
        assert_eq!(ok.reset_params().target_dispatches, 10);

        let no_target = StartParams {
            target_dispatches: 0,
            ..ok.clone()
        };
        assert_eq!(
            no_target.validate(),
            Err(ValidationError::OutOfRange {
                field: "target_dispatches",
                min: 1,
                max: u64::from(u32::MAX),
                value: 0,
            })
        );
        let no_calls = StartParams {
            max_active_calls: 0,
            ..ok
        };
        assert!(matches!(
            no_calls.validate(),
            Err(ValidationError::OutOfRange {
                field: "max_active_calls",
                ..
            })
        ));
    }
}

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    #[serde(alias = "medical", alias = "MEDICAL")]
    Medical,
    #[serde(alias = "fire", alias = "FIRE")]
    Fire,
    #[serde(alias = "police", alias = "POLICE")]
    Police,
    #[serde(alias = "rescue", alias = "RESCUE")]
    Rescue,
    #[serde(alias = "utility", alias = "UTILITY")]
    Utility,
}

impl ResourceType {
    pub const ALL: [ResourceType; 5] = [
        ResourceType::Medical,
        ResourceType::Fire,
        ResourceType::Police,
        ResourceType::Rescue,
        ResourceType::Utility,
    ];

    /// Path segment used by `/{type}/search` and `/{type}/dispatch`.
    pub fn path_segment(self) -> &'static str {
        match self {
            ResourceType::Medical => "medical",
            ResourceType::Fire => "fire",
            ResourceType::Police => "police",
            ResourceType::Rescue => "rescue",
            ResourceType::Utility => "utility",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown resource type '{0}'")]
pub struct UnknownResourceType(pub String);

impl FromStr for ResourceType {
    type Err = UnknownResourceType;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let lower = raw.trim().to_ascii_lowercase();
        ResourceType::ALL
            .into_iter()
            .find(|kind| kind.path_segment() == lower)
            .ok_or_else(|| UnknownResourceType(raw.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimulationStatus {
    #[serde(alias = "idle", alias = "IDLE")]
    Idle,
    #[serde(alias = "running", alias = "RUNNING")]
    Running,
    #[serde(alias = "stopped", alias = "STOPPED")]
    Stopped,
}

impl SimulationStatus {
    pub fn is_running(self) -> bool {
        self == SimulationStatus::Running
    }
}

/// Identity of an emergency call within the active queue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CallKey {
    pub city: String,
    pub county: String,
}

impl CallKey {
    pub fn new(city: impl Into<String>, county: impl Into<String>) -> Self {
        Self {
            city: city.into(),
            county: county.into(),
        }
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.county, self.city)
    }
}

/// Identity of a supply group: one resource type stationed at one location.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub city: String,
    pub county: String,
    pub resource_type: ResourceType,
}

impl ResourceKey {
    pub fn new(
        city: impl Into<String>,
        county: impl Into<String>,
        resource_type: ResourceType,
    ) -> Self {
        Self {
            city: city.into(),
            county: county.into(),
            resource_type,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.resource_type, self.county, self.city)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance in kilometres.
    pub fn haversine_km(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lon = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resource_type_case_insensitively() {
        assert_eq!("Fire".parse::<ResourceType>(), Ok(ResourceType::Fire));
        assert_eq!(" medical ".parse::<ResourceType>(), Ok(ResourceType::Medical));
        assert!("tanker".parse::<ResourceType>().is_err());
    }

    #[test]
    fn unknown_resource_type_names_the_rejected_input() {
        let error = "Tanker".parse::<ResourceType>().expect_err("not a resource type");
        assert_eq!(error, UnknownResourceType("Tanker".into()));
        assert_eq!(error.to_string(), "unknown resource type 'Tanker'");
        let boxed: Box<dyn std::error::Error> = Box::new(error);
        assert!(boxed.source().is_none());
    }

    #[test]
    fn decodes_status_in_either_case() {
        let upper: SimulationStatus = serde_json::from_str("\"Running\"").expect("upper");
        let lower: SimulationStatus = serde_json::from_str("\"running\"").expect("lower");
        assert_eq!(upper, SimulationStatus::Running);
        assert_eq!(lower, SimulationStatus::Running);
    }

    #[test]
    fn haversine_is_zero_for_same_point_and_symmetric() {
        let a = GeoPoint::new(40.7128, -74.0060);
        let b = GeoPoint::new(42.6526, -73.7562);
        assert!(a.haversine_km(&a).abs() < 1e-9);
        let ab = a.haversine_km(&b);
        let ba = b.haversine_km(&a);
        assert!((ab - ba).abs() < 1e-9);
        assert!((200.0..240.0).contains(&ab), "unexpected distance {ab}");
    }
}

//! Commands that act on the backends without following a session. They still
//! keep the stored session snapshot in step with what they change.

use chrono::Utc;
use client_core::{
    ApiError, AutoDispatchBackend, DispatchOrder, SessionRecovery, SimulationBackend,
};
use reqwest::Method;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub quantity: u32,
    pub distance: f64,
    pub snapshot_updated: bool,
}

/// Stops both backends and discards the snapshot so a stopped session is
/// never offered for resume.
pub async fn stop_once(
    control: &dyn SimulationBackend,
    auto: &dyn AutoDispatchBackend,
    recovery: &SessionRecovery,
) -> Result<(), ApiError> {
    control.stop().await?;
    if let Err(error) = auto.stop().await {
        warn!(%error, "console: auto-dispatch stop failed");
    }
    if let Err(error) = recovery.clear().await {
        warn!(%error, "console: snapshot clear failed");
    }
    Ok(())
}

pub async fn dispatch_once(
    backend: &dyn SimulationBackend,
    recovery: &SessionRecovery,
    order: &DispatchOrder,
) -> Result<DispatchOutcome, ApiError> {
    let resource_type = order.source.resource_type;
    let quantity = order.validate().map_err(|error| {
        ApiError::validation(
            Method::POST,
            format!("/{}/dispatch", resource_type.path_segment()),
            error,
        )
    })?;

    let receipt = backend
        .dispatch(resource_type, &order.request(quantity))
        .await?;
    let per_unit = match receipt.distance {
        Some(distance) => distance,
        None => distance_between(backend, order).await,
    };
    let distance = per_unit * f64::from(quantity);

    let snapshot_updated = match recovery.add_progress(quantity, distance, Utc::now()).await {
        Ok(updated) => updated,
        Err(error) => {
            warn!(%error, "console: snapshot progress failed");
            false
        }
    };

    Ok(DispatchOutcome {
        quantity,
        distance,
        snapshot_updated,
    })
}

/// Per-unit distance from coordinates, or zero when either end is not found.
async fn distance_between(backend: &dyn SimulationBackend, order: &DispatchOrder) -> f64 {
    let (resources, calls) = tokio::join!(
        backend.search_resources(order.source.resource_type),
        backend.call_queue()
    );
    let source = resources
        .ok()
        .and_then(|resources| resources.into_iter().find(|resource| resource.matches(&order.source)));
    let target = calls
        .ok()
        .and_then(|calls| calls.into_iter().find(|call| call.matches(&order.target)));
    match (source, target) {
        (Some(source), Some(target)) => source.position().haversine_km(&target.position()),
        _ => {
            debug!(source = %order.source, target = %order.target, "console: no coordinates for distance");
            0.0
        }
    }
}

#[cfg(test)]
#[path = "tests/oneshot_tests.rs"]
mod tests;

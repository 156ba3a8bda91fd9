//! Merges polled authoritative state with locally applied dispatch effects.
//!
//! The call queue never echoes back how many units this client has sent, so
//! per-call `dispatched` counts are owned here and carried forward across
//! polls. Everything else (which calls exist, what they request, how many
//! units each supply group holds) is taken from the server.
//!
//! Poll results are ordered by [`PollTicket`]: a result whose ticket was
//! issued before the most recent dispatch, or before the last applied result
//! of the same kind, is dropped so a late response cannot undo newer state.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use shared::{
    domain::{CallKey, ResourceKey, ResourceType},
    protocol::{ControlStatus, EmergencyCall, EmergencyResource, LocationRecord},
};
use tracing::{debug, warn};

use crate::types::{CallView, DashboardView, DemandLine, DispatchTotals};

pub type PollTicket = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollKind {
    Queue,
    Resources(ResourceType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Applied,
    Stale,
}

/// Units still needed for one resource type on one call. Over-dispatch is
/// reported as zero remaining; the server's treatment of it is not modelled.
pub fn remaining_needed(requested: u32, dispatched: u32) -> u32 {
    requested.saturating_sub(dispatched)
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchEffect {
    pub resource: ResourceKey,
    pub target: CallKey,
    pub quantity: u32,
    /// Distance reported by the backend; computed from coordinates if absent.
    pub distance_per_unit: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchApplied {
    pub call_found: bool,
    pub resource_found: bool,
    pub distance: f64,
    pub remaining: u32,
    pub totals: DispatchTotals,
}

#[derive(Debug, Default)]
pub struct DispatchState {
    last_ticket: PollTicket,
    last_dispatch_ticket: PollTicket,
    applied: HashMap<PollKind, PollTicket>,
    calls: Vec<EmergencyCall>,
    resources: BTreeMap<ResourceType, Vec<EmergencyResource>>,
    locations: Vec<LocationRecord>,
    status: Option<ControlStatus>,
    selected: Option<CallKey>,
    totals: DispatchTotals,
    started_at: Option<DateTime<Utc>>,
}

impl DispatchState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Must be taken before the request it stamps is issued.
    pub fn issue_ticket(&mut self) -> PollTicket {
        self.last_ticket += 1;
        self.last_ticket
    }

    fn is_stale(&self, kind: PollKind, ticket: PollTicket) -> bool {
        if ticket <= self.last_dispatch_ticket {
            return true;
        }
        self.applied
            .get(&kind)
            .is_some_and(|applied| ticket <= *applied)
    }

    pub fn apply_queue(&mut self, ticket: PollTicket, polled: Vec<EmergencyCall>) -> PollOutcome {
        if self.is_stale(PollKind::Queue, ticket) {
            debug!(ticket, last_dispatch = self.last_dispatch_ticket, "reconcile: stale queue poll dropped");
            return PollOutcome::Stale;
        }
        self.applied.insert(PollKind::Queue, ticket);

        let mut previous: HashMap<CallKey, EmergencyCall> = self
            .calls
            .drain(..)
            .map(|call| (call.key(), call))
            .collect();

        self.calls = polled
            .into_iter()
            .map(|mut call| {
                match previous.remove(&call.key()) {
                    Some(tracked) if !tracked.dispatched.is_empty() => {
                        call.dispatched = tracked.dispatched;
                    }
                    // Only cached payloads carry counts; live queue polls never do.
                    None if !call.dispatched.is_empty() => {}
                    _ => {
                        call.dispatched = call
                            .requests
                            .iter()
                            .map(|request| (request.resource_type, 0))
                            .collect();
                    }
                }
                call
            })
            .collect();

        if let Some(selected) = &self.selected {
            if !self.calls.iter().any(|call| call.matches(selected)) {
                debug!(call = %selected, "reconcile: selected call left the queue");
                self.selected = None;
            }
        }
        PollOutcome::Applied
    }

    pub fn apply_resources(
        &mut self,
        ticket: PollTicket,
        resource_type: ResourceType,
        polled: Vec<EmergencyResource>,
    ) -> PollOutcome {
        let kind = PollKind::Resources(resource_type);
        if self.is_stale(kind, ticket) {
            debug!(ticket, %resource_type, "reconcile: stale resource poll dropped");
            return PollOutcome::Stale;
        }
        self.applied.insert(kind, ticket);
        self.resources.insert(resource_type, polled);
        PollOutcome::Applied
    }

    pub fn apply_locations(&mut self, locations: Vec<LocationRecord>) {
        self.locations = locations;
    }

    pub fn apply_status(&mut self, status: Option<ControlStatus>) {
        self.status = status;
    }

    pub fn status(&self) -> Option<&ControlStatus> {
        self.status.as_ref()
    }

    /// Tracked calls with their carried-forward dispatched counts.
    pub fn calls(&self) -> &[EmergencyCall] {
        &self.calls
    }

    pub fn has_calls(&self) -> bool {
        !self.calls.is_empty()
    }

    pub fn has_resources(&self, resource_type: ResourceType) -> bool {
        self.resources
            .get(&resource_type)
            .is_some_and(|resources| !resources.is_empty())
    }

    pub fn call(&self, key: &CallKey) -> Option<&EmergencyCall> {
        self.calls.iter().find(|call| call.matches(key))
    }

    pub fn resource(&self, key: &ResourceKey) -> Option<&EmergencyResource> {
        self.resources
            .get(&key.resource_type)?
            .iter()
            .find(|resource| resource.matches(key))
    }

    /// Applies a confirmed dispatch immediately, ahead of the next poll, and
    /// invalidates every poll issued before it.
    pub fn apply_dispatch(&mut self, effect: &DispatchEffect) -> DispatchApplied {
        self.last_dispatch_ticket = self.issue_ticket();

        let per_unit = effect.distance_per_unit.unwrap_or_else(|| {
            match (self.resource(&effect.resource), self.call(&effect.target)) {
                (Some(resource), Some(call)) => resource.position().haversine_km(&call.position()),
                _ => 0.0,
            }
        });
        let distance = per_unit * f64::from(effect.quantity);
        let resource_type = effect.resource.resource_type;

        let mut remaining = 0;
        let call_found = match self.calls.iter_mut().find(|call| call.matches(&effect.target)) {
            Some(call) => {
                let requested = call.requested(resource_type);
                let dispatched = call.dispatched.entry(resource_type).or_insert(0);
                *dispatched = dispatched.saturating_add(effect.quantity);
                remaining = remaining_needed(requested, *dispatched);
                true
            }
            None => {
                warn!(call = %effect.target, "reconcile: dispatch target not held locally");
                false
            }
        };

        let resource_found = match self
            .resources
            .get_mut(&resource_type)
            .and_then(|resources| resources.iter_mut().find(|resource| resource.matches(&effect.resource)))
        {
            Some(resource) => {
                resource.quantity = resource.quantity.saturating_sub(effect.quantity);
                true
            }
            None => {
                warn!(resource = %effect.resource, "reconcile: dispatch source not held locally");
                false
            }
        };

        self.totals.dispatched += u64::from(effect.quantity);
        self.totals.distance += distance;

        DispatchApplied {
            call_found,
            resource_found,
            distance,
            remaining,
            totals: self.totals,
        }
    }

    pub fn select(&mut self, key: CallKey) -> bool {
        if self.call(&key).is_none() {
            return false;
        }
        self.selected = Some(key);
        true
    }

    pub fn clear_selection(&mut self) {
        self.selected = None;
    }

    pub fn selected(&self) -> Option<&CallKey> {
        self.selected.as_ref()
    }

    pub fn totals(&self) -> DispatchTotals {
        self.totals
    }

    /// Seeds counters and start time from a resumed session.
    pub fn restore_totals(&mut self, totals: DispatchTotals, started_at: DateTime<Utc>) {
        self.totals = totals;
        self.started_at = Some(started_at);
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Drops all simulation state. Tickets keep increasing so results of
    /// polls issued before the reset stay stale.
    pub fn reset(&mut self, started_at: Option<DateTime<Utc>>) {
        let last_ticket = self.last_ticket;
        *self = Self {
            last_ticket,
            last_dispatch_ticket: last_ticket,
            started_at,
            ..Self::default()
        };
    }

    pub fn view(&self) -> DashboardView {
        let calls = self
            .calls
            .iter()
            .map(|call| {
                let mut demand: BTreeMap<ResourceType, u32> = BTreeMap::new();
                for request in &call.requests {
                    *demand.entry(request.resource_type).or_insert(0) += request.quantity;
                }
                CallView {
                    key: call.key(),
                    latitude: call.latitude,
                    longitude: call.longitude,
                    demand: demand
                        .into_iter()
                        .map(|(resource_type, requested)| {
                            let dispatched = call.dispatched_of(resource_type);
                            DemandLine {
                                resource_type,
                                requested,
                                dispatched,
                                remaining: remaining_needed(requested, dispatched),
                            }
                        })
                        .collect(),
                }
            })
            .collect();

        DashboardView {
            calls,
            resources: self.resources.clone(),
            locations: self.locations.clone(),
            selected: self.selected.clone(),
            totals: self.totals,
            status: self.status.clone(),
            started_at: self.started_at,
        }
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;

//! Text rendering of dashboard events and failures for the operator console.

use client_core::{ApiError, DashboardEvent, DashboardView, RunMode};
use shared::{
    error::ErrorKind,
    protocol::{ControlStatus, SimulateStatus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorErrorCategory {
    Connectivity,
    Server,
    Rejected,
    Input,
    Protocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorErrorContext {
    Start,
    Resume,
    Dispatch,
    Control,
    Read,
}

#[derive(Debug, Clone)]
pub struct OperatorError {
    category: OperatorErrorCategory,
    context: OperatorErrorContext,
    message: String,
}

impl OperatorError {
    pub fn from_api(context: OperatorErrorContext, error: &ApiError) -> Self {
        let category = match error.kind {
            ErrorKind::Network | ErrorKind::Timeout => OperatorErrorCategory::Connectivity,
            ErrorKind::Server => OperatorErrorCategory::Server,
            ErrorKind::Client => OperatorErrorCategory::Rejected,
            ErrorKind::Validation => OperatorErrorCategory::Input,
            ErrorKind::Decode => OperatorErrorCategory::Protocol,
        };
        Self {
            category,
            context,
            message: error.message.clone(),
        }
    }

    pub fn category(&self) -> OperatorErrorCategory {
        self.category
    }

    pub fn context(&self) -> OperatorErrorContext {
        self.context
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether repeating the same action unchanged can succeed.
    pub fn worth_retrying(&self) -> bool {
        matches!(
            self.category,
            OperatorErrorCategory::Connectivity | OperatorErrorCategory::Server
        )
    }

    pub fn render(&self) -> String {
        let hint = match self.category {
            OperatorErrorCategory::Connectivity => {
                "backend unreachable; check the URL and network, then retry"
            }
            OperatorErrorCategory::Server => "backend failed; retry shortly",
            // Client errors carry the server's own explanation.
            OperatorErrorCategory::Rejected => "",
            OperatorErrorCategory::Input => "fix the input and try again",
            OperatorErrorCategory::Protocol => "backend sent an unexpected response",
        };
        let label = category_label(self.category);
        if hint.is_empty() {
            format!("{} error ({label}): {}", context_label(self.context), self.message)
        } else {
            format!(
                "{} error ({label}): {}; {hint}",
                context_label(self.context),
                self.message
            )
        }
    }
}

fn category_label(category: OperatorErrorCategory) -> &'static str {
    match category {
        OperatorErrorCategory::Connectivity => "connectivity",
        OperatorErrorCategory::Server => "server",
        OperatorErrorCategory::Rejected => "rejected",
        OperatorErrorCategory::Input => "input",
        OperatorErrorCategory::Protocol => "protocol",
    }
}

fn context_label(context: OperatorErrorContext) -> &'static str {
    match context {
        OperatorErrorContext::Start => "start",
        OperatorErrorContext::Resume => "resume",
        OperatorErrorContext::Dispatch => "dispatch",
        OperatorErrorContext::Control => "control",
        OperatorErrorContext::Read => "read",
    }
}

/// Console lines for one event. Elapsed ticks and view refreshes are
/// condensed to a single progress line.
pub fn render_event(event: &DashboardEvent) -> Vec<String> {
    match event {
        DashboardEvent::ViewUpdated(view) => vec![render_progress(view)],
        DashboardEvent::StatusChanged(Some(status)) => vec![render_control_status(status)],
        DashboardEvent::StatusChanged(None) => vec!["status: unknown".to_string()],
        DashboardEvent::Elapsed(elapsed) => vec![format!("elapsed {elapsed}")],
        DashboardEvent::DispatchApplied {
            source,
            target,
            quantity,
            distance,
        } => vec![format!(
            "dispatched {quantity} from {source} to {target} ({distance:.1} km)"
        )],
        DashboardEvent::SimulationStarted { mode, resumed } => {
            let verb = if *resumed { "resumed" } else { "started" };
            vec![format!("simulation {verb} in {} mode", mode_label(*mode))]
        }
        DashboardEvent::SimulationEnded => vec!["simulation ended".to_string()],
        DashboardEvent::Degraded { operation, message } => {
            vec![format!("degraded: {operation} failed, showing last known data ({message})")]
        }
    }
}

/// Drops repeats of the periodic status and progress lines and holds the
/// clock back for on-demand display.
#[derive(Debug, Default)]
pub struct EventPrinter {
    last_status: Option<String>,
    last_progress: Option<String>,
    elapsed: Option<String>,
}

impl EventPrinter {
    pub fn lines(&mut self, event: &DashboardEvent) -> Vec<String> {
        match event {
            DashboardEvent::Elapsed(elapsed) => {
                self.elapsed = Some(elapsed.clone());
                Vec::new()
            }
            DashboardEvent::StatusChanged(_) => {
                Self::changed(&mut self.last_status, render_event(event))
            }
            DashboardEvent::ViewUpdated(_) => {
                Self::changed(&mut self.last_progress, render_event(event))
            }
            DashboardEvent::SimulationEnded => {
                self.last_status = None;
                self.last_progress = None;
                render_event(event)
            }
            _ => render_event(event),
        }
    }

    pub fn elapsed(&self) -> Option<&str> {
        self.elapsed.as_deref()
    }

    fn changed(last: &mut Option<String>, lines: Vec<String>) -> Vec<String> {
        let joined = lines.join("\n");
        if last.as_deref() == Some(joined.as_str()) {
            return Vec::new();
        }
        *last = Some(joined);
        lines
    }
}

pub fn render_progress(view: &DashboardView) -> String {
    let open = view.calls.iter().filter(|call| !call.is_satisfied()).count();
    let available: u32 = view
        .resources
        .values()
        .flatten()
        .map(|resource| resource.quantity)
        .sum();
    let progress = view
        .progress()
        .map(|ratio| format!(" {:.0}%", ratio * 100.0))
        .unwrap_or_default();
    format!(
        "calls={} open={open} units_available={available} dispatched={} distance={:.1}km{progress}",
        view.calls.len(),
        view.totals.dispatched,
        view.totals.distance,
    )
}

/// Outstanding demand per call, one line each.
pub fn render_queue(view: &DashboardView) -> Vec<String> {
    view.calls
        .iter()
        .map(|call| {
            let demand = call
                .demand
                .iter()
                .map(|line| {
                    format!(
                        "{}:{}/{} (need {})",
                        line.resource_type, line.dispatched, line.requested, line.remaining
                    )
                })
                .collect::<Vec<_>>()
                .join(" ");
            let marker = if view.selected.as_ref() == Some(&call.key) {
                "*"
            } else {
                " "
            };
            format!("{marker} {} {demand}", call.key)
        })
        .collect()
}

pub fn render_control_status(status: &ControlStatus) -> String {
    let seed = status.seed.as_deref().unwrap_or("-");
    format!(
        "status={:?} active_calls={}/{} dispatches={}/{} distance={:.1} penalty={:.1} missed={} over_dispatched={} seed={seed}",
        status.status,
        status.active_calls,
        status.max_active_calls,
        status.total_dispatches,
        status.target_dispatches,
        status.distance,
        status.penalty,
        status.errors.missed,
        status.errors.over_dispatched,
    )
}

pub fn render_simulate_status(status: &SimulateStatus) -> String {
    let message = status
        .message
        .as_deref()
        .map(|message| format!(" ({message})"))
        .unwrap_or_default();
    format!(
        "auto-dispatch running={} dispatched={}{message}",
        status.running, status.dispatched
    )
}

fn mode_label(mode: RunMode) -> &'static str {
    match mode {
        RunMode::Manual => "manual",
        RunMode::Auto => "auto",
    }
}

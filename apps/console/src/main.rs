mod commands;
mod config;
mod oneshot;
mod render;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    telemetry::{load_perf_samples, stats_by_endpoint, success_rate},
    ApiError, AutoDispatchBackend, DispatchOrder, ErrorTracker, HttpAutoDispatchBackend,
    HttpSimulationBackend, Orchestrator, PerfRecorder, RequestEngine, ResumeDecision, RunMode,
    SessionRecovery, SimulationBackend, StartParams,
};
use shared::domain::{CallKey, ResourceKey, ResourceType};
use storage::{open_store, KeyValueStore};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    commands::{parse_command, OperatorCommand, HELP},
    config::{load_settings, Settings},
    oneshot::{dispatch_once, stop_once},
    render::{
        render_control_status, render_progress, render_queue, render_simulate_status,
        EventPrinter, OperatorError, OperatorErrorContext,
    },
};

#[derive(Parser, Debug)]
#[command(name = "dispatch-console", about = "Operator console for the dispatch simulation")]
struct Cli {
    /// Control API base URL; overrides settings.
    #[arg(long)]
    control_url: Option<String>,
    /// Auto-dispatch API base URL; overrides settings.
    #[arg(long)]
    auto_url: Option<String>,
    /// `memory`, a `.json` path, or a sqlite URL.
    #[arg(long)]
    store: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a simulation (or resume the last one) and follow it.
    Run {
        #[arg(long)]
        seed: String,
        #[arg(long, default_value_t = 100)]
        target_dispatches: u32,
        #[arg(long, default_value_t = 5)]
        max_active_calls: u32,
        /// Let the auto-dispatch backend make dispatch decisions.
        #[arg(long)]
        auto: bool,
        /// Skip the resume offer.
        #[arg(long)]
        fresh: bool,
        #[arg(long)]
        auto_fetch_secs: Option<u64>,
        #[arg(long)]
        no_auto_fetch: bool,
    },
    Status,
    Stop,
    Dispatch {
        resource_type: ResourceType,
        #[arg(allow_negative_numbers = true)]
        quantity: i64,
        #[arg(long)]
        source_county: String,
        #[arg(long)]
        source_city: String,
        #[arg(long)]
        target_county: String,
        #[arg(long)]
        target_city: String,
    },
    /// Ask the control API for the next call.
    Next,
    Health,
    /// Summarise request timings persisted by earlier runs.
    Perf,
}

struct Clients {
    store: Arc<dyn KeyValueStore>,
    control: Arc<HttpSimulationBackend>,
    auto: Arc<HttpAutoDispatchBackend>,
    perf: Arc<PerfRecorder>,
    errors: Arc<ErrorTracker>,
}

impl Clients {
    async fn connect(settings: &Settings) -> Result<Self> {
        let store = open_store(&settings.store)
            .await
            .with_context(|| format!("failed to open store {}", settings.store))?;
        let perf = Arc::new(PerfRecorder::default());
        let errors = Arc::new(ErrorTracker::default());
        let options = settings.request_options();

        let control = RequestEngine::new(&settings.control_url, options)
            .with_context(|| format!("invalid control url {}", settings.control_url))?
            .with_telemetry(Arc::clone(&perf), Arc::clone(&errors));
        let auto = RequestEngine::new(&settings.auto_url, options)
            .with_context(|| format!("invalid auto-dispatch url {}", settings.auto_url))?
            .with_telemetry(Arc::clone(&perf), Arc::clone(&errors));

        Ok(Self {
            store,
            control: Arc::new(HttpSimulationBackend::new(control)),
            auto: Arc::new(HttpAutoDispatchBackend::new(auto)),
            perf,
            errors,
        })
    }

    fn recovery(&self) -> SessionRecovery {
        SessionRecovery::new(Arc::clone(&self.store))
    }

    async fn persist_telemetry(&self) {
        if let Err(error) = self.perf.persist(&self.store).await {
            warn!(%error, "console: failed to persist perf samples");
        }
        if let Err(error) = self.errors.persist(&self.store).await {
            warn!(%error, "console: failed to persist tracked errors");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut settings = load_settings();
    if let Some(control_url) = cli.control_url {
        settings.control_url = control_url;
    }
    if let Some(auto_url) = cli.auto_url {
        settings.auto_url = auto_url;
    }
    if let Some(store) = cli.store {
        settings.store = store;
    }

    let clients = Clients::connect(&settings).await?;
    let outcome = execute(cli.command, &settings, &clients).await;
    clients.persist_telemetry().await;
    outcome
}

async fn execute(command: Command, settings: &Settings, clients: &Clients) -> Result<()> {
    match command {
        Command::Run {
            seed,
            target_dispatches,
            max_active_calls,
            auto,
            fresh,
            auto_fetch_secs,
            no_auto_fetch,
        } => {
            let params = StartParams {
                seed,
                target_dispatches,
                max_active_calls,
                mode: if auto { RunMode::Auto } else { RunMode::Manual },
            };
            let options = RunOptions {
                fresh,
                auto_fetch_secs,
                auto_fetch_enabled: !no_auto_fetch && settings.auto_fetch_enabled,
            };
            run(settings, clients, params, options).await
        }
        Command::Status => {
            let status = clients
                .control
                .control_status()
                .await
                .map_err(|error| report(OperatorErrorContext::Read, error))?;
            println!("{}", render_control_status(&status));
            match clients.auto.status().await {
                Ok(auto_status) => println!("{}", render_simulate_status(&auto_status)),
                Err(error) => println!("auto-dispatch status unavailable: {}", error.message),
            }
            Ok(())
        }
        Command::Stop => {
            stop_once(clients.control.as_ref(), clients.auto.as_ref(), &clients.recovery())
                .await
                .map_err(|error| report(OperatorErrorContext::Control, error))?;
            println!("simulation stopped");
            Ok(())
        }
        Command::Dispatch {
            resource_type,
            quantity,
            source_county,
            source_city,
            target_county,
            target_city,
        } => {
            let order = DispatchOrder {
                source: ResourceKey::new(source_city, source_county, resource_type),
                target: CallKey::new(target_city, target_county),
                quantity,
            };
            let outcome = dispatch_once(clients.control.as_ref(), &clients.recovery(), &order)
                .await
                .map_err(|error| report(OperatorErrorContext::Dispatch, error))?;
            println!(
                "dispatched {} from {} to {} ({:.1} km)",
                outcome.quantity, order.source, order.target, outcome.distance
            );
            if outcome.snapshot_updated {
                println!("session progress updated");
            }
            Ok(())
        }
        Command::Next => {
            clients
                .control
                .next_call()
                .await
                .map_err(|error| report(OperatorErrorContext::Control, error))?;
            println!("next call requested");
            Ok(())
        }
        Command::Health => {
            match clients.control.control_status().await {
                Ok(status) => println!("control: up ({:?})", status.status),
                Err(error) => println!("control: down ({})", error.message),
            }
            match clients.auto.health().await {
                Ok(health) => println!("auto-dispatch: {}", health.status),
                Err(error) => println!("auto-dispatch: down ({})", error.message),
            }
            Ok(())
        }
        Command::Perf => print_perf(&clients.store).await,
    }
}

struct RunOptions {
    fresh: bool,
    auto_fetch_secs: Option<u64>,
    auto_fetch_enabled: bool,
}

async fn run(
    settings: &Settings,
    clients: &Clients,
    params: StartParams,
    options: RunOptions,
) -> Result<()> {
    let control: Arc<dyn SimulationBackend> = clients.control.clone();
    let auto: Arc<dyn AutoDispatchBackend> = clients.auto.clone();
    let orchestrator = Orchestrator::new(
        control,
        auto,
        Arc::clone(&clients.store),
        settings.orchestrator_config(),
    );
    let mut events = BroadcastStream::new(orchestrator.subscribe());
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    if let Some(seconds) = options.auto_fetch_secs {
        orchestrator
            .set_auto_fetch_interval(seconds)
            .await
            .map_err(|error| report(OperatorErrorContext::Start, error))?;
    }
    orchestrator
        .set_auto_fetch_enabled(options.auto_fetch_enabled)
        .await;

    let resumed = if options.fresh {
        false
    } else {
        offer_resume(settings, &orchestrator, &mut stdin).await?
    };
    if !resumed {
        orchestrator
            .start_simulation(params)
            .await
            .map_err(|error| report(OperatorErrorContext::Start, error))?;
    }
    println!("{HELP}");

    let mut printer = EventPrinter::default();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("console: interrupted, leaving the simulation running");
                break;
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    if handle_command(&orchestrator, &printer, &line).await == Flow::Quit {
                        break;
                    }
                }
                Ok(None) => stdin_open = false,
                Err(error) => {
                    warn!(%error, "console: stdin read failed");
                    stdin_open = false;
                }
            },
            event = events.next() => match event {
                Some(Ok(event)) => {
                    for line in printer.lines(&event) {
                        println!("{line}");
                    }
                    if matches!(event, client_core::DashboardEvent::SimulationEnded) {
                        break;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                    warn!(missed, "console: event stream lagged");
                }
                None => break,
            },
        }
    }

    orchestrator.shutdown();
    Ok(())
}

async fn offer_resume(
    settings: &Settings,
    orchestrator: &Arc<Orchestrator>,
    stdin: &mut Lines<BufReader<Stdin>>,
) -> Result<bool> {
    let Some(snapshot) = orchestrator.offer_resume().await? else {
        return Ok(false);
    };
    let timeout = settings.resume_prompt_timeout();
    println!(
        "Found session '{}' started {} with {} dispatched ({:.1} km). Resume? [y/N] ({}s)",
        snapshot.seed,
        snapshot.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        snapshot.dispatched,
        snapshot.distance,
        timeout.as_secs()
    );

    let decision = async {
        match stdin.next_line().await {
            Ok(Some(answer)) => Some(parse_decision(&answer)),
            _ => None,
        }
    };
    match orchestrator.resolve_resume(snapshot, decision, timeout).await {
        Ok(resumed) => Ok(resumed),
        Err(error) => match error.downcast::<ApiError>() {
            Ok(api_error) => Err(report(OperatorErrorContext::Resume, api_error)),
            Err(other) => Err(other.context("failed to resolve the resume prompt")),
        },
    }
}

fn parse_decision(answer: &str) -> ResumeDecision {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => ResumeDecision::Resume,
        _ => ResumeDecision::Decline,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

async fn handle_command(orchestrator: &Arc<Orchestrator>, printer: &EventPrinter, line: &str) -> Flow {
    let command = match parse_command(line) {
        Ok(command) => command,
        Err(error) => {
            println!("{error:#}");
            return Flow::Continue;
        }
    };

    match command {
        OperatorCommand::Dispatch {
            source,
            target,
            quantity,
        } => {
            let order = DispatchOrder {
                source,
                target,
                quantity,
            };
            if let Err(error) = orchestrator.dispatch(order).await {
                print_failure(OperatorErrorContext::Dispatch, &error);
            }
        }
        OperatorCommand::Select(key) => {
            if !orchestrator.select_call(key.clone()).await {
                println!("no active call at {key}");
            }
        }
        OperatorCommand::ClearSelection => orchestrator.clear_selection().await,
        OperatorCommand::ShowQueue => {
            let view = orchestrator.view().await;
            println!("{}", render_progress(&view));
            if let Some(elapsed) = printer.elapsed() {
                println!("elapsed {elapsed}");
            }
            for line in render_queue(&view) {
                println!("{line}");
            }
        }
        OperatorCommand::AutoFetchInterval(seconds) => {
            match orchestrator.set_auto_fetch_interval(seconds).await {
                Ok(()) => println!("auto-fetch every {seconds}s"),
                Err(error) => print_failure(OperatorErrorContext::Control, &error),
            }
        }
        OperatorCommand::AutoFetchEnabled(enabled) => {
            orchestrator.set_auto_fetch_enabled(enabled).await;
            println!("auto-fetch {}", if enabled { "on" } else { "off" });
        }
        OperatorCommand::Stop => {
            if let Err(error) = orchestrator.stop_simulation().await {
                print_failure(OperatorErrorContext::Control, &error);
            }
        }
        OperatorCommand::Quit => return Flow::Quit,
        OperatorCommand::Help => println!("{HELP}"),
    }
    Flow::Continue
}

async fn print_perf(store: &Arc<dyn KeyValueStore>) -> Result<()> {
    let samples = load_perf_samples(store)
        .await
        .context("failed to load perf samples")?;
    if samples.is_empty() {
        println!("no samples recorded");
        return Ok(());
    }
    if let Some(rate) = success_rate(&samples) {
        println!("{} samples, {:.1}% successful", samples.len(), rate * 100.0);
    }
    for (endpoint, stats) in stats_by_endpoint(&samples) {
        println!(
            "{endpoint}: n={} avg={:.0}ms ok={:.1}%",
            stats.samples,
            stats.average_ms,
            stats.success_rate * 100.0
        );
    }
    Ok(())
}

fn print_failure(context: OperatorErrorContext, error: &ApiError) {
    let failure = OperatorError::from_api(context, error);
    warn!(context = ?failure.context(), kind = ?error.kind, url = %error.url, retries = error.retries, message = failure.message(), "console: operation failed");
    println!("{}", failure.render());
    if failure.worth_retrying() {
        println!("the same request may succeed if repeated");
    }
}

fn report(context: OperatorErrorContext, error: ApiError) -> anyhow::Error {
    let rendered = OperatorError::from_api(context, &error).render();
    anyhow::Error::new(error).context(rendered)
}

// src/main.rs

//! Agent entry-point: console process between the sensors and the companion.
//!
//! 1. Load configuration & set up structured logging
//! 2. Optionally expose Prometheus metrics
//! 3. Build the gRPC transport, dispatcher and action tracker
//! 4. Read `SystemEvent` JSON lines from stdin on a reader thread
//! 5. Drive the control loop every tick; policy events go to stdout
//! 6. On stdin EOF, let in-flight actions settle, then shut down cleanly

use std::{
    env,
    io::{self, BufRead},
    path::{Path, PathBuf},
    process, thread,
    time::Instant,
};

use anyhow::{Context, Result, anyhow};
use chrono::Local;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};
use fern::Dispatch;
use log::LevelFilter;
use metrics_exporter_prometheus::PrometheusBuilder;

use response_agent::actions::{
    ActionTracker, CaptureJob, JsonLinesSink, LocalExecutor,
};
use response_agent::comms::channel::ChannelTransport;
use response_agent::comms::companion::Companion;
use response_agent::comms::messages::Reply;
use response_agent::comms::Dispatcher;
use response_agent::config::{self, Config, LoggingConfig};
use response_agent::policy::event::SystemEvent;
use response_agent::policy::manager::SecurityManager;

/// Overrides the default `config.toml` next to the executable.
const CONFIG_ENV: &str = "RESPONSE_AGENT_CONFIG";

// ───── helpers ──────────────────────────────────────────────────────────────

/// Print an error with context and terminate the process.
macro_rules! fatal {
    ($ctx:expr, $($arg:tt)+) => {{
        eprintln!(
            "[{}][ERROR][{}] {}",
            chrono::Local::now().to_rfc3339(),
            $ctx,
            format!($($arg)+)
        );
        std::process::exit(1);
    }};
}

/// Directory that contains the running executable.
fn exe_dir() -> Result<PathBuf> {
    let exe = env::current_exe().context("cannot determine exe path")?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("executable must live in some directory"))
}

fn load_config(exe_dir: &Path) -> Result<Config> {
    let path = env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| exe_dir.join("config.toml"));
    config::load(&path).with_context(|| format!("loading {}", path.display()))
}

/// Configure global logging as requested in `[logging]`. Stdout carries the
/// event stream, so log lines go to stderr.
fn setup_logging(exe_dir: &Path, logging: &LoggingConfig) -> Result<(), fern::InitError> {
    let level = match logging.level.to_uppercase().as_str() {
        "ERROR" => LevelFilter::Error,
        "WARN" => LevelFilter::Warn,
        "DEBUG" => LevelFilter::Debug,
        "TRACE" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    let log_path = logging
        .enable
        .then(|| exe_dir.join(logging.file.as_deref().unwrap_or("response-agent.log")));

    let mut dispatch = Dispatch::new()
        .format(|out, msg, record| {
            out.finish(format_args!(
                "[{}][{:5}][{}][pid={}][tid={:?}] {}",
                Local::now().to_rfc3339(),
                record.level(),
                record.target(),
                process::id(),
                thread::current().id(),
                msg
            ))
        })
        .level(level)
        .chain(io::stderr());

    if let Some(path) = log_path {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}

/// Parse stdin line by line; the channel closes on EOF.
fn spawn_stdin_reader(tx: Sender<SystemEvent>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for (n, line) in io::stdin().lock().lines().enumerate() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    log::error!("stdin read failed: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SystemEvent>(&line) {
                Ok(event) => {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                Err(e) => log::warn!("line {}: not a system event: {}", n + 1, e),
            }
        }
        log::info!("stdin closed");
    })
}

/// Captures are recorded by an external collector; here they are only logged.
fn spawn_capture_logger(jobs: Receiver<CaptureJob>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for job in jobs {
            log::info!(
                "capture '{}' for event {} ({}s, container {})",
                job.name,
                job.event_id,
                job.duration.as_secs(),
                job.container_id.as_deref().unwrap_or("-")
            );
        }
    })
}

// ───── control loop ─────────────────────────────────────────────────────────

fn run() -> Result<()> {
    // 1 ─ Context
    let exe_dir = exe_dir()?;
    let cfg = load_config(&exe_dir)?;

    // 2 ─ Logging & metrics
    setup_logging(&exe_dir, &cfg.logging).context("logging setup failed")?;
    log::info!("Agent bootstrap initiated");
    if let Some(addr) = cfg.metrics.listen {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing Prometheus exporter")?;
        log::info!("Metrics exposed on http://{}/metrics", addr);
    }

    // 3 ─ Companion & tracker
    let transport =
        ChannelTransport::grpc(cfg.companion.connect_timeout).context("starting companion runtime")?;
    let mut dispatcher = Dispatcher::new(cfg.companion.dispatcher_config(), transport);
    Companion::new().ping(&mut dispatcher, i64::from(process::id()), |result| match result {
        Ok(Reply::Pong(pong)) => log::info!("companion answered ping (pid {})", pong.pid),
        Ok(other) => log::warn!("unexpected ping reply: {:?}", other),
        Err(e) => log::warn!("companion ping failed: {}", e),
    });

    let (local, capture_jobs) = LocalExecutor::new();
    let capture_logger = spawn_capture_logger(capture_jobs);
    let tracker = ActionTracker::new(Box::new(local), Box::new(JsonLinesSink::new(io::stdout())));
    let mut manager =
        SecurityManager::new(dispatcher, tracker, cfg.policies.clone(), cfg.actions.deadline);

    // 4 ─ Input
    let (events_tx, events_rx) = bounded::<SystemEvent>(10_000);
    let reader = spawn_stdin_reader(events_tx);

    // 5 ─ Loop
    let tick = cfg.actions.tick_interval;
    let mut input_closed_at: Option<Instant> = None;
    let mut connected = true;
    log::info!("Agent running with {} policy(ies)", manager.policies().len());

    loop {
        if input_closed_at.is_none() {
            match events_rx.recv_timeout(tick) {
                Ok(event) => {
                    let now = Instant::now();
                    manager.process_event(&event, now);
                    for event in events_rx.try_iter() {
                        manager.process_event(&event, now);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => input_closed_at = Some(Instant::now()),
            }
        } else {
            thread::sleep(tick);
        }

        let now = Instant::now();
        let up = manager.run_once(now);
        if up != connected {
            if up {
                log::info!("companion connection restored");
            } else {
                log::warn!("companion connection lost");
            }
            connected = up;
        }

        if let Some(closed) = input_closed_at {
            if manager.is_idle() || now.duration_since(closed) >= cfg.actions.deadline {
                break;
            }
        }
    }

    // 6 ─ Shutdown
    log::warn!("Shutdown initiated");
    manager.shutdown(Instant::now());
    drop(manager);
    let _ = reader.join();
    let _ = capture_logger.join();
    log::info!("Agent stopped cleanly");
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        fatal!("main", "{:#}", e);
    }
}

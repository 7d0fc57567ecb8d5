//! `model-exec-host` binary.
//!
//! Two personalities live in one executable (spec §4.4, §4.5; SPEC_FULL §2):
//! the **host**, which serves the HTTP facade and supervises jobs, and the
//! **worker harness**, spawned by re-invoking this same binary with a hidden
//! `--worker-harness` flag — Rust has no fork-with-inherited-state, so a
//! fresh re-exec is the only spawn style available (SPEC_FULL §4.6).

use clap::Parser;
use model_exec_host::http::build_router;
use model_exec_host::ipc::write_frame;
use model_exec_host::log_entry::LogLevel;
use model_exec_host::supervisor::Supervisor;
use model_exec_host::tracing_bridge::TracingBridgeLayer;
use model_exec_host::worker::{run_job, HarnessArgs, JobRequest};
use std::os::fd::FromRawFd;
use std::path::PathBuf;
use tracing_subscriber::prelude::*;

#[derive(Debug, Parser)]
#[command(name = "model-exec-host", about = "Single-node model execution host")]
struct Cli {
    /// Path to the model directory, entrypoint file, or manifest.json
    /// (spec §6). Required for the host; also consulted in worker mode.
    #[arg(long, env = "MODEL_PATH")]
    model_path: Option<PathBuf>,

    /// Port the HTTP facade listens on (spec §4.7).
    #[arg(long, env = "MODEL_PORT", default_value_t = 8080)]
    port: u16,

    /// Fallback log level, used when the job request omits `logLevel`
    /// (spec §4.4).
    #[arg(long, env = "MODEL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Internal: path to a serialized job request. Presence switches this
    /// invocation into worker-harness mode (spec §4.5).
    #[arg(long, hide = true)]
    worker_harness: Option<PathBuf>,

    /// Internal: manifest/model path the worker reloads independently of
    /// the host's own copy.
    #[arg(long, hide = true)]
    worker_manifest: Option<PathBuf>,

    /// Internal: fd number the IPC write end was dup'd onto before exec.
    #[arg(long, hide = true, default_value_t = 3)]
    ipc_fd: i32,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Some(job_path) = cli.worker_harness.clone() {
        run_worker(&cli, &job_path).await;
        return;
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    run_host(&cli).await;
}

async fn run_host(cli: &Cli) {
    let Some(model_path) = cli.model_path.clone() else {
        eprintln!("--model-path is required");
        std::process::exit(2);
    };

    let supervisor = Supervisor::new();
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    supervisor.register_shutdown(shutdown_tx).await;

    let router = build_router(supervisor, model_path);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, %addr, "failed to bind HTTP listener");
            std::process::exit(1);
        }
    };

    tracing::info!(%addr, "model execution host listening");

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = shutdown_rx.await;
    });

    if let Err(err) = server.await {
        tracing::error!(%err, "HTTP server exited with error");
    }
}

/// Runs inside the spawned subprocess (spec §4.4). Loads the manifest and
/// job request fresh (the host's copies don't cross the process boundary),
/// resolves the entrypoint, and drives it to completion.
async fn run_worker(cli: &Cli, job_path: &std::path::Path) {
    let manifest_path = cli.worker_manifest.clone().unwrap_or_else(|| {
        eprintln!("--worker-manifest is required in worker-harness mode");
        std::process::exit(2);
    });

    // Step 1 of the harness (spec §4.4): a TERM handler that exits cleanly,
    // installed before anything else so a SIGTERM arriving during startup
    // (e.g. an immediate `POST /terminate`) is still honored.
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::spawn(async move {
                term.recv().await;
                std::process::exit(0);
            });
        }
        Err(err) => eprintln!("failed to install SIGTERM handler: {err}"),
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<model_exec_host::ipc::WorkerMessage>();

    // SAFETY: `ipc_fd` was dup'd onto this process by the parent's
    // `pre_exec` hook before `exec`; it is this process's sole owner.
    let ipc_file = unsafe { std::fs::File::from_raw_fd(cli.ipc_fd) };
    let writer = tokio::task::spawn_blocking(move || {
        let mut file = ipc_file;
        while let Some(message) = rx.blocking_recv() {
            if write_frame(&mut file, &message).is_err() {
                break;
            }
        }
    });

    let exit_code = (|| async {
        let job_contents = std::fs::read_to_string(job_path).map_err(|e| e.to_string())?;
        let job_request: JobRequest = serde_json::from_str(&job_contents).map_err(|e| e.to_string())?;

        // Step 2 of the harness (spec §4.4): redirect stdout/stderr through a
        // tee that still writes the original stream and forwards each line
        // as a STDOUT/STDERR log entry.
        model_exec_host::stdio_tee::install(tx.clone());

        // Install the tracing bridge before touching user code, using the
        // same request-wins-over-CLI-wins-over-INFO precedence the harness
        // itself applies (spec §4.4).
        let min_level = job_request
            .log_level
            .as_deref()
            .or(cli.log_level.as_deref())
            .and_then(LogLevel::parse)
            .unwrap_or(LogLevel::Info);
        let bridge = TracingBridgeLayer::new(tx.clone(), min_level);
        let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        tracing_subscriber::registry().with(bridge).with(fmt_layer).init();

        let loaded = model_exec_host::manifest::load_manifest(&manifest_path).map_err(|e| e.to_string())?;
        let model = loaded
            .manifest
            .find_model(&job_request.model_id)
            .cloned()
            .ok_or_else(|| format!("unknown model id {:?}", job_request.model_id))?;

        let registry = model_exec_host::build_entrypoint_registry();
        let args = HarnessArgs { log_level: cli.log_level.clone() };
        Ok::<i32, String>(run_job(&registry, &model, job_request, args, tx.clone()).await)
    })()
    .await;

    drop(tx);
    let _ = writer.await;

    match exit_code {
        Ok(code) => std::process::exit(code),
        Err(msg) => {
            eprintln!("worker harness failed before entrypoint invocation: {msg}");
            std::process::exit(1);
        }
    }
}

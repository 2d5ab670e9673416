//! `rangefuse` – sonar-to-laser fusion node.
//!
//! 1. Loads `./rangefuse.toml` (or the path given as the first argument, or
//!    `$RANGEFUSE_CONFIG`) and logs the configured sensors.
//! 2. Reads newline-delimited JSON bridge frames (scans, range readings and
//!    frame updates) from **stdin** and publishes them on the event bus.
//! 3. Writes every fused scan to **stdout** as a JSON line.
//! 4. Stops on end of input or **Ctrl-C**, fusing scans already received.
//!
//! Logs and the banner go to stderr so stdout stays machine-readable.

mod config;

use colored::Colorize;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::BufReader;
use tracing::{error, info, warn};

use rangefuse_middleware::{EventBus, StdioBridge};
use rangefuse_perception::SharedTfEngine;
use rangefuse_runtime::{FusionNode, NodeStats, init_tracing};
use rangefuse_types::FuseError;

fn main() -> ExitCode {
    let _guard = init_tracing("rangefuse");

    print_banner();

    let path = config::config_path(std::env::args().nth(1));
    let cfg = match config::load_from(&path).map_err(FuseError::Config) {
        Ok(Some(cfg)) => {
            info!(path = %path.display(), "config loaded");
            cfg
        }
        Ok(None) => {
            warn!(path = %path.display(), "config file not found; using defaults");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            if let Err(e) = cfg.validate().map_err(FuseError::Config) {
                error!(error = %e, "invalid configuration");
                return ExitCode::FAILURE;
            }
            cfg
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("{}", "⚠  Ctrl-C received – finishing buffered scans …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            return ExitCode::FAILURE;
        }
    };

    let stats = runtime.block_on(serve(cfg, shutdown));
    // Stdin is read on a blocking thread that may never return.
    runtime.shutdown_background();

    info!(cycles = stats.cycles, rejected = stats.rejected, "rangefuse exiting");
    ExitCode::SUCCESS
}

/// Wire the bridge, the bus and the fusion node together and run until
/// shutdown.
async fn serve(cfg: config::Config, shutdown: Arc<AtomicBool>) -> NodeStats {
    let bus = EventBus::default();
    let tf = SharedTfEngine::new(cfg.frame_tree());
    let mut node = FusionNode::new(
        bus.clone(),
        tf,
        cfg.fuser(),
        &cfg.input_topic,
        &cfg.output_topic,
    );

    info!(
        input = %cfg.input_topic,
        output = %cfg.output_topic,
        cone = ?cfg.fusion.cone,
        static_transforms = cfg.transforms.len(),
        "fusion configured"
    );
    if cfg.sensors.is_empty() {
        warn!("no sensors configured; scans pass through unfused");
    }
    for sensor in cfg.sensor_descriptors() {
        node.add_sensor(sensor);
    }
    for sensor in node.manager().sensors() {
        info!("  {} <-> {}", sensor.topic(), sensor.frame_id());
    }

    // Subscribe the writer before any input can be fused.
    let writer = tokio::spawn(StdioBridge::run_writer(
        bus.subscribe_to(&cfg.output_topic),
        tokio::io::stdout(),
    ));

    let bridge = StdioBridge::new(bus.clone());
    let eof_shutdown = shutdown.clone();
    let reader = tokio::spawn(async move {
        let result = bridge.run_reader(BufReader::new(tokio::io::stdin())).await;
        eof_shutdown.store(true, Ordering::SeqCst);
        result
    });

    let stats = node.run(shutdown).await;

    reader.abort();
    match reader.await {
        Ok(Ok(forwarded)) => info!(forwarded, "input bridge finished"),
        Ok(Err(e)) => warn!(error = %e, "input bridge failed"),
        Err(e) if e.is_cancelled() => {}
        Err(e) => warn!(error = %e, "input bridge task panicked"),
    }

    // Dropping the last bus handle closes the output topic and lets the
    // writer finish.
    drop(bus);
    match writer.await {
        Ok(Ok(written)) => info!(written, "output bridge finished"),
        Ok(Err(e)) => warn!(error = %e, "output bridge failed"),
        Err(e) => warn!(error = %e, "output bridge task panicked"),
    }

    stats
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    eprintln!();
    eprintln!("  {} {}",
        "rangefuse".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    eprintln!("  Sonar-to-laser scan fusion");
    eprintln!();
}

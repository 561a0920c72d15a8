//! canalyzerd
//!
//! Headless analyzer daemon: wires the bus manager, gateway, decoders, and
//! diff engine together, then either replays a capture file (first CLI
//! argument) or runs live until interrupted. The graphical shell attaches
//! through the library's observer API instead of this binary.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use canalyzerd::bus::BusManager;
use canalyzerd::capture::{load_capture, CaptureKind};
use canalyzerd::config::AppConfig;
use canalyzerd::observer::TracingObserver;
use canalyzerd::pipeline::Analyzer;
use canalyzerd::replay::{ReplayManager, ReplaySpeed};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,canalyzerd=debug")),
        )
        .init();

    info!("starting canalyzerd");
    info!("version: {}", env!("CARGO_PKG_VERSION"));

    let config_path =
        std::env::var("CANALYZERD_CONFIG").unwrap_or_else(|_| "config.json".to_string());
    let config = AppConfig::load(&config_path);

    let mut bus_manager = BusManager::new(config.queue_capacity);
    let mut injectors = Vec::new();
    for bus in &config.can_buses {
        info!(bus = %bus.name, channel = %bus.channel, baudrate = bus.baudrate, "adding bus");
        injectors.push(bus_manager.add_bus(bus.name.clone(), bus.baudrate));
    }

    let analyzer = Arc::new(
        Analyzer::new(
            config.gateway.clone(),
            config.diff.clone(),
            Arc::new(TracingObserver),
        )
        .context("gateway configuration rejected")?,
    );
    analyzer.register_default_decoders();
    for injector in &injectors {
        analyzer.register_injector(injector.clone());
    }

    let receiver = bus_manager
        .take_receiver()
        .context("ingress receiver already taken")?;
    let worker = analyzer.spawn_worker(receiver);
    let tickers = analyzer.gateway().spawn_tickers();

    if let Some(capture_path) = std::env::args().nth(1) {
        info!(path = %capture_path, "replaying capture");
        let capture = load_capture(&capture_path, CaptureKind::Tracer)
            .await
            .with_context(|| format!("loading {capture_path}"))?;
        let replay = ReplayManager::new();
        let injected = replay
            .replay_capture(&capture, &injectors, ReplaySpeed::Realtime)
            .await?;
        info!(injected, "replay finished");
    } else {
        info!("running live; press ctrl-c to stop");
        tokio::signal::ctrl_c().await?;
        info!("interrupt received");
    }

    analyzer.gateway().stop_tickers();
    for ticker in tickers {
        ticker.abort();
    }
    bus_manager.shutdown().await;
    worker.await?;

    let stats = analyzer.decoder_stats();
    for (name, stat) in &stats {
        info!(
            decoder = name,
            decoded = stat.decoded,
            failed = stat.failed,
            success_rate = %format!("{:.1}%", stat.success_rate()),
            "decoder statistics"
        );
    }
    let diff = analyzer.diff_stats();
    info!(
        received = diff.total_received,
        displayed = diff.total_displayed,
        hidden = diff.total_hidden,
        "diff statistics"
    );
    info!(
        frames = analyzer.frames_processed(),
        dropped = bus_manager.dropped(),
        "shutdown complete"
    );
    Ok(())
}

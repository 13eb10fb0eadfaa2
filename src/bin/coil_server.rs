/// Voltage Coil Server
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
/// Runs the coil server standalone, publishing coil changes to the log.
///
/// Usage: coil_server [config.yaml|config.json]

use anyhow::Context;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::interval;

use voltage_coil_server::{
    logging, utils::format::format_duration, CoilServer, CoilServerConfig, LogProjection, ModbusServer,
};

/// Interval between statistics reports
const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => CoilServerConfig::from_file(&path)
            .with_context(|| format!("failed to load configuration from {}", path))?,
        None => CoilServerConfig::default(),
    };
    logging::init(config.debug);

    info!("🚀 {}", voltage_coil_server::info());

    let mut server = CoilServer::new(config, Arc::new(LogProjection)).context("invalid configuration")?;
    server.start().await.context("failed to start server")?;

    let snapshot = server.snapshot();
    match snapshot.local_addr {
        Some(addr) => info!("📍 Listening on: {}", addr),
        None => info!("⏳ Listener not bound yet, state: {}", snapshot.state),
    }

    let mut ticker = interval(STATS_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("🛑 Received interrupt signal, stopping server..."),
                    Err(err) => error!("❌ Failed to listen for interrupt signal: {}", err),
                }
                break;
            }
            _ = ticker.tick() => {
                let stats = server.stats().await;
                let snapshot = server.snapshot();
                info!("📊 Server statistics:");
                info!("   State: {} (reconnect attempts: {})", snapshot.state, snapshot.reconnect_attempts);
                info!("   Active connections: {}", stats.active_connections);
                info!("   Frames received: {}", stats.frames_received);
                info!("   Responses sent: {}", stats.responses_sent);
                info!("   Uptime: {}", format_duration(Duration::from_secs(stats.uptime_seconds)));
                if let Some(bank) = stats.coil_bank_stats {
                    info!("   Coils set: {}/{}, levels latched: {}", bank.raw_set, bank.size, bank.levels_latched);
                }
            }
        }
    }

    server.stop().await.context("failed to stop server")?;

    let final_stats = server.stats().await;
    info!("📊 Final server statistics:");
    info!("   Total connections: {}", final_stats.connections_accepted);
    info!("   Frames received: {}", final_stats.frames_received);
    info!("   Ignored frames: {}", final_stats.ignored_frames);
    info!("   Short coil payloads: {}", final_stats.short_payloads);
    info!("   Listener faults: {}", final_stats.listener_faults);
    info!("   Bytes received: {} bytes", final_stats.bytes_received);
    info!("   Bytes sent: {} bytes", final_stats.bytes_sent);

    Ok(())
}

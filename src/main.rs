//! Hermes demo: stream a camera through the bridge and report statistics

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use hermes::{BridgeError, CaptureSession, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hermes=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Hermes launching...");

    // Load configuration: first argument, then HERMES_CONFIG
    let config_path = std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("HERMES_CONFIG"))
        .map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    let registry = config.registry()?;

    for device in registry.list_devices()? {
        info!("Found device: {} ({})", device.display_name, device.id);
    }

    let session = match &config.capture.device {
        Some(id) => registry.select_device(id)?,
        None => registry.select_first()?,
    };
    let accepted = session.negotiate(config.requested_mode())?;
    info!(
        "Using {} at {}",
        session.name().unwrap_or_default(),
        accepted
    );

    let session = Arc::new(session);
    session.start()?;
    let device_id = session.device_id().unwrap_or_default();

    // Spawn consumer on a blocking thread; wait_frame parks the thread
    let timeout = Duration::from_millis(config.consumer.wait_timeout_ms);
    let consumer = tokio::task::spawn_blocking({
        let session = Arc::clone(&session);
        move || consume(&session, timeout)
    });

    let mut ticker =
        tokio::time::interval(Duration::from_millis(config.consumer.stats_interval_ms.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!("Failed to listen for ctrl-c: {}", e);
                }
                info!("Interrupt received");
                break;
            }
            _ = ticker.tick() => {
                let stats = session.stats();
                stats.publish_metrics(&device_id);
                info!(
                    "frames={} dropped={} drop_rate={:.3} fps={:.1}",
                    stats.total_frames,
                    stats.dropped_frames,
                    stats.drop_rate(),
                    stats.observed_fps
                );
            }
        }
    }

    session.stop()?;
    let consumed = consumer.await??;

    info!("Hermes shutting down after {} frames", consumed);
    Ok(())
}

/// Drain the mailbox until the session stops.
fn consume(session: &CaptureSession, timeout: Duration) -> hermes::Result<u64> {
    let mut consumed = 0u64;
    loop {
        match session.next_frame(timeout) {
            Ok(frame) => {
                consumed += 1;
                debug!(
                    "Frame {} ({} bytes, {})",
                    frame.sequence(),
                    frame.byte_length(),
                    frame.meta.format
                );
            }
            Err(BridgeError::Timeout) => {
                debug!("No frame within {:?}", timeout);
            }
            Err(BridgeError::Stopped) => return Ok(consumed),
            Err(err) => return Err(err),
        }
    }
}

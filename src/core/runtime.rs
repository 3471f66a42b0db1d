/// Async driver for the master engine
///
/// The engine itself is synchronous; this loop owns it inside one tokio task
/// and feeds it received bytes, collaborator requests and clock ticks, so all
/// state mutation happens in a single execution context.
use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

use super::{bus::MasterRequest, master::Master};
use crate::protocol::transport::Transport;

/// Configuration for the driver loop
pub struct RuntimeConfig {
    /// Interval at which deadlines and the supervisor are evaluated
    pub tick_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(10),
        }
    }
}

/// Run the master until a `Shutdown` request arrives or every request
/// sender is dropped.
///
/// This is the main loop that handles:
/// - Received byte chunks from the transport
/// - Collaborator requests
/// - Periodic ticks driving reply deadlines and the supervisor
pub async fn run_master<T: Transport>(
    mut master: Master<T>,
    requests: flume::Receiver<MasterRequest>,
    config: RuntimeConfig,
) -> Result<()> {
    let inbound = master.start(Instant::now())?;
    let mut ticker = tokio::time::interval(config.tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            chunk = inbound.recv_async() => {
                let chunk = chunk.map_err(|err| anyhow!("Transport closed: {err}"))?;
                master.on_bytes(&chunk, Instant::now());
            }
            request = requests.recv_async() => match request {
                Ok(request) => {
                    if !master.handle_request(request, Instant::now()) {
                        log::info!("Received shutdown request");
                        return Ok(());
                    }
                }
                Err(_) => {
                    log::info!("All master handles dropped, stopping");
                    return Ok(());
                }
            },
            _ = ticker.tick() => master.tick(Instant::now()),
        }
    }
}

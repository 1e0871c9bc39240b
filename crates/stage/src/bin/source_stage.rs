use anyhow::Context;
use channel::{ChannelError, Position, Source, WaitStatus};
use common::retry_if;
use stage::{Observability, StageConfig, StageMetrics, shutdown};
use std::sync::atomic::Ordering;

const CONNECT_BASE_DELAY_MS: u64 = 100;
const LOG_EVERY: u64 = 100;

fn main() -> anyhow::Result<()> {
    let config = StageConfig::from_env()?;
    let observability = Observability::init("source-stage", &config)?;
    let shutdown = shutdown::register_signals()?;

    tracing::info!(config = ?config, "Loaded configuration");

    let channel_config = config.channel_config();
    let mut source = retry_if(
        || Source::<Position>::connect_with(&config.channel_name, &channel_config),
        ChannelError::is_transient,
        config.connect_retries,
        CONNECT_BASE_DELAY_MS,
        "Connect to channel",
    )
    .with_context(|| format!("Failed to connect to channel '{}'", config.channel_name))?;

    let metrics = StageMetrics::new(&observability.meter(), &config.channel_name);
    let watcher = shutdown::watch(shutdown.clone(), source.notifier());
    let mut reads = 0u64;

    while !shutdown.load(Ordering::Acquire) {
        let sequence = match source.wait() {
            Ok(WaitStatus::Ready(sequence)) => sequence,
            Ok(WaitStatus::TimedOut) => continue,
            Ok(WaitStatus::Interrupted) => break,
            Err(e) => {
                return Err(e).with_context(|| {
                    format!(
                        "Lost slot {} on channel '{}'",
                        source.slot_index(),
                        config.channel_name
                    )
                });
            }
        };

        let position = source.get_value()?;
        source.signal_done()?;
        metrics.record_read();
        reads += 1;

        tracing::debug!(
            sequence,
            sample = position.sample,
            x = position.position[0],
            y = position.position[1],
            "Received position"
        );
        if reads % LOG_EVERY == 0 {
            tracing::info!(reads, sequence, "Reading positions");
        }
    }

    shutdown::stop(&shutdown, watcher);

    source
        .disconnect()
        .context("Failed to release channel slot")?;
    tracing::info!(channel = %config.channel_name, reads, "Source stage stopped gracefully");
    Ok(())
}

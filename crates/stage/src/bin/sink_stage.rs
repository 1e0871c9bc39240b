use anyhow::Context;
use channel::{ChannelError, Position, Sink};
use stage::{Observability, StageConfig, StageMetrics, shutdown};
use std::f64::consts::TAU;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Instant;

/// Synthetic target orbiting the middle of a 640x480 frame.
const CENTER: [f64; 2] = [320.0, 240.0];
const RADIUS: f64 = 100.0;
const PERIOD_SECS: f64 = 4.0;

fn position_at(sample: u64, elapsed_secs: f64) -> Position {
    let omega = TAU / PERIOD_SECS;
    let (sin, cos) = (omega * elapsed_secs).sin_cos();

    let velocity = [-RADIUS * omega * sin, RADIUS * omega * cos];
    let speed = velocity[0].hypot(velocity[1]);

    Position {
        sample,
        velocity_valid: true,
        heading_valid: speed > 0.0,
        velocity,
        heading: [velocity[0] / speed, velocity[1] / speed],
        ..Position::at(CENTER[0] + RADIUS * cos, CENTER[1] + RADIUS * sin)
    }
}

fn main() -> anyhow::Result<()> {
    let config = StageConfig::from_env()?;
    let observability = Observability::init("sink-stage", &config)?;
    let shutdown = shutdown::register_signals()?;

    tracing::info!(config = ?config, "Loaded configuration");

    let mut sink = Sink::<Position>::bind_with(&config.channel_name, &config.channel_config())
        .with_context(|| {
            format!(
                "Failed to bind channel '{}' (capacity {}) in {}",
                config.channel_name,
                config.capacity,
                config.shm_dir.display()
            )
        })?;
    let metrics = StageMetrics::new(&observability.meter(), &config.channel_name);
    let watcher = shutdown::watch(shutdown.clone(), sink.notifier());

    let interval = config.publish_interval();
    let started = Instant::now();
    let mut sample = 0u64;

    while !shutdown.load(Ordering::Acquire) {
        let tick = Instant::now();
        let position = position_at(sample, started.elapsed().as_secs_f64());

        let report = match sink.post(&position) {
            Ok(report) => report,
            Err(ChannelError::Interrupted) => break,
            Err(e) => {
                return Err(e).with_context(|| {
                    format!(
                        "Publish failed on channel '{}' ({}/{} sources)",
                        config.channel_name,
                        sink.source_count(),
                        sink.capacity()
                    )
                });
            }
        };

        metrics.record_post(&report, tick.elapsed());
        if report.interrupted {
            break;
        }
        tracing::debug!(
            sequence = report.sequence,
            readers = report.readers,
            evicted = report.evicted.len(),
            "Published position"
        );

        sample += 1;
        thread::sleep(interval.saturating_sub(tick.elapsed()));
    }

    shutdown::stop(&shutdown, watcher);

    tracing::info!(
        channel = %config.channel_name,
        posts = sample,
        sources = sink.source_count(),
        "Sink stage stopped gracefully"
    );
    Ok(())
}

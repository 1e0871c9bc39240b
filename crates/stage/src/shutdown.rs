use channel::Notifier;
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    flag,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const WATCH_INTERVAL: Duration = Duration::from_millis(50);

/// Flag raised on SIGTERM or SIGINT.
pub fn register_signals() -> anyhow::Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));

    flag::register(SIGTERM, Arc::clone(&shutdown))?;
    flag::register(SIGINT, Arc::clone(&shutdown))?;

    tracing::info!("Signal handlers registered (SIGTERM, SIGINT)");
    Ok(shutdown)
}

/// Wake the channel handle behind `notifier` once `shutdown` is raised, so a
/// blocking wait does not hold up process exit.
///
/// Raise the flag yourself to stop the watcher on a normal exit.
pub fn watch(shutdown: Arc<AtomicBool>, notifier: Notifier) -> JoinHandle<()> {
    thread::spawn(move || {
        while !shutdown.load(Ordering::Acquire) {
            thread::sleep(WATCH_INTERVAL);
        }
        if let Err(e) = notifier.notify() {
            tracing::warn!(channel = notifier.channel(), "Failed to interrupt wait: {}", e);
        }
    })
}

/// Raise `shutdown` and wait for the watcher thread to finish.
pub fn stop(shutdown: &AtomicBool, watcher: JoinHandle<()>) {
    shutdown.store(true, Ordering::Release);
    if let Err(panic) = watcher.join() {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!(reason = %reason, "Shutdown watcher panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use channel::{ChannelConfig, Sink, Source, WaitStatus};
    use tempfile::tempdir;

    #[test]
    fn test_watcher_interrupts_blocked_wait() {
        let dir = tempdir().unwrap();
        let config = ChannelConfig::default().with_shm_dir(dir.path());
        let _sink = Sink::<u64>::bind_with("watched", &config).unwrap();
        let mut source = Source::<u64>::connect_with("watched", &config).unwrap();

        let shutdown = Arc::new(AtomicBool::new(false));
        let watcher = watch(Arc::clone(&shutdown), source.notifier());

        shutdown.store(true, Ordering::Release);
        assert_eq!(
            source.wait_timeout(Duration::from_secs(5)).unwrap(),
            WaitStatus::Interrupted,
            "Raising the flag should end the wait"
        );
        watcher.join().unwrap();
    }

    #[test]
    fn test_stop_survives_panicked_watcher() {
        let shutdown = AtomicBool::new(false);
        let watcher = thread::spawn(|| panic!("watcher failed"));

        stop(&shutdown, watcher);

        assert!(shutdown.load(Ordering::Acquire));
    }
}

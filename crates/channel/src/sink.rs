use crate::config::ChannelConfig;
use crate::errors::{ChannelError, Result};
use crate::header::SegmentLayout;
use crate::node::Completion;
use crate::notifier::Notifier;
use crate::payload::Payload;
use crate::segment::Segment;
use crate::utils::{current_pid, process_alive};
use common::{span, span_debug};
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a new Sink waits on the write gate before assuming its dead
/// predecessor left it closed.
const STALE_GATE_TIMEOUT: Duration = Duration::from_millis(100);

/// Result of one publish cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostReport {
    pub sequence: u64,
    /// Sources armed by this publish.
    pub readers: usize,
    /// Slots evicted because their Source missed the rendezvous timeout.
    pub evicted: Vec<usize>,
    /// The rendezvous was cut short by a notifier.
    pub interrupted: bool,
}

impl PostReport {
    /// Readers that finished (or left) before the write section reopened.
    pub fn completed(&self) -> usize {
        self.readers - self.evicted.len()
    }
}

/// Producer end of a channel.
///
/// There is at most one live Sink per channel. Each [`post`](Sink::post)
/// writes the payload and returns only after every Source present at
/// publish time finished reading it.
pub struct Sink<T: Payload> {
    segment: Arc<Segment>,
    payload: NonNull<T>,
    rendezvous_timeout: Option<Duration>,
    interrupted: bool,
    pid: i32,
}

// The payload pointer targets the shared mapping owned by `segment`
unsafe impl<T: Payload> Send for Sink<T> {}

impl<T: Payload> Sink<T> {
    pub fn bind(name: &str) -> Result<Self> {
        Self::bind_with(name, &ChannelConfig::default())
    }

    /// Create the channel, or take over an existing one that has no live Sink.
    pub fn bind_with(name: &str, config: &ChannelConfig) -> Result<Self> {
        let layout = SegmentLayout::for_payload::<T>(config.capacity)?;
        let segment =
            Segment::create_or_open(&config.shm_dir, name, layout, &config.attach_retry)?;
        let payload = segment.payload::<T>()?;

        let pid = current_pid();
        let header = segment.header();
        let previous = header
            .claim_sink(pid)
            .map_err(|owner| ChannelError::ChannelConflict {
                channel: name.to_string(),
                pid: owner,
            })?;

        if let Err(e) = Self::take_over(&segment, previous) {
            header.release_sink(pid);
            return Err(e);
        }

        let capacity = segment.node().capacity();
        if capacity != config.capacity {
            tracing::debug!(
                channel = name,
                capacity,
                requested = config.capacity,
                "Attached to existing channel, keeping its capacity"
            );
        }

        tracing::info!(
            channel = name,
            capacity,
            created = segment.created(),
            "Sink bound"
        );

        Ok(Self {
            segment: Arc::new(segment),
            payload,
            rendezvous_timeout: config.rendezvous_timeout,
            interrupted: false,
            pid,
        })
    }

    /// Clear state left behind by the channel's previous Sink.
    fn take_over(segment: &Segment, previous: Option<i32>) -> Result<()> {
        if segment.created() {
            return Ok(());
        }

        let node = segment.node();
        if let Some(previous) = previous {
            tracing::warn!(
                channel = segment.name(),
                previous_pid = previous,
                "Previous sink died, taking over channel"
            );
            if node.recover_write_gate(STALE_GATE_TIMEOUT)? {
                tracing::warn!(
                    channel = segment.name(),
                    "Reopened write gate left closed by previous sink"
                );
            }
        }

        node.reset_rendezvous()
    }

    /// Publish `value` to every connected Source.
    pub fn post(&mut self, value: &T) -> Result<PostReport> {
        self.post_with(|payload| *payload = *value)
    }

    /// Publish by updating the payload in place.
    ///
    /// `write` runs with the write gate held, after the previous cycle's
    /// rendezvous completed, so no Source is reading while it runs.
    pub fn post_with(&mut self, write: impl FnOnce(&mut T)) -> Result<PostReport> {
        let node = self.segment.node();
        if self.interrupted || node.sink_interrupted() {
            self.interrupted = true;
            return Err(ChannelError::Interrupted);
        }

        let _s = span!("post");
        let gate = node.begin_write()?;

        write(unsafe { &mut *self.payload.as_ptr() });

        let cycle = node.arm_readers()?;
        let mut report = PostReport {
            sequence: cycle.sequence,
            readers: cycle.armed.len(),
            evicted: Vec::new(),
            interrupted: false,
        };

        let _r = span_debug!("rendezvous", readers = cycle.armed.len());
        // The timeout bounds the whole rendezvous
        let deadline = self.rendezvous_timeout.map(|timeout| Instant::now() + timeout);
        for lease in &cycle.armed {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            match node.await_completion(lease, remaining)? {
                Completion::Done | Completion::Departed => {}
                Completion::Evicted { pid } => {
                    tracing::warn!(
                        channel = self.segment.name(),
                        slot = lease.index,
                        pid,
                        alive = process_alive(pid),
                        timeout_ms = self.rendezvous_timeout.map(|t| t.as_millis() as u64),
                        "Source missed the rendezvous, slot evicted"
                    );
                    report.evicted.push(lease.index);
                }
                Completion::Interrupted => {
                    self.interrupted = true;
                    report.interrupted = true;
                    break;
                }
            }
        }

        gate.end();
        Ok(report)
    }

    /// Current payload as last written by this Sink.
    pub fn value(&self) -> T {
        // Only `post_with` writes, and it needs `&mut self`
        unsafe { self.payload.as_ptr().read() }
    }

    /// Abort a rendezvous in progress. The Sink refuses to post afterwards.
    pub fn notify_self(&self) -> Result<()> {
        self.segment.node().interrupt_sink()
    }

    /// Handle that can interrupt this Sink from another thread.
    pub fn notifier(&self) -> Notifier {
        Notifier::for_sink(Arc::clone(&self.segment))
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Whether this Sink created the segment (rather than taking it over).
    pub fn is_creator(&self) -> bool {
        self.segment.created()
    }

    pub fn capacity(&self) -> usize {
        self.segment.node().capacity()
    }

    pub fn source_count(&self) -> usize {
        self.segment.node().source_ref_count()
    }

    /// Number of publishes on this channel, across Sinks.
    pub fn sequence(&self) -> u64 {
        self.segment.node().sequence()
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted || self.segment.node().sink_interrupted()
    }
}

impl<T: Payload> Drop for Sink<T> {
    fn drop(&mut self) {
        self.segment.header().release_sink(self.pid);
        tracing::debug!(channel = self.segment.name(), "Sink released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> ChannelConfig {
        ChannelConfig::default()
            .with_shm_dir(dir)
            .with_capacity(2)
            .with_rendezvous_timeout(Some(Duration::from_millis(50)))
    }

    #[test]
    fn test_post_without_sources_completes() {
        let dir = tempdir().unwrap();
        let mut sink = Sink::<u64>::bind_with("empty", &config(dir.path())).unwrap();

        let report = sink.post(&7).unwrap();

        assert_eq!(report.sequence, 1);
        assert_eq!(report.readers, 0);
        assert!(report.evicted.is_empty());
        assert_eq!(sink.value(), 7);
    }

    #[test]
    fn test_second_live_sink_conflicts() {
        let dir = tempdir().unwrap();
        let _sink = Sink::<u64>::bind_with("solo", &config(dir.path())).unwrap();

        match Sink::<u64>::bind_with("solo", &config(dir.path())) {
            Err(ChannelError::ChannelConflict { channel, pid }) => {
                assert_eq!(channel, "solo");
                assert_eq!(pid, current_pid());
            }
            Err(other) => panic!("Expected ChannelConflict, got {other:?}"),
            Ok(_) => panic!("Second sink must not bind"),
        }
    }

    #[test]
    fn test_rebind_after_drop() {
        let dir = tempdir().unwrap();
        let first = Sink::<u64>::bind_with("again", &config(dir.path())).unwrap();
        assert!(first.is_creator());
        drop(first);

        let second = Sink::<u64>::bind_with("again", &config(dir.path())).unwrap();
        assert!(second.is_creator(), "Segment is gone once the last handle left");
    }

    #[test]
    fn test_takes_over_from_dead_sink() {
        let dir = tempdir().unwrap();
        let crashed = Sink::<u64>::bind_with("crash", &config(dir.path())).unwrap();
        // A sink process that died inside its write section
        std::mem::forget(crashed.segment.node().begin_write().unwrap());
        crashed
            .segment
            .header()
            .sink_pid
            .store(i32::MAX - 1, Ordering::Release);

        let mut sink = Sink::<u64>::bind_with("crash", &config(dir.path())).unwrap();

        assert!(!sink.is_creator());
        let report = sink.post(&5).unwrap();
        assert_eq!(report.sequence, 1, "Write gate should have been reopened");
        drop(crashed);
    }

    #[test]
    fn test_notify_self_refuses_further_posts() {
        let dir = tempdir().unwrap();
        let mut sink = Sink::<u64>::bind_with("stop", &config(dir.path())).unwrap();

        sink.notify_self().unwrap();

        assert!(sink.is_interrupted());
        assert!(matches!(sink.post(&1), Err(ChannelError::Interrupted)));
    }

    #[test]
    fn test_payload_type_must_match_channel() {
        let dir = tempdir().unwrap();
        let _sink = Sink::<u64>::bind_with("typed", &config(dir.path())).unwrap();

        assert!(matches!(
            Sink::<[u8; 3]>::bind_with("typed", &config(dir.path())),
            Err(ChannelError::LayoutMismatch(_))
        ));
    }

    #[test]
    fn test_report_counts_completed_readers() {
        let report = PostReport {
            sequence: 4,
            readers: 3,
            evicted: vec![1],
            interrupted: false,
        };
        assert_eq!(report.completed(), 2);
    }
}

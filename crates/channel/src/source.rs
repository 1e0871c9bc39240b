use crate::config::ChannelConfig;
use crate::errors::{ChannelError, Result};
use crate::node::{SlotLease, Wakeup};
use crate::notifier::Notifier;
use crate::payload::Payload;
use crate::segment::Segment;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};
use std::time::Duration;

/// Slice of a snapshot's wait on the write gate between checks for being
/// armed by the Sink.
const SNAPSHOT_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Idle,
    /// Between a successful wait and `signal_done`.
    Reading,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// A publish arrived, carrying its sequence number.
    Ready(u64),
    Interrupted,
    TimedOut,
}

/// Consumer end of a channel, holding one slot of the Node.
pub struct Source<T: Payload> {
    segment: Arc<Segment>,
    payload: NonNull<T>,
    lease: SlotLease,
    state: ReadState,
}

// The payload pointer targets the shared mapping owned by `segment`
unsafe impl<T: Payload> Send for Source<T> {}

impl<T: Payload> Source<T> {
    pub fn connect(name: &str) -> Result<Self> {
        Self::connect_with(name, &ChannelConfig::default())
    }

    /// Attach to a bound channel and take a slot.
    ///
    /// Fails with `ChannelNotFound` before the Sink has bound (worth retrying)
    /// and with `CapacityExceeded` when every slot is held (not worth it).
    pub fn connect_with(name: &str, config: &ChannelConfig) -> Result<Self> {
        let segment = Segment::open(&config.shm_dir, name, &config.attach_retry)?;
        let payload = segment.payload::<T>()?;

        let node = segment.node();
        let lease = node.acquire_slot().map_err(|e| e.for_channel(name))?;

        tracing::info!(
            channel = name,
            slot = lease.index,
            sources = node.source_ref_count(),
            capacity = node.capacity(),
            "Source connected"
        );

        Ok(Self {
            segment: Arc::new(segment),
            payload,
            lease,
            state: ReadState::Idle,
        })
    }

    /// Block until the Sink publishes.
    ///
    /// On `Ready` the payload may be read until [`signal_done`](Self::signal_done).
    pub fn wait(&mut self) -> Result<WaitStatus> {
        self.wait_for(None)
    }

    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<WaitStatus> {
        self.wait_for(Some(timeout))
    }

    fn wait_for(&mut self, timeout: Option<Duration>) -> Result<WaitStatus> {
        match self.state {
            ReadState::Idle => {}
            ReadState::Reading => return Err(ChannelError::ReadInProgress),
            ReadState::Disconnected => return Err(self.evicted()),
        }

        let woke = self.segment.node().await_publish(&self.lease, timeout);
        match woke {
            Ok(Wakeup::Published(sequence)) => {
                self.state = ReadState::Reading;
                Ok(WaitStatus::Ready(sequence))
            }
            Ok(Wakeup::Interrupted) => Ok(WaitStatus::Interrupted),
            Ok(Wakeup::TimedOut) => Ok(WaitStatus::TimedOut),
            Err(e) => Err(self.on_error(e)),
        }
    }

    /// Copy the published payload.
    ///
    /// The copy is checked against the slot after it is taken. A Source the
    /// Sink evicted mid-read gets `Evicted` instead of a payload that may have
    /// been rewritten under it.
    pub fn get_value(&mut self) -> Result<T> {
        match self.state {
            ReadState::Reading => {}
            ReadState::Idle => return Err(ChannelError::NotReading),
            ReadState::Disconnected => return Err(self.evicted()),
        }

        let value = unsafe { self.payload.as_ptr().read_volatile() };
        fence(Ordering::Acquire);

        let node = self.segment.node();
        if !node.holds(&self.lease) {
            self.state = ReadState::Disconnected;
            return Err(self.evicted());
        }
        if !node.is_pending(self.lease.index) {
            // A new Sink dropped the cycle, the slot is still ours
            self.state = ReadState::Idle;
            return Err(ChannelError::CycleAbandoned);
        }
        Ok(value)
    }

    /// Tell the Sink this Source finished reading the current publish.
    pub fn signal_done(&mut self) -> Result<()> {
        match self.state {
            ReadState::Reading => {}
            ReadState::Idle => return Err(ChannelError::NotReading),
            ReadState::Disconnected => return Err(self.evicted()),
        }

        self.state = ReadState::Idle;
        let signalled = self.segment.node().signal_done(&self.lease);
        signalled.map_err(|e| self.on_error(e))
    }

    /// Copy the payload outside of a publish cycle.
    ///
    /// Waits for any write section in progress, so the copy is never torn.
    /// Fails with `ReadPending` if the Sink has armed this slot, since the
    /// Sink keeps the write gate until this Source reads and signals done.
    pub fn snapshot(&mut self) -> Result<T> {
        if self.state == ReadState::Reading {
            return self.get_value();
        }

        let node = self.segment.node();
        loop {
            if self.state == ReadState::Disconnected || !node.holds(&self.lease) {
                return Err(self.evicted());
            }
            if node.is_pending(self.lease.index) {
                return Err(ChannelError::ReadPending);
            }

            if let Some(gate) = node.begin_write_timeout(SNAPSHOT_POLL)? {
                let value = unsafe { self.payload.as_ptr().read() };
                gate.end();
                return Ok(value);
            }
        }
    }

    /// Release the slot. A read in progress is signalled done first.
    pub fn disconnect(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        let state = std::mem::replace(&mut self.state, ReadState::Disconnected);
        let node = self.segment.node();

        let released = match state {
            ReadState::Disconnected => return Ok(()),
            ReadState::Reading => node
                .signal_done(&self.lease)
                .and_then(|()| node.release_lease(&self.lease)),
            ReadState::Idle => node.release_lease(&self.lease),
        };

        match released {
            Ok(()) => {
                tracing::info!(
                    channel = self.segment.name(),
                    slot = self.lease.index,
                    "Source disconnected"
                );
                Ok(())
            }
            // The Sink already took the slot back
            Err(ChannelError::Evicted { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn on_error(&mut self, e: ChannelError) -> ChannelError {
        if matches!(e, ChannelError::Evicted { .. }) {
            self.state = ReadState::Disconnected;
        }
        e
    }

    fn evicted(&self) -> ChannelError {
        ChannelError::Evicted {
            index: self.lease.index,
        }
    }

    /// Handle that can interrupt this Source's wait from another thread.
    pub fn notifier(&self) -> Notifier {
        Notifier::for_source(Arc::clone(&self.segment), self.lease)
    }

    pub fn slot_index(&self) -> usize {
        self.lease.index
    }

    pub fn is_reading(&self) -> bool {
        self.state == ReadState::Reading
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    pub fn capacity(&self) -> usize {
        self.segment.node().capacity()
    }

    pub fn source_count(&self) -> usize {
        self.segment.node().source_ref_count()
    }

    pub fn sequence(&self) -> u64 {
        self.segment.node().sequence()
    }
}

impl<T: Payload> Drop for Source<T> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(
                channel = self.segment.name(),
                slot = self.lease.index,
                "Failed to release slot: {}",
                e
            );
        }
    }
}

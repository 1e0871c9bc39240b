use crate::errors::Result;
use crate::node::SlotLease;
use crate::segment::Segment;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
enum Target {
    Sink,
    Source(SlotLease),
}

/// Wakes a Sink or Source out of its blocking wait, typically from a
/// signal-handling thread during shutdown.
///
/// Keeps the segment attached, so it stays valid after its handle is gone.
#[derive(Clone)]
pub struct Notifier {
    segment: Arc<Segment>,
    target: Target,
}

impl Notifier {
    pub(crate) fn for_sink(segment: Arc<Segment>) -> Self {
        Self {
            segment,
            target: Target::Sink,
        }
    }

    pub(crate) fn for_source(segment: Arc<Segment>, lease: SlotLease) -> Self {
        Self {
            segment,
            target: Target::Source(lease),
        }
    }

    pub fn notify(&self) -> Result<()> {
        let node = self.segment.node();
        match self.target {
            Target::Sink => node.interrupt_sink(),
            // No-op once the lease has been released or evicted
            Target::Source(lease) => node.interrupt_source(&lease),
        }
    }

    pub fn channel(&self) -> &str {
        self.segment.name()
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("channel", &self.segment.name())
            .field("target", &self.target)
            .finish()
    }
}

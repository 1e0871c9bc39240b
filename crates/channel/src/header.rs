use crate::errors::{ChannelError, Result};
use crate::node::{MAX_SLOTS, Node};
use crate::utils::process_alive;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

/// "RDVZCHAN" in little endian.
pub const SEGMENT_MAGIC: u64 = u64::from_le_bytes(*b"RDVZCHAN");
pub const LAYOUT_VERSION: u32 = 1;

/// Lifecycle of a segment. A freshly created (zero-filled) file reads as
/// `Initializing` until its creator has built the Node.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Initializing = 0,
    Ready = 1,
    Closed = 2,
}

impl SegmentState {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(SegmentState::Initializing),
            1 => Some(SegmentState::Ready),
            2 => Some(SegmentState::Closed),
            _ => None,
        }
    }
}

/// Segment layout:
///
/// ```text
/// [ Header (64 B) ][ Node ][ pad to payload alignment ][ payload ]
/// ```
///
/// Every field is an atomic so that any attached process may read it through
/// a shared reference. Layout fields are written once by the creator before
/// `state` is published as `Ready` with `Ordering::Release`; attachers load
/// `state` with `Ordering::Acquire` before trusting them.
#[repr(C, align(64))]
pub struct Header {
    pub magic: AtomicU64,
    pub version: AtomicU32,
    pub state: AtomicU32,
    /// Number of live handles (Sink + Sources). The handle that drops it to
    /// zero tears the segment down.
    pub attach_count: AtomicU32,
    /// Pid of the bound Sink, 0 when no Sink is bound.
    pub sink_pid: AtomicI32,
    pub capacity: AtomicU32,
    pub payload_align: AtomicU32,
    pub payload_size: AtomicU64,
    pub payload_offset: AtomicU64,
    pub total_size: AtomicU64,
}

impl Header {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn state(&self) -> Option<SegmentState> {
        SegmentState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn layout(&self) -> SegmentLayout {
        SegmentLayout {
            capacity: self.capacity.load(Ordering::Acquire) as usize,
            payload_size: self.payload_size.load(Ordering::Acquire) as usize,
            payload_align: self.payload_align.load(Ordering::Acquire) as usize,
        }
    }

    pub(crate) fn write_layout(&self, layout: &SegmentLayout) {
        self.magic.store(SEGMENT_MAGIC, Ordering::Relaxed);
        self.version.store(LAYOUT_VERSION, Ordering::Relaxed);
        self.capacity
            .store(layout.capacity as u32, Ordering::Relaxed);
        self.payload_size
            .store(layout.payload_size as u64, Ordering::Relaxed);
        self.payload_align
            .store(layout.payload_align as u32, Ordering::Relaxed);
        self.payload_offset
            .store(layout.payload_offset() as u64, Ordering::Relaxed);
        self.total_size
            .store(layout.total_size() as u64, Ordering::Relaxed);
    }

    /// Take attachment. Fails once the count has reached zero, since the
    /// handle that dropped it is already tearing the segment down.
    pub(crate) fn try_attach(&self) -> bool {
        let mut current = self.attach_count.load(Ordering::Acquire);
        loop {
            if current == 0 || self.state() != Some(SegmentState::Ready) {
                return false;
            }
            match self.attach_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop attachment. Returns `true` for the last handle.
    pub(crate) fn detach(&self) -> bool {
        self.attach_count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Register `pid` as the channel's only Sink.
    ///
    /// Returns the pid of a dead previous owner that was replaced, or the
    /// pid of the live owner as the error.
    pub(crate) fn claim_sink(&self, pid: i32) -> std::result::Result<Option<i32>, i32> {
        loop {
            let current = self.sink_pid.load(Ordering::Acquire);
            if current == 0 {
                if self
                    .sink_pid
                    .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(None);
                }
                continue;
            }

            if current != pid && !process_alive(current) {
                if self
                    .sink_pid
                    .compare_exchange(current, pid, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(Some(current));
                }
                continue;
            }

            return Err(current);
        }
    }

    pub(crate) fn release_sink(&self, pid: i32) {
        let _ = self
            .sink_pid
            .compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// Geometry of a channel segment, derived from capacity and payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    pub capacity: usize,
    pub payload_size: usize,
    pub payload_align: usize,
}

const fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

impl SegmentLayout {
    pub const NODE_OFFSET: usize = align_up(Header::SIZE, std::mem::align_of::<Node>());

    /// Payloads start on their own cache line.
    const MIN_PAYLOAD_ALIGN: usize = 64;

    pub fn for_payload<T>(capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > MAX_SLOTS {
            return Err(ChannelError::LayoutMismatch(format!(
                "capacity {} outside 1..={}",
                capacity, MAX_SLOTS
            )));
        }

        Ok(Self {
            capacity,
            payload_size: std::mem::size_of::<T>(),
            payload_align: std::mem::align_of::<T>(),
        })
    }

    pub fn payload_offset(&self) -> usize {
        align_up(
            Self::NODE_OFFSET + std::mem::size_of::<Node>(),
            self.payload_align.max(Self::MIN_PAYLOAD_ALIGN),
        )
    }

    pub fn total_size(&self) -> usize {
        self.payload_offset() + self.payload_size.max(1)
    }

    /// Payload type of an attaching handle must match the creator's.
    pub fn check_payload<T>(&self) -> Result<()> {
        if self.payload_size != std::mem::size_of::<T>()
            || self.payload_align != std::mem::align_of::<T>()
        {
            return Err(ChannelError::LayoutMismatch(format!(
                "payload is {} bytes (align {}), handle expects {} bytes (align {})",
                self.payload_size,
                self.payload_align,
                std::mem::size_of::<T>(),
                std::mem::align_of::<T>()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_alignment() {
        assert_eq!(
            std::mem::align_of::<Header>(),
            64,
            "Header must sit on its own cache line"
        );
        assert_eq!(Header::SIZE, 64, "Header should fill exactly one line");
    }

    #[test]
    fn test_state_round_trip_from_u32() {
        assert_eq!(SegmentState::from_u32(0), Some(SegmentState::Initializing));
        assert_eq!(SegmentState::from_u32(1), Some(SegmentState::Ready));
        assert_eq!(SegmentState::from_u32(2), Some(SegmentState::Closed));
        assert_eq!(SegmentState::from_u32(9), None);
    }

    #[test]
    fn test_layout_offsets_are_aligned() {
        let layout = SegmentLayout::for_payload::<[u64; 4]>(4).unwrap();

        assert_eq!(SegmentLayout::NODE_OFFSET % std::mem::align_of::<Node>(), 0);
        assert!(layout.payload_offset() >= SegmentLayout::NODE_OFFSET + std::mem::size_of::<Node>());
        assert_eq!(layout.payload_offset() % 64, 0);
        assert_eq!(layout.total_size(), layout.payload_offset() + 32);
    }

    #[test]
    fn test_layout_rejects_bad_capacity() {
        assert!(SegmentLayout::for_payload::<u32>(0).is_err());
        assert!(SegmentLayout::for_payload::<u32>(MAX_SLOTS + 1).is_err());
        assert!(SegmentLayout::for_payload::<u32>(MAX_SLOTS).is_ok());
    }

    #[test]
    fn test_check_payload_detects_type_change() {
        let layout = SegmentLayout::for_payload::<u64>(2).unwrap();

        assert!(layout.check_payload::<u64>().is_ok());
        assert!(matches!(
            layout.check_payload::<[u8; 3]>(),
            Err(ChannelError::LayoutMismatch(_))
        ));
    }

    #[test]
    fn test_sink_claim_is_exclusive() {
        let header: Header = unsafe { std::mem::zeroed() };
        let me = std::process::id() as i32;

        assert_eq!(header.claim_sink(me), Ok(None));
        assert_eq!(
            header.claim_sink(me),
            Err(me),
            "A live owner must not be replaced"
        );

        header.release_sink(me);
        assert_eq!(header.sink_pid.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_sink_claim_replaces_dead_owner() {
        let header: Header = unsafe { std::mem::zeroed() };
        // pid_max on Linux is at most 2^22, so this pid cannot exist
        let dead = i32::MAX - 1;
        header.sink_pid.store(dead, Ordering::Release);

        let me = std::process::id() as i32;
        assert_eq!(header.claim_sink(me), Ok(Some(dead)));
        assert_eq!(header.sink_pid.load(Ordering::Acquire), me);
    }

    #[test]
    fn test_attach_requires_ready_and_live_count() {
        let header: Header = unsafe { std::mem::zeroed() };
        assert!(!header.try_attach(), "Initializing segment must refuse");

        header.state.store(SegmentState::Ready as u32, Ordering::Release);
        assert!(!header.try_attach(), "Zero count means teardown in progress");

        header.attach_count.store(1, Ordering::Release);
        assert!(header.try_attach());
        assert!(!header.detach());
        assert!(header.detach(), "Second detach is the last one");
    }
}

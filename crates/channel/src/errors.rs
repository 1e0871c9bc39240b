use crate::semaphore::SemaphoreError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Semaphore error: {0}")]
    Semaphore(#[from] SemaphoreError),

    #[error("Channel '{channel}' is full: {occupied}/{capacity} slots occupied")]
    CapacityExceeded {
        channel: String,
        capacity: usize,
        occupied: usize,
    },

    #[error("Invalid slot index {index} (capacity {capacity})")]
    InvalidIndex { index: usize, capacity: usize },

    #[error("Channel '{0}' not found")]
    ChannelNotFound(String),

    #[error("Channel '{channel}' already has a sink bound (pid {pid})")]
    ChannelConflict { channel: String, pid: i32 },

    #[error("Slot {index} was evicted by the sink")]
    Evicted { index: usize },

    #[error("Segment layout does not match: {0}")]
    LayoutMismatch(String),

    #[error("Invalid channel name: {0:?}")]
    InvalidName(String),

    #[error("No read in progress")]
    NotReading,

    #[error("Slot has unread published data, call wait() first")]
    ReadPending,

    #[error("Publish was abandoned by the sink before the read finished")]
    CycleAbandoned,

    #[error("Previous read not signalled done")]
    ReadInProgress,

    #[error("Payload of {len} bytes exceeds buffer of {capacity} bytes")]
    PayloadTooLarge { len: usize, capacity: usize },

    #[error("Handle was interrupted")]
    Interrupted,
}

impl ChannelError {
    /// Errors that come from start-order races and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChannelError::ChannelNotFound(_))
    }

    /// Name the channel in errors raised by the Node, which does not know it.
    pub(crate) fn for_channel(self, name: &str) -> Self {
        match self {
            ChannelError::CapacityExceeded {
                capacity, occupied, ..
            } => ChannelError::CapacityExceeded {
                channel: name.to_string(),
                capacity,
                occupied,
            },
            other => other,
        }
    }
}

pub type Result<T, E = ChannelError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_formatting() {
        let err = ChannelError::CapacityExceeded {
            channel: "frames".to_string(),
            capacity: 2,
            occupied: 2,
        };
        assert_eq!(
            err.to_string(),
            "Channel 'frames' is full: 2/2 slots occupied",
            "CapacityExceeded should name channel and occupancy"
        );

        let err = ChannelError::InvalidIndex {
            index: 7,
            capacity: 4,
        };
        assert_eq!(err.to_string(), "Invalid slot index 7 (capacity 4)");

        let err = ChannelError::ChannelNotFound("pos".to_string());
        assert_eq!(err.to_string(), "Channel 'pos' not found");

        let err = ChannelError::ChannelConflict {
            channel: "pos".to_string(),
            pid: 42,
        };
        assert_eq!(
            err.to_string(),
            "Channel 'pos' already has a sink bound (pid 42)"
        );
    }

    #[test]
    fn test_only_not_found_is_transient() {
        assert!(ChannelError::ChannelNotFound("x".into()).is_transient());
        assert!(
            !ChannelError::CapacityExceeded {
                channel: "x".into(),
                capacity: 1,
                occupied: 1
            }
            .is_transient()
        );
        assert!(
            !ChannelError::ChannelConflict {
                channel: "x".into(),
                pid: 1
            }
            .is_transient()
        );
        assert!(!ChannelError::Evicted { index: 0 }.is_transient());
    }

    #[test]
    fn test_error_conversion_from_io_error() {
        fn uses_question_mark() -> Result<()> {
            Err(io::Error::other("test error"))?;
            Ok(())
        }

        match uses_question_mark().unwrap_err() {
            ChannelError::IoError(e) => assert_eq!(e.to_string(), "test error"),
            other => panic!("Expected IoError variant, got {other:?}"),
        }
    }
}

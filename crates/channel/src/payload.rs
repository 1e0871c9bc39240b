use crate::errors::{ChannelError, Result};

/// Types that can live in a channel's payload buffer.
///
/// The buffer is shared between processes and starts out zero-filled, so
/// the value is copied bit for bit and never dropped.
///
/// # Safety
///
/// Implementors must:
/// - contain no pointers or references (they mean nothing in another process)
/// - have a valid all-zero bit pattern
/// - have the same layout in every process attached to the channel
///   (use `#[repr(C)]` for structs)
pub unsafe trait Payload: Copy + Send + Sync + 'static {}

macro_rules! impl_payload {
    ($($t:ty),* $(,)?) => {
        $(unsafe impl Payload for $t {})*
    };
}

impl_payload!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64, bool);

unsafe impl<T: Payload, const N: usize> Payload for [T; N] {}

/// Coordinate frame of a [`Position`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CoordinateSystem {
    /// Referenced to the camera sensor, origin in the upper left corner.
    #[default]
    Pixels = 0,
    /// Mapped through a homography into world units.
    World = 1,
}

/// Position record published by detectors.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Position {
    pub coord_system: CoordinateSystem,
    pub position_valid: bool,
    pub velocity_valid: bool,
    pub heading_valid: bool,
    pub sample: u64,
    pub position: [f64; 2],
    pub velocity: [f64; 2],
    pub heading: [f64; 2],
}

unsafe impl Payload for Position {}

impl Position {
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            position_valid: true,
            position: [x, y],
            ..Self::default()
        }
    }
}

/// Length-prefixed byte buffer for payloads of arbitrary content, such as
/// encoded frames.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Blob<const N: usize> {
    len: u64,
    bytes: [u8; N],
}

unsafe impl<const N: usize> Payload for Blob<N> {}

impl<const N: usize> Default for Blob<N> {
    fn default() -> Self {
        Self {
            len: 0,
            bytes: [0; N],
        }
    }
}

impl<const N: usize> std::fmt::Debug for Blob<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob")
            .field("len", &self.len)
            .field("capacity", &N)
            .finish()
    }
}

impl<const N: usize> Blob<N> {
    pub const CAPACITY: usize = N;

    pub fn set(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > N {
            return Err(ChannelError::PayloadTooLarge {
                len: data.len(),
                capacity: N,
            });
        }
        self.bytes[..data.len()].copy_from_slice(data);
        self.len = data.len() as u64;
        Ok(())
    }

    /// Valid bytes. A length corrupted past `N` is clamped.
    pub fn as_bytes(&self) -> &[u8] {
        let len = (self.len as usize).min(N);
        &self.bytes[..len]
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_position_is_default() {
        let zeroed: Position = unsafe { std::mem::zeroed() };
        assert_eq!(zeroed, Position::default());
        assert_eq!(zeroed.coord_system, CoordinateSystem::Pixels);
        assert!(!zeroed.position_valid);
    }

    #[test]
    fn test_position_at_marks_valid() {
        let pos = Position::at(3.0, 4.5);
        assert!(pos.position_valid);
        assert!(!pos.velocity_valid);
        assert_eq!(pos.position, [3.0, 4.5]);
    }

    #[test]
    fn test_blob_set_and_read_back() {
        let mut blob = Blob::<16>::default();
        assert!(blob.is_empty());

        blob.set(b"frame bytes").unwrap();
        assert_eq!(blob.as_bytes(), b"frame bytes");

        blob.set(b"short").unwrap();
        assert_eq!(blob.as_bytes(), b"short", "Shorter write must shrink");
    }

    #[test]
    fn test_blob_rejects_oversized_data() {
        let mut blob = Blob::<4>::default();
        assert!(matches!(
            blob.set(b"too long"),
            Err(ChannelError::PayloadTooLarge {
                len: 8,
                capacity: 4
            })
        ));
        assert!(blob.is_empty(), "Failed write must leave the blob untouched");
    }
}

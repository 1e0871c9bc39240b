//! Named shared segment backing one channel.
//!
//! The Sink creates the segment file exclusively (`O_EXCL`), so exactly one
//! process builds the Node. Everyone else attaches to the finished segment
//! and the handle that drops the attach count to zero unlinks it.

use crate::errors::{ChannelError, Result};
use crate::header::{Header, LAYOUT_VERSION, SEGMENT_MAGIC, SegmentLayout, SegmentState};
use crate::node::Node;
use crate::paths;
use crate::payload::Payload;
use crate::retry::RetryConfig;
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

pub struct Segment {
    _mmap: MmapMut,
    base: NonNull<u8>,
    path: PathBuf,
    name: String,
    layout: SegmentLayout,
    created: bool,
    attached: bool,
}

// The mapping is only reached through atomics, process-shared semaphores,
// and a payload guarded by the Node protocol.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create and initialize a new segment. Fails with `AlreadyExists` if
    /// the channel's file is present.
    pub(crate) fn create(shm_dir: &Path, name: &str, layout: SegmentLayout) -> Result<Self> {
        let path = paths::segment_path(shm_dir, name)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;

        match Self::build(file, &path, name, layout) {
            Ok(segment) => {
                tracing::debug!(
                    channel = name,
                    path = %path.display(),
                    size = layout.total_size(),
                    "Created channel segment"
                );
                Ok(segment)
            }
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                Err(e)
            }
        }
    }

    fn build(file: File, path: &Path, name: &str, layout: SegmentLayout) -> Result<Self> {
        let size = layout.total_size();
        file.set_len(size as u64)?;

        let mut mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        let base = NonNull::from(&mut *mmap).cast::<u8>();

        let mut segment = Self {
            _mmap: mmap,
            base,
            path: path.to_path_buf(),
            name: name.to_string(),
            layout,
            created: true,
            attached: false,
        };

        let header = segment.header();
        header.write_layout(&layout);
        // Fresh file is zero-filled and not yet Ready, nobody else touches it
        unsafe { segment.node().init(layout.capacity)? };
        header.attach_count.store(1, Ordering::Relaxed);
        header
            .state
            .store(SegmentState::Ready as u32, Ordering::Release);

        segment.attached = true;
        Ok(segment)
    }

    /// Attach to an existing segment, waiting for its creator to finish
    /// initializing it.
    pub(crate) fn open(shm_dir: &Path, name: &str, retry: &RetryConfig) -> Result<Self> {
        let path = paths::segment_path(shm_dir, name)?;
        retry
            .poll(|| Self::try_open(&path, name))?
            .ok_or_else(|| ChannelError::ChannelNotFound(name.to_string()))
    }

    /// Create the segment, or attach to it if it already exists.
    pub(crate) fn create_or_open(
        shm_dir: &Path,
        name: &str,
        layout: SegmentLayout,
        retry: &RetryConfig,
    ) -> Result<Self> {
        let path = paths::segment_path(shm_dir, name)?;
        retry
            .poll(|| match Self::create(shm_dir, name, layout) {
                Ok(segment) => Ok(Some(segment)),
                Err(ChannelError::IoError(e)) if e.kind() == io::ErrorKind::AlreadyExists => {
                    match Self::try_open(&path, name) {
                        // Unlinked between our create and open, try creating again
                        Err(ChannelError::ChannelNotFound(_)) => Ok(None),
                        other => other,
                    }
                }
                Err(e) => Err(e),
            })?
            .ok_or_else(|| ChannelError::ChannelNotFound(name.to_string()))
    }

    /// One attach attempt. `Ok(None)` means "not ready yet, try again".
    fn try_open(path: &Path, name: &str) -> Result<Option<Self>> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ChannelError::ChannelNotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata()?.len() as usize;
        if len < SegmentLayout::NODE_OFFSET {
            return Ok(None);
        }

        let mut mmap = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        let base = NonNull::from(&mut *mmap).cast::<u8>();
        let header = unsafe { &*(base.as_ptr() as *const Header) };

        match header.state() {
            Some(SegmentState::Ready) => {}
            Some(SegmentState::Initializing) | Some(SegmentState::Closed) => return Ok(None),
            None => {
                return Err(ChannelError::LayoutMismatch(
                    "unknown segment state".to_string(),
                ));
            }
        }

        if header.magic.load(Ordering::Acquire) != SEGMENT_MAGIC
            || header.version.load(Ordering::Acquire) != LAYOUT_VERSION
        {
            return Err(ChannelError::LayoutMismatch(format!(
                "{} is not a version {} channel segment",
                path.display(),
                LAYOUT_VERSION
            )));
        }

        let layout = header.layout();
        let expected = header.total_size.load(Ordering::Acquire) as usize;
        if layout.total_size() != expected || len < expected {
            return Err(ChannelError::LayoutMismatch(format!(
                "segment is {} bytes, layout needs {}",
                len,
                layout.total_size()
            )));
        }

        if !header.try_attach() {
            return Ok(None);
        }

        Ok(Some(Self {
            _mmap: mmap,
            base,
            path: path.to_path_buf(),
            name: name.to_string(),
            layout,
            created: false,
            attached: true,
        }))
    }

    pub fn header(&self) -> &Header {
        unsafe { &*(self.base.as_ptr() as *const Header) }
    }

    pub fn node(&self) -> &Node {
        unsafe { &*(self.base.as_ptr().add(SegmentLayout::NODE_OFFSET) as *const Node) }
    }

    /// Typed pointer to the payload buffer.
    pub(crate) fn payload<T: Payload>(&self) -> Result<NonNull<T>> {
        self.layout.check_payload::<T>()?;
        let offset = self.layout.payload_offset();
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }.cast::<T>())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> SegmentLayout {
        self.layout
    }

    /// Whether this handle created the segment.
    pub fn created(&self) -> bool {
        self.created
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if !self.attached {
            return;
        }

        let header = self.header();
        if !header.detach() {
            return;
        }

        header
            .state
            .store(SegmentState::Closed as u32, Ordering::Release);
        if let Err(e) = unsafe { self.node().destroy() } {
            tracing::warn!(channel = %self.name, "Failed to destroy node semaphores: {}", e);
        }

        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(channel = %self.name, "Removed channel segment"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                channel = %self.name,
                path = %self.path.display(),
                "Failed to remove channel segment: {}",
                e
            ),
        }
    }
}

/// Unlink a channel's segment left behind by crashed processes.
///
/// Handles still attached keep their mapping; new handles get a fresh
/// segment. Returns `false` if there was nothing to remove.
pub fn remove_channel(shm_dir: &Path, name: &str) -> Result<bool> {
    let path = paths::segment_path(shm_dir, name)?;
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn quick_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_micros(50),
            max_delay: Duration::from_micros(200),
        }
    }

    fn layout() -> SegmentLayout {
        SegmentLayout::for_payload::<[u64; 8]>(4).unwrap()
    }

    #[test]
    fn test_create_then_open_shares_node() {
        let dir = tempdir().unwrap();

        let created = Segment::create(dir.path(), "shared", layout()).unwrap();
        let opened = Segment::open(dir.path(), "shared", &quick_retry()).unwrap();

        assert!(created.created());
        assert!(!opened.created());
        assert_eq!(opened.layout(), layout());
        assert_eq!(created.header().attach_count.load(Ordering::Acquire), 2);

        let lease = created.node().acquire_slot().unwrap();
        assert!(
            opened.node().is_occupied(lease.index),
            "Both mappings must see the same node"
        );
    }

    #[test]
    fn test_second_create_fails_exclusively() {
        let dir = tempdir().unwrap();
        let _first = Segment::create(dir.path(), "excl", layout()).unwrap();

        match Segment::create(dir.path(), "excl", layout()) {
            Err(ChannelError::IoError(e)) => assert_eq!(e.kind(), io::ErrorKind::AlreadyExists),
            Err(other) => panic!("Expected AlreadyExists, got {other:?}"),
            Ok(_) => panic!("Second create must fail"),
        }
    }

    #[test]
    fn test_open_missing_channel_is_not_found() {
        let dir = tempdir().unwrap();

        assert!(matches!(
            Segment::open(dir.path(), "absent", &quick_retry()),
            Err(ChannelError::ChannelNotFound(name)) if name == "absent"
        ));
    }

    #[test]
    fn test_uninitialized_segment_is_not_attached() {
        let dir = tempdir().unwrap();
        // A creator that died right after O_EXCL leaves an empty file
        std::fs::File::create(dir.path().join("chan_stuck")).unwrap();

        assert!(matches!(
            Segment::open(dir.path(), "stuck", &quick_retry()),
            Err(ChannelError::ChannelNotFound(_))
        ));
    }

    #[test]
    fn test_last_detach_removes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chan_life");

        let created = Segment::create(dir.path(), "life", layout()).unwrap();
        let opened = Segment::open(dir.path(), "life", &quick_retry()).unwrap();

        drop(created);
        assert!(path.exists(), "An attached handle keeps the segment alive");

        drop(opened);
        assert!(!path.exists(), "Last detach should unlink the segment");
    }

    #[test]
    fn test_create_or_open_attaches_to_existing() {
        let dir = tempdir().unwrap();

        let first = Segment::create_or_open(dir.path(), "either", layout(), &quick_retry()).unwrap();
        let second = Segment::create_or_open(dir.path(), "either", layout(), &quick_retry()).unwrap();

        assert!(first.created());
        assert!(!second.created());
    }

    #[test]
    fn test_payload_type_is_checked() {
        let dir = tempdir().unwrap();
        let segment = Segment::create(dir.path(), "typed", layout()).unwrap();

        assert!(segment.payload::<[u64; 8]>().is_ok());
        assert!(matches!(
            segment.payload::<u8>(),
            Err(ChannelError::LayoutMismatch(_))
        ));
    }

    #[test]
    fn test_remove_channel() {
        let dir = tempdir().unwrap();
        let segment = Segment::create(dir.path(), "orphan", layout()).unwrap();
        std::mem::forget(segment);

        assert!(remove_channel(dir.path(), "orphan").unwrap());
        assert!(!remove_channel(dir.path(), "orphan").unwrap());
    }
}

//! Channel naming and defaults shared by every stage.
//!
//! A channel name maps to exactly one segment file, so producers and
//! consumers only have to agree on the name.

use crate::errors::{ChannelError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// tmpfs-backed directory holding channel segments.
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

/// Segment files are named `<prefix><channel>`.
pub const SEGMENT_PREFIX: &str = "chan_";

/// Default number of Source slots per channel.
pub const DEFAULT_CAPACITY: usize = 8;

/// How long the Sink waits for a Source to finish reading before evicting it.
pub const DEFAULT_RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(5);

pub const MAX_NAME_LEN: usize = 200;

pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.len() > MAX_NAME_LEN
        || name.contains('/')
        || name.contains('\0')
        || name == "."
        || name == ".."
    {
        return Err(ChannelError::InvalidName(name.to_string()));
    }
    Ok(())
}

pub fn segment_path(shm_dir: &Path, name: &str) -> Result<PathBuf> {
    validate_name(name)?;
    Ok(shm_dir.join(format!("{SEGMENT_PREFIX}{name}")))
}

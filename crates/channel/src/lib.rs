//! Shared-memory rendezvous channel between one producer process (the Sink)
//! and up to [`MAX_SLOTS`] consumer processes (Sources).
//!
//! ```ignore
//! let mut sink = Sink::<Position>::bind("positions")?;
//! sink.post(&Position::at(12.0, 40.0))?;
//!
//! // in another process
//! let mut source = Source::<Position>::connect("positions")?;
//! if let WaitStatus::Ready(_) = source.wait()? {
//!     let position = source.get_value()?;
//!     source.signal_done()?;
//! }
//! ```

pub mod config;
pub mod errors;
pub mod header;
pub mod node;
mod notifier;
pub mod paths;
pub mod payload;
pub mod retry;
mod segment;
mod semaphore;
mod sink;
mod source;
mod utils;

pub use config::ChannelConfig;
pub use errors::{ChannelError, Result};
pub use node::MAX_SLOTS;
pub use notifier::Notifier;
pub use payload::{Blob, CoordinateSystem, Payload, Position};
pub use retry::RetryConfig;
pub use segment::remove_channel;
pub use semaphore::SemaphoreError;
pub use sink::{PostReport, Sink};
pub use source::{Source, WaitStatus};

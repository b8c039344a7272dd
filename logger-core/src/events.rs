//! Logger event subscriptions

use crate::logger::WriteError;

/// Callbacks fired by a [`DataLogger`](crate::DataLogger)
///
/// Subscribers run inline on the context that owns the logger and should
/// return quickly.
pub trait LoggerEvents: Send + Sync {
    /// The effective block size of the backend changed
    fn block_size_update(&self, _block_size: u16) {}

    /// A block could not be written
    fn write_failure(&self, _block_type: u8, _data: &[u8], _error: &WriteError) {}
}

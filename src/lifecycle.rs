//! Capability shared by everything the idle supervisor can tear down and bring back.

use crate::error::Result;

/// An object whose expensive resources can be released and re-acquired.
///
/// `finalize` must be idempotent. `initialize` after `finalize` starts a fresh
/// generation of the resource (new child process, new prompt negotiation).
pub trait Lifecycle: Send + Sync {
    fn initialize(&self) -> Result<()>;

    fn finalize(&self) -> Result<()>;

    /// Short label used in log lines.
    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

// Error types for vfio-switch

use std::io;

use thiserror::Error;

use crate::core::service::DeviceHolder;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, SwitchError>;

/// All failure classes of a driver switch run
#[derive(Debug, Error)]
pub enum SwitchError {
    /// Missing or malformed configuration artifact
    #[error("configuration error: {0}")]
    Config(String),

    /// Driver assignment does not cover the functions actually present
    #[error(
        "{expected} driver assignment(s) configured but {found} PCI function(s) found under {prefix}"
    )]
    FunctionCountMismatch {
        prefix: String,
        expected: usize,
        found: usize,
    },

    /// Failed to rebind one PCI function; aborts the whole switch
    #[error("failed to bind {function} to {driver}: {source}")]
    Binding {
        function: String,
        driver: String,
        source: io::Error,
    },

    /// The vendor query tool failed or produced unparseable output
    #[error("power sampling failed: {0}")]
    Sample(String),

    /// An external command could not be run or exited unsuccessfully
    #[error("{program} failed: {detail}")]
    Command { program: String, detail: String },

    /// Passthrough precondition violation: another process holds the device
    #[error("device still in use by: {}", fmt_holders(.0))]
    DeviceBusy(Vec<DeviceHolder>),

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn fmt_holders(holders: &[DeviceHolder]) -> String {
    holders
        .iter()
        .map(|h| format!("{} (pid {})", h.name, h.pid))
        .collect::<Vec<_>>()
        .join(", ")
}

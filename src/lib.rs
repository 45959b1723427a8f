// vfio-switch
//
// Hands a secondary GPU between the host NVIDIA driver stack and vfio-pci
// so the card can be passed to a virtual machine and reclaimed afterwards.

// Core functionality modules
pub mod core;

// GPU power state sampling and convergence
pub mod gpu;

// Error types
pub mod error;

// Utility functions
pub mod utils;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

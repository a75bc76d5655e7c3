mod core;

// Re-export the daemon and driver surface, used by the binary and integration tests
pub use crate::core::*;

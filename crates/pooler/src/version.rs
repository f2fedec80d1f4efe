//! Version information for pooler.

/// Pooler version from Cargo.toml, reported in `status` replies.
pub const POOLER_VERSION: &str = env!("CARGO_PKG_VERSION");

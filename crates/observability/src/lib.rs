//! Shared tracing setup for enrichq binaries.

/// Initialize process-wide tracing.
///
/// Safe to call multiple times; later calls are no-ops.
pub fn init() {
    tracing::init();
}

/// Subscriber configuration (filters, layers).
pub mod tracing;

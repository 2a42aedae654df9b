//! Process-wide tracing setup shared by binaries and tests.

/// Initialize process-wide observability with the default filter.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize observability with an explicit filter directive (e.g. `"jobtrack_infra=debug"`).
///
/// `RUST_LOG` is ignored when a directive is given. Safe to call multiple times.
pub fn init_with_filter(directive: &str) {
    tracing::init_with_filter(directive);
}

/// Tracing configuration (filters, formatting).
pub mod tracing;

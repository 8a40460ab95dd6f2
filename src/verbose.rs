//! Verbose message categories and a collector helper.
//!
//! Every log line the core emits names one of these categories as its
//! tracing target, so embedders can filter per subsystem.

/// The verbose categories the storage core emits.
pub const CATEGORIES: &[&str] = &[
    "block",
    "evict",
    "evictserver",
    "fileops",
    "hazard",
    "mutex",
    "read",
    "readserver",
    "reconcile",
    "salvage",
    "verify",
    "write",
];

/// Install a default collector printing verbose messages to stderr.
/// Embedders with their own tracing setup skip this.
pub fn init(level: tracing::Level) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_sorted_and_unique() {
        let mut sorted = CATEGORIES.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted, CATEGORIES);
    }

    #[test]
    fn test_init_is_idempotent() {
        init(tracing::Level::ERROR);
        init(tracing::Level::ERROR);
    }
}

use std::time::Duration;

/// Ring construction options.
#[derive(Debug, Clone)]
pub struct RingOptions {
    /// Virtual buckets generated per unit of node weight.
    pub buckets_per_node: u32,
    /// How long a down node is retained before the periodic prune deletes it
    /// from the node table and strips its buckets. This is the ring's
    /// retention window, distinct from the per-lookup routing grace in
    /// [`LookupOptions`].
    pub down_node_expiry: Duration,
    /// Minimum time between prune passes.
    pub prune_interval: Duration,
}

impl Default for RingOptions {
    fn default() -> Self {
        Self {
            buckets_per_node: 16,
            down_node_expiry: Duration::ZERO,
            prune_interval: Duration::from_secs(30),
        }
    }
}

/// Per-lookup options.
#[derive(Debug, Clone, Default)]
pub struct LookupOptions {
    /// A down node remains routable while its downtime is below this window.
    pub down_node_expiry: Duration,
}

impl LookupOptions {
    pub fn with_down_node_expiry(down_node_expiry: Duration) -> Self {
        Self { down_node_expiry }
    }
}

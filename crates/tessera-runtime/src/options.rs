use facet::Facet;
use std::time::Duration;

/// Configuration surface for one connector (§6 configuration table).
/// Populated by the host application's own config loader -- this struct
/// only derives `Facet` so that loader can deserialize into it; no loading
/// mechanism is implemented here.
#[derive(Facet, Clone, Debug, PartialEq)]
pub struct ConnectorOptions {
    /// Flush window in milliseconds; 0 disables batching (immediate
    /// per-change emission, at the cost of allocations).
    pub buffer_time_ms: u64,
    /// Back-off between connector reconnect attempts, in milliseconds.
    pub retry_time_ms: u64,
    /// Write-retry ring capacity; 0 disables buffering.
    pub max_queue_size: usize,
    /// Largest outbound batch.
    pub max_batch_size: usize,
    /// Recursion guard for subject graph traversal.
    pub max_nesting_depth: u32,
    /// Client-side window for delete-then-add echo suppression, in
    /// milliseconds.
    pub recently_deleted_ttl_ms: u64,
    /// Whether reorder-only changes to ordered collections are propagated.
    /// Connector policy (§9 open question); the canonical connector leaves
    /// this `false`.
    pub propagate_reorders: bool,
}

impl ConnectorOptions {
    pub fn buffer_time(&self) -> Duration {
        Duration::from_millis(self.buffer_time_ms)
    }

    pub fn retry_time(&self) -> Duration {
        Duration::from_millis(self.retry_time_ms)
    }

    pub fn recently_deleted_ttl(&self) -> Duration {
        Duration::from_millis(self.recently_deleted_ttl_ms)
    }
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            buffer_time_ms: 8,
            retry_time_ms: 10_000,
            max_queue_size: 4096,
            max_batch_size: 256,
            max_nesting_depth: 10,
            // Must exceed worst-case round-trip plus server processing;
            // chosen conservatively as a default, tunable per deployment.
            recently_deleted_ttl_ms: 30_000,
            propagate_reorders: false,
        }
    }
}

/// Process-wide options, currently just the connector default. Split out
/// from `ConnectorOptions` so a host that runs several connectors can
/// override per-connector values against a shared baseline.
#[derive(Facet, Clone, Debug, PartialEq, Default)]
pub struct RuntimeOptions {
    pub default_connector: ConnectorOptions,
}

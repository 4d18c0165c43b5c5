//! Configuration options for the metadata cache and its injector.

use std::time::Duration;

/// Default cap on the number of prefixes handled per injection chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 512;

/// Default cap on the injector's retry backoff.
pub const DEFAULT_MAX_RETRY_INTERVAL: Duration = Duration::from_secs(60);

//------------ Config --------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Config {
    /// Cap on per-chunk work inside one injection run. Chunking bounds
    /// the peak number of live identities, since references released for
    /// a chunk are only freed after that chunk's datapath writes landed.
    pub chunk_size: usize,
    /// Cap on the injector controller's exponential retry backoff.
    pub max_retry_interval: Duration,
    /// Permits `cidr:`, `fqdn:` and `cidrgroup:` labels on node prefixes,
    /// which are otherwise stripped from in-cluster prefixes.
    pub policy_cidr_matches_nodes: bool,
    /// Permits `node:`-source labels on node prefixes.
    pub per_node_labels: bool,
    /// Enables per-decision debug logging in the injector.
    pub debug_logging: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retry_interval: DEFAULT_MAX_RETRY_INTERVAL,
            policy_cidr_matches_nodes: false,
            per_node_labels: false,
            debug_logging: false,
        }
    }
}

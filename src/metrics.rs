//! Prometheus collectors exposed by the metadata cache.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntGauge, Registry,
};

//------------ Metrics -------------------------------------------------------

/// The collectors the cache keeps up to date. All collectors are
/// registered on a private [`Registry`] that the embedding agent can
/// gather from or merge into its own.
pub struct Metrics {
    registry: Registry,
    pub(crate) prefixes: IntGauge,
    pub(crate) identities: IntGauge,
    pub(crate) injection_duration: Histogram,
    pub(crate) injection_errors: IntCounter,
    pub(crate) queue_depth: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let prefixes = IntGauge::new(
            "ipcache_prefixes_total",
            "Number of prefixes tracked in the metadata cache",
        )?;
        let identities = IntGauge::new(
            "ipcache_identities_total",
            "Number of identities referenced by datapath entries",
        )?;
        let injection_duration = Histogram::with_opts(HistogramOpts::new(
            "ipcache_injection_duration_seconds",
            "Duration of label injection runs",
        ))?;
        let injection_errors = IntCounter::new(
            "ipcache_injection_errors_total",
            "Number of label injection runs that failed",
        )?;
        let queue_depth = IntGauge::new(
            "ipcache_queue_depth",
            "Number of prefixes waiting for label injection",
        )?;

        registry.register(Box::new(prefixes.clone()))?;
        registry.register(Box::new(identities.clone()))?;
        registry.register(Box::new(injection_duration.clone()))?;
        registry.register(Box::new(injection_errors.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Metrics {
            registry,
            prefixes,
            identities,
            injection_duration,
            injection_errors,
            queue_depth,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn prefixes(&self) -> i64 {
        self.prefixes.get()
    }

    pub fn identities(&self) -> i64 {
        self.identities.get()
    }

    pub fn injection_errors(&self) -> u64 {
        self.injection_errors.get()
    }

    pub fn queue_depth(&self) -> i64 {
        self.queue_depth.get()
    }
}

#[cfg(test)]
mod tests {
    use super::Metrics;

    #[test]
    fn test_collectors_registered() {
        let metrics = Metrics::new().unwrap();
        metrics.prefixes.set(3);
        metrics.queue_depth.set(1);
        metrics.injection_errors.inc();
        let families = metrics.registry().gather();
        let names: Vec<&str> =
            families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"ipcache_prefixes_total"));
        assert!(names.contains(&"ipcache_identities_total"));
        assert!(names.contains(&"ipcache_injection_duration_seconds"));
        assert!(names.contains(&"ipcache_injection_errors_total"));
        assert!(names.contains(&"ipcache_queue_depth"));
    }
}

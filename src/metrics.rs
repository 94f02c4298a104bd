use prometheus::proto::MetricFamily;
use prometheus::{GaugeVec, Histogram, HistogramOpts, IntCounter, Opts, Registry};

use crate::consts::{REASON_KARPENTER_DISRUPTED, REASON_KARPENTER_DRIFTED};

/// Counters scoped to one parking source.
#[derive(Clone)]
pub struct SourceCounters {
    pub nodes_parked_total: IntCounter,
    pub nodes_parking_failed_total: IntCounter,
    pub errors_total: IntCounter,
}

impl SourceCounters {
    fn new(registry: &Registry, source: &str) -> Result<SourceCounters, prometheus::Error> {
        let nodes_parked_total = IntCounter::with_opts(Opts::new(
            format!("shredder_{source}_nodes_parked_total"),
            format!("Total number of nodes parked by the {source} source"),
        ))?;
        let nodes_parking_failed_total = IntCounter::with_opts(Opts::new(
            format!("shredder_{source}_nodes_parking_failed_total"),
            format!("Total number of nodes the {source} source failed to park"),
        ))?;
        let errors_total = IntCounter::with_opts(Opts::new(
            format!("shredder_{source}_errors_total"),
            format!("Total number of errors encountered by the {source} source"),
        ))?;

        registry.register(Box::new(nodes_parked_total.clone()))?;
        registry.register(Box::new(nodes_parking_failed_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(SourceCounters {
            nodes_parked_total,
            nodes_parking_failed_total,
            errors_total,
        })
    }
}

/// All `shredder_*` metric families. Owned by the process, passed explicitly;
/// the scrape endpoint is an external collaborator fed by [`Metrics::gather`].
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    pub loops_total: IntCounter,
    pub errors_total: IntCounter,
    pub processed_nodes_total: IntCounter,
    pub processed_pods_total: IntCounter,
    pub nodes_parked_total: IntCounter,
    pub nodes_parking_failed_total: IntCounter,

    pub karpenter: SourceCounters,
    pub node_label: SourceCounters,

    pub loops_duration_seconds: Histogram,
    pub processing_duration_seconds: Histogram,

    /// Unix seconds at which each parked node becomes force-evictable.
    /// Reset at every tick.
    pub node_force_to_evict_time: GaugeVec,
    /// Unix seconds at which each parked pod becomes force-evictable.
    /// Reset at every tick.
    pub pod_force_to_evict_time: GaugeVec,
    /// Per-pod failures of the current tick. Reset at every tick.
    pub pod_errors_total: GaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Metrics, prometheus::Error> {
        let registry = Registry::new();

        let loops_total = IntCounter::with_opts(Opts::new(
            "shredder_loops_total",
            "Total number of eviction loops",
        ))?;
        let errors_total = IntCounter::with_opts(Opts::new(
            "shredder_errors_total",
            "Total number of errors encountered by the eviction loop",
        ))?;
        let processed_nodes_total = IntCounter::with_opts(Opts::new(
            "shredder_processed_nodes_total",
            "Total number of parked nodes processed",
        ))?;
        let processed_pods_total = IntCounter::with_opts(Opts::new(
            "shredder_processed_pods_total",
            "Total number of pods evicted, restarted or deleted",
        ))?;
        let nodes_parked_total = IntCounter::with_opts(Opts::new(
            "shredder_nodes_parked_total",
            "Total number of nodes parked",
        ))?;
        let nodes_parking_failed_total = IntCounter::with_opts(Opts::new(
            "shredder_nodes_parking_failed_total",
            "Total number of nodes that failed to park",
        ))?;

        let loops_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "shredder_loops_duration_seconds",
            "Duration of each eviction loop",
        ))?;
        let processing_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "shredder_processing_duration_seconds",
            "Duration of processing a single parked node",
        ))?;

        let node_force_to_evict_time = GaugeVec::new(
            Opts::new(
                "shredder_node_force_to_evict_time",
                "Unix time at which a parked node becomes force-evictable",
            ),
            &["node_name"],
        )?;
        let pod_force_to_evict_time = GaugeVec::new(
            Opts::new(
                "shredder_pod_force_to_evict_time",
                "Unix time at which a parked pod becomes force-evictable",
            ),
            &["pod_name", "namespace"],
        )?;
        let pod_errors_total = GaugeVec::new(
            Opts::new(
                "shredder_pod_errors_total",
                "Per-pod failures of the current eviction loop",
            ),
            &["pod_name", "namespace", "reason", "action"],
        )?;

        registry.register(Box::new(loops_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(processed_nodes_total.clone()))?;
        registry.register(Box::new(processed_pods_total.clone()))?;
        registry.register(Box::new(nodes_parked_total.clone()))?;
        registry.register(Box::new(nodes_parking_failed_total.clone()))?;
        registry.register(Box::new(loops_duration_seconds.clone()))?;
        registry.register(Box::new(processing_duration_seconds.clone()))?;
        registry.register(Box::new(node_force_to_evict_time.clone()))?;
        registry.register(Box::new(pod_force_to_evict_time.clone()))?;
        registry.register(Box::new(pod_errors_total.clone()))?;

        let karpenter = SourceCounters::new(&registry, "karpenter")?;
        let node_label = SourceCounters::new(&registry, "node_label")?;

        Ok(Metrics {
            registry,
            loops_total,
            errors_total,
            processed_nodes_total,
            processed_pods_total,
            nodes_parked_total,
            nodes_parking_failed_total,
            karpenter,
            node_label,
            loops_duration_seconds,
            processing_duration_seconds,
            node_force_to_evict_time,
            pod_force_to_evict_time,
            pod_errors_total,
        })
    }

    pub fn source_counters(&self, reason: &str) -> &SourceCounters {
        match reason {
            REASON_KARPENTER_DRIFTED | REASON_KARPENTER_DISRUPTED => &self.karpenter,
            _ => &self.node_label,
        }
    }

    /// Gauges that only describe the tick in flight.
    pub fn reset_tick_gauges(&self) {
        self.node_force_to_evict_time.reset();
        self.pod_force_to_evict_time.reset();
        self.pod_errors_total.reset();
    }

    pub fn record_pod_error(&self, pod_name: &str, namespace: &str, reason: &str, action: &str) {
        self.pod_errors_total
            .with_label_values(&[pod_name, namespace, reason, action])
            .inc();
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }
}

use crate::error::Error;

use opentelemetry::trace::TraceId;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::{
    counter::Counter, exemplar::HistogramWithExemplars, family::Family, gauge::Gauge,
};
use prometheus_client::registry::{Registry, Unit};
use std::sync::Arc;
use tokio::time::Instant;

/// All controller metrics, registered into the process-wide registry that
/// also carries the Kubernetes client metrics.
#[derive(Clone)]
pub struct Metrics {
    pub reconcile: ReconcileMetrics,
    pub watch: WatchMetrics,
    pub registry: Arc<Registry>,
}

impl Metrics {
    pub fn new(mut registry: Registry) -> Self {
        let reconcile = ReconcileMetrics::default().register(&mut registry);
        let watch = WatchMetrics::default().register(&mut registry);
        Self {
            reconcile,
            watch,
            registry: Arc::new(registry),
        }
    }

    /// Encode the registry in OpenMetrics text format.
    pub fn render(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new(Registry::with_prefix("runboat"))
    }
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct TraceLabel {
    pub id: String,
}

impl TryFrom<&TraceId> for TraceLabel {
    type Error = ();

    fn try_from(id: &TraceId) -> Result<TraceLabel, ()> {
        if std::matches!(id, &TraceId::INVALID) {
            Err(())
        } else {
            Ok(Self { id: id.to_string() })
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcilerLabel {
    pub reconciler: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FailureLabels {
    pub reconciler: String,
    pub error: String,
}

#[derive(Clone)]
pub struct ReconcileMetrics {
    pub runs: Family<ReconcilerLabel, Counter>,
    pub failures: Family<FailureLabels, Counter>,
    pub duration: HistogramWithExemplars<TraceLabel>,
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self {
            runs: Family::<ReconcilerLabel, Counter>::default(),
            failures: Family::<FailureLabels, Counter>::default(),
            duration: HistogramWithExemplars::new([0.1, 0.5, 1., 5., 10.].into_iter()),
        }
    }
}

impl ReconcileMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register_with_unit(
            "reconcile_duration",
            "reconcile pass duration",
            Unit::Seconds,
            self.duration.clone(),
        );
        r.register("reconcile_failures", "failed reconcile passes", self.failures.clone());
        r.register("reconcile_runs", "reconcile passes", self.runs.clone());
        self
    }

    pub fn set_failure(&self, reconciler: &str, error: &Error) {
        self.failures
            .get_or_create(&FailureLabels {
                reconciler: reconciler.to_string(),
                error: error.metric_label(),
            })
            .inc();
    }

    pub fn count_and_measure(&self, reconciler: &str, trace_id: &TraceId) -> ReconcileMeasurer {
        self.runs
            .get_or_create(&ReconcilerLabel {
                reconciler: reconciler.to_string(),
            })
            .inc();
        ReconcileMeasurer {
            start: Instant::now(),
            labels: trace_id.try_into().ok(),
            metric: self.duration.clone(),
        }
    }
}

/// Observes the pass duration on drop.
pub struct ReconcileMeasurer {
    start: Instant,
    labels: Option<TraceLabel>,
    metric: HistogramWithExemplars<TraceLabel>,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        let labels = self.labels.take();
        self.metric.observe(duration, labels);
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WatchLabel {
    pub kind: String,
}

#[derive(Clone, Default)]
pub struct WatchMetrics {
    pub events: Family<WatchLabel, Counter>,
    pub failures: Family<WatchLabel, Counter>,
    pub ready: Gauge,
}

impl WatchMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register("watch_events", "watch events received", self.events.clone());
        r.register("watch_failures", "watch stream errors", self.failures.clone());
        r.register(
            "ready",
            "whether the initial list has been applied",
            self.ready.clone(),
        );
        self
    }

    pub fn event_inc(&self, kind: &str) {
        self.events
            .get_or_create(&WatchLabel { kind: kind.to_string() })
            .inc();
    }

    pub fn failure_inc(&self, kind: &str) {
        self.failures
            .get_or_create(&WatchLabel { kind: kind.to_string() })
            .inc();
    }
}

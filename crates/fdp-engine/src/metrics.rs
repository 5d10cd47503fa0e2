//! Prometheus handles for the decision path.
//!
//! The daemon owns the `Registry` and exposes it at `GET /metrics`; the
//! engine only increments. Metric names follow the request-surface contract:
//! `requests_total`, `decisions_total{verdict}`, `errors_total{kind}` and a
//! latency histogram.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
};

#[derive(Clone)]
pub struct EngineMetrics {
    pub requests_total: IntCounter,
    pub decisions_total: IntCounterVec,
    pub errors_total: IntCounterVec,
    pub latency_seconds: Histogram,
    pub idempotent_replays_total: IntCounter,
}

impl EngineMetrics {
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let requests_total =
            IntCounter::with_opts(Opts::new("requests_total", "Scoring requests received"))?;
        let decisions_total = IntCounterVec::new(
            Opts::new("decisions_total", "Decisions returned, by verdict"),
            &["verdict"],
        )?;
        let errors_total = IntCounterVec::new(
            Opts::new("errors_total", "Errors observed, by kind"),
            &["kind"],
        )?;
        let latency_seconds = Histogram::with_opts(
            HistogramOpts::new("decision_latency_seconds", "End-to-end decision latency")
                .buckets(vec![
                    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.08, 0.1, 0.25, 0.5, 1.0,
                ]),
        )?;
        let idempotent_replays_total = IntCounter::with_opts(Opts::new(
            "idempotent_replays_total",
            "Requests answered from a prior decision",
        ))?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(decisions_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(latency_seconds.clone()))?;
        registry.register(Box::new(idempotent_replays_total.clone()))?;

        Ok(Self {
            requests_total,
            decisions_total,
            errors_total,
            latency_seconds,
            idempotent_replays_total,
        })
    }

    /// Fresh handles on a private registry; used by tests and harnesses that
    /// never scrape.
    pub fn detached() -> Self {
        Self::register(&Registry::new()).expect("detached metrics registration cannot fail")
    }

    pub fn error(&self, kind: &str) {
        self.errors_total.with_label_values(&[kind]).inc();
    }
}

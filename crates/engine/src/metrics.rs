use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

/// Prometheus metrics for the decision path.
pub struct EngineMetrics {
    pub registry: Registry,
    pub decisions_total: IntCounter,
    /// Denials by decision kind.
    pub denials_total: IntCounterVec,
    pub blocks_issued: IntCounter,
    pub heuristic_denials: IntCounterVec,
    pub rule_hits: IntCounterVec,
    pub store_failures: IntCounter,
    pub decision_duration: Histogram,
}

impl EngineMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let decisions_total = IntCounter::with_opts(Opts::new(
            "ratewarden_decisions_total",
            "Requests evaluated by the engine",
        ))?;
        let denials_total = IntCounterVec::new(
            Opts::new("ratewarden_denials_total", "Requests denied, by reason"),
            &["kind"],
        )?;
        let blocks_issued = IntCounter::with_opts(Opts::new(
            "ratewarden_blocks_issued_total",
            "Block records written after repeated violations",
        ))?;
        let heuristic_denials = IntCounterVec::new(
            Opts::new(
                "ratewarden_heuristic_denials_total",
                "Requests refused by abuse heuristics",
            ),
            &["heuristic"],
        )?;
        let rule_hits = IntCounterVec::new(
            Opts::new("ratewarden_rule_hits_total", "Requests matched per rule"),
            &["rule"],
        )?;
        let store_failures = IntCounter::with_opts(Opts::new(
            "ratewarden_store_failures_total",
            "Decisions resolved by the store failure policy",
        ))?;
        let decision_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ratewarden_decision_duration_seconds",
                "Time spent deciding one request",
            )
            .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25]),
        )?;

        registry.register(Box::new(decisions_total.clone()))?;
        registry.register(Box::new(denials_total.clone()))?;
        registry.register(Box::new(blocks_issued.clone()))?;
        registry.register(Box::new(heuristic_denials.clone()))?;
        registry.register(Box::new(rule_hits.clone()))?;
        registry.register(Box::new(store_failures.clone()))?;
        registry.register(Box::new(decision_duration.clone()))?;

        Ok(Self {
            registry,
            decisions_total,
            denials_total,
            blocks_issued,
            heuristic_denials,
            rule_hits,
            store_failures,
            decision_duration,
        })
    }

    /// Text exposition format.
    pub fn encode(&self) -> prometheus::Result<String> {
        use prometheus::Encoder;

        let mut buffer = Vec::new();
        prometheus::TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_metrics() {
        let m = EngineMetrics::new().unwrap();
        m.decisions_total.inc();
        m.heuristic_denials.with_label_values(&["ip"]).inc();
        let text = m.encode().unwrap();
        assert!(text.contains("ratewarden_decisions_total 1"));
        assert!(text.contains("heuristic=\"ip\""));
    }
}

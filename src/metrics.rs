use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;

/// Admission and sweep counters. `prometheus-client` appends `_total` to
/// counter names at encode time, so these surface as
/// `imagetrust_validation_total`, `imagetrust_denied_total`, and so on.
#[derive(Clone)]
pub struct Metrics {
    pub validation_total: Counter,
    pub mutation_total: Counter,
    pub allowed: Counter,
    pub denied: Counter,
    pub warnings: Counter,
    pub mutation_exempted: Counter,
    pub validation_exempted: Counter,
    pub deleted: Counter,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            validation_total: Counter::default(),
            mutation_total: Counter::default(),
            allowed: Counter::default(),
            denied: Counter::default(),
            warnings: Counter::default(),
            mutation_exempted: Counter::default(),
            validation_exempted: Counter::default(),
            deleted: Counter::default(),
        };

        registry.register(
            "imagetrust_validation",
            "Number of pods processed by the validating webhook",
            metrics.validation_total.clone(),
        );
        registry.register(
            "imagetrust_mutation",
            "Number of pods processed by the mutating webhook",
            metrics.mutation_total.clone(),
        );
        registry.register(
            "imagetrust_allowed",
            "Number of pods allowed",
            metrics.allowed.clone(),
        );
        registry.register(
            "imagetrust_denied",
            "Number of pods denied",
            metrics.denied.clone(),
        );
        registry.register(
            "imagetrust_warnings",
            "Number of pods processed with warnings",
            metrics.warnings.clone(),
        );
        registry.register(
            "imagetrust_mutation_exempted",
            "Number of exempted containers skipped during mutation",
            metrics.mutation_exempted.clone(),
        );
        registry.register(
            "imagetrust_validation_exempted",
            "Number of exempted containers skipped during validation",
            metrics.validation_exempted.clone(),
        );
        registry.register(
            "imagetrust_deleted",
            "Number of pods deleted by the startup sweep",
            metrics.deleted.clone(),
        );

        metrics
    }

    #[cfg(test)]
    pub fn unregistered() -> Self {
        Self::new(&mut Registry::default())
    }
}

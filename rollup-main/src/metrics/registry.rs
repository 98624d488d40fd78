//! Ordered collection of metric definitions.

use super::{Evaluation, MetricDefinition, Record};
use crate::config::MetricSpec;
use crate::error::{Result, RollupError};

/// Definitions in configuration order.
#[derive(Debug, Clone, Default)]
pub struct MetricsRegistry {
    definitions: Vec<MetricDefinition>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles every spec, rejecting duplicate names.
    pub fn from_specs(specs: &[MetricSpec]) -> Result<Self> {
        let mut registry = Self::new();
        for spec in specs {
            registry.add(MetricDefinition::configure(spec)?)?;
        }
        Ok(registry)
    }

    pub fn add(&mut self, definition: MetricDefinition) -> Result<()> {
        if self.definitions.iter().any(|d| d.name() == definition.name()) {
            return Err(RollupError::invalid_config(format!(
                "duplicate metrics name {:?}",
                definition.name()
            )));
        }
        self.definitions.push(definition);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn definitions(&self) -> &[MetricDefinition] {
        &self.definitions
    }

    /// Evaluates every definition against the record, in definition order,
    /// yielding only the ones that apply.
    pub fn evaluate_all<'a>(
        &'a self,
        timestamp: i64,
        record: &'a Record,
    ) -> impl Iterator<Item = (&'a MetricDefinition, Evaluation)> + 'a {
        self.definitions
            .iter()
            .filter_map(move |d| d.evaluate(timestamp, record).map(|e| (d, e)))
    }
}

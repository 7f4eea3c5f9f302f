//! Per-integration-type scheduling defaults.

use std::collections::HashMap;
use std::sync::Arc;

use sluice_core::{IntegrationType, JobDefinitionParameters};

/// Supplies the processor and scheduling parameters for one integration type.
///
/// A trigger whose type has no registered supplier is never scheduled.
pub trait JobParameterSupplier: Send + Sync {
    fn integration_type(&self) -> IntegrationType;

    /// Processor that handles this type's ingestion results.
    fn etl_processor_name(&self) -> &str;

    fn job_parameters(&self) -> JobDefinitionParameters {
        JobDefinitionParameters::default()
    }
}

/// Supplier with fixed values, for types that need no custom logic.
#[derive(Debug, Clone)]
pub struct StaticParameterSupplier {
    integration_type: IntegrationType,
    processor_name: String,
    parameters: JobDefinitionParameters,
}

impl StaticParameterSupplier {
    pub fn new(integration_type: impl Into<IntegrationType>, processor_name: impl Into<String>) -> Self {
        Self {
            integration_type: integration_type.into(),
            processor_name: processor_name.into(),
            parameters: JobDefinitionParameters::default(),
        }
    }

    pub fn with_parameters(mut self, parameters: JobDefinitionParameters) -> Self {
        self.parameters = parameters;
        self
    }
}

impl JobParameterSupplier for StaticParameterSupplier {
    fn integration_type(&self) -> IntegrationType {
        self.integration_type.clone()
    }

    fn etl_processor_name(&self) -> &str {
        &self.processor_name
    }

    fn job_parameters(&self) -> JobDefinitionParameters {
        self.parameters.clone()
    }
}

#[derive(Default, Clone)]
pub struct SupplierRegistry {
    suppliers: HashMap<IntegrationType, Arc<dyn JobParameterSupplier>>,
}

impl SupplierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the supplier's own integration type, replacing any previous one.
    pub fn register(&mut self, supplier: impl JobParameterSupplier + 'static) {
        self.suppliers.insert(supplier.integration_type(), Arc::new(supplier));
    }

    pub fn get(&self, integration_type: &IntegrationType) -> Option<&Arc<dyn JobParameterSupplier>> {
        self.suppliers.get(integration_type)
    }

    pub fn contains(&self, integration_type: &IntegrationType) -> bool {
        self.suppliers.contains_key(integration_type)
    }

    pub fn len(&self) -> usize {
        self.suppliers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.suppliers.is_empty()
    }
}

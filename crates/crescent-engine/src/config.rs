//! Engine construction options

/// Tunable limits for an [`EngineState`](crate::EngineState).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of value-stack slots. Pushing past this limit raises
    /// a runtime "stack overflow" error.
    pub stack_limit: usize,
    /// Optional simulated allocation budget in bytes. When set, allocating
    /// operations (tables, strings, blocks, closures, threads) charge
    /// against it and raise a memory error once it is exhausted. `None`
    /// means unlimited.
    pub alloc_budget: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            stack_limit: 4096,
            alloc_budget: None,
        }
    }
}

impl EngineConfig {
    pub fn with_stack_limit(mut self, limit: usize) -> Self {
        self.stack_limit = limit;
        self
    }

    pub fn with_alloc_budget(mut self, budget: usize) -> Self {
        self.alloc_budget = Some(budget);
        self
    }
}

//! Limits and collector tuning for a runtime state.

/// Configuration consumed by [`State::with_config`](crate::state::State::with_config).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateConfig {
    /// Maximum nesting of native calls before `StackOverflow` is raised.
    pub max_call_depth: usize,
    /// Maximum number of live stack slots.
    pub max_stack_slots: usize,
    /// Run a collection after this many heap allocations. `None` leaves
    /// collection entirely to explicit `collect_garbage` calls.
    pub gc_interval: Option<usize>,
}

impl Default for StateConfig {
    fn default() -> Self {
        StateConfig {
            max_call_depth: 200,
            max_stack_slots: 1_000_000,
            gc_interval: Some(4096),
        }
    }
}

//! Registered state graphs.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::{GraphError, StateGraph};

/// Set of state graphs, keyed by graph name.
///
/// Built once at startup and then shared read-only by every runner.
#[derive(Debug, Default, Clone)]
pub struct GraphRegistry {
    graphs: BTreeMap<&'static str, Arc<StateGraph>>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a graph.
    pub fn register(&mut self, graph: StateGraph) -> Result<(), GraphError> {
        let name = graph.name();
        if self.graphs.contains_key(name) {
            return Err(GraphError::AlreadyRegistered(name));
        }
        debug!(
            graph = name,
            initial = graph.initial_state().name(),
            automatic = graph.automatic_states().count(),
            "registered state graph"
        );
        self.graphs.insert(name, Arc::new(graph));
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, graph: StateGraph) -> Result<Self, GraphError> {
        self.register(graph)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<StateGraph>> {
        self.graphs.get(name)
    }

    /// All graphs, in name order.
    pub fn graphs(&self) -> impl Iterator<Item = &Arc<StateGraph>> {
        self.graphs.values()
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GraphBuilder, StateDef, StateKind};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Flag {
        Up,
        Down,
    }

    impl StateKind for Flag {
        const GRAPH: &'static str = "flag";

        fn name(self) -> &'static str {
            match self {
                Flag::Up => "up",
                Flag::Down => "down",
            }
        }

        fn all() -> &'static [Self] {
            &[Flag::Up, Flag::Down]
        }
    }

    fn flag() -> StateGraph {
        GraphBuilder::<Flag>::new()
            .state(Flag::Up, StateDef::externally_progressed())
            .state(Flag::Down, StateDef::terminal())
            .transition(Flag::Up, Flag::Down)
            .build()
            .unwrap()
    }

    #[test]
    fn test_register_and_get() {
        let registry = GraphRegistry::new().with(flag()).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("flag").unwrap().name(), "flag");
        assert!(registry.get("other").is_none());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = GraphRegistry::new();
        registry.register(flag()).unwrap();
        assert_eq!(
            registry.register(flag()),
            Err(GraphError::AlreadyRegistered("flag"))
        );
    }
}

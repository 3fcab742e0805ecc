//! State graph definitions.
//!
//! A graph is declared once per entity type with [`GraphBuilder`], validated
//! when built, and never changes afterwards. Handlers are bound to their
//! states at build time.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use chrono::Duration;
use tracing::warn;

use crate::handler::{DynHandler, Erased};
use crate::{GraphError, StateHandler};

/// The states of one graph, as a closed enum.
pub trait StateKind: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Name of the graph these states belong to.
    const GRAPH: &'static str;

    /// Persisted name of this state.
    fn name(self) -> &'static str;

    /// Every state of the graph.
    fn all() -> &'static [Self];

    fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|s| s.name() == name)
    }
}

/// Scheduling attributes of a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateDef {
    try_interval: Option<Duration>,
    force_initial: bool,
    attempt_immediately: bool,
    externally_progressed: bool,
}

impl StateDef {
    /// A state that is never attempted automatically. Leaf states become
    /// terminal; states with outgoing edges must be given an interval.
    pub fn terminal() -> Self {
        Self {
            try_interval: None,
            force_initial: false,
            attempt_immediately: true,
            externally_progressed: false,
        }
    }

    /// A state attempted every `seconds`.
    pub fn try_every(seconds: i64) -> Self {
        Self {
            try_interval: Some(Duration::seconds(seconds)),
            ..Self::terminal()
        }
    }

    /// A state only ever left through a forced transition.
    pub fn externally_progressed() -> Self {
        Self {
            externally_progressed: true,
            ..Self::terminal()
        }
    }

    /// Make this the graph's initial state.
    pub fn initial(mut self) -> Self {
        self.force_initial = true;
        self
    }

    /// Wait one full interval before the first attempt after entering.
    pub fn delayed(mut self) -> Self {
        self.attempt_immediately = false;
        self
    }
}

/// A validated state of a registered graph.
pub struct StateNode {
    name: &'static str,
    try_interval: Option<Duration>,
    force_initial: bool,
    attempt_immediately: bool,
    externally_progressed: bool,
    children: Vec<&'static str>,
    timeout: Option<(&'static str, Duration)>,
    handler: Option<Arc<dyn DynHandler>>,
}

impl StateNode {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn try_interval(&self) -> Option<Duration> {
        self.try_interval
    }

    pub fn is_force_initial(&self) -> bool {
        self.force_initial
    }

    pub fn attempt_immediately(&self) -> bool {
        self.attempt_immediately
    }

    /// Terminal states count as externally progressed.
    pub fn is_externally_progressed(&self) -> bool {
        self.externally_progressed
    }

    pub fn is_terminal(&self) -> bool {
        self.children.is_empty()
    }

    /// Whether the scheduler ever picks this state up on its own.
    pub fn is_automatic(&self) -> bool {
        !self.externally_progressed && self.try_interval.is_some() && self.handler.is_some()
    }

    /// States reachable by one declared edge.
    pub fn children(&self) -> &[&'static str] {
        &self.children
    }

    /// Target state and age after which an attempt that produced no
    /// transition moves there instead.
    pub fn timeout(&self) -> Option<(&'static str, Duration)> {
        self.timeout
    }

    pub(crate) fn handler(&self) -> Option<&Arc<dyn DynHandler>> {
        self.handler.as_ref()
    }
}

impl fmt::Debug for StateNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateNode")
            .field("name", &self.name)
            .field("try_interval", &self.try_interval)
            .field("force_initial", &self.force_initial)
            .field("attempt_immediately", &self.attempt_immediately)
            .field("externally_progressed", &self.externally_progressed)
            .field("children", &self.children)
            .field("timeout", &self.timeout)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// The closed set of states and transitions for one entity type.
#[derive(Debug)]
pub struct StateGraph {
    name: &'static str,
    nodes: Vec<StateNode>,
    initial: usize,
}

impl StateGraph {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The state every new instance starts in.
    pub fn initial_state(&self) -> &StateNode {
        &self.nodes[self.initial]
    }

    pub fn state(&self, name: &str) -> Option<&StateNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn states(&self) -> impl Iterator<Item = &StateNode> {
        self.nodes.iter()
    }

    /// States the scheduler attempts on its own.
    pub fn automatic_states(&self) -> impl Iterator<Item = &StateNode> {
        self.nodes.iter().filter(|n| n.is_automatic())
    }

    /// Declared targets from `state`, or `None` if the state is unknown.
    pub fn legal_next_states(&self, state: &str) -> Option<&[&'static str]> {
        self.state(state).map(StateNode::children)
    }

    pub fn is_legal_transition(&self, from: &str, to: &str) -> bool {
        self.legal_next_states(from)
            .is_some_and(|children| children.contains(&to))
    }

    /// The handler bound to `state`, if it has one.
    pub fn handler_for(&self, state: &str) -> Option<&Arc<dyn DynHandler>> {
        self.state(state).and_then(StateNode::handler)
    }
}

/// Declares and validates a [`StateGraph`].
pub struct GraphBuilder<S: StateKind> {
    states: Vec<(S, StateDef)>,
    edges: Vec<(S, S)>,
    timeouts: Vec<(S, S, Duration)>,
    handlers: Vec<(S, Arc<dyn StateHandler<S>>)>,
}

impl<S: StateKind> Default for GraphBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: StateKind> GraphBuilder<S> {
    pub fn new() -> Self {
        Self {
            states: Vec::new(),
            edges: Vec::new(),
            timeouts: Vec::new(),
            handlers: Vec::new(),
        }
    }

    pub fn state(mut self, state: S, def: StateDef) -> Self {
        self.states.push((state, def));
        self
    }

    /// Declare the edge `from -> to`.
    pub fn transition(mut self, from: S, to: S) -> Self {
        self.edges.push((from, to));
        self
    }

    /// Declare the edge `from -> to`, taken automatically once an attempt in
    /// `from` produces no transition and the state is at least `seconds` old.
    pub fn times_out_to(mut self, from: S, to: S, seconds: i64) -> Self {
        self.timeouts.push((from, to, Duration::seconds(seconds)));
        self
    }

    pub fn handler(mut self, state: S, handler: impl StateHandler<S>) -> Self {
        self.handlers.push((state, Arc::new(handler)));
        self
    }

    /// Validate the declaration and bind handlers.
    pub fn build(self) -> Result<StateGraph, GraphError> {
        let graph = S::GRAPH;

        let mut index: HashMap<S, usize> = HashMap::new();
        for (i, (state, _)) in self.states.iter().enumerate() {
            if index.insert(*state, i).is_some() {
                return Err(GraphError::DuplicateState {
                    graph,
                    state: state.name(),
                });
            }
        }
        let lookup = |state: S| {
            index
                .get(&state)
                .copied()
                .ok_or(GraphError::UndeclaredState {
                    graph,
                    state: state.name(),
                })
        };

        let count = self.states.len();
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); count];
        let mut has_parent = vec![false; count];
        let mut timeouts: Vec<Option<(usize, Duration)>> = vec![None; count];

        for (from, to) in &self.edges {
            let (f, t) = (lookup(*from)?, lookup(*to)?);
            if !children[f].contains(&t) {
                children[f].push(t);
            }
            has_parent[t] = true;
        }

        for (from, to, after) in &self.timeouts {
            let (f, t) = (lookup(*from)?, lookup(*to)?);
            if timeouts[f].is_some() {
                return Err(GraphError::DuplicateTimeout {
                    graph,
                    state: from.name(),
                });
            }
            timeouts[f] = Some((t, *after));
            if !children[f].contains(&t) {
                children[f].push(t);
            }
            has_parent[t] = true;
        }

        let mut handlers: Vec<Option<Arc<dyn DynHandler>>> = vec![None; count];
        for (state, handler) in self.handlers {
            let i = lookup(state)?;
            handlers[i] = Some(Arc::new(Erased::new(handler)));
        }

        let initial = Self::pick_initial(graph, &self.states, &has_parent)?;

        let mut nodes = Vec::with_capacity(count);
        for (i, (state, def)) in self.states.iter().enumerate() {
            let name = state.name();
            let terminal = children[i].is_empty();
            let handler = handlers[i].take();

            if terminal && handler.is_some() {
                return Err(GraphError::TerminalWithHandler { graph, state: name });
            }
            if !terminal && !def.externally_progressed {
                if def.try_interval.is_none() {
                    return Err(GraphError::MissingInterval { graph, state: name });
                }
                if handler.is_none() {
                    return Err(GraphError::MissingHandler { graph, state: name });
                }
            }

            nodes.push(StateNode {
                name,
                try_interval: def.try_interval,
                force_initial: i == initial,
                attempt_immediately: def.attempt_immediately,
                externally_progressed: def.externally_progressed || terminal,
                children: children[i].iter().map(|c| self.states[*c].0.name()).collect(),
                timeout: timeouts[i].map(|(t, after)| (self.states[t].0.name(), after)),
                handler,
            });
        }

        // Unreachable states are legal (records may be created straight into
        // them) but usually a typo in the edge list.
        let mut seen = vec![false; count];
        let mut queue = VecDeque::from([initial]);
        seen[initial] = true;
        while let Some(i) = queue.pop_front() {
            for &c in &children[i] {
                if !seen[c] {
                    seen[c] = true;
                    queue.push_back(c);
                }
            }
        }
        for (i, reached) in seen.iter().enumerate() {
            if !reached {
                warn!(
                    graph,
                    state = nodes[i].name,
                    "state is unreachable from the initial state"
                );
            }
        }

        Ok(StateGraph {
            name: graph,
            nodes,
            initial,
        })
    }

    fn pick_initial(
        graph: &'static str,
        states: &[(S, StateDef)],
        has_parent: &[bool],
    ) -> Result<usize, GraphError> {
        let forced: Vec<usize> = states
            .iter()
            .enumerate()
            .filter(|(_, (_, def))| def.force_initial)
            .map(|(i, _)| i)
            .collect();

        let candidates = if forced.is_empty() {
            (0..states.len()).filter(|i| !has_parent[*i]).collect()
        } else {
            forced
        };

        match candidates.as_slice() {
            [only] => Ok(*only),
            [] => Err(GraphError::NoInitialState { graph }),
            [first, second, ..] => Err(GraphError::MultipleInitialStates {
                graph,
                first: states[*first].0.name(),
                second: states[*second].0.name(),
            }),
        }
    }
}

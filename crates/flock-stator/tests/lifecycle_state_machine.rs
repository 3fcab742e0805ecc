//! Stateful property testing of the instance lifecycle.
//!
//! Uses proptest-state-machine to interleave creation, forced transitions,
//! schedule-now requests and scheduler passes, and checks every stored
//! instance against a reference model after each step.

use std::sync::Arc;

use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use serde_json::json;
use tokio::runtime::Runtime;

use flock_stator::{
    GraphBuilder, GraphRegistry, HandlerError, Instance, InstanceId, MemoryStore, Outcome,
    Runner, RunnerConfig, StateDef, StateKind, Stator, handler_fn,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Task {
    Queued,
    Running,
    Held,
    Finished,
}

impl StateKind for Task {
    const GRAPH: &'static str = "task";

    fn name(self) -> &'static str {
        match self {
            Task::Queued => "queued",
            Task::Running => "running",
            Task::Held => "held",
            Task::Finished => "finished",
        }
    }

    fn all() -> &'static [Self] {
        &[Task::Queued, Task::Running, Task::Held, Task::Finished]
    }
}

/// Declared edges, mirrored by the model.
const EDGES: &[(Task, Task)] = &[
    (Task::Queued, Task::Running),
    (Task::Queued, Task::Held),
    (Task::Running, Task::Finished),
    (Task::Held, Task::Queued),
];

fn is_edge(from: Task, to: Task) -> bool {
    EDGES.contains(&(from, to))
}

/// Automatic states and whether they are attempted as soon as they are entered.
fn schedule(state: Task) -> Option<bool> {
    match state {
        Task::Queued => Some(true),
        Task::Running => Some(false),
        Task::Held | Task::Finished => None,
    }
}

/// Operations on the system.
#[derive(Debug, Clone)]
pub enum LifecycleOperation {
    /// Create an instance whose `queued` handler either advances or fails.
    Create { advances: bool },
    /// Force an instance towards a state (legal or not).
    Force { index: usize, target: usize },
    /// Clear the attempt timestamp of an instance.
    ScheduleNow { index: usize },
    /// One scheduler pass.
    RunCycle,
}

#[derive(Debug, Clone)]
pub struct ModelInstance {
    state: Task,
    attempts: u32,
    due: bool,
    advances: bool,
}

/// Reference model of every instance.
#[derive(Debug, Clone, Default)]
pub struct LifecycleModel {
    instances: Vec<ModelInstance>,
}

impl ReferenceStateMachine for LifecycleModel {
    type State = Self;
    type Transition = LifecycleOperation;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let create = any::<bool>().prop_map(|advances| LifecycleOperation::Create { advances });
        if state.instances.is_empty() {
            return create.boxed();
        }
        let count = state.instances.len();
        prop_oneof![
            2 => create,
            2 => (0..count, 0..Task::all().len())
                .prop_map(|(index, target)| LifecycleOperation::Force { index, target }),
            1 => (0..count).prop_map(|index| LifecycleOperation::ScheduleNow { index }),
            3 => Just(LifecycleOperation::RunCycle),
        ]
        .boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            LifecycleOperation::Create { advances } => {
                state.instances.push(ModelInstance {
                    state: Task::Queued,
                    attempts: 0,
                    due: true,
                    advances: *advances,
                });
            }
            LifecycleOperation::Force { index, target } => {
                let inst = &mut state.instances[*index];
                let target = Task::all()[*target];
                if is_edge(inst.state, target) {
                    inst.state = target;
                    inst.attempts = 0;
                    inst.due = schedule(target).unwrap_or(false);
                }
            }
            LifecycleOperation::ScheduleNow { index } => {
                let inst = &mut state.instances[*index];
                inst.due = schedule(inst.state).is_some();
            }
            LifecycleOperation::RunCycle => {
                for inst in state.instances.iter_mut().filter(|i| i.due) {
                    match inst.state {
                        Task::Queued if inst.advances => {
                            inst.state = Task::Running;
                            inst.attempts = 0;
                            inst.due = false;
                        }
                        _ => {
                            inst.attempts += 1;
                            inst.due = false;
                        }
                    }
                }
            }
        }
        state
    }

    fn preconditions(state: &Self::State, transition: &Self::Transition) -> bool {
        match transition {
            LifecycleOperation::Force { index, .. } | LifecycleOperation::ScheduleNow { index } => {
                *index < state.instances.len()
            }
            _ => true,
        }
    }
}

/// The system under test.
pub struct LifecycleHarness {
    runtime: Runtime,
    stator: Stator,
    runner: Runner,
    ids: Vec<InstanceId>,
}

impl LifecycleHarness {
    fn new() -> Self {
        let runtime = Runtime::new().expect("Failed to create tokio runtime");

        let graph = GraphBuilder::<Task>::new()
            .state(Task::Queued, StateDef::try_every(600).initial())
            .state(Task::Running, StateDef::try_every(600).delayed())
            .state(Task::Held, StateDef::externally_progressed())
            .state(Task::Finished, StateDef::terminal())
            .transition(Task::Queued, Task::Running)
            .transition(Task::Queued, Task::Held)
            .transition(Task::Running, Task::Finished)
            .transition(Task::Held, Task::Queued)
            .handler(
                Task::Queued,
                handler_fn(|inst: Instance| async move {
                    if inst.data["advances"].as_bool().unwrap_or(false) {
                        Ok(Outcome::to(Task::Running))
                    } else {
                        Err(HandlerError::Transient("not yet".to_string()))
                    }
                }),
            )
            .handler(Task::Running, handler_fn(|_| async { Ok(Outcome::Stay) }))
            .build()
            .expect("graph is valid");

        let registry = GraphRegistry::new().with(graph).expect("single registration");
        let stator = Stator::new(registry, Arc::new(MemoryStore::new()));
        let runner = Runner::new(
            stator.clone(),
            RunnerConfig {
                concurrency: 1000,
                concurrency_per_graph: 1000,
                ..RunnerConfig::default()
            },
        );

        Self {
            runtime,
            stator,
            runner,
            ids: Vec::new(),
        }
    }

    fn apply_operation(&mut self, op: &LifecycleOperation) {
        let stator = self.stator.clone();
        match op {
            LifecycleOperation::Create { advances } => {
                let inst = self
                    .runtime
                    .block_on(stator.create::<Task>(json!({ "advances": advances })))
                    .expect("create succeeds");
                self.ids.push(inst.id);
            }
            LifecycleOperation::Force { index, target } => {
                let id = self.ids[*index];
                let target = Task::all()[*target];
                let before = self.runtime.block_on(stator.get(id)).expect("instance exists");
                let result = self
                    .runtime
                    .block_on(stator.transition_perform(id, target));
                let legal = Task::from_name(&before.state).is_some_and(|from| is_edge(from, target));
                assert_eq!(result.is_ok(), legal, "forced {} -> {}", before.state, target.name());
                if let Err(e) = result {
                    assert!(e.is_fatal());
                }
            }
            LifecycleOperation::ScheduleNow { index } => {
                self.runtime
                    .block_on(stator.schedule_now(self.ids[*index]))
                    .expect("instance exists");
            }
            LifecycleOperation::RunCycle => {
                let reports = self
                    .runtime
                    .block_on(self.runner.run_single_cycle())
                    .expect("cycle succeeds");
                assert!(reports.iter().all(|r| r.outcome.is_ok()));
            }
        }
    }
}

impl StateMachineTest for LifecycleHarness {
    type SystemUnderTest = Self;
    type Reference = LifecycleModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self::new()
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.apply_operation(&transition);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        assert_eq!(state.ids.len(), ref_state.instances.len());

        for (id, expected) in state.ids.iter().zip(&ref_state.instances) {
            let stored = state
                .runtime
                .block_on(state.stator.get(*id))
                .expect("instance exists");

            // State is always a declared state and matches the model
            let actual = Task::from_name(&stored.state).expect("declared state");
            assert_eq!(actual, expected.state);
            assert_eq!(stored.state_attempts, expected.attempts);
            // No attempt left a claim behind
            assert_eq!(stored.lease, None);
        }
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 50,
        max_shrink_iters: 5000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn lifecycle_state_machine_test(sequential 1..40 => LifecycleHarness);
}

#[test]
fn test_created_instance_starts_initial_with_no_attempts() {
    let harness = LifecycleHarness::new();
    let inst = harness
        .runtime
        .block_on(harness.stator.create::<Task>(json!({ "advances": true })))
        .expect("create succeeds");

    assert_eq!(inst.state, "queued");
    assert_eq!(inst.state_attempts, 0);
    assert_eq!(inst.state_attempted_at, None);
    assert_eq!(
        harness
            .stator
            .graph("task")
            .expect("registered")
            .initial_state()
            .name(),
        "queued"
    );
}

//! The `graphs` command.

use std::fmt::{self, Write};
use std::sync::Arc;

use miette::{Result, miette};

use flock_activities::{ActivitiesConfig, Context, Directory, RecordingDelivery};
use flock_stator::{MemoryStore, StateGraph, StateNode};

/// Every activity graph, one block per graph.
pub fn describe_all() -> Result<String> {
    let ctx = Context::new(
        Arc::new(Directory::new()),
        Arc::new(RecordingDelivery::new()),
        Arc::new(MemoryStore::new()),
        ActivitiesConfig::default(),
    );
    let registry = flock_activities::registry(&ctx).map_err(|e| miette!("invalid graph: {}", e))?;

    let mut out = String::new();
    for graph in registry.graphs() {
        describe(&mut out, graph).map_err(|e| miette!("failed to describe graph: {}", e))?;
        out.push('\n');
    }
    Ok(out)
}

/// One graph: a header line, then a line per state.
pub fn describe(out: &mut impl Write, graph: &StateGraph) -> fmt::Result {
    writeln!(out, "{}", graph.name())?;
    for node in graph.states() {
        let initial = node.name() == graph.initial_state().name();
        write!(
            out,
            "  {}{} ({})",
            if initial { "* " } else { "" },
            node.name(),
            cadence(node),
        )?;
        edges(out, node)?;
        writeln!(out)?;
    }
    Ok(())
}

fn cadence(node: &StateNode) -> String {
    if node.is_terminal() {
        return "terminal".to_string();
    }
    if node.is_externally_progressed() {
        return "external".to_string();
    }
    match node.try_interval() {
        Some(interval) if node.attempt_immediately() => format!("every {}s", interval.num_seconds()),
        Some(interval) => format!("every {}s, delayed", interval.num_seconds()),
        None => "manual".to_string(),
    }
}

fn edges(out: &mut impl Write, node: &StateNode) -> fmt::Result {
    if node.children().is_empty() {
        return Ok(());
    }
    write!(out, " -> {}", node.children().join(", "))?;
    if let Some((to, after)) = node.timeout() {
        write!(out, "; {} after {}s", to, after.num_seconds())?;
    }
    Ok(())
}

//! Tables command implementation.

use super::{check_format, CliResult};
use groupsync_engine::fsm::Table;
use groupsync_engine::{control_table, http_table};
use serde::Serialize;

/// Summary of one machine table.
#[derive(Debug, Serialize)]
pub struct TableSummary {
    /// Machine name.
    pub machine: &'static str,
    /// `(code, name)` of every state.
    pub states: Vec<(u32, &'static str)>,
    /// `(code, name)` of every event.
    pub events: Vec<(u32, &'static str)>,
    /// Transitions declared across all nodes.
    pub transitions: usize,
    /// Dropped `(state, event)` cells.
    pub dropped: usize,
    /// Invalid `(state, event)` cells.
    pub invalid: usize,
}

fn summarize<C>(table: &Table<C>) -> TableSummary {
    let nodes = table.nodes();
    TableSummary {
        machine: table.name(),
        states: table.states().collect(),
        events: table.events().collect(),
        transitions: nodes.iter().map(|n| n.transitions().len()).sum(),
        dropped: nodes.iter().map(|n| n.dropped().len()).sum(),
        invalid: nodes.iter().map(|n| n.invalid_events().len()).sum(),
    }
}

/// Builds every table (which validates it) and prints a summary.
pub fn run(format: &str) -> CliResult<()> {
    let json = check_format(format)?;
    let summaries = vec![summarize(&http_table()?), summarize(&control_table()?)];

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    for summary in &summaries {
        println!("{} (valid)", summary.machine);
        println!(
            "  states: {}",
            summary.states.iter().map(|(_, n)| *n).collect::<Vec<_>>().join(", ")
        );
        println!(
            "  events: {}",
            summary.events.iter().map(|(_, n)| *n).collect::<Vec<_>>().join(", ")
        );
        println!(
            "  cells:  {} transitions, {} dropped, {} invalid",
            summary.transitions, summary.dropped, summary.invalid
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_cell_is_covered() {
        for summary in [summarize(&http_table().unwrap()), summarize(&control_table().unwrap())] {
            let cells = summary.states.len() - 1; // Stop has no node
            assert_eq!(
                summary.transitions + summary.dropped + summary.invalid,
                cells * summary.events.len(),
                "{}",
                summary.machine
            );
        }
    }
}

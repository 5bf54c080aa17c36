//! Embarrassingly parallel batch jobs over serialized chronicles.
//!
//! Each task is self-contained: it receives a serialized chronicle plus an
//! action program, runs to completion on its own engine, and returns a
//! serialized result. Tasks never share mutable state; the pool is only
//! for batch simulations, batch merges, and Monte Carlo style sweeps.

use rayon::prelude::*;
use thiserror::Error;
use tracing::debug;

use std::sync::Arc;

use tessera_chronicle::{Chronicle, ChronicleError};
use tessera_engine::{ActionRegistry, Engine, EngineConfig};
use tessera_events::EventBus;
use tessera_types::Action;

/// Errors from the batch pool.
#[derive(Debug, Error)]
pub enum ParallelError {
    /// A task's chronicle failed to load or merge.
    #[error(transparent)]
    Chronicle(#[from] ChronicleError),

    /// The batch was empty.
    #[error("empty batch")]
    EmptyBatch,
}

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, ParallelError>;

/// One self-contained simulation.
#[derive(Debug, Clone)]
pub struct SimulationTask {
    /// Identifies the task in the result set.
    pub label: String,
    /// Serialized starting chronicle.
    pub chronicle: Vec<u8>,
    /// Actions to apply, in order.
    pub program: Vec<Action>,
}

/// Outcome of one simulation.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    /// Task label echoed.
    pub label: String,
    /// Serialized final chronicle.
    pub chronicle: Vec<u8>,
    /// Actions applied successfully.
    pub applied: usize,
    /// Actions that failed; failures do not stop the program.
    pub failed: usize,
}

/// Runs every task on the rayon pool.
///
/// Handlers come from `registry`; per-task results preserve input order.
pub fn simulate_batch(
    registry: &ActionRegistry,
    tasks: Vec<SimulationTask>,
) -> Vec<Result<SimulationResult>> {
    tasks
        .into_par_iter()
        .map(|task| run_simulation(registry.clone(), task))
        .collect()
}

fn run_simulation(registry: ActionRegistry, task: SimulationTask) -> Result<SimulationResult> {
    let bus = EventBus::new();
    let chronicle = Arc::new(Chronicle::load(&task.chronicle, &task.label, bus)?);
    let engine = Engine::with_chronicle(
        EngineConfig {
            peer_id: task.label.clone(),
            ..Default::default()
        },
        chronicle,
        registry,
    );

    let mut applied = 0;
    let mut failed = 0;
    for action in task.program {
        if engine.dispatch(action).is_ok() {
            applied += 1;
        } else {
            failed += 1;
        }
    }
    debug!(label = %task.label, applied, failed, "simulation finished");

    Ok(SimulationResult {
        label: task.label,
        chronicle: engine.snapshot(),
        applied,
        failed,
    })
}

/// Merges a batch of serialized chronicles into one document.
///
/// Merge order does not matter: the CRDT merge is commutative,
/// associative, and idempotent, so the pairwise parallel reduction
/// converges to the same document as any sequential fold.
pub fn merge_batch(docs: Vec<Vec<u8>>) -> Result<Vec<u8>> {
    if docs.is_empty() {
        return Err(ParallelError::EmptyBatch);
    }

    let merged = docs
        .into_par_iter()
        .map(|bytes| {
            Chronicle::load(&bytes, "merge", EventBus::new())
                .map(Arc::new)
                .map_err(ParallelError::from)
        })
        .try_reduce_with(|left, right| {
            left.merge(&right)?;
            Ok(left)
        })
        .expect("non-empty batch")?;

    Ok(merged.save())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_board::Stack;
    use tessera_engine::standard_packs;
    use tessera_types::Token;

    fn registry() -> ActionRegistry {
        let registry = ActionRegistry::new();
        for pack in standard_packs() {
            registry.register_pack(&pack);
        }
        registry
    }

    fn deck_bytes(n: usize) -> Vec<u8> {
        let chronicle = Arc::new(Chronicle::new("seed", EventBus::new()));
        let tokens: Vec<Token> = (0..n)
            .map(|i| Token::new(format!("card-{i}"), i as i64))
            .collect();
        Stack::with_tokens(chronicle.clone(), "stack", tokens).unwrap();
        chronicle.save()
    }

    fn draw_program(seed: &str, draws: usize) -> Vec<Action> {
        let mut program = vec![Action::with_payload(
            "stack:shuffle",
            serde_json::json!({ "seed": seed }),
        )];
        for _ in 0..draws {
            program.push(Action::with_payload(
                "stack:draw",
                serde_json::json!({ "count": 1 }),
            ));
        }
        program
    }

    #[test]
    fn test_simulations_run_in_isolation() {
        let bytes = deck_bytes(52);
        let tasks: Vec<SimulationTask> = (0..8)
            .map(|i| SimulationTask {
                label: format!("sim-{i}"),
                chronicle: bytes.clone(),
                program: draw_program(&format!("seed-{i}"), 5),
            })
            .collect();

        let results = simulate_batch(&registry(), tasks);
        assert_eq!(results.len(), 8);
        for (i, result) in results.iter().enumerate() {
            let result = result.as_ref().unwrap();
            assert_eq!(result.label, format!("sim-{i}"), "order preserved");
            assert_eq!(result.applied, 6);
            assert_eq!(result.failed, 0);
        }

        // Different seeds diverge; identical seeds agree.
        let state = |r: &SimulationResult| {
            Chronicle::load(&r.chronicle, "check", EventBus::new())
                .unwrap()
                .state()
        };
        let a = state(results[0].as_ref().unwrap());
        let b = state(results[1].as_ref().unwrap());
        assert_ne!(a, b);

        let rerun = simulate_batch(
            &registry(),
            vec![SimulationTask {
                label: "sim-0".into(),
                chronicle: deck_bytes(52),
                program: draw_program("seed-0", 5),
            }],
        );
        assert_eq!(a, state(rerun[0].as_ref().unwrap()), "same seed, same result");
    }

    #[test]
    fn test_failed_steps_are_counted_not_fatal() {
        let tasks = vec![SimulationTask {
            label: "short".into(),
            chronicle: deck_bytes(1),
            program: vec![
                Action::with_payload("stack:draw", serde_json::json!({ "count": 5 })),
                Action::with_payload("stack:draw", serde_json::json!({ "count": 1 })),
            ],
        }];
        let results = simulate_batch(&registry(), tasks);
        let result = results[0].as_ref().unwrap();
        assert_eq!(result.applied, 1);
        assert_eq!(result.failed, 1);
    }

    #[test]
    fn test_merge_batch_converges() {
        // Peers with disjoint changes over a shared ancestor.
        let base = Arc::new(Chronicle::new("base", EventBus::new()));
        base.change("init", |d| {
            d.put_record("stack", &tessera_types::StackState::default())
        })
        .unwrap();
        let bytes = base.save();

        let mut docs = Vec::new();
        for i in 0..4 {
            let peer =
                Chronicle::load(&bytes, &format!("peer-{i}"), EventBus::new()).unwrap();
            peer.change("claim", |d| {
                d.put_record(&format!("zone:z{i}"), &tessera_types::ZoneState::default())
            })
            .unwrap();
            docs.push(peer.save());
        }

        let merged = merge_batch(docs.clone()).unwrap();
        let merged = Chronicle::load(&merged, "verify", EventBus::new()).unwrap();
        let state = merged.state();
        for i in 0..4 {
            assert!(state["zones"][format!("z{i}")].is_object());
        }

        // Reversed order merges to the same document.
        docs.reverse();
        let reversed = merge_batch(docs).unwrap();
        let reversed = Chronicle::load(&reversed, "verify", EventBus::new()).unwrap();
        assert_eq!(reversed.state(), state);
    }

    #[test]
    fn test_merge_empty_batch() {
        assert!(matches!(merge_batch(vec![]), Err(ParallelError::EmptyBatch)));
    }
}

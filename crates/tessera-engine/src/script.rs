//! Ordered action programs with delays and abort support.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use tessera_types::Action;

use crate::Engine;

/// One step of a script.
#[derive(Debug, Clone)]
pub struct ScriptStep {
    /// The action to dispatch.
    pub action: Action,
    /// Delay before this step, in milliseconds.
    pub delay_ms: u64,
}

/// An ordered sequence of actions with optional inter-step delays.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Script name, carried on `script:complete`.
    pub name: String,
    /// Steps in order.
    pub steps: Vec<ScriptStep>,
}

impl Script {
    /// Creates an empty script.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Appends a step with no delay.
    pub fn step(mut self, action: Action) -> Self {
        self.steps.push(ScriptStep {
            action,
            delay_ms: 0,
        });
        self
    }

    /// Appends a step preceded by a delay.
    pub fn step_after(mut self, action: Action, delay_ms: u64) -> Self {
        self.steps.push(ScriptStep { action, delay_ms });
        self
    }
}

/// How a script run ended.
#[derive(Debug, Clone)]
pub struct ScriptOutcome {
    /// False when the abort token fired before the last step.
    pub completed: bool,
    /// Steps actually dispatched.
    pub applied: usize,
}

/// Runs a script against an engine.
///
/// The abort token is checked between steps and during delays; once
/// aborted, no further steps run. Emits `script:complete {completed}`.
pub async fn run_script(
    engine: &Engine,
    script: &Script,
    cancel: &CancellationToken,
) -> ScriptOutcome {
    let mut applied = 0;
    let mut completed = true;

    for step in &script.steps {
        if cancel.is_cancelled() {
            completed = false;
            break;
        }
        if step.delay_ms > 0 {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(step.delay_ms)) => {}
                _ = cancel.cancelled() => {
                    completed = false;
                    break;
                }
            }
        }
        engine.dispatch(step.action.clone());
        applied += 1;
    }

    debug!(script = %script.name, completed, applied, "script finished");
    engine.bus().emit(
        "script:complete",
        serde_json::json!({
            "name": script.name,
            "completed": completed,
            "applied": applied,
        }),
    );
    ScriptOutcome { completed, applied }
}

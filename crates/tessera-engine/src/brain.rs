//! AI delegation for agents.

use tessera_types::Action;

use crate::{Engine, Result, Script};

/// What an agent's delegate decided to do.
#[derive(Debug)]
pub enum Thought {
    /// Apply a single action.
    Act(Action),
    /// Run an ordered action program.
    Run(Script),
}

/// An agent's AI delegate.
///
/// Stored in the engine's table keyed by agent id, so agents and their
/// brains reference each other only by identifier. A `think` error emits
/// `agent:error` and does not advance the turn.
pub trait AgentBrain: Send + Sync {
    /// Decides the agent's next move; `None` passes the turn.
    fn think(&self, engine: &Engine) -> Result<Option<Thought>>;
}

impl<F> AgentBrain for F
where
    F: Fn(&Engine) -> Result<Option<Thought>> + Send + Sync,
{
    fn think(&self, engine: &Engine) -> Result<Option<Thought>> {
        self(engine)
    }
}

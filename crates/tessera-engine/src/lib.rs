//! The typed action pipeline.
//!
//! [`Engine::dispatch`] is the only legal mutation entry point: it resolves
//! a handler from the [`ActionRegistry`], applies it to the Chronicle-backed
//! domain objects, appends to history, evaluates [`Policy`]s, and announces
//! the outcome on the event bus. Scripts, the recorder, and AI delegation
//! build on dispatch.

mod actions;
mod brain;
mod engine;
mod error;
mod policy;
mod recorder;
mod registry;
mod script;

pub use actions::{
    agent_pack, debug_pack, rule_pack, source_pack, space_pack, stack_pack, standard_packs,
};
pub use brain::{AgentBrain, Thought};
pub use engine::{DispatchResult, Engine, EngineConfig};
pub use error::EngineError;
pub use policy::Policy;
pub use recorder::{replay, Recorder, RecorderEntry};
pub use registry::{ActionPack, ActionRegistry, Handler, CATCH_ALL};
pub use script::{run_script, Script, ScriptOutcome, ScriptStep};

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

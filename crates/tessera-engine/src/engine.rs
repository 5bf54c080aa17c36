//! The engine: dispatch orchestration, history, policies, snapshots.

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

use tessera_board::{Agent, Source, Space, Stack};
use tessera_chronicle::Chronicle;
use tessera_events::EventBus;
use tessera_types::{Action, RuleState, RULES_KEY};

use crate::policy::Policy;
use crate::registry::ActionRegistry;
use crate::{AgentBrain, EngineError, Result, Thought};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Actor identity for the engine's chronicle.
    pub peer_id: String,
    /// History entries to retain; 0 keeps everything.
    pub max_history: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            peer_id: "engine".to_string(),
            max_history: 0,
        }
    }
}

/// Outcome of one dispatch.
#[derive(Debug)]
pub struct DispatchResult {
    /// The normalized action as applied (or rejected).
    pub action: Action,
    /// Handler result, or the typed failure.
    pub result: Result<serde_json::Value>,
}

impl DispatchResult {
    /// Whether the action was applied.
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// The orchestrator owning the chronicle and domain objects.
///
/// All methods take `&self`; dispatch is serialized by an internal
/// reentrant lock, so a policy effect may itself dispatch and the next
/// dispatch observes every effect of the previous one.
pub struct Engine {
    config: EngineConfig,
    chronicle: Arc<Chronicle>,
    bus: EventBus,
    registry: ActionRegistry,
    policies: RwLock<Vec<Policy>>,
    history: Mutex<Vec<Action>>,
    stack: Stack,
    space: Space,
    source: RwLock<Option<Source>>,
    agents: RwLock<HashMap<String, Agent>>,
    brains: RwLock<HashMap<String, Arc<dyn AgentBrain>>>,
    dispatch_lock: ReentrantMutex<()>,
}

impl Engine {
    /// Creates an engine with a fresh chronicle and an empty registry.
    pub fn new(config: EngineConfig) -> Self {
        let bus = EventBus::new();
        let chronicle = Arc::new(Chronicle::new(&config.peer_id, bus.clone()));
        Self::with_chronicle(config, chronicle, ActionRegistry::new())
    }

    /// Creates an engine with the standard action packs registered.
    pub fn with_standard_packs(config: EngineConfig) -> Self {
        let engine = Self::new(config);
        for pack in crate::actions::standard_packs() {
            engine.registry.register_pack(&pack);
        }
        engine
    }

    /// Creates an engine around an existing chronicle and registry.
    ///
    /// Used by the worker to host a mirror engine restored from a snapshot.
    pub fn with_chronicle(
        config: EngineConfig,
        chronicle: Arc<Chronicle>,
        registry: ActionRegistry,
    ) -> Self {
        let bus = chronicle.bus().clone();
        let stack = Stack::new(chronicle.clone());
        let space = Space::new(chronicle.clone());
        Self {
            config,
            chronicle,
            bus,
            registry,
            policies: RwLock::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            stack,
            space,
            source: RwLock::new(None),
            agents: RwLock::new(HashMap::new()),
            brains: RwLock::new(HashMap::new()),
            dispatch_lock: ReentrantMutex::new(()),
        }
    }

    /// The engine's chronicle.
    pub fn chronicle(&self) -> &Arc<Chronicle> {
        &self.chronicle
    }

    /// The engine's event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The action registry.
    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// The default stack.
    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    /// The shared space.
    pub fn space(&self) -> &Space {
        &self.space
    }

    /// The configured peer id.
    pub fn peer_id(&self) -> &str {
        &self.config.peer_id
    }

    /// Installs a source over the given stacks.
    pub fn set_source(&self, source: Source) {
        *self.source.write() = Some(source);
    }

    /// The installed source, if any.
    pub fn source(&self) -> Option<Source> {
        self.source.read().clone()
    }

    /// Creates an agent and registers its handle.
    pub fn create_agent(&self, id: &str, name: &str) -> Result<Agent> {
        let agent = Agent::create(self.chronicle.clone(), id, name)?;
        self.agents.write().insert(id.to_string(), agent.clone());
        Ok(agent)
    }

    /// Looks up an agent handle, attaching lazily if the record exists
    /// (e.g. it arrived through sync).
    pub fn agent(&self, id: &str) -> Option<Agent> {
        if let Some(agent) = self.agents.read().get(id) {
            return Some(agent.clone());
        }
        let attached = Agent::attach(self.chronicle.clone(), id);
        if attached.state().is_ok() {
            self.agents
                .write()
                .insert(id.to_string(), attached.clone());
            return Some(attached);
        }
        None
    }

    /// Installs an AI delegate for an agent.
    pub fn set_brain(&self, agent_id: &str, brain: Arc<dyn AgentBrain>) {
        self.brains.write().insert(agent_id.to_string(), brain);
    }

    /// Runs one full turn for an agent: think, begin, apply, end.
    ///
    /// A `think` error emits `agent:error` and returns before the turn
    /// begins, so the turn counter does not advance. Script steps run
    /// back-to-back here; use [`crate::run_script`] for timed replay.
    pub fn take_turn(&self, agent_id: &str) -> Result<()> {
        let brain = self.brains.read().get(agent_id).cloned();
        let thought = match brain {
            Some(brain) => match brain.think(self) {
                Ok(thought) => thought,
                Err(err) => {
                    self.bus.emit(
                        "agent:error",
                        serde_json::json!({ "id": agent_id, "error": err.to_string() }),
                    );
                    return Err(err);
                }
            },
            None => None,
        };

        let agent = self
            .agent(agent_id)
            .ok_or_else(|| EngineError::IllegalMove(format!("agent not found: {agent_id}")))?;
        agent.begin_turn()?;
        match thought {
            Some(Thought::Act(action)) => {
                self.dispatch(action);
            }
            Some(Thought::Run(script)) => {
                for step in &script.steps {
                    self.dispatch(step.action.clone());
                }
            }
            None => {}
        }
        agent.end_turn()?;
        Ok(())
    }

    /// The only legal mutation entry point.
    ///
    /// Normalizes the action, resolves and runs its handler, appends to
    /// history, evaluates enabled policies in descending priority, and
    /// emits `engine:action` (or `engine:error` on failure). Handler
    /// panics are captured; failed actions are not applied and not
    /// recorded.
    pub fn dispatch(&self, mut action: Action) -> DispatchResult {
        let _guard = self.dispatch_lock.lock();
        action.normalize();
        self.normalize_payload(&mut action);

        let handler = match self.registry.resolve(&action.kind) {
            Some(handler) => handler,
            None => {
                let err = EngineError::UnknownAction(action.kind.clone());
                self.emit_failure(&action, &err);
                return DispatchResult {
                    action,
                    result: Err(err),
                };
            }
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| handler(self, &action.payload)));
        let result = match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(err),
            Err(panic) => Err(EngineError::Panic(panic_message(&panic))),
        };

        match result {
            Ok(value) => {
                self.push_history(action.clone());
                self.evaluate_policies(&action);
                self.bus.emit(
                    "engine:action",
                    serde_json::json!({ "action": &action, "result": &value }),
                );
                debug!(kind = %action.kind, "action applied");
                DispatchResult {
                    action,
                    result: Ok(value),
                }
            }
            Err(err) => {
                self.emit_failure(&action, &err);
                DispatchResult {
                    action,
                    result: Err(err),
                }
            }
        }
    }

    /// Dispatches a batch in order, returning every outcome.
    pub fn dispatch_many(&self, actions: Vec<Action>) -> Vec<DispatchResult> {
        actions.into_iter().map(|a| self.dispatch(a)).collect()
    }

    /// Applied actions in dispatch order.
    pub fn history(&self) -> Vec<Action> {
        self.history.lock().clone()
    }

    /// Serializes the chronicle for a snapshot.
    pub fn snapshot(&self) -> Vec<u8> {
        self.chronicle.save()
    }

    /// Restores the chronicle from a snapshot and clears the engine-local
    /// history.
    pub fn restore(&self, bytes: &[u8]) -> Result<()> {
        self.chronicle.restore(bytes)?;
        self.history.lock().clear();
        Ok(())
    }

    /// Adds a policy.
    pub fn add_policy(&self, policy: Policy) {
        self.policies.write().push(policy);
    }

    /// Removes a policy by name; returns whether it existed.
    pub fn remove_policy(&self, name: &str) -> bool {
        let mut policies = self.policies.write();
        let before = policies.len();
        policies.retain(|p| p.name != name);
        policies.len() != before
    }

    /// Enables or disables a policy; returns whether it exists.
    pub fn enable_policy(&self, name: &str, enabled: bool) -> bool {
        let mut policies = self.policies.write();
        match policies.iter_mut().find(|p| p.name == name) {
            Some(policy) => {
                policy.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// How many times a policy's effect has run locally.
    pub fn policy_hits(&self, name: &str) -> Option<u64> {
        self.policies
            .read()
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.hits)
    }

    /// Clears replicated fired-state and local hit counters.
    pub fn reset_policies(&self) -> Result<()> {
        self.chronicle.change_with("rule:reset", |draft| {
            draft.put_record(RULES_KEY, &RuleState::default())?;
            Ok::<_, EngineError>(())
        })?;
        for policy in self.policies.write().iter_mut() {
            policy.hits = 0;
        }
        Ok(())
    }

    /// Whether a once-policy has fired, per the replicated rule state.
    pub fn rule_fired(&self, name: &str) -> bool {
        self.chronicle
            .get_record::<RuleState>(RULES_KEY)
            .ok()
            .flatten()
            .map(|rules| rules.fired.contains_key(name))
            .unwrap_or(false)
    }

    fn evaluate_policies(&self, last_action: &Action) {
        let snapshot: Vec<(String, bool, crate::policy::PolicyCondition, crate::policy::PolicyEffect)> = {
            let policies = self.policies.read();
            let mut items: Vec<_> = policies
                .iter()
                .filter(|p| p.enabled)
                .map(|p| (p.name.clone(), p.priority, p.once, p.condition.clone(), p.effect.clone()))
                .collect();
            items.sort_by(|a, b| b.1.cmp(&a.1));
            items
                .into_iter()
                .map(|(name, _, once, c, e)| (name, once, c, e))
                .collect()
        };

        for (name, once, condition, effect) in snapshot {
            if once && self.rule_fired(&name) {
                continue;
            }

            let holds = match catch_unwind(AssertUnwindSafe(|| condition(self, Some(last_action)))) {
                Ok(holds) => holds,
                Err(panic) => {
                    self.emit_policy_error(&name, "condition", &panic_message(&panic));
                    continue;
                }
            };
            if !holds {
                continue;
            }

            // The fired flag is committed before the effect runs, so it
            // replicates no later than anything the effect writes. The
            // triggering action's timestamp is used (not wall clock) so a
            // replayed log reproduces the document exactly.
            if once {
                let fired_at = last_action.timestamp;
                let marked = self.chronicle.change_with("policy:fired", |draft| {
                    let mut rules: RuleState = draft.get_record_or_default(RULES_KEY)?;
                    rules.fired.insert(name.clone(), fired_at);
                    draft.put_record(RULES_KEY, &rules)?;
                    Ok::<_, EngineError>(())
                });
                if let Err(err) = marked {
                    self.emit_policy_error(&name, "fired-state", &err.to_string());
                    continue;
                }
            }

            if let Some(policy) = self.policies.write().iter_mut().find(|p| p.name == name) {
                policy.hits += 1;
            }

            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| effect(self))) {
                self.emit_policy_error(&name, "effect", &panic_message(&panic));
            }
        }
    }

    /// Captures nondeterministic inputs (shuffle seeds, minted placement
    /// ids) into the action payload so the recorder log replays to an
    /// identical document.
    fn normalize_payload(&self, action: &mut Action) {
        let captures_seed = matches!(
            action.kind.as_str(),
            "stack:shuffle" | "space:shuffle" | "source:shuffle" | "source:reshuffle"
        );
        let captures_placement_id = action.kind == "space:place";
        if !captures_seed && !captures_placement_id {
            return;
        }
        if !action.payload.is_object() {
            action.payload = serde_json::json!({});
        }
        let payload = action.payload.as_object_mut().expect("object payload");
        if captures_seed {
            let missing = payload.get("seed").map(|s| s.is_null()).unwrap_or(true);
            if missing {
                payload.insert("seed".to_string(), serde_json::json!(rand::random::<u32>()));
            }
        }
        if captures_placement_id && !payload.contains_key("placementId") {
            payload.insert(
                "placementId".to_string(),
                serde_json::json!(uuid::Uuid::new_v4().to_string()),
            );
        }
    }

    fn push_history(&self, action: Action) {
        let mut history = self.history.lock();
        history.push(action);
        let max = self.config.max_history;
        if max > 0 && history.len() > max {
            let excess = history.len() - max;
            history.drain(..excess);
        }
    }

    fn emit_failure(&self, action: &Action, err: &EngineError) {
        warn!(kind = %action.kind, error = %err, "action failed");
        self.bus.emit(
            "engine:error",
            serde_json::json!({
                "action": action,
                "kind": err.kind(),
                "message": err.to_string(),
            }),
        );
    }

    fn emit_policy_error(&self, name: &str, phase: &str, message: &str) {
        warn!(policy = %name, phase = %phase, error = %message, "policy failed");
        self.bus.emit(
            "policy:error",
            serde_json::json!({ "policy": name, "phase": phase, "error": message }),
        );
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

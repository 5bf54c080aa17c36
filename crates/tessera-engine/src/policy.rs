//! Condition/effect pairs evaluated after each applied action.

use std::sync::Arc;

use tessera_types::Action;

use crate::Engine;

pub(crate) type PolicyCondition =
    Arc<dyn Fn(&Engine, Option<&Action>) -> bool + Send + Sync + 'static>;
pub(crate) type PolicyEffect = Arc<dyn Fn(&Engine) + Send + Sync + 'static>;

/// A rule: `condition` checked after every applied action, `effect` run when
/// it holds.
///
/// Policies are evaluated in descending priority order. A `once` policy is
/// skipped after its first firing; fired-status is written into
/// `state.rules.fired` so replicas agree on which once-policies already
/// triggered. Condition or effect panics are captured, reported on
/// `policy:error`, and never abort dispatch.
pub struct Policy {
    /// Unique policy name; the replication key for `once` firing.
    pub name: String,
    pub(crate) condition: PolicyCondition,
    pub(crate) effect: PolicyEffect,
    /// Higher runs earlier.
    pub priority: i32,
    /// Fire at most once.
    pub once: bool,
    /// Disabled policies are skipped entirely.
    pub enabled: bool,
    /// Number of times the effect has run.
    pub hits: u64,
}

impl Policy {
    /// Creates an enabled, repeating policy with priority 0.
    pub fn new<C, E>(name: impl Into<String>, condition: C, effect: E) -> Self
    where
        C: Fn(&Engine, Option<&Action>) -> bool + Send + Sync + 'static,
        E: Fn(&Engine) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            condition: Arc::new(condition),
            effect: Arc::new(effect),
            priority: 0,
            once: false,
            enabled: true,
            hits: 0,
        }
    }

    /// Sets the evaluation priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Marks the policy as fire-at-most-once.
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    /// Starts the policy disabled.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("once", &self.once)
            .field("enabled", &self.enabled)
            .field("hits", &self.hits)
            .finish()
    }
}

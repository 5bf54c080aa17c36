//! Named participants with inventories, resources, and a turn lifecycle.

use std::sync::Arc;

use tessera_chronicle::{Chronicle, DocDraft};
use tessera_types::{AgentState, LoopState, PlacementRecord, StackState, Token, AGENT_PREFIX, LOOP_KEY};

use crate::space::{place_in_draft, PlaceOptions};
use crate::{BoardError, Result, Stack};

fn agent_key(id: &str) -> String {
    format!("{AGENT_PREFIX}{id}")
}

/// A named participant.
///
/// The agent record (inventory, discard pile, resources, turn counter)
/// lives under `agent:{id}` in the document; this handle projects it.
#[derive(Clone)]
pub struct Agent {
    chronicle: Arc<Chronicle>,
    id: String,
}

impl Agent {
    /// Creates a new agent record.
    pub fn create(chronicle: Arc<Chronicle>, id: &str, name: &str) -> Result<Self> {
        let agent = Self {
            chronicle,
            id: id.to_string(),
        };
        agent.chronicle.change_with("agent:create", |draft| {
            draft.put_record(&agent_key(id), &AgentState::new(id, name))?;
            Ok::<_, BoardError>(())
        })?;
        agent.emit("agent:create", serde_json::json!({ "id": id, "name": name }));
        Ok(agent)
    }

    /// Attaches to an existing agent record.
    pub fn attach(chronicle: Arc<Chronicle>, id: &str) -> Self {
        Self {
            chronicle,
            id: id.to_string(),
        }
    }

    /// The agent's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current record; fails when the agent does not exist.
    pub fn state(&self) -> Result<AgentState> {
        self.chronicle
            .get_record::<AgentState>(&agent_key(&self.id))?
            .ok_or_else(|| BoardError::AgentNotFound(self.id.clone()))
    }

    /// Tokens currently in hand.
    pub fn inventory(&self) -> Result<Vec<Token>> {
        Ok(self.state()?.inventory)
    }

    /// Assigns a private stack to the agent.
    pub fn assign_stack(&self, stack: &Stack) -> Result<()> {
        self.update_record("agent:assign-stack", |state| {
            state.stack_key = Some(stack.key().to_string());
            Ok(())
        })
    }

    /// Names the space this agent shares with others.
    pub fn join_space(&self, space_name: &str) -> Result<()> {
        self.update_record("agent:join-space", |state| {
            state.space = Some(space_name.to_string());
            Ok(())
        })
    }

    /// Sets a named resource to an absolute amount.
    pub fn set_resource(&self, resource: &str, amount: i64) -> Result<()> {
        self.update_record("agent:set-resource", |state| {
            state.resources.insert(resource.to_string(), amount);
            Ok(())
        })
    }

    /// Adjusts a named resource by a delta; returns the new amount.
    pub fn adjust_resource(&self, resource: &str, delta: i64) -> Result<i64> {
        let mut updated = 0;
        self.update_record("agent:adjust-resource", |state| {
            let entry = state.resources.entry(resource.to_string()).or_insert(0);
            *entry += delta;
            updated = *entry;
            Ok(())
        })?;
        Ok(updated)
    }

    /// Current amount of a named resource.
    pub fn resource(&self, resource: &str) -> Result<i64> {
        Ok(self.state()?.resources.get(resource).copied().unwrap_or(0))
    }

    /// Draws from a stack into this agent's inventory.
    ///
    /// One atomic change across the stack and agent records; the stack's
    /// short-draw rule applies.
    pub fn draw_from(&self, stack: &Stack, n: usize, allow_short: bool) -> Result<Vec<Token>> {
        let drawn = self.chronicle.change_with("agent:draw", |draft| {
            let mut deck: StackState = draft.get_record_or_default(stack.key())?;
            let drawn = crate::stack::draw_from_state(&mut deck, n, allow_short)?;
            deck.drawn.extend(drawn.iter().cloned());
            draft.put_record(stack.key(), &deck)?;

            let mut state = load_agent(draft, &self.id)?;
            state.inventory.extend(drawn.iter().cloned());
            draft.put_record(&agent_key(&self.id), &state)?;
            Ok::<_, BoardError>(drawn)
        })?;
        self.emit(
            "agent:draw",
            serde_json::json!({ "id": self.id, "count": drawn.len() }),
        );
        Ok(drawn)
    }

    /// Moves matching tokens (all, without a predicate) from the hand to
    /// the agent's personal discard pile.
    pub fn discard_from_hand(
        &self,
        predicate: Option<&(dyn Fn(&Token) -> bool)>,
    ) -> Result<Vec<Token>> {
        let discarded = self.chronicle.change_with("agent:discard", |draft| {
            let mut state = load_agent(draft, &self.id)?;
            let (discarded, kept): (Vec<Token>, Vec<Token>) = state
                .inventory
                .drain(..)
                .partition(|t| predicate.map(|p| p(t)).unwrap_or(true));
            state.inventory = kept;
            state.discard.extend(discarded.iter().cloned());
            draft.put_record(&agent_key(&self.id), &state)?;
            Ok::<_, BoardError>(discarded)
        })?;
        self.emit(
            "agent:discard",
            serde_json::json!({ "id": self.id, "count": discarded.len() }),
        );
        Ok(discarded)
    }

    /// Plays a card from the hand into a zone.
    ///
    /// Fails with [`BoardError::ZoneLocked`] on locked zones and leaves the
    /// hand untouched.
    pub fn play_card(&self, zone: &str, card_id: &str) -> Result<PlacementRecord> {
        let placed = self.chronicle.change_with("agent:play", |draft| {
            let mut state = load_agent(draft, &self.id)?;
            let index = state
                .inventory
                .iter()
                .position(|t| t.id == card_id)
                .ok_or_else(|| BoardError::TokenNotFound(card_id.to_string()))?;
            let token = state.inventory.remove(index);
            let record = place_in_draft(draft, zone, &token, &PlaceOptions::default())?
                .ok_or_else(|| BoardError::ZoneLocked(zone.to_string()))?;
            draft.put_record(&agent_key(&self.id), &state)?;
            Ok::<_, BoardError>(record)
        })?;
        self.emit(
            "agent:play",
            serde_json::json!({ "id": self.id, "zone": zone, "tokenId": card_id }),
        );
        Ok(placed)
    }

    /// Begins this agent's turn: increments its counter, marks it active,
    /// and advances the shared loop record.
    pub fn begin_turn(&self) -> Result<u64> {
        let turns = self.chronicle.change_with("agent:begin-turn", |draft| {
            let mut state = load_agent(draft, &self.id)?;
            state.active = true;
            state.turns += 1;
            let turns = state.turns;
            draft.put_record(&agent_key(&self.id), &state)?;

            let mut game_loop: LoopState = draft.get_record_or_default(LOOP_KEY)?;
            game_loop.turn += 1;
            game_loop.running = true;
            game_loop.active_agent = Some(self.id.clone());
            draft.put_record(LOOP_KEY, &game_loop)?;
            Ok::<_, BoardError>(turns)
        })?;
        self.emit(
            "agent:turn-started",
            serde_json::json!({ "id": self.id, "turns": turns }),
        );
        Ok(turns)
    }

    /// Ends this agent's turn.
    pub fn end_turn(&self) -> Result<()> {
        self.chronicle.change_with("agent:end-turn", |draft| {
            let mut state = load_agent(draft, &self.id)?;
            state.active = false;
            draft.put_record(&agent_key(&self.id), &state)?;

            let mut game_loop: LoopState = draft.get_record_or_default(LOOP_KEY)?;
            if game_loop.active_agent.as_deref() == Some(self.id.as_str()) {
                game_loop.active_agent = None;
            }
            draft.put_record(LOOP_KEY, &game_loop)?;
            Ok::<_, BoardError>(())
        })?;
        self.emit("agent:turn-ended", serde_json::json!({ "id": self.id }));
        Ok(())
    }

    fn update_record<F>(&self, label: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut AgentState) -> Result<()>,
    {
        self.chronicle.change_with(label, |draft| {
            let mut state = load_agent(draft, &self.id)?;
            f(&mut state)?;
            draft.put_record(&agent_key(&self.id), &state)?;
            Ok(())
        })
    }

    fn emit(&self, topic: &str, payload: serde_json::Value) {
        self.chronicle.bus().emit(topic, payload);
    }
}

fn load_agent(draft: &DocDraft, id: &str) -> Result<AgentState> {
    draft
        .get_record::<AgentState>(&agent_key(id))?
        .ok_or_else(|| BoardError::AgentNotFound(id.to_string()))
}

/// What to move in a transfer or steal.
#[derive(Debug, Clone, Default)]
pub struct TransferSpec {
    /// Named resource to move.
    pub resource: Option<String>,
    /// Amount of the resource.
    pub amount: Option<i64>,
    /// Specific token to move from the inventory.
    pub token_id: Option<String>,
}

/// What actually moved.
#[derive(Debug, Clone, Default)]
pub struct TransferOutcome {
    /// Whether anything moved.
    pub success: bool,
    /// Resource amount moved, if any.
    pub amount: Option<i64>,
    /// Token moved, if any.
    pub token_id: Option<String>,
}

/// One side of a trade.
#[derive(Debug, Clone, Default)]
pub struct TradeOffer {
    /// Named resource offered.
    pub resource: Option<String>,
    /// Amount of the resource offered.
    pub amount: i64,
    /// Tokens offered from the inventory.
    pub token_ids: Vec<String>,
}

/// Moves resources or a token between two agents in one atomic change.
///
/// Fails with [`BoardError::InsufficientResources`] when the giver lacks
/// the requested amount or token; nothing moves on failure.
pub fn transfer(
    chronicle: &Chronicle,
    from: &str,
    to: &str,
    spec: &TransferSpec,
) -> Result<TransferOutcome> {
    let outcome = chronicle.change_with("agent:transfer", |draft| {
        let mut giver = load_agent(draft, from)?;
        let mut taker = load_agent(draft, to)?;
        let mut outcome = TransferOutcome::default();

        if let (Some(resource), Some(amount)) = (&spec.resource, spec.amount) {
            take_resource(&mut giver, resource, amount, true)?;
            *taker.resources.entry(resource.clone()).or_insert(0) += amount;
            outcome.amount = Some(amount);
            outcome.success = true;
        }
        if let Some(ref token_id) = spec.token_id {
            let token = take_token(&mut giver, token_id)?;
            taker.inventory.push(token);
            outcome.token_id = Some(token_id.clone());
            outcome.success = true;
        }

        draft.put_record(&agent_key(from), &giver)?;
        draft.put_record(&agent_key(to), &taker)?;
        Ok::<_, BoardError>(outcome)
    })?;
    chronicle.bus().emit(
        "agent:transfer",
        serde_json::json!({ "from": from, "to": to, "success": outcome.success }),
    );
    Ok(outcome)
}

/// Atomically swaps two offers between two agents.
///
/// Both sides are validated before anything moves; an uncovered offer fails
/// the whole trade with [`BoardError::InsufficientResources`].
pub fn trade(
    chronicle: &Chronicle,
    agent1: &str,
    offer1: &TradeOffer,
    agent2: &str,
    offer2: &TradeOffer,
) -> Result<()> {
    chronicle.change_with("agent:trade", |draft| {
        let mut a = load_agent(draft, agent1)?;
        let mut b = load_agent(draft, agent2)?;

        apply_offer(&mut a, &mut b, offer1)?;
        apply_offer(&mut b, &mut a, offer2)?;

        draft.put_record(&agent_key(agent1), &a)?;
        draft.put_record(&agent_key(agent2), &b)?;
        Ok::<_, BoardError>(())
    })?;
    chronicle.bus().emit(
        "agent:trade",
        serde_json::json!({ "agent1": agent1, "agent2": agent2, "success": true }),
    );
    Ok(())
}

/// Takes resources or a token from a victim.
///
/// With `validate`, a short victim fails the steal; without it, up to the
/// available amount is taken.
pub fn steal(
    chronicle: &Chronicle,
    from: &str,
    to: &str,
    spec: &TransferSpec,
    validate: bool,
) -> Result<TransferOutcome> {
    let outcome = chronicle.change_with("agent:steal", |draft| {
        let mut victim = load_agent(draft, from)?;
        let mut thief = load_agent(draft, to)?;
        let mut outcome = TransferOutcome::default();

        if let (Some(resource), Some(amount)) = (&spec.resource, spec.amount) {
            let taken = take_resource(&mut victim, resource, amount, validate)?;
            *thief.resources.entry(resource.clone()).or_insert(0) += taken;
            outcome.amount = Some(taken);
            outcome.success = taken > 0;
        }
        if let Some(ref token_id) = spec.token_id {
            match take_token(&mut victim, token_id) {
                Ok(token) => {
                    thief.inventory.push(token);
                    outcome.token_id = Some(token_id.clone());
                    outcome.success = true;
                }
                Err(err) if validate => return Err(err),
                Err(_) => {}
            }
        }

        draft.put_record(&agent_key(from), &victim)?;
        draft.put_record(&agent_key(to), &thief)?;
        Ok(outcome)
    })?;
    chronicle.bus().emit(
        "agent:steal",
        serde_json::json!({
            "from": from,
            "to": to,
            "success": outcome.success,
            "stolen": { "amount": outcome.amount, "tokenId": outcome.token_id },
        }),
    );
    Ok(outcome)
}

fn take_resource(
    state: &mut AgentState,
    resource: &str,
    amount: i64,
    strict: bool,
) -> Result<i64> {
    let available = state.resources.get(resource).copied().unwrap_or(0);
    if available < amount {
        if strict {
            return Err(BoardError::InsufficientResources(format!(
                "{}: has {available} of {resource}, needs {amount}",
                state.id
            )));
        }
        state.resources.insert(resource.to_string(), 0);
        return Ok(available.max(0));
    }
    state.resources.insert(resource.to_string(), available - amount);
    Ok(amount)
}

fn take_token(state: &mut AgentState, token_id: &str) -> Result<Token> {
    let index = state
        .inventory
        .iter()
        .position(|t| t.id == token_id)
        .ok_or_else(|| BoardError::TokenNotFound(token_id.to_string()))?;
    Ok(state.inventory.remove(index))
}

fn apply_offer(giver: &mut AgentState, taker: &mut AgentState, offer: &TradeOffer) -> Result<()> {
    if let Some(ref resource) = offer.resource {
        let moved = take_resource(giver, resource, offer.amount, true)?;
        *taker.resources.entry(resource.clone()).or_insert(0) += moved;
    }
    for token_id in &offer.token_ids {
        let token = take_token(giver, token_id)?;
        taker.inventory.push(token);
    }
    Ok(())
}

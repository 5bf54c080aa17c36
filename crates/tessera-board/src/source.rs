//! Union view over multiple stacks with a reshuffle policy.

use std::sync::Arc;
use tracing::debug;

use tessera_chronicle::{Chronicle, DocDraft};
use tessera_types::{
    hash_seed, Mulberry32, ReshuffleMode, ReshufflePolicy, SourceState, StackState, Token,
    SOURCE_KEY,
};

use crate::stack::draw_from_state;
use crate::{BoardError, Result, Stack};

/// A union view over an ordered list of stacks.
///
/// Draws pull from the current head stack until it empties, then advance to
/// the next. When the total remaining live tokens falls to the policy
/// threshold, auto mode folds every constituent's discards back into that
/// constituent's own pile and reshuffles it with a freshly forked seed;
/// manual mode emits `source:reshuffle-needed` and takes no action.
#[derive(Clone)]
pub struct Source {
    chronicle: Arc<Chronicle>,
    key: String,
}

impl Source {
    /// Builds a source over the given stacks, recording its state.
    pub fn build(
        chronicle: Arc<Chronicle>,
        stacks: &[&Stack],
        policy: ReshufflePolicy,
    ) -> Result<Self> {
        if stacks.is_empty() {
            return Err(BoardError::EmptySource);
        }
        let source = Self {
            chronicle,
            key: SOURCE_KEY.to_string(),
        };
        let stack_keys: Vec<String> = stacks.iter().map(|s| s.key().to_string()).collect();
        source.chronicle.change_with("source:init", |draft| {
            draft.put_record(
                &source.key,
                &SourceState {
                    stack_keys,
                    cursor: 0,
                    policy,
                    seed: None,
                },
            )?;
            Ok::<_, BoardError>(())
        })?;
        Ok(source)
    }

    /// Attaches to an existing source record.
    pub fn attach(chronicle: Arc<Chronicle>) -> Self {
        Self {
            chronicle,
            key: SOURCE_KEY.to_string(),
        }
    }

    /// Current source record.
    pub fn state(&self) -> Result<SourceState> {
        Ok(self
            .chronicle
            .get_record::<SourceState>(&self.key)?
            .unwrap_or_default())
    }

    /// Total live tokens remaining across all constituents.
    pub fn remaining(&self) -> Result<usize> {
        let state = self.state()?;
        let mut total = 0;
        for key in &state.stack_keys {
            total += self
                .chronicle
                .get_record::<StackState>(key)?
                .map(|s| s.stack.len())
                .unwrap_or(0);
        }
        Ok(total)
    }

    /// Draws `n` tokens across constituents, head stack first.
    ///
    /// Applies the same short-draw rule as [`Stack::draw`]. Triggers the
    /// reshuffle policy after the draw when the threshold is crossed.
    pub fn draw(&self, n: usize, allow_short: bool) -> Result<Vec<Token>> {
        let (drawn, reshuffled, needed) = self.chronicle.change_with("source:draw", |draft| {
            let mut source: SourceState = draft.get_record_or_default(&self.key)?;
            if source.stack_keys.is_empty() {
                return Err(BoardError::EmptySource);
            }

            let mut remaining_total = 0;
            for key in &source.stack_keys {
                let state: StackState = draft.get_record_or_default(key)?;
                remaining_total += state.stack.len();
            }
            if n > remaining_total && !allow_short {
                return Err(BoardError::StackEmpty {
                    requested: n,
                    remaining: remaining_total,
                });
            }

            let mut drawn = Vec::with_capacity(n.min(remaining_total));
            while drawn.len() < n && source.cursor < source.stack_keys.len() {
                let key = source.stack_keys[source.cursor].clone();
                let mut state: StackState = draft.get_record_or_default(&key)?;
                let want = n - drawn.len();
                let take = draw_from_state(&mut state, want, true)?;
                state.drawn.extend(take.iter().cloned());
                draft.put_record(&key, &state)?;
                let exhausted = state.stack.is_empty();
                drawn.extend(take);
                if exhausted {
                    source.cursor += 1;
                } else {
                    break;
                }
            }
            if source.cursor >= source.stack_keys.len() {
                source.cursor = source.stack_keys.len().saturating_sub(1);
            }

            let left = remaining_total - drawn.len();
            let mut reshuffled = false;
            let mut needed = false;
            if left <= source.policy.threshold {
                match source.policy.mode {
                    ReshuffleMode::Auto => {
                        reshuffle_in_draft(draft, &mut source, None)?;
                        reshuffled = true;
                    }
                    ReshuffleMode::Manual => needed = true,
                }
            }
            draft.put_record(&self.key, &source)?;
            Ok((drawn, reshuffled, needed))
        })?;

        self.emit(
            "source:draw",
            serde_json::json!({ "count": drawn.len(), "ids": drawn.iter().map(|t| t.id.clone()).collect::<Vec<_>>() }),
        );
        if reshuffled {
            self.emit("source:reshuffle", serde_json::json!({ "auto": true }));
        }
        if needed {
            self.emit("source:reshuffle-needed", serde_json::json!({}));
        }
        Ok(drawn)
    }

    /// Burns `n` tokens across constituents into their discard piles.
    pub fn burn(&self, n: usize) -> Result<Vec<Token>> {
        let burned = self.chronicle.change_with("source:burn", |draft| {
            let mut source: SourceState = draft.get_record_or_default(&self.key)?;
            let mut burned = Vec::new();
            while burned.len() < n && source.cursor < source.stack_keys.len() {
                let key = source.stack_keys[source.cursor].clone();
                let mut state: StackState = draft.get_record_or_default(&key)?;
                let want = n - burned.len();
                let take = draw_from_state(&mut state, want, true)?;
                state.discards.extend(take.iter().cloned());
                draft.put_record(&key, &state)?;
                let exhausted = state.stack.is_empty();
                burned.extend(take);
                if exhausted {
                    source.cursor += 1;
                } else {
                    break;
                }
            }
            if source.cursor >= source.stack_keys.len() {
                source.cursor = source.stack_keys.len().saturating_sub(1);
            }
            draft.put_record(&self.key, &source)?;
            Ok::<_, BoardError>(burned)
        })?;
        self.emit("source:burn", serde_json::json!({ "count": burned.len() }));
        Ok(burned)
    }

    /// Reshuffles every constituent's live pile with forked seeds.
    pub fn shuffle(&self, seed: Option<&str>) -> Result<u32> {
        let seed32 = match seed {
            Some(s) => hash_seed(s),
            None => rand::random::<u32>(),
        };
        self.shuffle_seeded(seed32)?;
        Ok(seed32)
    }

    /// Shuffles constituents with an explicit 32-bit base seed.
    pub fn shuffle_seeded(&self, seed32: u32) -> Result<()> {
        self.chronicle.change_with("source:shuffle", |draft| {
            let mut source: SourceState = draft.get_record_or_default(&self.key)?;
            let mut rng = Mulberry32::new(seed32);
            for key in source.stack_keys.clone() {
                let mut state: StackState = draft.get_record_or_default(&key)?;
                let mut fork = rng.fork();
                fork.shuffle(&mut state.stack);
                draft.put_record(&key, &state)?;
            }
            source.seed = Some(seed32);
            draft.put_record(&self.key, &source)?;
            Ok::<_, BoardError>(())
        })?;
        self.emit("source:shuffle", serde_json::json!({ "seed": seed32 }));
        Ok(())
    }

    /// Manually folds all discards back into their own piles and
    /// reshuffles, as the auto policy would.
    pub fn reshuffle(&self, seed: Option<&str>) -> Result<()> {
        self.reshuffle_seeded(seed.map(hash_seed))
    }

    /// Reshuffles with an explicit 32-bit base seed (or a random one).
    pub fn reshuffle_seeded(&self, seed32: Option<u32>) -> Result<()> {
        self.chronicle.change_with("source:reshuffle", |draft| {
            let mut source: SourceState = draft.get_record_or_default(&self.key)?;
            reshuffle_in_draft(draft, &mut source, seed32)?;
            draft.put_record(&self.key, &source)?;
            Ok::<_, BoardError>(())
        })?;
        self.emit("source:reshuffle", serde_json::json!({ "auto": false }));
        Ok(())
    }

    fn emit(&self, topic: &str, payload: serde_json::Value) {
        self.chronicle.bus().emit(topic, payload);
    }
}

/// Folds each constituent's discards back into that constituent's live
/// pile and reshuffles it with a seed forked per constituent.
///
/// Constituent order is preserved; piles are never merged. The draw cursor
/// rewinds to the first stack.
fn reshuffle_in_draft(
    draft: &mut DocDraft,
    source: &mut SourceState,
    seed: Option<u32>,
) -> Result<()> {
    let seed32 = seed.unwrap_or_else(rand::random::<u32>);
    let mut rng = Mulberry32::new(seed32);
    for key in source.stack_keys.clone() {
        let mut state: StackState = draft.get_record_or_default(&key)?;
        let mut discards = std::mem::take(&mut state.discards);
        state.stack.append(&mut discards);
        let mut fork = rng.fork();
        fork.shuffle(&mut state.stack);
        state.seed = Some(seed32);
        draft.put_record(&key, &state)?;
    }
    source.cursor = 0;
    source.seed = Some(seed32);
    debug!(seed = seed32, "source reshuffled");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_events::EventBus;

    fn deck(chronicle: &Arc<Chronicle>, key: &str, ids: &[&str]) -> Stack {
        let tokens: Vec<Token> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| Token::new(*id, i as i64))
            .collect();
        Stack::with_tokens(chronicle.clone(), key, tokens).unwrap()
    }

    fn fixture(policy: ReshufflePolicy) -> (Arc<Chronicle>, Source, Stack, Stack) {
        let chronicle = Arc::new(Chronicle::new("test-peer", EventBus::new()));
        let a = deck(&chronicle, "shoe-a", &["a1", "a2"]);
        let b = deck(&chronicle, "shoe-b", &["b1", "b2"]);
        let source = Source::build(chronicle.clone(), &[&a, &b], policy).unwrap();
        (chronicle, source, a, b)
    }

    #[test]
    fn test_draw_crosses_constituents_in_order() {
        let (_c, source, a, b) = fixture(ReshufflePolicy {
            threshold: 0,
            mode: ReshuffleMode::Manual,
        });

        let drawn = source.draw(3, false).unwrap();
        let ids: Vec<String> = drawn.iter().map(|t| t.id.clone()).collect();
        // Head stack drains first, then the source advances to the next.
        assert_eq!(ids, ["a1", "a2", "b2"]);
        assert_eq!(a.size().unwrap(), 0);
        assert_eq!(b.size().unwrap(), 1);
        assert_eq!(source.remaining().unwrap(), 1);
    }

    #[test]
    fn test_overdraw_fails_like_stack() {
        let (_c, source, _a, _b) = fixture(ReshufflePolicy {
            threshold: 0,
            mode: ReshuffleMode::Manual,
        });
        let err = source.draw(5, false).unwrap_err();
        assert!(matches!(err, BoardError::StackEmpty { requested: 5, remaining: 4 }));
        assert_eq!(source.remaining().unwrap(), 4, "failed draw changes nothing");
    }

    #[test]
    fn test_auto_reshuffle_preserves_constituents() {
        let (_c, source, a, b) = fixture(ReshufflePolicy {
            threshold: 2,
            mode: ReshuffleMode::Auto,
        });

        // Burn two into discards, leaving 2 live: threshold crossed on draw.
        source.burn(2).unwrap();
        source.draw(1, false).unwrap();

        // After reshuffle, each constituent got its own discards back.
        let a_state = a.state().unwrap();
        let b_state = b.state().unwrap();
        assert!(a_state.discards.is_empty());
        assert!(b_state.discards.is_empty());
        let a_ids: Vec<&str> = a_state.stack.iter().map(|t| t.id.as_str()).collect();
        assert!(a_ids.iter().all(|id| id.starts_with('a')), "piles never merge: {a_ids:?}");
        assert_eq!(source.state().unwrap().cursor, 0, "cursor rewinds");
    }

    #[test]
    fn test_manual_mode_emits_reshuffle_needed() {
        let bus = EventBus::new();
        let seen = Arc::new(parking_lot::Mutex::new(0usize));
        let sink = seen.clone();
        bus.on("source:reshuffle-needed", move |_| {
            *sink.lock() += 1;
        })
        .detach();

        let chronicle = Arc::new(Chronicle::new("test-peer", bus));
        let a = deck(&chronicle, "shoe-a", &["a1", "a2"]);
        let source = Source::build(
            chronicle,
            &[&a],
            ReshufflePolicy {
                threshold: 1,
                mode: ReshuffleMode::Manual,
            },
        )
        .unwrap();

        source.draw(1, false).unwrap();
        assert_eq!(*seen.lock(), 1);
        // No reshuffle happened.
        assert_eq!(source.remaining().unwrap(), 1);
    }

    #[test]
    fn test_shuffle_forks_per_constituent_deterministically() {
        let (_c1, s1, a1, b1) = fixture(ReshufflePolicy::default());
        let (_c2, s2, a2, b2) = fixture(ReshufflePolicy::default());
        s1.shuffle(Some("shoe")).unwrap();
        s2.shuffle(Some("shoe")).unwrap();
        assert_eq!(a1.tokens().unwrap(), a2.tokens().unwrap());
        assert_eq!(b1.tokens().unwrap(), b2.tokens().unwrap());
    }

    #[test]
    fn test_build_requires_stacks() {
        let chronicle = Arc::new(Chronicle::new("test-peer", EventBus::new()));
        let result = Source::build(chronicle, &[], ReshufflePolicy::default());
        assert!(matches!(result, Err(BoardError::EmptySource)));
    }
}

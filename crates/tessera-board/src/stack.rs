//! Ordered deck of tokens with draw/shuffle/burn/discard semantics.

use std::sync::Arc;

use tessera_chronicle::{Chronicle, DocDraft};
use tessera_types::{hash_seed, Mulberry32, StackState, Token, STACK_KEY};

use crate::{BoardError, Result};

/// An ordered deck tied to exactly one chronicle.
///
/// In-memory this is only a handle; the compartments (`stack`, `drawn`,
/// `discards`) live under the stack's document key and the multiset union
/// of the three equals the initial token set until `reset`.
#[derive(Clone)]
pub struct Stack {
    chronicle: Arc<Chronicle>,
    key: String,
}

impl Stack {
    /// Attaches to the default `stack` document key.
    pub fn new(chronicle: Arc<Chronicle>) -> Self {
        Self::with_key(chronicle, STACK_KEY)
    }

    /// Attaches to a custom document key (private decks, source members).
    pub fn with_key(chronicle: Arc<Chronicle>, key: impl Into<String>) -> Self {
        Self {
            chronicle,
            key: key.into(),
        }
    }

    /// Attaches and records the initial token set as one bootstrap change.
    pub fn with_tokens(
        chronicle: Arc<Chronicle>,
        key: impl Into<String>,
        tokens: Vec<Token>,
    ) -> Result<Self> {
        let stack = Self::with_key(chronicle, key);
        stack.chronicle.change_with("stack:init", |draft| {
            draft.put_record(
                &stack.key,
                &StackState {
                    stack: tokens,
                    ..Default::default()
                },
            )?;
            Ok::<_, BoardError>(())
        })?;
        Ok(stack)
    }

    /// The document key this stack projects.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current compartments, recomputed from the document.
    pub fn state(&self) -> Result<StackState> {
        Ok(self
            .chronicle
            .get_record::<StackState>(&self.key)?
            .unwrap_or_default())
    }

    /// Tokens in the live deck, bottom to top.
    pub fn tokens(&self) -> Result<Vec<Token>> {
        Ok(self.state()?.stack)
    }

    /// Number of tokens in the live deck.
    pub fn size(&self) -> Result<usize> {
        Ok(self.state()?.stack.len())
    }

    /// Number of drawn tokens.
    pub fn drawn_count(&self) -> Result<usize> {
        Ok(self.state()?.drawn.len())
    }

    /// Number of discarded tokens.
    pub fn discard_count(&self) -> Result<usize> {
        Ok(self.state()?.discards.len())
    }

    /// Looks at the top `n` tokens without removing them, top first.
    pub fn peek(&self, n: usize) -> Result<Vec<Token>> {
        let state = self.state()?;
        Ok(state.stack.iter().rev().take(n).cloned().collect())
    }

    /// Draws `n` tokens from the top.
    ///
    /// Fails with [`BoardError::StackEmpty`] when `n` exceeds the remaining
    /// deck, unless `allow_short` is set, in which case what remains is
    /// returned. Drawn tokens move to the `drawn` compartment.
    pub fn draw(&self, n: usize, allow_short: bool) -> Result<Vec<Token>> {
        let drawn = self.chronicle.change_with("stack:draw", |draft| {
            let mut state: StackState = draft.get_record_or_default(&self.key)?;
            let drawn = draw_from_state(&mut state, n, allow_short)?;
            state.drawn.extend(drawn.iter().cloned());
            draft.put_record(&self.key, &state)?;
            Ok::<_, BoardError>(drawn)
        })?;
        self.emit(
            "stack:draw",
            serde_json::json!({
                "key": self.key,
                "count": drawn.len(),
                "ids": drawn.iter().map(|t| t.id.clone()).collect::<Vec<_>>(),
            }),
        );
        Ok(drawn)
    }

    /// Draws a single token from the top.
    pub fn draw_one(&self) -> Result<Token> {
        let mut drawn = self.draw(1, false)?;
        Ok(drawn.remove(0))
    }

    /// Removes up to `n` tokens from the top into the discard pile.
    pub fn burn(&self, n: usize) -> Result<Vec<Token>> {
        let burned = self.chronicle.change_with("stack:burn", |draft| {
            let mut state: StackState = draft.get_record_or_default(&self.key)?;
            let take = n.min(state.stack.len());
            let burned: Vec<Token> = state.stack.split_off(state.stack.len() - take);
            state.discards.extend(burned.iter().cloned());
            draft.put_record(&self.key, &state)?;
            Ok::<_, BoardError>(burned)
        })?;
        self.emit(
            "stack:burn",
            serde_json::json!({ "key": self.key, "count": burned.len() }),
        );
        Ok(burned)
    }

    /// Moves up to `n` tokens from the drawn pile into the discards.
    pub fn discard_from_drawn(&self, n: usize) -> Result<Vec<Token>> {
        self.chronicle.change_with("stack:discard", |draft| {
            let mut state: StackState = draft.get_record_or_default(&self.key)?;
            let take = n.min(state.drawn.len());
            let discarded: Vec<Token> = state.drawn.split_off(state.drawn.len() - take);
            state.discards.extend(discarded.iter().cloned());
            draft.put_record(&self.key, &state)?;
            Ok::<_, BoardError>(discarded)
        })
    }

    /// Seeded Fisher-Yates reorder of the live deck only.
    ///
    /// With no seed, a nondeterministic seed is generated and captured into
    /// the document so replay reproduces the order. Returns the seed used.
    pub fn shuffle(&self, seed: Option<&str>) -> Result<u32> {
        let seed32 = match seed {
            Some(s) => hash_seed(s),
            None => rand::random::<u32>(),
        };
        self.shuffle_seeded(seed32)?;
        Ok(seed32)
    }

    /// Shuffles with an explicit 32-bit seed.
    pub fn shuffle_seeded(&self, seed: u32) -> Result<()> {
        self.chronicle.change_with("stack:shuffle", |draft| {
            let mut state: StackState = draft.get_record_or_default(&self.key)?;
            Mulberry32::new(seed).shuffle(&mut state.stack);
            state.seed = Some(seed);
            draft.put_record(&self.key, &state)?;
            Ok::<_, BoardError>(())
        })?;
        self.emit(
            "stack:shuffle",
            serde_json::json!({ "key": self.key, "seed": seed }),
        );
        Ok(())
    }

    /// Returns drawn and discarded tokens to the live deck in the original
    /// insertion order (by token index), then emits `stack:reset`.
    pub fn reset(&self) -> Result<()> {
        self.chronicle.change_with("stack:reset", |draft| {
            let mut state: StackState = draft.get_record_or_default(&self.key)?;
            let mut all = std::mem::take(&mut state.stack);
            all.append(&mut state.drawn);
            all.append(&mut state.discards);
            all.sort_by_key(|t| t.index);
            state.stack = all;
            state.seed = None;
            draft.put_record(&self.key, &state)?;
            Ok::<_, BoardError>(())
        })?;
        self.emit("stack:reset", serde_json::json!({ "key": self.key }));
        Ok(())
    }

    /// Cuts the deck at `at`: the bottom `at` tokens move to the top.
    pub fn cut(&self, at: usize) -> Result<()> {
        self.chronicle.change_with("stack:cut", |draft| {
            let mut state: StackState = draft.get_record_or_default(&self.key)?;
            if at >= state.stack.len() {
                return Err(BoardError::IndexOutOfBounds(at));
            }
            let mut top = state.stack.split_off(at);
            top.append(&mut state.stack);
            state.stack = top;
            draft.put_record(&self.key, &state)?;
            Ok(())
        })
    }

    /// Swaps two tokens in the live deck by index.
    pub fn swap(&self, i: usize, j: usize) -> Result<()> {
        self.chronicle.change_with("stack:swap", |draft| {
            let mut state: StackState = draft.get_record_or_default(&self.key)?;
            let len = state.stack.len();
            if i >= len || j >= len {
                return Err(BoardError::IndexOutOfBounds(i.max(j)));
            }
            state.stack.swap(i, j);
            draft.put_record(&self.key, &state)?;
            Ok(())
        })?;
        self.emit(
            "stack:swap",
            serde_json::json!({ "key": self.key, "i": i, "j": j }),
        );
        Ok(())
    }

    /// Inserts a token at an index in the live deck.
    pub fn insert_at(&self, token: Token, at: usize) -> Result<()> {
        self.chronicle.change_with("stack:insert", |draft| {
            let mut state: StackState = draft.get_record_or_default(&self.key)?;
            if at > state.stack.len() {
                return Err(BoardError::IndexOutOfBounds(at));
            }
            state.stack.insert(at, token.clone());
            draft.put_record(&self.key, &state)?;
            Ok(())
        })?;
        self.emit("stack:insert", serde_json::json!({ "key": self.key, "at": at }));
        Ok(())
    }

    /// Removes and returns the token at an index in the live deck.
    pub fn remove_at(&self, at: usize) -> Result<Token> {
        self.chronicle.change_with("stack:remove", |draft| {
            let mut state: StackState = draft.get_record_or_default(&self.key)?;
            if at >= state.stack.len() {
                return Err(BoardError::IndexOutOfBounds(at));
            }
            let token = state.stack.remove(at);
            draft.put_record(&self.key, &state)?;
            Ok(token)
        })
    }

    /// Reverses the live deck order.
    pub fn reverse(&self) -> Result<()> {
        self.chronicle.change_with("stack:reverse", |draft| {
            let mut state: StackState = draft.get_record_or_default(&self.key)?;
            state.stack.reverse();
            draft.put_record(&self.key, &state)?;
            Ok::<_, BoardError>(())
        })
    }

    fn emit(&self, topic: &str, payload: serde_json::Value) {
        self.chronicle.bus().emit(topic, payload);
    }
}

/// Removes up to `n` tokens from the tail of the live deck.
///
/// Shared by [`Stack::draw`] and the source's cross-stack draw so both
/// enforce the same short-draw rule.
pub(crate) fn draw_from_state(
    state: &mut StackState,
    n: usize,
    allow_short: bool,
) -> Result<Vec<Token>> {
    let remaining = state.stack.len();
    if n > remaining && !allow_short {
        return Err(BoardError::StackEmpty {
            requested: n,
            remaining,
        });
    }
    let take = n.min(remaining);
    Ok(state.stack.split_off(remaining - take))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tessera_events::EventBus;

    fn fixture(n: usize) -> (Arc<Chronicle>, Stack) {
        let chronicle = Arc::new(Chronicle::new("test-peer", EventBus::new()));
        let tokens: Vec<Token> = (0..n)
            .map(|i| Token::new(format!("card-{i}"), i as i64))
            .collect();
        let stack = Stack::with_tokens(chronicle.clone(), STACK_KEY, tokens).unwrap();
        (chronicle, stack)
    }

    fn compartment_ids(stack: &Stack) -> HashSet<String> {
        let state = stack.state().unwrap();
        state
            .stack
            .iter()
            .chain(&state.drawn)
            .chain(&state.discards)
            .map(|t| t.id.clone())
            .collect()
    }

    #[test]
    fn test_draw_removes_from_top() {
        let (_c, stack) = fixture(5);
        let drawn = stack.draw(2, false).unwrap();
        assert_eq!(drawn[1].id, "card-4", "top of deck is the end");
        assert_eq!(stack.size().unwrap(), 3);
        assert_eq!(stack.drawn_count().unwrap(), 2);
    }

    #[test]
    fn test_overdraw_fails_without_allow_short() {
        let (_c, stack) = fixture(3);
        let err = stack.draw(5, false).unwrap_err();
        assert!(matches!(
            err,
            BoardError::StackEmpty {
                requested: 5,
                remaining: 3
            }
        ));
        // No partial corruption: all three compartments untouched.
        assert_eq!(stack.size().unwrap(), 3);
        assert_eq!(stack.drawn_count().unwrap(), 0);
    }

    #[test]
    fn test_overdraw_short_returns_remainder() {
        let (_c, stack) = fixture(3);
        let drawn = stack.draw(5, true).unwrap();
        assert_eq!(drawn.len(), 3);
        assert_eq!(stack.size().unwrap(), 0);
    }

    #[test]
    fn test_burn_moves_to_discards() {
        let (_c, stack) = fixture(4);
        let burned = stack.burn(2).unwrap();
        assert_eq!(burned.len(), 2);
        assert_eq!(stack.discard_count().unwrap(), 2);
        assert_eq!(stack.size().unwrap(), 2);
    }

    #[test]
    fn test_multiset_conservation() {
        let (_c, stack) = fixture(10);
        let initial = compartment_ids(&stack);

        stack.draw(3, false).unwrap();
        stack.burn(2).unwrap();
        stack.shuffle(Some("s")).unwrap();
        stack.cut(1).unwrap();
        stack.swap(0, 2).unwrap();
        stack.discard_from_drawn(1).unwrap();

        assert_eq!(compartment_ids(&stack), initial);
    }

    #[test]
    fn test_shuffle_is_seed_deterministic() {
        let (_c, a) = fixture(52);
        let (_c2, b) = fixture(52);
        a.shuffle(Some("seed-42")).unwrap();
        b.shuffle(Some("seed-42")).unwrap();
        let ids = |s: &Stack| {
            s.tokens()
                .unwrap()
                .iter()
                .map(|t| t.id.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&a), ids(&b));
    }

    #[test]
    fn test_shuffle_captures_seed_for_replay() {
        let (_c, stack) = fixture(10);
        let seed = stack.shuffle(None).unwrap();
        assert_eq!(stack.state().unwrap().seed, Some(seed));

        // Replaying the captured seed on a fresh deck reproduces the order.
        let (_c2, replay) = fixture(10);
        replay.shuffle_seeded(seed).unwrap();
        assert_eq!(
            stack.tokens().unwrap(),
            replay.tokens().unwrap()
        );
    }

    #[test]
    fn test_shuffle_single_element_noop() {
        let (_c, stack) = fixture(1);
        let before = stack.tokens().unwrap();
        stack.shuffle(Some("x")).unwrap();
        assert_eq!(stack.tokens().unwrap(), before);
    }

    #[test]
    fn test_reset_restores_original_order() {
        let (_c, stack) = fixture(6);
        stack.shuffle(Some("mix")).unwrap();
        stack.draw(2, false).unwrap();
        stack.burn(1).unwrap();

        stack.reset().unwrap();
        let ids: Vec<String> = stack.tokens().unwrap().iter().map(|t| t.id.clone()).collect();
        let expected: Vec<String> = (0..6).map(|i| format!("card-{i}")).collect();
        assert_eq!(ids, expected);
        assert_eq!(stack.drawn_count().unwrap(), 0);
        assert_eq!(stack.discard_count().unwrap(), 0);
    }

    #[test]
    fn test_peek_is_non_mutating() {
        let (_c, stack) = fixture(5);
        let peeked = stack.peek(2).unwrap();
        assert_eq!(peeked[0].id, "card-4", "peek returns top first");
        assert_eq!(stack.size().unwrap(), 5);
    }

    #[test]
    fn test_cut_rotates() {
        let (_c, stack) = fixture(3);
        stack.cut(1).unwrap();
        let ids: Vec<String> = stack.tokens().unwrap().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, ["card-1", "card-2", "card-0"]);
    }

    #[test]
    fn test_cut_out_of_bounds() {
        let (_c, stack) = fixture(3);
        assert!(matches!(
            stack.cut(3),
            Err(BoardError::IndexOutOfBounds(3))
        ));
    }

    #[test]
    fn test_insert_and_remove_at() {
        let (_c, stack) = fixture(2);
        stack.insert_at(Token::new("joker", 99), 1).unwrap();
        assert_eq!(stack.size().unwrap(), 3);
        let removed = stack.remove_at(1).unwrap();
        assert_eq!(removed.id, "joker");
        assert!(matches!(
            stack.remove_at(9),
            Err(BoardError::IndexOutOfBounds(9))
        ));
    }

    #[test]
    fn test_events_emitted() {
        let bus = EventBus::new();
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.on("*", move |e| {
            if e.topic.starts_with("stack:") {
                sink.lock().push(e.topic.clone());
            }
        })
        .detach();

        let chronicle = Arc::new(Chronicle::new("test-peer", bus));
        let tokens = vec![Token::new("a", 0), Token::new("b", 1)];
        let stack = Stack::with_tokens(chronicle, STACK_KEY, tokens).unwrap();
        stack.draw(1, false).unwrap();
        stack.shuffle(Some("s")).unwrap();
        stack.reset().unwrap();

        let topics = seen.lock();
        assert!(topics.contains(&"stack:draw".to_string()));
        assert!(topics.contains(&"stack:shuffle".to_string()));
        assert!(topics.contains(&"stack:reset".to_string()));
    }

    /// Recorded once from an independent implementation of the PRNG
    /// contract (xmur3 string hash, mulberry32, Fisher-Yates):
    /// `hash_seed("seed-42")` = 458356233, and the shuffled deck's top
    /// five cards in draw order are these. Any change to the hash, the
    /// generator, the shuffle, or the draw path breaks this vector.
    const DETERMINISTIC_DEAL: [&str; 5] =
        ["card-21", "card-13", "card-44", "card-15", "card-8"];

    #[test]
    fn test_deterministic_deal_reference_vector() {
        // A 52-token deck shuffled with "seed-42" must deal this exact
        // hand on every platform, byte-for-byte.
        let (_c, stack) = fixture(52);
        stack.shuffle(Some("seed-42")).unwrap();
        let drawn = stack.draw(5, false).unwrap();
        let ids: Vec<String> = drawn.iter().map(|t| t.id.clone()).collect();

        assert_eq!(ids, DETERMINISTIC_DEAL);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Draw(usize),
            Burn(usize),
            Discard(usize),
            Shuffle(u32),
            Cut(usize),
            Swap(usize, usize),
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                (1usize..4).prop_map(Op::Draw),
                (1usize..4).prop_map(Op::Burn),
                (1usize..4).prop_map(Op::Discard),
                any::<u32>().prop_map(Op::Shuffle),
                (0usize..10).prop_map(Op::Cut),
                ((0usize..10), (0usize..10)).prop_map(|(i, j)| Op::Swap(i, j)),
            ]
        }

        proptest! {
            // Any sequence of operations not including reset preserves
            // the multiset union of the three compartments.
            #[test]
            fn compartments_conserve_tokens(ops in proptest::collection::vec(op_strategy(), 0..24)) {
                let (_c, stack) = fixture(10);
                let initial = compartment_ids(&stack);

                for op in ops {
                    // Domain failures (overdraw, bad index) are fine;
                    // they must leave the compartments untouched either way.
                    let _ = match op {
                        Op::Draw(n) => stack.draw(n, false).map(|_| ()),
                        Op::Burn(n) => stack.burn(n).map(|_| ()),
                        Op::Discard(n) => stack.discard_from_drawn(n).map(|_| ()),
                        Op::Shuffle(seed) => stack.shuffle_seeded(seed),
                        Op::Cut(at) => stack.cut(at),
                        Op::Swap(i, j) => stack.swap(i, j),
                    };
                    prop_assert_eq!(compartment_ids(&stack), initial.clone());
                    prop_assert_eq!(stack.state().unwrap().total(), 10);
                }
            }

            // Reset then sort-by-index restores the pristine deck no
            // matter what happened before.
            #[test]
            fn reset_always_restores_insertion_order(ops in proptest::collection::vec(op_strategy(), 0..12)) {
                let (_c, stack) = fixture(8);
                for op in ops {
                    let _ = match op {
                        Op::Draw(n) => stack.draw(n, true).map(|_| ()),
                        Op::Burn(n) => stack.burn(n).map(|_| ()),
                        Op::Discard(n) => stack.discard_from_drawn(n).map(|_| ()),
                        Op::Shuffle(seed) => stack.shuffle_seeded(seed),
                        Op::Cut(at) => stack.cut(at),
                        Op::Swap(i, j) => stack.swap(i, j),
                    };
                }
                stack.reset().unwrap();
                let ids: Vec<String> =
                    stack.tokens().unwrap().iter().map(|t| t.id.clone()).collect();
                let expected: Vec<String> = (0..8).map(|i| format!("card-{i}")).collect();
                prop_assert_eq!(ids, expected);
            }
        }
    }
}

//! Builtin action packs covering the core action namespace.

use serde_json::{json, Value};
use tracing::info;

use tessera_board::{steal, trade, transfer, PlaceOptions, SpreadPattern, Stack, TradeOffer, TransferSpec};
use tessera_types::Token;

use crate::{ActionPack, Engine, EngineError};

/// Every builtin pack, in registration order.
pub fn standard_packs() -> Vec<ActionPack> {
    vec![
        stack_pack(),
        space_pack(),
        source_pack(),
        agent_pack(),
        rule_pack(),
        debug_pack(),
    ]
}

fn req_str<'a>(payload: &'a Value, key: &str) -> Result<&'a str, EngineError> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::InvalidPayload(format!("missing string field: {key}")))
}

fn req_usize(payload: &Value, key: &str) -> Result<usize, EngineError> {
    payload
        .get(key)
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .ok_or_else(|| EngineError::InvalidPayload(format!("missing integer field: {key}")))
}

fn opt_usize(payload: &Value, key: &str, default: usize) -> usize {
    payload
        .get(key)
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(default)
}

fn opt_bool(payload: &Value, key: &str, default: bool) -> bool {
    payload.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn opt_i64(payload: &Value, key: &str) -> Option<i64> {
    payload.get(key).and_then(Value::as_i64)
}

fn token_field(payload: &Value, key: &str) -> Result<Token, EngineError> {
    let value = payload
        .get(key)
        .cloned()
        .ok_or_else(|| EngineError::InvalidPayload(format!("missing token field: {key}")))?;
    serde_json::from_value(value)
        .map_err(|e| EngineError::InvalidPayload(format!("malformed token: {e}")))
}

fn place_options(payload: &Value) -> PlaceOptions {
    PlaceOptions {
        id: payload
            .get("placementId")
            .and_then(Value::as_str)
            .map(str::to_string),
        x: payload.get("x").and_then(Value::as_f64),
        y: payload.get("y").and_then(Value::as_f64),
        rotation: payload.get("rotation").and_then(Value::as_f64),
        face_up: payload.get("faceUp").and_then(Value::as_bool),
        meta: None,
    }
}

enum SeedArg {
    Captured(u32),
    Text(String),
    Absent,
}

fn seed_arg(payload: &Value) -> SeedArg {
    match payload.get("seed") {
        Some(Value::Number(n)) => SeedArg::Captured(n.as_u64().unwrap_or(0) as u32),
        Some(Value::String(s)) => SeedArg::Text(s.clone()),
        _ => SeedArg::Absent,
    }
}

/// `stack:*` handlers over the engine's default stack.
pub fn stack_pack() -> ActionPack {
    ActionPack::new("stack")
        .with("stack:draw", |engine, payload| {
            let explicit_count = payload.get("count").is_some();
            let count = opt_usize(payload, "count", 1);
            let allow_short = opt_bool(payload, "allowShort", false);
            let tokens = engine.stack().draw(count, allow_short)?;
            if explicit_count {
                Ok(json!(tokens))
            } else {
                Ok(json!(tokens.first()))
            }
        })
        .with("stack:burn", |engine, payload| {
            let count = opt_usize(payload, "count", 1);
            let burned = engine.stack().burn(count)?;
            Ok(json!(burned))
        })
        .with("stack:shuffle", |engine, payload| {
            let seed = match seed_arg(payload) {
                SeedArg::Captured(seed) => {
                    engine.stack().shuffle_seeded(seed)?;
                    seed
                }
                SeedArg::Text(text) => engine.stack().shuffle(Some(&text))?,
                SeedArg::Absent => engine.stack().shuffle(None)?,
            };
            Ok(json!({ "seed": seed }))
        })
        .with("stack:reset", |engine, _| {
            engine.stack().reset()?;
            Ok(Value::Null)
        })
        .with("stack:cut", |engine, payload| {
            engine.stack().cut(req_usize(payload, "at")?)?;
            Ok(Value::Null)
        })
        .with("stack:swap", |engine, payload| {
            engine
                .stack()
                .swap(req_usize(payload, "i")?, req_usize(payload, "j")?)?;
            Ok(Value::Null)
        })
        .with("stack:insert", |engine, payload| {
            let token = token_field(payload, "token")?;
            let at = opt_usize(payload, "at", engine.stack().size()?);
            engine.stack().insert_at(token, at)?;
            Ok(Value::Null)
        })
        .with("stack:peek", |engine, payload| {
            let count = opt_usize(payload, "count", 1);
            Ok(json!(engine.stack().peek(count)?))
        })
        .with("stack:discard", |engine, payload| {
            let count = opt_usize(payload, "count", 1);
            Ok(json!(engine.stack().discard_from_drawn(count)?))
        })
}

/// `space:*` handlers over the engine's shared space.
pub fn space_pack() -> ActionPack {
    ActionPack::new("space")
        .with("space:place", |engine, payload| {
            let zone = req_str(payload, "zone")?;
            let token = token_field(payload, "token")?;
            let placed = engine.space().place(zone, &token, place_options(payload))?;
            Ok(json!(placed))
        })
        .with("space:move", |engine, payload| {
            engine.space().move_placement(
                req_str(payload, "from")?,
                req_str(payload, "to")?,
                req_str(payload, "placementId")?,
                place_options(payload),
            )?;
            Ok(Value::Null)
        })
        .with("space:flip", |engine, payload| {
            let face_up = engine.space().flip(
                req_str(payload, "zone")?,
                req_str(payload, "placementId")?,
                payload.get("faceUp").and_then(Value::as_bool),
            )?;
            Ok(json!({ "faceUp": face_up }))
        })
        .with("space:remove", |engine, payload| {
            let removed = engine
                .space()
                .remove(req_str(payload, "zone")?, req_str(payload, "placementId")?)?;
            Ok(json!(removed))
        })
        .with("space:clear", |engine, payload| {
            let count = engine.space().clear_zone(req_str(payload, "zone")?)?;
            Ok(json!({ "count": count }))
        })
        .with("space:lock", |engine, payload| {
            let locked = opt_bool(payload, "locked", true);
            engine.space().lock_zone(req_str(payload, "zone")?, locked)?;
            Ok(json!({ "locked": locked }))
        })
        .with("space:transfer", |engine, payload| {
            let count = engine
                .space()
                .transfer_zone(req_str(payload, "from")?, req_str(payload, "to")?)?;
            Ok(json!({ "count": count }))
        })
        .with("space:shuffle", |engine, payload| {
            let zone = req_str(payload, "zone")?;
            let seed = match seed_arg(payload) {
                SeedArg::Captured(seed) => {
                    engine.space().shuffle_zone_seeded(zone, seed)?;
                    seed
                }
                SeedArg::Text(text) => engine.space().shuffle_zone(zone, Some(&text))?,
                SeedArg::Absent => engine.space().shuffle_zone(zone, None)?,
            };
            Ok(json!({ "seed": seed }))
        })
        .with("space:spread", |engine, payload| {
            let zone = req_str(payload, "zone")?;
            let pattern = spread_pattern(payload)?;
            let count = engine.space().spread_zone(zone, pattern)?;
            Ok(json!({ "count": count }))
        })
}

fn spread_pattern(payload: &Value) -> Result<SpreadPattern, EngineError> {
    let origin_x = payload.get("originX").and_then(Value::as_f64).unwrap_or(0.0);
    let origin_y = payload.get("originY").and_then(Value::as_f64).unwrap_or(0.0);
    match req_str(payload, "pattern")? {
        "linear" => Ok(SpreadPattern::Linear {
            origin_x,
            origin_y,
            spacing: payload.get("spacing").and_then(Value::as_f64).unwrap_or(30.0),
        }),
        "arc" => Ok(SpreadPattern::Arc {
            center_x: origin_x,
            center_y: origin_y,
            radius: payload.get("radius").and_then(Value::as_f64).unwrap_or(100.0),
            start_angle: payload
                .get("startAngle")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            angle_step: payload
                .get("angleStep")
                .and_then(Value::as_f64)
                .unwrap_or(15.0),
        }),
        "grid" => Ok(SpreadPattern::Grid {
            origin_x,
            origin_y,
            cols: opt_usize(payload, "cols", 4),
            col_spacing: payload
                .get("colSpacing")
                .and_then(Value::as_f64)
                .unwrap_or(30.0),
            row_spacing: payload
                .get("rowSpacing")
                .and_then(Value::as_f64)
                .unwrap_or(40.0),
        }),
        other => Err(EngineError::InvalidPayload(format!(
            "unknown spread pattern: {other}"
        ))),
    }
}

/// `source:*` handlers over the engine's installed source.
pub fn source_pack() -> ActionPack {
    fn source_of(engine: &Engine) -> Result<tessera_board::Source, EngineError> {
        engine
            .source()
            .ok_or_else(|| EngineError::IllegalMove("no source installed".into()))
    }

    ActionPack::new("source")
        .with("source:draw", |engine, payload| {
            let count = opt_usize(payload, "count", 1);
            let allow_short = opt_bool(payload, "allowShort", false);
            let tokens = source_of(engine)?.draw(count, allow_short)?;
            Ok(json!(tokens))
        })
        .with("source:burn", |engine, payload| {
            let count = opt_usize(payload, "count", 1);
            Ok(json!(source_of(engine)?.burn(count)?))
        })
        .with("source:shuffle", |engine, payload| {
            let source = source_of(engine)?;
            let seed = match seed_arg(payload) {
                SeedArg::Captured(seed) => {
                    source.shuffle_seeded(seed)?;
                    seed
                }
                SeedArg::Text(text) => source.shuffle(Some(&text))?,
                SeedArg::Absent => source.shuffle(None)?,
            };
            Ok(json!({ "seed": seed }))
        })
        .with("source:reshuffle", |engine, payload| {
            let source = source_of(engine)?;
            match seed_arg(payload) {
                SeedArg::Captured(seed) => source.reshuffle_seeded(Some(seed))?,
                SeedArg::Text(text) => source.reshuffle(Some(&text))?,
                SeedArg::Absent => source.reshuffle(None)?,
            }
            Ok(Value::Null)
        })
}

/// `agent:*` handlers.
pub fn agent_pack() -> ActionPack {
    fn agent_of(engine: &Engine, id: &str) -> Result<tessera_board::Agent, EngineError> {
        engine
            .agent(id)
            .ok_or_else(|| EngineError::IllegalMove(format!("agent not found: {id}")))
    }

    fn transfer_spec(payload: &Value) -> TransferSpec {
        TransferSpec {
            resource: payload
                .get("resource")
                .and_then(Value::as_str)
                .map(str::to_string),
            amount: opt_i64(payload, "amount"),
            token_id: payload
                .get("token")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }

    fn trade_offer(payload: &Value) -> TradeOffer {
        TradeOffer {
            resource: payload
                .get("resource")
                .and_then(Value::as_str)
                .map(str::to_string),
            amount: opt_i64(payload, "amount").unwrap_or(0),
            token_ids: payload
                .get("tokens")
                .and_then(Value::as_array)
                .map(|ids| {
                    ids.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    ActionPack::new("agent")
        .with("agent:create", |engine, payload| {
            let id = req_str(payload, "id")?;
            let name = payload.get("name").and_then(Value::as_str).unwrap_or(id);
            let agent = engine.create_agent(id, name)?;
            Ok(serde_json::to_value(agent.state()?)
                .map_err(|e| EngineError::InvalidPayload(e.to_string()))?)
        })
        .with("agent:draw", |engine, payload| {
            let agent = agent_of(engine, req_str(payload, "id")?)?;
            let count = opt_usize(payload, "count", 1);
            let allow_short = opt_bool(payload, "allowShort", false);
            let stack = match agent.state()?.stack_key {
                Some(key) => Stack::with_key(engine.chronicle().clone(), key),
                None => engine.stack().clone(),
            };
            Ok(json!(agent.draw_from(&stack, count, allow_short)?))
        })
        .with("agent:discard", |engine, payload| {
            let agent = agent_of(engine, req_str(payload, "id")?)?;
            Ok(json!(agent.discard_from_hand(None)?))
        })
        .with("agent:beginTurn", |engine, payload| {
            let agent = agent_of(engine, req_str(payload, "id")?)?;
            let turns = agent.begin_turn()?;
            Ok(json!({ "turns": turns }))
        })
        .with("agent:endTurn", |engine, payload| {
            let agent = agent_of(engine, req_str(payload, "id")?)?;
            agent.end_turn()?;
            Ok(Value::Null)
        })
        .with("agent:transfer", |engine, payload| {
            let outcome = transfer(
                engine.chronicle(),
                req_str(payload, "from")?,
                req_str(payload, "to")?,
                &transfer_spec(payload),
            )?;
            Ok(json!({
                "success": outcome.success,
                "amount": outcome.amount,
                "tokenId": outcome.token_id,
            }))
        })
        .with("agent:trade", |engine, payload| {
            let side1 = payload
                .get("agent1")
                .ok_or_else(|| EngineError::InvalidPayload("missing agent1".into()))?;
            let side2 = payload
                .get("agent2")
                .ok_or_else(|| EngineError::InvalidPayload("missing agent2".into()))?;
            let offer1 = side1.get("offer").cloned().unwrap_or(Value::Null);
            let offer2 = side2.get("offer").cloned().unwrap_or(Value::Null);
            trade(
                engine.chronicle(),
                req_str(side1, "name")?,
                &trade_offer(&offer1),
                req_str(side2, "name")?,
                &trade_offer(&offer2),
            )?;
            Ok(json!({ "success": true }))
        })
        .with("agent:steal", |engine, payload| {
            let outcome = steal(
                engine.chronicle(),
                req_str(payload, "from")?,
                req_str(payload, "to")?,
                &transfer_spec(payload),
                opt_bool(payload, "validate", true),
            )?;
            Ok(json!({
                "success": outcome.success,
                "stolen": { "amount": outcome.amount, "tokenId": outcome.token_id },
            }))
        })
}

/// `rule:*` handlers toggling policies registered in code.
pub fn rule_pack() -> ActionPack {
    ActionPack::new("rule")
        .with("rule:add", |engine, payload| {
            let name = req_str(payload, "name")?;
            Ok(json!({ "enabled": engine.enable_policy(name, true) }))
        })
        .with("rule:remove", |engine, payload| {
            let name = req_str(payload, "name")?;
            Ok(json!({ "removed": engine.remove_policy(name) }))
        })
        .with("rule:reset", |engine, _| {
            engine.reset_policies()?;
            Ok(Value::Null)
        })
}

/// `debug:log`.
pub fn debug_pack() -> ActionPack {
    ActionPack::new("debug").with("debug:log", |engine, payload| {
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        info!(message = %message, "debug:log");
        engine
            .bus()
            .emit("debug:log", json!({ "message": message }));
        Ok(Value::Null)
    })
}

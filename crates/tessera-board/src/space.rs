//! Named zones holding positioned, optionally face-down placements.

use std::sync::Arc;
use uuid::Uuid;

use tessera_chronicle::{Chronicle, DocDraft};
use tessera_types::{
    hash_seed, Metadata, Mulberry32, PlacementRecord, Token, ZoneState, ZONE_PREFIX,
};

use crate::{BoardError, Result, Stack};

/// Options for placing or moving a token.
#[derive(Debug, Clone, Default)]
pub struct PlaceOptions {
    /// Explicit placement id; minted when absent. Dispatch captures the
    /// minted id into the action payload so replay reproduces it.
    pub id: Option<String>,
    /// Horizontal coordinate, unitless.
    pub x: Option<f64>,
    /// Vertical coordinate, unitless.
    pub y: Option<f64>,
    /// Rotation in degrees.
    pub rotation: Option<f64>,
    /// Face-up override; defaults to the zone's policy.
    pub face_up: Option<bool>,
    /// Metadata merged over the placement's existing entries.
    pub meta: Option<Metadata>,
}

/// Deterministic layout patterns for [`Space::spread_zone`].
///
/// Coordinates are a pure function of placement index and the pattern
/// parameters.
#[derive(Debug, Clone, Copy)]
pub enum SpreadPattern {
    /// Evenly spaced along a horizontal line.
    Linear {
        origin_x: f64,
        origin_y: f64,
        spacing: f64,
    },
    /// Fanned along a circular arc; placements are rotated to face outward.
    Arc {
        center_x: f64,
        center_y: f64,
        radius: f64,
        start_angle: f64,
        angle_step: f64,
    },
    /// Row-major grid with a fixed column count.
    Grid {
        origin_x: f64,
        origin_y: f64,
        cols: usize,
        col_spacing: f64,
        row_spacing: f64,
    },
}

/// A mapping from zone name to an ordered sequence of placements.
///
/// Zones are created lazily on first reference and stored one document key
/// per zone, so concurrent edits to different zones merge cleanly.
#[derive(Clone)]
pub struct Space {
    chronicle: Arc<Chronicle>,
}

fn zone_key(name: &str) -> String {
    format!("{ZONE_PREFIX}{name}")
}

impl Space {
    /// Attaches a space to a chronicle.
    pub fn new(chronicle: Arc<Chronicle>) -> Self {
        Self { chronicle }
    }

    /// Current state of a zone, if it exists.
    pub fn zone(&self, name: &str) -> Result<Option<ZoneState>> {
        Ok(self.chronicle.get_record(&zone_key(name))?)
    }

    /// Placements of a zone in order; empty for unknown zones.
    pub fn placements(&self, name: &str) -> Result<Vec<PlacementRecord>> {
        Ok(self.zone(name)?.map(|z| z.placements).unwrap_or_default())
    }

    /// Names of all existing zones.
    pub fn zones(&self) -> Vec<String> {
        match self.chronicle.state().get("zones") {
            Some(serde_json::Value::Object(zones)) => zones.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Appends a token to a zone.
    ///
    /// Returns `None` when the zone is locked; the space is untouched.
    pub fn place(
        &self,
        zone: &str,
        token: &Token,
        opts: PlaceOptions,
    ) -> Result<Option<PlacementRecord>> {
        let placed = self.chronicle.change_with("space:place", |draft| {
            place_in_draft(draft, zone, token, &opts)
        })?;
        if let Some(ref record) = placed {
            self.emit(
                "space:place",
                serde_json::json!({
                    "zone": zone,
                    "placementId": record.id,
                    "tokenId": record.token_id,
                }),
            );
        }
        Ok(placed)
    }

    /// Moves a placement between zones, preserving its id and merging
    /// `opts` over its existing fields.
    pub fn move_placement(
        &self,
        from: &str,
        to: &str,
        placement_id: &str,
        opts: PlaceOptions,
    ) -> Result<()> {
        self.chronicle.change_with("space:move", |draft| {
            let mut src: ZoneState = draft
                .get_record(&zone_key(from))?
                .ok_or_else(|| BoardError::ZoneNotFound(from.to_string()))?;
            if src.locked {
                return Err(BoardError::ZoneLocked(from.to_string()));
            }
            let index = src
                .placements
                .iter()
                .position(|p| p.id == placement_id)
                .ok_or_else(|| BoardError::PlacementNotFound {
                    zone: from.to_string(),
                    id: placement_id.to_string(),
                })?;
            let mut record = src.placements.remove(index);
            apply_options(&mut record, &opts);

            if from == to {
                src.placements.push(record);
                draft.put_record(&zone_key(from), &src)?;
            } else {
                let mut dst: ZoneState = draft.get_record_or_default(&zone_key(to))?;
                if dst.locked {
                    return Err(BoardError::ZoneLocked(to.to_string()));
                }
                dst.placements.push(record);
                draft.put_record(&zone_key(from), &src)?;
                draft.put_record(&zone_key(to), &dst)?;
            }
            Ok(())
        })?;
        self.emit(
            "space:move",
            serde_json::json!({ "from": from, "to": to, "placementId": placement_id }),
        );
        Ok(())
    }

    /// Toggles or sets a placement's face-up flag; returns the new value.
    pub fn flip(&self, zone: &str, placement_id: &str, face_up: Option<bool>) -> Result<bool> {
        let new_value = self.chronicle.change_with("space:flip", |draft| {
            let mut state: ZoneState = draft
                .get_record(&zone_key(zone))?
                .ok_or_else(|| BoardError::ZoneNotFound(zone.to_string()))?;
            let record = state
                .placements
                .iter_mut()
                .find(|p| p.id == placement_id)
                .ok_or_else(|| BoardError::PlacementNotFound {
                    zone: zone.to_string(),
                    id: placement_id.to_string(),
                })?;
            record.face_up = face_up.unwrap_or(!record.face_up);
            let value = record.face_up;
            draft.put_record(&zone_key(zone), &state)?;
            Ok::<_, BoardError>(value)
        })?;
        self.emit(
            "space:flip",
            serde_json::json!({ "zone": zone, "placementId": placement_id, "faceUp": new_value }),
        );
        Ok(new_value)
    }

    /// Removes a placement from a zone; fails on locked zones.
    pub fn remove(&self, zone: &str, placement_id: &str) -> Result<PlacementRecord> {
        let removed = self.chronicle.change_with("space:remove", |draft| {
            let mut state: ZoneState = draft
                .get_record(&zone_key(zone))?
                .ok_or_else(|| BoardError::ZoneNotFound(zone.to_string()))?;
            if state.locked {
                return Err(BoardError::ZoneLocked(zone.to_string()));
            }
            let index = state
                .placements
                .iter()
                .position(|p| p.id == placement_id)
                .ok_or_else(|| BoardError::PlacementNotFound {
                    zone: zone.to_string(),
                    id: placement_id.to_string(),
                })?;
            let record = state.placements.remove(index);
            draft.put_record(&zone_key(zone), &state)?;
            Ok(record)
        })?;
        self.emit(
            "space:remove",
            serde_json::json!({ "zone": zone, "placementId": placement_id }),
        );
        Ok(removed)
    }

    /// Empties a zone; returns the number of placements removed.
    pub fn clear_zone(&self, zone: &str) -> Result<usize> {
        let cleared = self.chronicle.change_with("space:clear", |draft| {
            let Some(mut state) = draft.get_record::<ZoneState>(&zone_key(zone))? else {
                return Ok::<_, BoardError>(0);
            };
            let count = state.placements.len();
            state.placements.clear();
            draft.put_record(&zone_key(zone), &state)?;
            Ok(count)
        })?;
        self.emit("space:clear", serde_json::json!({ "zone": zone, "count": cleared }));
        Ok(cleared)
    }

    /// Deletes a zone entirely; returns whether it existed.
    pub fn delete_zone(&self, zone: &str) -> Result<bool> {
        self.chronicle.change_with("space:delete", |draft| {
            Ok::<_, BoardError>(draft.remove(&zone_key(zone)))
        })
    }

    /// Sets a zone's locked flag, creating the zone if needed.
    pub fn lock_zone(&self, zone: &str, locked: bool) -> Result<()> {
        self.chronicle.change_with("space:lock", |draft| {
            let mut state: ZoneState = draft.get_record_or_default(&zone_key(zone))?;
            state.locked = locked;
            draft.put_record(&zone_key(zone), &state)?;
            Ok::<_, BoardError>(())
        })?;
        self.emit("space:lock", serde_json::json!({ "zone": zone, "locked": locked }));
        Ok(())
    }

    /// Bulk-moves every placement from `src` to `dst`, preserving order.
    ///
    /// Returns the number moved; fails on a locked source or destination.
    pub fn transfer_zone(&self, src: &str, dst: &str) -> Result<usize> {
        let moved = self.chronicle.change_with("space:transfer", |draft| {
            let Some(mut src_state) = draft.get_record::<ZoneState>(&zone_key(src))? else {
                return Ok(0);
            };
            if src_state.locked {
                return Err(BoardError::ZoneLocked(src.to_string()));
            }
            let mut dst_state: ZoneState = draft.get_record_or_default(&zone_key(dst))?;
            if dst_state.locked {
                return Err(BoardError::ZoneLocked(dst.to_string()));
            }
            let count = src_state.placements.len();
            dst_state.placements.append(&mut src_state.placements);
            draft.put_record(&zone_key(src), &src_state)?;
            draft.put_record(&zone_key(dst), &dst_state)?;
            Ok(count)
        })?;
        self.emit(
            "space:transfer",
            serde_json::json!({ "from": src, "to": dst, "count": moved }),
        );
        Ok(moved)
    }

    /// Seeded reorder of a zone's placements; returns the seed used.
    pub fn shuffle_zone(&self, zone: &str, seed: Option<&str>) -> Result<u32> {
        let seed32 = match seed {
            Some(s) => hash_seed(s),
            None => rand::random::<u32>(),
        };
        self.shuffle_zone_seeded(zone, seed32)?;
        Ok(seed32)
    }

    /// Reorders a zone with an explicit 32-bit seed.
    pub fn shuffle_zone_seeded(&self, zone: &str, seed32: u32) -> Result<()> {
        self.chronicle.change_with("space:shuffle", |draft| {
            let mut state: ZoneState = draft
                .get_record(&zone_key(zone))?
                .ok_or_else(|| BoardError::ZoneNotFound(zone.to_string()))?;
            Mulberry32::new(seed32).shuffle(&mut state.placements);
            draft.put_record(&zone_key(zone), &state)?;
            Ok::<_, BoardError>(())
        })?;
        self.emit("space:shuffle", serde_json::json!({ "zone": zone, "seed": seed32 }));
        Ok(())
    }

    /// Recomputes coordinates and rotation for every placement in a zone
    /// from its index and the pattern parameters.
    pub fn spread_zone(&self, zone: &str, pattern: SpreadPattern) -> Result<usize> {
        let count = self.chronicle.change_with("space:spread", |draft| {
            let mut state: ZoneState = draft
                .get_record(&zone_key(zone))?
                .ok_or_else(|| BoardError::ZoneNotFound(zone.to_string()))?;
            for (index, record) in state.placements.iter_mut().enumerate() {
                let (x, y, rotation) = spread_position(&pattern, index);
                record.x = Some(x);
                record.y = Some(y);
                record.rotation = Some(rotation);
            }
            let count = state.placements.len();
            draft.put_record(&zone_key(zone), &state)?;
            Ok::<_, BoardError>(count)
        })?;
        self.emit("space:spread", serde_json::json!({ "zone": zone, "count": count }));
        Ok(count)
    }

    /// Removes up to `n` placements from the end of a zone.
    pub fn draw_from_zone(&self, zone: &str, n: usize) -> Result<Vec<PlacementRecord>> {
        self.chronicle.change_with("space:draw", |draft| {
            let Some(mut state) = draft.get_record::<ZoneState>(&zone_key(zone))? else {
                return Ok(Vec::new());
            };
            if state.locked {
                return Err(BoardError::ZoneLocked(zone.to_string()));
            }
            let take = n.min(state.placements.len());
            let drawn = state.placements.split_off(state.placements.len() - take);
            draft.put_record(&zone_key(zone), &state)?;
            Ok(drawn)
        })
    }

    /// Places a batch of tokens into a zone with default options.
    pub fn push_to_zone(&self, zone: &str, tokens: &[Token]) -> Result<Vec<PlacementRecord>> {
        self.chronicle.change_with("space:push", |draft| {
            let mut placed = Vec::with_capacity(tokens.len());
            for token in tokens {
                match place_in_draft(draft, zone, token, &PlaceOptions::default())? {
                    Some(record) => placed.push(record),
                    None => return Err(BoardError::ZoneLocked(zone.to_string())),
                }
            }
            Ok(placed)
        })
    }

    /// Returns up to `n` placements from a zone to the top of a stack.
    ///
    /// One atomic change across the zone and the stack's document key.
    pub fn return_to_stack(&self, stack: &Stack, zone: &str, n: usize) -> Result<usize> {
        self.chronicle.change_with("space:return", |draft| {
            let Some(mut state) = draft.get_record::<ZoneState>(&zone_key(zone))? else {
                return Ok(0);
            };
            if state.locked {
                return Err(BoardError::ZoneLocked(zone.to_string()));
            }
            let take = n.min(state.placements.len());
            let returned = state.placements.split_off(state.placements.len() - take);

            let mut deck: tessera_types::StackState =
                draft.get_record_or_default(stack.key())?;
            deck.stack.extend(returned.into_iter().map(|p| p.token));
            draft.put_record(&zone_key(zone), &state)?;
            draft.put_record(stack.key(), &deck)?;
            Ok(take)
        })
    }

    /// Drains every unlocked zone into a stack; returns the count collected.
    pub fn collect_all_into(&self, stack: &Stack) -> Result<usize> {
        self.chronicle.change_with("space:collect", |draft| {
            let zone_keys: Vec<String> = draft
                .keys()
                .filter(|k| k.starts_with(ZONE_PREFIX))
                .map(|k| k.to_string())
                .collect();
            let mut deck: tessera_types::StackState =
                draft.get_record_or_default(stack.key())?;
            let mut collected = 0;
            for key in zone_keys {
                let mut state: ZoneState = draft.get_record_or_default(&key)?;
                if state.locked {
                    continue;
                }
                collected += state.placements.len();
                deck.stack
                    .extend(state.placements.drain(..).map(|p| p.token));
                draft.put_record(&key, &state)?;
            }
            draft.put_record(stack.key(), &deck)?;
            Ok::<_, BoardError>(collected)
        })
    }

    fn emit(&self, topic: &str, payload: serde_json::Value) {
        self.chronicle.bus().emit(topic, payload);
    }
}

/// Appends a placement to a zone inside an open draft.
///
/// Shared with the agent's play-card path so both honor zone locking and
/// face-up defaults identically. Returns `None` when the zone is locked.
pub(crate) fn place_in_draft(
    draft: &mut DocDraft,
    zone: &str,
    token: &Token,
    opts: &PlaceOptions,
) -> Result<Option<PlacementRecord>> {
    let mut state: ZoneState = draft.get_record_or_default(&zone_key(zone))?;
    if state.locked {
        return Ok(None);
    }
    let record = PlacementRecord {
        id: opts
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        token_id: token.id.clone(),
        token: token.clone(),
        x: opts.x,
        y: opts.y,
        rotation: opts.rotation,
        face_up: opts.face_up.unwrap_or(state.face_up_default),
        meta: opts.meta.clone().unwrap_or_default(),
    };
    state.placements.push(record.clone());
    draft.put_record(&zone_key(zone), &state)?;
    Ok(Some(record))
}

fn apply_options(record: &mut PlacementRecord, opts: &PlaceOptions) {
    if opts.x.is_some() {
        record.x = opts.x;
    }
    if opts.y.is_some() {
        record.y = opts.y;
    }
    if opts.rotation.is_some() {
        record.rotation = opts.rotation;
    }
    if let Some(face_up) = opts.face_up {
        record.face_up = face_up;
    }
    if let Some(ref meta) = opts.meta {
        record.meta.extend(meta.clone());
    }
}

fn spread_position(pattern: &SpreadPattern, index: usize) -> (f64, f64, f64) {
    match *pattern {
        SpreadPattern::Linear {
            origin_x,
            origin_y,
            spacing,
        } => (origin_x + spacing * index as f64, origin_y, 0.0),
        SpreadPattern::Arc {
            center_x,
            center_y,
            radius,
            start_angle,
            angle_step,
        } => {
            let angle = start_angle + angle_step * index as f64;
            let radians = angle.to_radians();
            (
                center_x + radius * radians.cos(),
                center_y + radius * radians.sin(),
                angle,
            )
        }
        SpreadPattern::Grid {
            origin_x,
            origin_y,
            cols,
            col_spacing,
            row_spacing,
        } => {
            let cols = cols.max(1);
            let col = index % cols;
            let row = index / cols;
            (
                origin_x + col_spacing * col as f64,
                origin_y + row_spacing * row as f64,
                0.0,
            )
        }
    }
}

//! Map objects returned to scan callers and the raw upstream map payload

use serde::{Deserialize, Serialize};

/// A scan target
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

impl Location {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Kind of a map object. Serialized as its numeric code (1, 2, 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ObjectKind {
    Pokemon,
    Pokestop,
    Gym,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 3] = [ObjectKind::Pokemon, ObjectKind::Pokestop, ObjectKind::Gym];
}

impl From<ObjectKind> for u8 {
    fn from(kind: ObjectKind) -> u8 {
        match kind {
            ObjectKind::Pokemon => 1,
            ObjectKind::Pokestop => 2,
            ObjectKind::Gym => 3,
        }
    }
}

impl TryFrom<u8> for ObjectKind {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(ObjectKind::Pokemon),
            2 => Ok(ObjectKind::Pokestop),
            3 => Ok(ObjectKind::Gym),
            other => Err(format!("unknown object kind {}", other)),
        }
    }
}

/// An object observed on the map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapObject {
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    pub id: String,
    #[serde(rename = "pokemonID", default, skip_serializing_if = "is_zero_u32")]
    pub pokemon_id: u32,
    #[serde(skip)]
    pub spawnpoint_id: String,
    pub lat: f64,
    pub lng: f64,
    /// Unix seconds; 0 for objects that never expire
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub expiry: i64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub lured: bool,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub team: u32,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Response envelope of the scanner endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResponse {
    pub ok: bool,
    pub error: String,
    pub map_objects: Vec<MapObject>,
}

impl ScanResponse {
    pub fn success(map_objects: Vec<MapObject>) -> Self {
        Self {
            ok: true,
            error: String::new(),
            map_objects,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: error.into(),
            map_objects: Vec::new(),
        }
    }
}

// ============================================================================
// Upstream payload
// ============================================================================

/// Raw map response as delivered by the upstream client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapPayload {
    #[serde(default)]
    pub cells: Vec<MapCell>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapCell {
    #[serde(default)]
    pub wild_pokemon: Vec<WildPokemon>,
    #[serde(default)]
    pub forts: Vec<Fort>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WildPokemon {
    pub encounter_id: u64,
    pub pokemon_id: u32,
    #[serde(default)]
    pub spawn_point_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub time_till_hidden_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FortKind {
    Checkpoint,
    Gym,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fort {
    pub id: String,
    pub kind: FortKind,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub lure: Option<LureInfo>,
    /// Whether a modifier (lure module) is active on a checkpoint
    #[serde(default)]
    pub active_modifier: bool,
    #[serde(default)]
    pub owned_by_team: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LureInfo {
    pub encounter_id: u64,
    pub active_pokemon_id: u32,
    pub lure_expires_timestamp_ms: i64,
}

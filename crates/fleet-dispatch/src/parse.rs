//! Turns a raw upstream map payload into the objects returned to callers

use chrono::{DateTime, TimeDelta, Utc};
use fleet_proto::{FortKind, MapObject, MapPayload, ObjectKind};

/// Sightings claiming to stay visible longer than this are bogus
const MAX_VISIBLE_MINUTES: i64 = 15;

pub fn parse_map_objects(payload: &MapPayload) -> Vec<MapObject> {
    parse_map_objects_at(payload, Utc::now())
}

/// Same as [`parse_map_objects`], with expiries computed relative to `now`
pub fn parse_map_objects_at(payload: &MapPayload, now: DateTime<Utc>) -> Vec<MapObject> {
    let horizon = (now + TimeDelta::minutes(MAX_VISIBLE_MINUTES)).timestamp();
    let mut objects = Vec::new();

    for cell in &payload.cells {
        for pokemon in &cell.wild_pokemon {
            let Some(expiry) = expiry_after(now, pokemon.time_till_hidden_ms) else {
                continue;
            };
            if expiry > horizon {
                continue;
            }
            objects.push(MapObject {
                kind: ObjectKind::Pokemon,
                id: to_base36(pokemon.encounter_id),
                pokemon_id: pokemon.pokemon_id,
                spawnpoint_id: pokemon.spawn_point_id.clone(),
                lat: pokemon.latitude,
                lng: pokemon.longitude,
                expiry,
                lured: false,
                team: 0,
            });
        }

        for fort in &cell.forts {
            match fort.kind {
                FortKind::Checkpoint => {
                    if let Some(lure) = &fort.lure {
                        objects.push(MapObject {
                            kind: ObjectKind::Pokemon,
                            id: to_base36(lure.encounter_id),
                            pokemon_id: lure.active_pokemon_id,
                            spawnpoint_id: String::new(),
                            lat: fort.latitude,
                            lng: fort.longitude,
                            expiry: lure.lure_expires_timestamp_ms / 1000,
                            lured: false,
                            team: 0,
                        });
                    }
                    objects.push(MapObject {
                        kind: ObjectKind::Pokestop,
                        id: fort.id.clone(),
                        pokemon_id: 0,
                        spawnpoint_id: String::new(),
                        lat: fort.latitude,
                        lng: fort.longitude,
                        expiry: 0,
                        lured: fort.active_modifier,
                        team: 0,
                    });
                }
                FortKind::Gym => objects.push(MapObject {
                    kind: ObjectKind::Gym,
                    id: fort.id.clone(),
                    pokemon_id: 0,
                    spawnpoint_id: String::new(),
                    lat: fort.latitude,
                    lng: fort.longitude,
                    expiry: 0,
                    lured: false,
                    team: fort.owned_by_team,
                }),
            }
        }
    }

    objects
}

/// Unix time `ms` milliseconds after `now`, or `None` when out of range
fn expiry_after(now: DateTime<Utc>, ms: i64) -> Option<i64> {
    let delta = TimeDelta::try_milliseconds(ms)?;
    now.checked_add_signed(delta).map(|at| at.timestamp())
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

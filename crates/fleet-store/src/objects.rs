//! Persistence of observed map objects

use async_trait::async_trait;
use fleet_proto::{MapObject, ObjectKind};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::InventoryError;

/// Sink for objects observed by scans
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Insert or replace objects by id
    async fn add_map_objects(&self, objects: &[MapObject]) -> Result<(), InventoryError>;

    /// Known, unexpired objects of the given kinds
    async fn get_map_objects(&self, kinds: &[ObjectKind]) -> Result<Vec<MapObject>, InventoryError>;
}

/// In-memory object store keyed by object id
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<String, MapObject>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn add_map_objects(&self, objects: &[MapObject]) -> Result<(), InventoryError> {
        let mut stored = self.objects.write().await;
        for object in objects {
            stored.insert(object.id.clone(), object.clone());
        }
        Ok(())
    }

    async fn get_map_objects(&self, kinds: &[ObjectKind]) -> Result<Vec<MapObject>, InventoryError> {
        let now = chrono::Utc::now().timestamp();
        let stored = self.objects.read().await;
        Ok(stored
            .values()
            .filter(|o| kinds.contains(&o.kind))
            .filter(|o| o.expiry == 0 || o.expiry > now)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(id: &str, kind: ObjectKind, expiry: i64) -> MapObject {
        MapObject {
            kind,
            id: id.to_string(),
            pokemon_id: 0,
            spawnpoint_id: String::new(),
            lat: 0.0,
            lng: 0.0,
            expiry,
            lured: false,
            team: 0,
        }
    }

    #[tokio::test]
    async fn test_upsert_by_id() {
        let store = InMemoryObjectStore::new();
        store
            .add_map_objects(&[object("x", ObjectKind::Gym, 0)])
            .await
            .unwrap();
        let mut updated = object("x", ObjectKind::Gym, 0);
        updated.team = 3;
        store.add_map_objects(&[updated]).await.unwrap();

        assert_eq!(store.len().await, 1);
        let gyms = store.get_map_objects(&[ObjectKind::Gym]).await.unwrap();
        assert_eq!(gyms[0].team, 3);
    }

    #[tokio::test]
    async fn test_expired_and_filtered_objects_are_hidden() {
        let store = InMemoryObjectStore::new();
        let future = chrono::Utc::now().timestamp() + 600;
        store
            .add_map_objects(&[
                object("expired", ObjectKind::Pokemon, 1),
                object("alive", ObjectKind::Pokemon, future),
                object("stop", ObjectKind::Pokestop, 0),
            ])
            .await
            .unwrap();

        let pokemon = store
            .get_map_objects(&[ObjectKind::Pokemon])
            .await
            .unwrap();
        assert_eq!(pokemon.len(), 1);
        assert_eq!(pokemon[0].id, "alive");

        let all = store.get_map_objects(&ObjectKind::ALL).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}

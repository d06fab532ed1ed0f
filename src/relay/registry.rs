//! Entity → endpoint directory kept by the relay.

use super::protocol::{DisplayMeta, EntityListing, EntityMeta, SortMode, PAGE_SIZE};
use crate::utils::RelayError;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Endpoint {
    id: String,
    meta: DisplayMeta,
}

/// Directory of live endpoints per entity
///
/// The sorted view used for paging is rebuilt lazily, only after the set of
/// endpoints changed or a different sort mode is asked for.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    entities: HashMap<String, Vec<Endpoint>>,
    owners: HashMap<String, String>,
    sorted: Vec<EntityListing>,
    sorted_by: SortMode,
    dirty: bool,
}

impl EndpointRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `endpoint_id` for `entity_id`
    ///
    /// # Errors
    ///
    /// `RelayError::AlreadyRegistered` if the endpoint is already registered
    pub fn register(
        &mut self,
        entity_id: &str,
        endpoint_id: &str,
        meta: DisplayMeta,
    ) -> Result<(), RelayError> {
        if self.owners.contains_key(endpoint_id) {
            return Err(RelayError::AlreadyRegistered {
                endpoint_id: endpoint_id.to_string(),
            });
        }

        self.owners
            .insert(endpoint_id.to_string(), entity_id.to_string());
        self.entities
            .entry(entity_id.to_string())
            .or_default()
            .push(Endpoint {
                id: endpoint_id.to_string(),
                meta,
            });
        self.dirty = true;
        Ok(())
    }

    /// Remove an endpoint; entities left without endpoints are forgotten
    pub fn unregister(&mut self, endpoint_id: &str) -> Option<String> {
        let entity_id = self.owners.remove(endpoint_id)?;

        if let Some(endpoints) = self.entities.get_mut(&entity_id) {
            endpoints.retain(|e| e.id != endpoint_id);
            if endpoints.is_empty() {
                self.entities.remove(&entity_id);
            }
        }
        self.sorted.retain(|row| row.client_id != endpoint_id);
        Some(entity_id)
    }

    /// Resolve an entity to its first registered endpoint
    pub fn resolve(&self, entity_id: &str) -> EntityMeta {
        match self.entities.get(entity_id).and_then(|e| e.first()) {
            Some(endpoint) => EntityMeta {
                id: entity_id.to_string(),
                available: true,
                client_id: Some(endpoint.id.clone()),
                name: Some(endpoint.meta.name.clone()),
                avatar: endpoint.meta.avatar.clone(),
            },
            None => EntityMeta::unavailable(entity_id),
        }
    }

    /// One page of the directory
    pub fn list(&mut self, page: usize, sort: SortMode) -> Vec<EntityListing> {
        if self.dirty || sort != self.sorted_by {
            self.rebuild(sort);
        }

        self.sorted
            .iter()
            .skip(page.saturating_mul(PAGE_SIZE))
            .take(PAGE_SIZE)
            .cloned()
            .collect()
    }

    /// Entity owning `endpoint_id`
    pub fn owner(&self, endpoint_id: &str) -> Option<&str> {
        self.owners.get(endpoint_id).map(String::as_str)
    }

    /// Number of live endpoints
    pub fn endpoint_count(&self) -> usize {
        self.owners.len()
    }

    fn rebuild(&mut self, sort: SortMode) {
        self.sorted = self
            .entities
            .iter()
            .flat_map(|(entity_id, endpoints)| {
                endpoints.iter().map(move |e| EntityListing {
                    id: entity_id.clone(),
                    client_id: e.id.clone(),
                    name: e.meta.name.clone(),
                    avatar: e.meta.avatar.clone(),
                })
            })
            .collect();

        match sort {
            SortMode::ByName => self.sorted.sort_by(|a, b| {
                a.name
                    .to_lowercase()
                    .cmp(&b.name.to_lowercase())
                    .then_with(|| a.id.cmp(&b.id))
                    .then_with(|| a.client_id.cmp(&b.client_id))
            }),
            SortMode::ById => self
                .sorted
                .sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.client_id.cmp(&b.client_id))),
        }

        self.sorted_by = sort;
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str) -> DisplayMeta {
        DisplayMeta {
            name: name.to_string(),
            avatar: None,
        }
    }

    #[test]
    fn test_register_twice_fails() {
        let mut registry = EndpointRegistry::new();
        registry.register("a1", "ep-1", meta("Alice")).unwrap();

        let err = registry.register("a2", "ep-1", meta("Other")).unwrap_err();
        assert_eq!(
            err,
            RelayError::AlreadyRegistered {
                endpoint_id: "ep-1".to_string()
            }
        );
        assert_eq!(registry.owner("ep-1"), Some("a1"));
    }

    #[test]
    fn test_first_endpoint_is_authoritative() {
        let mut registry = EndpointRegistry::new();
        registry.register("a1", "ep-1", meta("Alice phone")).unwrap();
        registry.register("a1", "ep-2", meta("Alice laptop")).unwrap();

        let resolved = registry.resolve("a1");
        assert!(resolved.available);
        assert_eq!(resolved.client_id.as_deref(), Some("ep-1"));

        registry.unregister("ep-1");
        assert_eq!(registry.resolve("a1").client_id.as_deref(), Some("ep-2"));

        registry.unregister("ep-2");
        assert!(!registry.resolve("a1").available);
        assert_eq!(registry.endpoint_count(), 0);
    }

    #[test]
    fn test_list_sorted_by_name_and_paged() {
        let mut registry = EndpointRegistry::new();
        for i in 0..60 {
            registry
                .register(&format!("e{i:02}"), &format!("ep{i}"), meta(&format!("user {:02}", 59 - i)))
                .unwrap();
        }

        let first = registry.list(0, SortMode::ByName);
        assert_eq!(first.len(), PAGE_SIZE);
        assert_eq!(first[0].name, "user 00");
        assert_eq!(first[0].id, "e59");

        let second = registry.list(1, SortMode::ByName);
        assert_eq!(second.len(), 10);
        assert!(registry.list(2, SortMode::ByName).is_empty());

        let by_id = registry.list(0, SortMode::ById);
        assert_eq!(by_id[0].id, "e00");
    }

    #[test]
    fn test_unregister_updates_sorted_view() {
        let mut registry = EndpointRegistry::new();
        registry.register("a1", "ep-1", meta("Alice")).unwrap();
        registry.register("b1", "ep-2", meta("Bob")).unwrap();
        assert_eq!(registry.list(0, SortMode::ByName).len(), 2);

        assert_eq!(registry.unregister("ep-1").as_deref(), Some("a1"));
        let rows = registry.list(0, SortMode::ByName);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "b1");
        assert_eq!(registry.unregister("ep-unknown"), None);
    }
}

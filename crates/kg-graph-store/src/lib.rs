#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kg-graph-store** – Property graph adapter (C4).
//!
//! The graph store never invents a node. Every relationship upsert must
//! reference entity ids that were already upserted as REAL nodes
//! (see [`kg_types::EntityRecord::is_real`]); an edge pointing at an
//! unknown or placeholder id is rejected rather than silently creating a
//! stub node, which is the anti-pattern that leaves orphaned "unknown"
//! nodes scattered across a graph.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use kg_net::{retry, FailureClass, RetryPolicy};
use kg_types::{EntityRecord, EntityType, RelationshipRecord};
use tracing::debug;
use url::Url;

//─────────────────────────────
//  Client trait
//─────────────────────────────

/// Errors surfaced by a [`GraphStoreClient`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum GraphStoreError {
    /// The entity is not a REAL node (empty or `"unknown"` name) and was
    /// rejected rather than written as a placeholder.
    #[error("refusing to upsert placeholder node {0}")]
    PlaceholderNode(String),
    /// A relationship referenced an entity id that has never been
    /// upserted as a node. Never retried — the caller ordered its writes
    /// wrong.
    #[error("relationship references unknown entity id {0}")]
    UnknownEndpoint(String),
    /// A relationship's source and target were the same entity id.
    #[error("relationship {0} is a self-loop")]
    SelfLoop(String),
    /// The transport or remote service failed.
    #[error("graph store request failed: {0}")]
    Transport(String),
    /// The remote service returned a response this client couldn't parse.
    #[error("failed to decode graph store response: {0}")]
    Decode(String),
}

impl GraphStoreError {
    /// Classify this error for [`kg_net::retry`]: structural violations
    /// are never retried, transport failures are.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            GraphStoreError::Transport(_) | GraphStoreError::Decode(_) => FailureClass::Transient,
            _ => FailureClass::Fatal,
        }
    }
}

/// Adapter to a property graph store, keyed by deterministic entity ids
/// from `kg-identity`.
#[async_trait]
pub trait GraphStoreClient: Send + Sync {
    /// MERGE-by-id upsert of a node. Rejects placeholder entities.
    async fn upsert_node(&self, entity: EntityRecord) -> Result<(), GraphStoreError>;

    /// MERGE-by-id upsert of an edge. Both endpoints must already exist as
    /// nodes; self-loops are rejected.
    async fn upsert_relationship(&self, relationship: RelationshipRecord) -> Result<(), GraphStoreError>;

    /// Resolve `(project, path)` to the entity_id of the indexed FILE node
    /// at that path, for import-resolution callers. `None` if no FILE has
    /// been upserted at that path yet.
    async fn lookup_entity_id(&self, project: &str, path: &str) -> Result<Option<String>, GraphStoreError>;

    /// Total node count, surfaced on `/metrics`.
    async fn node_count(&self) -> Result<u64, GraphStoreError>;

    /// FILE nodes with zero incoming and zero outgoing relationships.
    async fn detect_orphans(&self) -> Result<HashSet<String>, GraphStoreError>;
}

//─────────────────────────────
//  HTTP implementation
//─────────────────────────────

#[derive(Debug, serde::Serialize)]
struct UpsertNodeRequest<'a> {
    entity_id: &'a str,
    label: &'static str,
    name: &'a str,
    description: Option<&'a str>,
    project_name: &'a str,
    source_path: &'a str,
}

#[derive(Debug, serde::Serialize)]
struct UpsertRelationshipRequest<'a> {
    relationship_id: &'a str,
    source_entity_id: &'a str,
    target_entity_id: &'a str,
    relationship_type: &'static str,
    strength: f32,
}

#[derive(Debug, serde::Deserialize)]
struct ExistsResponse {
    exists: bool,
}

#[derive(Debug, serde::Deserialize)]
struct LookupResponse {
    entity_id: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Debug, serde::Deserialize)]
struct OrphansResponse {
    orphan_entity_ids: Vec<String>,
}

/// HTTP-backed [`GraphStoreClient`] for a Cypher/Gremlin-style property
/// graph exposed over a thin REST facade.
pub struct HttpGraphStore {
    client: reqwest::Client,
    base_url: Url,
    retry_policy: RetryPolicy,
}

impl HttpGraphStore {
    /// Construct a client against `base_url`.
    pub fn new(base_url: Url, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client builder should not fail with static config"),
            base_url,
            retry_policy: RetryPolicy::default(),
        }
    }

    fn url(&self, path: &str) -> Result<Url, GraphStoreError> {
        self.base_url
            .join(path)
            .map_err(|e| GraphStoreError::Transport(e.to_string()))
    }

    /// Does a node with `entity_id` currently exist? Used to enforce the
    /// known-endpoint invariant before an edge write, distinct from the
    /// public `(project, path)` lookup import resolution uses.
    async fn node_exists(&self, entity_id: &str) -> Result<bool, GraphStoreError> {
        let url = self.url(&format!("/nodes/{entity_id}/exists"))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| GraphStoreError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(GraphStoreError::Transport(format!(
                "existence check returned status {}",
                response.status()
            )));
        }
        let decoded: ExistsResponse = response
            .json()
            .await
            .map_err(|e| GraphStoreError::Decode(e.to_string()))?;
        Ok(decoded.exists)
    }
}

#[async_trait]
impl GraphStoreClient for HttpGraphStore {
    async fn upsert_node(&self, entity: EntityRecord) -> Result<(), GraphStoreError> {
        if !entity.is_real() {
            return Err(GraphStoreError::PlaceholderNode(entity.entity_id));
        }
        let url = self.url("/nodes")?;
        let body = UpsertNodeRequest {
            entity_id: &entity.entity_id,
            label: entity.entity_type.graph_label(),
            name: &entity.name,
            description: entity.description.as_deref(),
            project_name: &entity.project_name,
            source_path: &entity.source_path,
        };
        retry(
            self.retry_policy,
            |e: &GraphStoreError| e.failure_class(),
            || async {
                let response = self
                    .client
                    .put(url.clone())
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| GraphStoreError::Transport(e.to_string()))?;
                if !response.status().is_success() {
                    return Err(GraphStoreError::Transport(format!(
                        "node upsert returned status {}",
                        response.status()
                    )));
                }
                Ok(())
            },
        )
        .await
    }

    async fn upsert_relationship(&self, relationship: RelationshipRecord) -> Result<(), GraphStoreError> {
        if relationship.is_self_loop() {
            return Err(GraphStoreError::SelfLoop(relationship.relationship_id));
        }
        if !self.node_exists(&relationship.source_entity_id).await? {
            return Err(GraphStoreError::UnknownEndpoint(relationship.source_entity_id));
        }
        if !self.node_exists(&relationship.target_entity_id).await? {
            return Err(GraphStoreError::UnknownEndpoint(relationship.target_entity_id));
        }

        let url = self.url("/relationships")?;
        let body = UpsertRelationshipRequest {
            relationship_id: &relationship.relationship_id,
            source_entity_id: &relationship.source_entity_id,
            target_entity_id: &relationship.target_entity_id,
            relationship_type: relationship.relationship_type.as_str(),
            strength: relationship.strength,
        };
        retry(
            self.retry_policy,
            |e: &GraphStoreError| e.failure_class(),
            || async {
                let response = self
                    .client
                    .put(url.clone())
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| GraphStoreError::Transport(e.to_string()))?;
                if !response.status().is_success() {
                    return Err(GraphStoreError::Transport(format!(
                        "relationship upsert returned status {}",
                        response.status()
                    )));
                }
                Ok(())
            },
        )
        .await
    }

    async fn lookup_entity_id(&self, project: &str, path: &str) -> Result<Option<String>, GraphStoreError> {
        let url = self.url("/files/lookup")?;
        let response = self
            .client
            .get(url)
            .query(&[("project", project), ("path", path)])
            .send()
            .await
            .map_err(|e| GraphStoreError::Transport(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(GraphStoreError::Transport(format!(
                "file lookup returned status {}",
                response.status()
            )));
        }
        let decoded: LookupResponse = response
            .json()
            .await
            .map_err(|e| GraphStoreError::Decode(e.to_string()))?;
        Ok(decoded.entity_id)
    }

    async fn node_count(&self) -> Result<u64, GraphStoreError> {
        let url = self.url("/nodes/count")?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| GraphStoreError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(GraphStoreError::Transport(format!(
                "count returned status {}",
                response.status()
            )));
        }
        let decoded: CountResponse = response
            .json()
            .await
            .map_err(|e| GraphStoreError::Decode(e.to_string()))?;
        Ok(decoded.count)
    }

    async fn detect_orphans(&self) -> Result<HashSet<String>, GraphStoreError> {
        let url = self.url("/files/orphans")?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| GraphStoreError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(GraphStoreError::Transport(format!(
                "orphan check returned status {}",
                response.status()
            )));
        }
        let decoded: OrphansResponse = response
            .json()
            .await
            .map_err(|e| GraphStoreError::Decode(e.to_string()))?;
        Ok(decoded.orphan_entity_ids.into_iter().collect())
    }
}

//─────────────────────────────
//  In-memory test double
//─────────────────────────────

/// In-memory [`GraphStoreClient`] used by tests and local development. It
/// enforces exactly the same no-placeholder, known-endpoint, no-self-loop
/// invariants as [`HttpGraphStore`].
#[derive(Default)]
pub struct InMemoryGraphStore {
    nodes: Mutex<HashMap<String, EntityRecord>>,
    relationships: Mutex<HashMap<String, RelationshipRecord>>,
    /// `(project_name, source_path) -> entity_id` for FILE nodes, the index
    /// `lookup_entity_id` resolves against.
    file_index: Mutex<HashMap<(String, String), String>>,
}

impl InMemoryGraphStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphStoreClient for InMemoryGraphStore {
    async fn upsert_node(&self, entity: EntityRecord) -> Result<(), GraphStoreError> {
        if !entity.is_real() {
            return Err(GraphStoreError::PlaceholderNode(entity.entity_id));
        }
        debug!(entity_id = %entity.entity_id, "upserting in-memory graph node");
        if entity.entity_type == EntityType::File {
            self.file_index
                .lock()
                .expect("in-memory graph store mutex poisoned")
                .insert((entity.project_name.clone(), entity.source_path.clone()), entity.entity_id.clone());
        }
        self.nodes
            .lock()
            .expect("in-memory graph store mutex poisoned")
            .insert(entity.entity_id.clone(), entity);
        Ok(())
    }

    async fn upsert_relationship(&self, relationship: RelationshipRecord) -> Result<(), GraphStoreError> {
        if relationship.is_self_loop() {
            return Err(GraphStoreError::SelfLoop(relationship.relationship_id));
        }
        {
            let nodes = self.nodes.lock().expect("in-memory graph store mutex poisoned");
            if !nodes.contains_key(&relationship.source_entity_id) {
                return Err(GraphStoreError::UnknownEndpoint(relationship.source_entity_id));
            }
            if !nodes.contains_key(&relationship.target_entity_id) {
                return Err(GraphStoreError::UnknownEndpoint(relationship.target_entity_id));
            }
        }
        self.relationships
            .lock()
            .expect("in-memory graph store mutex poisoned")
            .insert(relationship.relationship_id.clone(), relationship);
        Ok(())
    }

    async fn lookup_entity_id(&self, project: &str, path: &str) -> Result<Option<String>, GraphStoreError> {
        Ok(self
            .file_index
            .lock()
            .expect("in-memory graph store mutex poisoned")
            .get(&(project.to_string(), path.to_string()))
            .cloned())
    }

    async fn node_count(&self) -> Result<u64, GraphStoreError> {
        Ok(self.nodes.lock().expect("in-memory graph store mutex poisoned").len() as u64)
    }

    async fn detect_orphans(&self) -> Result<HashSet<String>, GraphStoreError> {
        let nodes = self.nodes.lock().expect("in-memory graph store mutex poisoned");
        let relationships = self
            .relationships
            .lock()
            .expect("in-memory graph store mutex poisoned");
        let mut orphans = HashSet::new();
        for node in nodes.values() {
            if node.entity_type != EntityType::File {
                continue;
            }
            let has_edge = relationships
                .values()
                .any(|rel| rel.source_entity_id == node.entity_id || rel.target_entity_id == node.entity_id);
            if !has_edge {
                orphans.insert(node.entity_id.clone());
            }
        }
        Ok(orphans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kg_types::{EntityType, ExtractionMetadata, RelationshipType};
    use std::collections::BTreeMap;

    fn real_entity(id: &str) -> EntityRecord {
        EntityRecord {
            entity_id: id.to_string(),
            entity_type: EntityType::File,
            name: "main.py".to_string(),
            description: None,
            project_name: "demo".to_string(),
            source_path: format!("/src/{id}.py"),
            extraction: ExtractionMetadata {
                method: "test".to_string(),
                confidence: 1.0,
                file_hash: "x".to_string(),
            },
        }
    }

    fn relationship(src: &str, tgt: &str) -> RelationshipRecord {
        RelationshipRecord {
            relationship_id: kg_identity::relationship_id(src, RelationshipType::Contains.as_str(), tgt),
            source_entity_id: src.to_string(),
            target_entity_id: tgt.to_string(),
            relationship_type: RelationshipType::Contains,
            strength: 1.0,
            context: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn placeholder_node_is_rejected() {
        let store = InMemoryGraphStore::new();
        let mut placeholder = real_entity("file_aaa");
        placeholder.name = "unknown".to_string();
        let err = store.upsert_node(placeholder).await.unwrap_err();
        assert!(matches!(err, GraphStoreError::PlaceholderNode(_)));
    }

    #[tokio::test]
    async fn relationship_to_unknown_endpoint_is_rejected() {
        let store = InMemoryGraphStore::new();
        store.upsert_node(real_entity("file_aaa")).await.unwrap();
        let err = store
            .upsert_relationship(relationship("file_aaa", "file_bbb"))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphStoreError::UnknownEndpoint(_)));
    }

    #[tokio::test]
    async fn rejected_relationship_creates_no_placeholder_target() {
        let store = InMemoryGraphStore::new();
        store.upsert_node(real_entity("file_aaa")).await.unwrap();
        assert!(store
            .upsert_relationship(relationship("file_aaa", "file_bbb"))
            .await
            .is_err());
        assert_eq!(store.node_count().await.unwrap(), 1);
        assert_eq!(
            store.lookup_entity_id("demo", "/src/file_bbb.py").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn file_node_with_no_relationships_is_an_orphan() {
        let store = InMemoryGraphStore::new();
        store.upsert_node(real_entity("file_aaa")).await.unwrap();
        let orphans = store.detect_orphans().await.unwrap();
        assert_eq!(orphans, HashSet::from(["file_aaa".to_string()]));
    }

    #[tokio::test]
    async fn self_loop_is_rejected() {
        let store = InMemoryGraphStore::new();
        store.upsert_node(real_entity("file_aaa")).await.unwrap();
        let err = store
            .upsert_relationship(relationship("file_aaa", "file_aaa"))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphStoreError::SelfLoop(_)));
    }

    #[tokio::test]
    async fn valid_relationship_between_real_nodes_succeeds() {
        let store = InMemoryGraphStore::new();
        store.upsert_node(real_entity("dir_aaa")).await.unwrap();
        store.upsert_node(real_entity("file_bbb")).await.unwrap();
        store
            .upsert_relationship(relationship("dir_aaa", "file_bbb"))
            .await
            .unwrap();
        assert!(store.detect_orphans().await.unwrap().is_empty());
        assert_eq!(store.node_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn lookup_entity_id_resolves_an_upserted_file() {
        let store = InMemoryGraphStore::new();
        store.upsert_node(real_entity("file_aaa")).await.unwrap();
        assert_eq!(
            store.lookup_entity_id("demo", "/src/file_aaa.py").await.unwrap(),
            Some("file_aaa".to_string())
        );
        assert_eq!(store.lookup_entity_id("other-project", "/src/file_aaa.py").await.unwrap(), None);
    }

    #[tokio::test]
    async fn reupserting_same_node_id_is_idempotent() {
        let store = InMemoryGraphStore::new();
        store.upsert_node(real_entity("file_aaa")).await.unwrap();
        store.upsert_node(real_entity("file_aaa")).await.unwrap();
        assert_eq!(store.node_count().await.unwrap(), 1);
    }
}

#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kg-types** – Shared primitive data structures for the knowledge-graph
//! enrichment pipeline.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that every other crate can depend on it without causing cycles.
//! It intentionally makes no assumptions about I/O, the bus transport, or
//! which vector index / graph store product is behind the adapters.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

//─────────────────────────────
//  File record
//─────────────────────────────

/// A single source file discovered by the (out-of-scope) bulk ingester and
/// carried on the bus as part of an enrichment request.
///
/// `(project_name, absolute_path)` uniquely identifies a file across the
/// fleet; re-ingesting identical `content` is a no-op at the store
/// adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Absolute path — identity-bearing together with `project_name`.
    pub absolute_path: String,
    /// Logical project this file belongs to.
    pub project_name: String,
    /// Path relative to the project root.
    pub relative_path: String,
    /// Raw file content.
    pub content: Vec<u8>,
    /// Best-effort language tag (e.g. `"python"`), empty if unknown.
    pub language: String,
    /// Last-modified timestamp as reported by the ingester.
    pub last_modified: DateTime<Utc>,
}

impl FileRecord {
    /// Content hash used for identity derivation and idempotent upserts.
    ///
    /// BLAKE3 of the raw bytes, hex-encoded. Distinct from the entity id
    /// hash, which additionally mixes in path and project.
    pub fn content_hash(&self) -> String {
        blake3::hash(&self.content).to_hex().to_string()
    }

    /// Size of the file content in bytes.
    pub fn size_bytes(&self) -> usize {
        self.content.len()
    }
}

//─────────────────────────────
//  Closed label / type enums
//─────────────────────────────

/// Closed, case-exact set of entity types. Any code path that writes a
/// graph label MUST source it from this enum — raw string literals are
/// forbidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum EntityType {
    /// A source file.
    File,
    /// A filesystem directory.
    Directory,
    /// A project / repository root. Intentionally all-caps label.
    Project,
    /// A function definition.
    Function,
    /// A class definition.
    Class,
    /// A method definition.
    Method,
    /// A variable binding.
    Variable,
    /// An abstract concept extracted by the intelligence service.
    Concept,
    /// A recognised design/code pattern.
    Pattern,
    /// A standalone code example.
    CodeExample,
    /// A prose document.
    Document,
}

impl EntityType {
    /// Case-exact graph label from the closed set
    /// (`File, Directory, PROJECT, Function, Class, Method, Variable,
    /// Concept, Pattern, CodeExample, Document`).
    pub const fn graph_label(self) -> &'static str {
        match self {
            EntityType::File => "File",
            EntityType::Directory => "Directory",
            EntityType::Project => "PROJECT",
            EntityType::Function => "Function",
            EntityType::Class => "Class",
            EntityType::Method => "Method",
            EntityType::Variable => "Variable",
            EntityType::Concept => "Concept",
            EntityType::Pattern => "Pattern",
            EntityType::CodeExample => "CodeExample",
            EntityType::Document => "Document",
        }
    }

    /// Entity-id prefix used by `kg-identity` (e.g. `file_`, `func_`).
    pub const fn id_prefix(self) -> &'static str {
        match self {
            EntityType::File => "file",
            EntityType::Directory => "dir",
            EntityType::Project => "project",
            EntityType::Function => "func",
            EntityType::Class => "class",
            EntityType::Method => "method",
            EntityType::Variable => "var",
            EntityType::Concept => "concept",
            EntityType::Pattern => "pattern",
            EntityType::CodeExample => "example",
            EntityType::Document => "doc",
        }
    }
}

/// Every currently defined [`EntityType`] variant, used to keep the label
/// enum, the id-prefix set, and exhaustiveness tests in lock-step as the
/// single source of truth for the closed label set.
pub const ALL_ENTITY_TYPES: &[EntityType] = &[
    EntityType::File,
    EntityType::Directory,
    EntityType::Project,
    EntityType::Function,
    EntityType::Class,
    EntityType::Method,
    EntityType::Variable,
    EntityType::Concept,
    EntityType::Pattern,
    EntityType::CodeExample,
    EntityType::Document,
];

/// Closed set of relationship types a `RelationshipRecord` may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum RelationshipType {
    /// Structural containment (directory → file, file → entity).
    Contains,
    /// Import/reference edge resolved across files.
    Imports,
    /// A file defines a contained entity.
    Defines,
    /// Cross-agent/coordination edge (reserved for future orchestration use).
    Coordinates,
    /// Interface implementation edge.
    Implements,
    /// Loose semantic relation surfaced by the intelligence service.
    RelatesTo,
    /// Entity-to-concept edge.
    HasConcept,
    /// Dependency edge between entities.
    DependsOn,
}

impl RelationshipType {
    /// Stable wire name, used in relationship payloads and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            RelationshipType::Contains => "CONTAINS",
            RelationshipType::Imports => "IMPORTS",
            RelationshipType::Defines => "DEFINES",
            RelationshipType::Coordinates => "COORDINATES",
            RelationshipType::Implements => "IMPLEMENTS",
            RelationshipType::RelatesTo => "RELATES_TO",
            RelationshipType::HasConcept => "HAS_CONCEPT",
            RelationshipType::DependsOn => "DEPENDS_ON",
        }
    }
}

//─────────────────────────────
//  Entity / relationship records
//─────────────────────────────

/// How an entity was discovered, recorded for observability/debugging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionMetadata {
    /// Extraction method, e.g. `"tree-sitter"` or `"intelligence-service"`.
    pub method: String,
    /// Confidence in `[0, 1]` reported by the extractor.
    pub confidence: f32,
    /// Content hash of the source file at extraction time.
    pub file_hash: String,
}

/// A typed node destined for the graph store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Deterministic identifier, see `kg-identity`.
    pub entity_id: String,
    /// Entity type — determines the graph label via [`EntityType::graph_label`].
    pub entity_type: EntityType,
    /// Human-readable name. MUST NOT be `"unknown"` for a REAL node.
    pub name: String,
    /// Optional free-text description.
    pub description: Option<String>,
    /// Owning project, required on every node so the graph store can index
    /// FILE nodes by `(project_name, source_path)` for import resolution.
    pub project_name: String,
    /// Source file this entity was extracted from (its own absolute path,
    /// for a FILE entity).
    pub source_path: String,
    /// Extraction provenance.
    pub extraction: ExtractionMetadata,
}

impl EntityRecord {
    /// A REAL node: populated name, not the `"unknown"` sentinel used by
    /// the placeholder anti-pattern.
    pub fn is_real(&self) -> bool {
        !self.name.trim().is_empty() && self.name != "unknown"
    }
}

/// A typed edge destined for the graph store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    /// Deterministic identifier, see `kg-identity`.
    pub relationship_id: String,
    /// Source endpoint entity id.
    pub source_entity_id: String,
    /// Target endpoint entity id.
    pub target_entity_id: String,
    /// Relationship type.
    pub relationship_type: RelationshipType,
    /// Strength in `[0, 1]`.
    pub strength: f32,
    /// Arbitrary context carried alongside the edge.
    pub context: BTreeMap<String, String>,
}

impl RelationshipRecord {
    /// Structural invariant: an edge may never be a self-loop.
    pub fn is_self_loop(&self) -> bool {
        self.source_entity_id == self.target_entity_id
    }
}

//─────────────────────────────
//  Vector record
//─────────────────────────────

/// Payload stored alongside a vector point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorPayload {
    /// Absolute path of the indexed file.
    pub absolute_path: String,
    /// Path relative to the project root.
    pub relative_path: String,
    /// Logical project name.
    pub project_name: String,
    /// Project root path.
    pub project_root: String,
    /// RFC 3339 UTC timestamp of indexing.
    pub indexed_at: DateTime<Utc>,
    /// Quality score reported by the intelligence service.
    pub quality_score: f32,
    /// ONEX compliance score reported by the intelligence service.
    pub onex_compliance: f32,
    /// Ordered list of concepts, truncated to at most 5.
    pub concepts: Vec<String>,
    /// Ordered list of themes, truncated to at most 5.
    pub themes: Vec<String>,
}

/// Maximum number of ordered `concepts`/`themes` entries.
pub const MAX_PAYLOAD_LIST_LEN: usize = 5;

impl VectorPayload {
    /// Build a payload, truncating `concepts`/`themes` to
    /// [`MAX_PAYLOAD_LIST_LEN`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        absolute_path: String,
        relative_path: String,
        project_name: String,
        project_root: String,
        indexed_at: DateTime<Utc>,
        quality_score: f32,
        onex_compliance: f32,
        mut concepts: Vec<String>,
        mut themes: Vec<String>,
    ) -> Self {
        concepts.truncate(MAX_PAYLOAD_LIST_LEN);
        themes.truncate(MAX_PAYLOAD_LIST_LEN);
        Self {
            absolute_path,
            relative_path,
            project_name,
            project_root,
            indexed_at,
            quality_score,
            onex_compliance,
            concepts,
            themes,
        }
    }
}

/// A point written to the vector store's `file_locations` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Deterministic point id — low 64 bits of the content+project hash.
    pub point_id: u64,
    /// Embedding vector; dimension must match the collection configuration.
    pub embedding: Vec<f32>,
    /// Payload metadata.
    pub payload: VectorPayload,
}

//─────────────────────────────
//  Event envelope
//─────────────────────────────

/// Recognised bus event types. The `...Completed`/`...Failed` variants
/// are pass-through lifecycle events that carry no payload validation
/// contract (see `kg_schema::EventClass::Lifecycle`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum EventType {
    /// Legacy single-file analysis request.
    CodeAnalysisRequested,
    /// Single-file or batch enrichment request.
    EnrichDocumentRequested,
    /// Bulk project ingest request.
    TreeIndexProjectRequested,
    /// Per-file enrichment success.
    EnrichmentFileCompleted,
    /// Per-file terminal failure.
    EnrichmentFileFailed,
    /// Project-level ingest success.
    TreeIndexProjectCompleted,
    /// Project-level ingest failure.
    TreeIndexProjectFailed,
    /// Anything not in the recognised set above.
    Unrecognised,
}

/// Envelope carried by every bus message.
///
/// Every log line and every emitted event for one ingestion run MUST carry
/// the same `correlation_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Correlation id propagated unchanged across all derived events.
    pub correlation_id: Uuid,
    /// Logical event type.
    pub event_type: EventType,
    /// Bus topic the message was read from / will be published to.
    pub topic: String,
    /// RFC 3339 UTC timestamp.
    pub timestamp: DateTime<Utc>,
    /// Arbitrary, event-type-specific payload.
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Build a derived envelope (e.g. a completion event) that propagates
    /// the same correlation id.
    pub fn derive(
        &self,
        event_type: EventType,
        topic: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            correlation_id: self.correlation_id,
            event_type,
            topic: topic.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

//─────────────────────────────
//  Well-known topic names
//─────────────────────────────

/// Logical bus topic names recognised by the pipeline.
pub mod topics {
    /// Single-file or batch enrichment requests.
    pub const ENRICHMENT_FILE_REQUESTED: &str = "enrichment.file.requested.v1";
    /// Per-file success.
    pub const ENRICHMENT_FILE_COMPLETED: &str = "enrichment.file.completed.v1";
    /// Per-file terminal failure.
    pub const ENRICHMENT_FILE_FAILED: &str = "enrichment.file.failed.v1";
    /// Bulk project ingest request.
    pub const TREE_INDEX_PROJECT_REQUESTED: &str = "tree.index-project.requested.v1";
    /// Project-level success.
    pub const TREE_INDEX_PROJECT_COMPLETED: &str = "tree.index-project.completed.v1";
    /// Project-level failure.
    pub const TREE_INDEX_PROJECT_FAILED: &str = "tree.index-project.failed.v1";
}

#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kg-orchestrator** – Enrichment orchestrator (C5).
//!
//! Turns one [`FileRecord`] into graph nodes/edges and a vector point by
//! sequencing six stages: size-gated preparation, five concurrent
//! intelligence sub-requests, entity/relationship construction, a
//! concurrent vector-upsert/graph-upsert pair, and cache warming. A single
//! file's terminal failure never aborts a batch; the caller gets a
//! per-file outcome either way.

pub mod cache;
pub mod intelligence;
pub mod stamping;

use std::sync::Arc;

use kg_identity::{directory_entity_id, file_entity_id, owned_entity_id, project_entity_id, relationship_id};
use kg_types::{
    EntityRecord, EntityType, ExtractionMetadata, FileRecord, RelationshipRecord, RelationshipType,
    VectorPayload, VectorRecord,
};
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use cache::{default_queries, CacheWarmer, NoopCacheWarmer};
use intelligence::{IntelligenceClient, IntelligenceError};
use kg_graph_store::{GraphStoreClient, GraphStoreError};
use kg_vector_store::{vector_point_id, VectorStoreClient, VectorStoreError};
use stamping::StampingClient;

/// Default file-size skip threshold, in bytes.
pub const DEFAULT_MAX_FILE_SIZE_BYTES: usize = 10 * 1024 * 1024;
/// Default bound on concurrent intelligence sub-requests per file.
pub const DEFAULT_INTELLIGENCE_CONCURRENCY: usize = 5;
/// Default bound on files enriched concurrently across all workers sharing
/// one orchestrator.
pub const DEFAULT_MAX_CONCURRENT_FILES: usize = 5;

/// Cumulative directory paths from the topmost ancestor to the file's
/// immediate parent, e.g. `/src/pkg/main.py` -> `["/src", "/src/pkg"]`.
/// Empty if the file sits directly under the project root.
fn ancestor_directories(absolute_path: &str) -> Vec<String> {
    let mut segments: Vec<&str> = absolute_path.split('/').filter(|s| !s.is_empty()).collect();
    segments.pop();
    let mut dirs = Vec::with_capacity(segments.len());
    let mut current = String::new();
    for segment in segments {
        current.push('/');
        current.push_str(segment);
        dirs.push(current.clone());
    }
    dirs
}

/// Whether the orchestrator is driving work from the bus (the steady
/// state) or falling back to synchronous HTTP calls because the stamping
/// service's bus-mediated path isn't reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Work arrives via the bus; completion is reported as bus events.
    AsyncBus,
    /// The stamping service is unreachable via the bus path; the
    /// orchestrator calls it directly over HTTP instead.
    HttpFallback,
}

/// Why a file was skipped instead of processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// File exceeded [`OrchestratorConfig::max_file_size_bytes`].
    FileTooLarge {
        /// Size of the file in bytes.
        size_bytes: usize,
    },
}

/// Terminal, per-file failure. The batch continues past this.
#[derive(Debug, thiserror::Error)]
pub enum EnrichmentError {
    /// An intelligence sub-request failed after exhausting retries.
    #[error("intelligence request failed: {0}")]
    Intelligence(#[from] IntelligenceError),
    /// The vector store rejected or failed the upsert.
    #[error("vector store upsert failed: {0}")]
    VectorStore(#[from] VectorStoreError),
    /// The graph store rejected or failed an upsert.
    #[error("graph store upsert failed: {0}")]
    GraphStore(#[from] GraphStoreError),
}

impl EnrichmentError {
    /// Coarse-grained failure kind for the consumer's `errors.by_kind`
    /// metric breakdown.
    pub fn kind(&self) -> &'static str {
        match self {
            EnrichmentError::Intelligence(_) => "intelligence",
            EnrichmentError::VectorStore(_) => "vector_store",
            EnrichmentError::GraphStore(_) => "graph_store",
        }
    }
}

/// Aggregated counts from successfully enriching one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichmentSummary {
    /// Entity id of the file node.
    pub file_entity_id: String,
    /// Entities created (file node plus any extracted symbols).
    pub entities_created: u32,
    /// Relationships created.
    pub relationships_created: u32,
    /// Imports that could not be resolved to a known entity.
    pub unresolved_imports: u32,
    /// Vector points upserted (0 or 1 per file).
    pub vectors_upserted: u32,
}

/// Outcome of `enrich_file` for one file.
#[derive(Debug, Clone, PartialEq)]
pub enum EnrichmentOutcome {
    /// The file was fully processed.
    Processed(EnrichmentSummary),
    /// The file was skipped without attempting enrichment.
    Skipped(SkipReason),
}

/// Aggregated outcome of `enrich_batch` across many files.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Files successfully processed.
    pub files_indexed: u32,
    /// Files skipped due to size.
    pub files_skipped: u32,
    /// Total entities created across the batch.
    pub entities_created: u32,
    /// Total relationships created across the batch.
    pub relationships_created: u32,
    /// Total unresolved imports across the batch.
    pub unresolved_imports: u32,
    /// Total vector points upserted across the batch.
    pub vectors_upserted: u32,
    /// `(absolute_path, kind, reason)` for files that failed terminally.
    pub failed_files: Vec<(String, String, String)>,
}

/// Construction parameters for [`Orchestrator`].
pub struct OrchestratorConfig {
    /// Project root, used for vector payloads.
    pub project_root: String,
    /// Bound on concurrent intelligence sub-requests per file.
    pub intelligence_concurrency: usize,
    /// Bound on files enriched concurrently across all callers sharing this
    /// orchestrator.
    pub max_concurrent_files: usize,
    /// Files over this size are skipped instead of enriched.
    pub max_file_size_bytes: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            project_root: String::new(),
            intelligence_concurrency: DEFAULT_INTELLIGENCE_CONCURRENCY,
            max_concurrent_files: DEFAULT_MAX_CONCURRENT_FILES,
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
        }
    }
}

/// The enrichment orchestrator: owns the intelligence/stamping clients and
/// the vector/graph store adapters, and sequences the six-stage pipeline.
pub struct Orchestrator {
    intelligence: Arc<dyn IntelligenceClient>,
    stamping: Arc<dyn StampingClient>,
    vector_store: Arc<dyn VectorStoreClient>,
    graph_store: Arc<dyn GraphStoreClient>,
    cache_warmer: Arc<dyn CacheWarmer>,
    config: OrchestratorConfig,
    semaphore: Semaphore,
    file_semaphore: Semaphore,
    mode: Mode,
}

impl Orchestrator {
    /// Construct an orchestrator, probing the stamping service once to
    /// decide [`Mode`].
    pub async fn new(
        intelligence: Arc<dyn IntelligenceClient>,
        stamping: Arc<dyn StampingClient>,
        vector_store: Arc<dyn VectorStoreClient>,
        graph_store: Arc<dyn GraphStoreClient>,
        config: OrchestratorConfig,
    ) -> Self {
        Self::with_cache_warmer(
            intelligence,
            stamping,
            vector_store,
            graph_store,
            Arc::new(NoopCacheWarmer),
            config,
        )
        .await
    }

    /// Construct an orchestrator with an explicit [`CacheWarmer`].
    pub async fn with_cache_warmer(
        intelligence: Arc<dyn IntelligenceClient>,
        stamping: Arc<dyn StampingClient>,
        vector_store: Arc<dyn VectorStoreClient>,
        graph_store: Arc<dyn GraphStoreClient>,
        cache_warmer: Arc<dyn CacheWarmer>,
        config: OrchestratorConfig,
    ) -> Self {
        let mode = match stamping.health_check().await {
            Ok(()) => Mode::AsyncBus,
            Err(_) => Mode::HttpFallback,
        };
        info!(?mode, "orchestrator initialised");
        let semaphore = Semaphore::new(config.intelligence_concurrency.max(1));
        let file_semaphore = Semaphore::new(config.max_concurrent_files.max(1));
        Self {
            intelligence,
            stamping,
            vector_store,
            graph_store,
            cache_warmer,
            config,
            semaphore,
            file_semaphore,
            mode,
        }
    }

    /// The execution mode selected at construction time.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Live liveness probe of the downstream intelligence service, for
    /// `/ready` to report without reaching into the orchestrator's
    /// internals.
    pub async fn intelligence_healthy(&self) -> bool {
        self.intelligence.health_check().await.is_ok()
    }

    /// Live circuit-breaker state guarding the intelligence service, for
    /// `/ready` and `/metrics`.
    pub fn circuit_breaker_state(&self) -> kg_net::BreakerState {
        self.intelligence.circuit_breaker_state()
    }

    /// Run the six-stage pipeline for one file.
    pub async fn enrich_file(
        &self,
        file: &FileRecord,
        correlation_id: Uuid,
    ) -> Result<EnrichmentOutcome, EnrichmentError> {
        // Stage 1: preparation / size gating.
        let size = file.size_bytes();
        if size > self.config.max_file_size_bytes {
            warn!(
                %correlation_id,
                path = %file.absolute_path,
                size_bytes = size,
                "file exceeds size threshold, skipping"
            );
            return Ok(EnrichmentOutcome::Skipped(SkipReason::FileTooLarge {
                size_bytes: size,
            }));
        }

        let _file_permit = self
            .file_semaphore
            .acquire()
            .await
            .expect("file semaphore is never closed");

        let content_hash = file.content_hash();
        let file_id = file_entity_id(&file.project_name, &file.absolute_path, &content_hash);

        // Stage 2: five intelligence sub-requests, bounded by a semaphore.
        let (structure, concepts, quality, imports, docs) = tokio::try_join!(
            self.bounded(self.intelligence.structure_analysis(file)),
            self.bounded(self.intelligence.concept_extraction(file)),
            self.bounded(self.intelligence.quality_scoring(file)),
            self.bounded(self.intelligence.import_resolution(file)),
            self.bounded(self.intelligence.documentation_generation(file)),
        )?;

        // Stage 3: entity/relationship construction.
        let mut entities = Vec::new();
        let mut relationships = Vec::new();

        // Ensure the PROJECT node and the DIRECTORY chain down to the
        // file's parent, each linked to the next by a CONTAINS edge.
        let project_id = project_entity_id(&file.project_name);
        entities.push(EntityRecord {
            entity_id: project_id.clone(),
            entity_type: EntityType::Project,
            name: file.project_name.clone(),
            description: None,
            project_name: file.project_name.clone(),
            source_path: String::new(),
            extraction: ExtractionMetadata {
                method: "orchestrator".to_string(),
                confidence: 1.0,
                file_hash: String::new(),
            },
        });

        let mut parent_id = project_id;
        for dir_path in ancestor_directories(&file.absolute_path) {
            let dir_id = directory_entity_id(&file.project_name, &dir_path);
            entities.push(EntityRecord {
                entity_id: dir_id.clone(),
                entity_type: EntityType::Directory,
                name: dir_path.rsplit('/').next().unwrap_or(&dir_path).to_string(),
                description: None,
                project_name: file.project_name.clone(),
                source_path: dir_path.clone(),
                extraction: ExtractionMetadata {
                    method: "orchestrator".to_string(),
                    confidence: 1.0,
                    file_hash: String::new(),
                },
            });
            relationships.push(RelationshipRecord {
                relationship_id: relationship_id(&parent_id, RelationshipType::Contains.as_str(), &dir_id),
                source_entity_id: parent_id.clone(),
                target_entity_id: dir_id.clone(),
                relationship_type: RelationshipType::Contains,
                strength: 1.0,
                context: Default::default(),
            });
            parent_id = dir_id;
        }

        entities.push(EntityRecord {
            entity_id: file_id.clone(),
            entity_type: EntityType::File,
            name: file
                .absolute_path
                .rsplit('/')
                .next()
                .unwrap_or(&file.absolute_path)
                .to_string(),
            description: Some(docs.description.clone()),
            project_name: file.project_name.clone(),
            source_path: file.absolute_path.clone(),
            extraction: ExtractionMetadata {
                method: "tree-sitter".to_string(),
                confidence: 1.0,
                file_hash: content_hash.clone(),
            },
        });
        relationships.push(RelationshipRecord {
            relationship_id: relationship_id(&parent_id, RelationshipType::Contains.as_str(), &file_id),
            source_entity_id: parent_id,
            target_entity_id: file_id.clone(),
            relationship_type: RelationshipType::Contains,
            strength: 1.0,
            context: Default::default(),
        });

        for name in &structure.functions {
            let id = owned_entity_id(EntityType::Function, &file_id, name);
            entities.push(EntityRecord {
                entity_id: id.clone(),
                entity_type: EntityType::Function,
                name: name.clone(),
                description: None,
                project_name: file.project_name.clone(),
                source_path: file.absolute_path.clone(),
                extraction: ExtractionMetadata {
                    method: "intelligence-service".to_string(),
                    confidence: 0.9,
                    file_hash: content_hash.clone(),
                },
            });
            relationships.push(RelationshipRecord {
                relationship_id: relationship_id(&file_id, RelationshipType::Defines.as_str(), &id),
                source_entity_id: file_id.clone(),
                target_entity_id: id,
                relationship_type: RelationshipType::Defines,
                strength: 1.0,
                context: Default::default(),
            });
        }
        for name in &structure.classes {
            let id = owned_entity_id(EntityType::Class, &file_id, name);
            entities.push(EntityRecord {
                entity_id: id.clone(),
                entity_type: EntityType::Class,
                name: name.clone(),
                description: None,
                project_name: file.project_name.clone(),
                source_path: file.absolute_path.clone(),
                extraction: ExtractionMetadata {
                    method: "intelligence-service".to_string(),
                    confidence: 0.9,
                    file_hash: content_hash.clone(),
                },
            });
            relationships.push(RelationshipRecord {
                relationship_id: relationship_id(&file_id, RelationshipType::Defines.as_str(), &id),
                source_entity_id: file_id.clone(),
                target_entity_id: id,
                relationship_type: RelationshipType::Defines,
                strength: 1.0,
                context: Default::default(),
            });
        }

        for concept in &concepts.concepts {
            let id = owned_entity_id(EntityType::Concept, &file_id, concept);
            entities.push(EntityRecord {
                entity_id: id.clone(),
                entity_type: EntityType::Concept,
                name: concept.clone(),
                description: None,
                project_name: file.project_name.clone(),
                source_path: file.absolute_path.clone(),
                extraction: ExtractionMetadata {
                    method: "intelligence-service".to_string(),
                    confidence: 0.7,
                    file_hash: content_hash.clone(),
                },
            });
            relationships.push(RelationshipRecord {
                relationship_id: relationship_id(&file_id, RelationshipType::HasConcept.as_str(), &id),
                source_entity_id: file_id.clone(),
                target_entity_id: id,
                relationship_type: RelationshipType::HasConcept,
                strength: 0.7,
                context: Default::default(),
            });
        }

        // Never trust a target id handed to us by the intelligence service:
        // resolve its reported path against the graph store ourselves, and
        // skip silently if no FILE has been indexed there yet.
        let mut unresolved_imports = 0u32;
        for import in &imports.imports {
            let Some(resolved_path) = &import.resolved_path else {
                unresolved_imports += 1;
                continue;
            };
            match self.graph_store.lookup_entity_id(&file.project_name, resolved_path).await? {
                Some(target) => relationships.push(RelationshipRecord {
                    relationship_id: relationship_id(&file_id, RelationshipType::Imports.as_str(), &target),
                    source_entity_id: file_id.clone(),
                    target_entity_id: target,
                    relationship_type: RelationshipType::Imports,
                    strength: 1.0,
                    context: Default::default(),
                }),
                None => unresolved_imports += 1,
            }
        }

        let vector_record = VectorRecord {
            point_id: vector_point_id(&file.project_name, &content_hash),
            embedding: Vec::new(),
            payload: VectorPayload::new(
                file.absolute_path.clone(),
                file.relative_path.clone(),
                file.project_name.clone(),
                self.config.project_root.clone(),
                chrono::Utc::now(),
                quality.quality_score,
                quality.onex_compliance,
                concepts.concepts.clone(),
                concepts.themes.clone(),
            ),
        };

        // Stages 4/5: vector upsert and graph node upserts run concurrently.
        let graph_nodes = async {
            for entity in &entities {
                self.graph_store.upsert_node(entity.clone()).await?;
            }
            Ok::<(), GraphStoreError>(())
        };
        tokio::try_join!(
            async { self.vector_store.upsert_point(vector_record).await.map_err(EnrichmentError::from) },
            async { graph_nodes.await.map_err(EnrichmentError::from) },
        )?;

        // Relationships can only be written once every endpoint node exists.
        // Each write is best-effort; only count the ones that actually land.
        let mut relationships_written = 0u32;
        for relationship in &relationships {
            match self.graph_store.upsert_relationship(relationship.clone()).await {
                Ok(()) => relationships_written += 1,
                Err(err) => {
                    warn!(%correlation_id, relationship_id = %relationship.relationship_id, error = %err, "dropping relationship with unresolved endpoint");
                }
            }
        }

        // Stage 6: cache warming, best-effort, and stamping.
        let queries = default_queries(&file.project_name, &file_id);
        self.cache_warmer.warm(&file_id, &queries).await;
        if self.mode == Mode::HttpFallback {
            if let Err(err) = self.stamping.mark_processed(&file_id).await {
                warn!(%correlation_id, error = %err, "stamping service mark_processed failed");
            }
        }

        Ok(EnrichmentOutcome::Processed(EnrichmentSummary {
            file_entity_id: file_id,
            entities_created: entities.len() as u32,
            relationships_created: relationships_written,
            unresolved_imports,
            vectors_upserted: 1,
        }))
    }

    /// Run `enrich_file` for every file in `files`, continuing past any
    /// single file's terminal failure and aggregating the results.
    pub async fn enrich_batch(&self, files: &[FileRecord], correlation_id: Uuid) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for file in files {
            match self.enrich_file(file, correlation_id).await {
                Ok(EnrichmentOutcome::Processed(summary)) => {
                    outcome.files_indexed += 1;
                    outcome.entities_created += summary.entities_created;
                    outcome.relationships_created += summary.relationships_created;
                    outcome.unresolved_imports += summary.unresolved_imports;
                    outcome.vectors_upserted += summary.vectors_upserted;
                }
                Ok(EnrichmentOutcome::Skipped(_)) => {
                    outcome.files_skipped += 1;
                }
                Err(err) => {
                    warn!(%correlation_id, path = %file.absolute_path, error = %err, "file enrichment failed terminally");
                    outcome
                        .failed_files
                        .push((file.absolute_path.clone(), err.kind().to_string(), err.to_string()));
                }
            }
        }
        outcome
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, IntelligenceError>>,
    ) -> Result<T, IntelligenceError> {
        let _permit = self.semaphore.acquire().await.expect("semaphore never closed");
        fut.await
    }
}

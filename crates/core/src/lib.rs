//! Mnemograph — content-addressed knowledge-fact graph with multi-algorithm
//! retrieval.
//!
//! The core primitive is a [`Fact`]: a subject-relation-object triple,
//! optionally anchored to a time node. Nodes, relations and facts are
//! **content-addressed** — their ids are hashes of a canonical string
//! rendering, so two facts built from identical inputs are the same fact no
//! matter where or when they were constructed.
//!
//! On top of the fact model sit four layers:
//!
//! - a pluggable key-value cache ([`KvStore`]) with a bounded, evicting
//!   in-memory store and a two-tier volatile-over-persistent combinator;
//! - a memoization layer ([`Memoized`], [`MemoCache`]) that caches arbitrary
//!   computations by argument hash, write-once per key;
//! - a pluggable graph store ([`GraphStore`]) with an in-memory reference
//!   backend that preserves every edge ever attached under a business key,
//!   even across duplicate node instances;
//! - four retrieval algorithms (A*, BFS, beam, water-circles) that turn a
//!   query into a ranked, deduplicated fact set, plus a consistency engine
//!   that retires facts a newer fact supersedes.
//!
//! # Quick start
//!
//! ```rust
//! use mnemograph::{Fact, GraphStore, InMemoryGraph, Node};
//!
//! let mut graph = InMemoryGraph::new();
//! let fact = Fact::simple(
//!     Node::object("alice"),
//!     "works_at",
//!     Node::object("Acme"),
//! );
//! let id = fact.id();
//! graph.create(vec![fact], None).unwrap();
//!
//! let read = graph.read(&[id]).unwrap();
//! assert!(read[0].is_some());
//! ```
//!
//! Embedding generation and obsolescence judgement are *not* provided here:
//! callers supply an [`EmbeddingOracle`] and an [`ObsolescenceJudge`]. The
//! crate never phones an external model.

mod consistency;
mod graph;
mod kv;
mod kv_redb;
mod memo;
mod model;
mod retrieval;

pub use consistency::{
    ConsistencyEngine, IngestReport, JudgeDecision, JudgeStatus, KeepAllJudge, ObsolescenceJudge,
};
pub use graph::in_memory::InMemoryGraph;
pub use graph::{
    open_graph, BackendConfig, CreateFlags, DeleteFlags, GraphBackendKind, GraphStore, IdKind,
    ItemCounts, SharedEdge, SharedIdKind,
};
pub use kv::{BoundedKv, CacheValue, KvStore, MemoryKv, TieredKv};
pub use kv_redb::RedbKv;
pub use memo::{KeyPart, MemoArgs, MemoCache, Memoized};
pub use model::{Fact, FactId, Node, NodeId, NodeKind, Relation, RelationId, RelationKind};
pub use retrieval::astar::{AStarConfig, AStarRetriever, Heuristic};
pub use retrieval::beam::{BeamConfig, BeamRetriever, FinalizePolicy, IntersectionPolicy};
pub use retrieval::bfs::{BfsConfig, BfsRetriever};
pub use retrieval::circles::{WaterCirclesConfig, WaterCirclesRetriever};
pub use retrieval::mixture::MixtureRetriever;
pub use retrieval::{
    CancelToken, EmbeddingOracle, QueryContext, RetrievalOutcome, Retriever, SeedGroup,
};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Every failure mode in the crate, split by what the caller can do about it.
///
/// `NotFound` is reserved for *required singular* lookups (e.g.
/// [`GraphStore::get_facts`]); batch reads represent misses as `None` entries
/// instead. The two are never mixed on one operation.
#[derive(Debug, thiserror::Error)]
pub enum MnemographError {
    /// Malformed input caught before any mutation: empty required string,
    /// duplicate ids within one batch, argument out of declared range.
    #[error("validation error: {0}")]
    Validation(String),
    /// A referenced node/fact/key is absent and the operation requires it.
    #[error("not found: {0}")]
    NotFound(String),
    /// Write-once violation: a memoization key or cache id already holds a
    /// value. The existing value is never overwritten.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// A storage backend failed. Not retried by the core — retry policy
    /// belongs to the specific backend.
    #[error("storage error: {0}")]
    Storage(String),
    /// An external collaborator (embedding oracle, obsolescence judge)
    /// failed.
    #[error("external call failed: {0}")]
    External(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<redb::DatabaseError> for MnemographError {
    fn from(e: redb::DatabaseError) -> Self {
        MnemographError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for MnemographError {
    fn from(e: redb::TransactionError) -> Self {
        MnemographError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for MnemographError {
    fn from(e: redb::TableError) -> Self {
        MnemographError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for MnemographError {
    fn from(e: redb::StorageError) -> Self {
        MnemographError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for MnemographError {
    fn from(e: redb::CommitError) -> Self {
        MnemographError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MnemographError>;

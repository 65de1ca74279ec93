//! Graph storage abstraction: one CRUD + traversal contract over pluggable
//! backends.
//!
//! The contract speaks **business keys** throughout — the content-derived
//! ids of [`crate::Node`] / [`crate::Fact`] — never a backend's surrogate
//! instance ids. A business key may map to several physical instances inside
//! a backend (see the multi-instance dedup invariant on
//! [`in_memory::InMemoryGraph`]); every operation here must behave as if the
//! key named all of them at once.

pub mod in_memory;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{Fact, FactId, Node, NodeId, NodeKind, RelationId};
use crate::{MnemographError, Result};

/// Per-fact creation flags: whether to materialize the subject/object node,
/// or attach the new edge to already-existing instances only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateFlags {
    pub create_subject: bool,
    pub create_object: bool,
}

impl Default for CreateFlags {
    fn default() -> Self {
        Self {
            create_subject: true,
            create_object: true,
        }
    }
}

impl CreateFlags {
    /// Attach the edge to existing node instances only; create neither
    /// endpoint.
    pub fn attach_only() -> Self {
        Self {
            create_subject: false,
            create_object: false,
        }
    }
}

/// Per-fact deletion flags: whether the subject/object node instances are
/// deleted along with the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteFlags {
    pub delete_subject: bool,
    pub delete_object: bool,
}

impl Default for DeleteFlags {
    fn default() -> Self {
        Self {
            delete_subject: true,
            delete_object: true,
        }
    }
}

impl DeleteFlags {
    /// Remove the edge only; leave both endpoint nodes in place.
    pub fn edge_only() -> Self {
        Self {
            delete_subject: false,
            delete_object: false,
        }
    }
}

/// Which id family an existence/count query refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Node,
    Relation,
    Fact,
}

/// Which ids [`GraphStore::get_shared_ids`] should report per connecting
/// edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedIdKind {
    Fact,
    Relation,
    Both,
}

/// One edge connecting two queried nodes, as reported by
/// [`GraphStore::get_shared_ids`]. Fields are populated per the requested
/// [`SharedIdKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedEdge {
    pub fact_id: Option<FactId>,
    pub relation_id: Option<RelationId>,
}

/// Store-wide item counts, per id family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemCounts {
    pub nodes: usize,
    pub relations: usize,
    pub facts: usize,
}

/// Uniform CRUD + traversal contract over pluggable graph backends.
///
/// Errors follow one rule: batch reads represent misses as `None`, required
/// singular lookups (`get_facts`, `get_node_kind`) raise `NotFound`.
pub trait GraphStore {
    /// Insert a batch of facts. `flags[i]` controls endpoint materialization
    /// for `facts[i]` (both created when `flags` is `None`). Fails with
    /// `Validation` — before any mutation — if the flag list length
    /// mismatches or any fact id is duplicated within the batch.
    fn create(&mut self, facts: Vec<Fact>, flags: Option<Vec<CreateFlags>>) -> Result<()>;

    /// Order-preserving batch read by fact business key; `None` per miss.
    fn read(&self, fact_ids: &[FactId]) -> Result<Vec<Option<Fact>>>;

    /// Order-preserving batch read by node business key; `None` per miss.
    /// All instances under one key share their content by construction, so
    /// any representative instance answers.
    fn read_nodes(&self, node_ids: &[NodeId]) -> Result<Vec<Option<Node>>>;

    /// Delete facts by business key. `flags[i]` controls whether endpoint
    /// node instances go with the edge (both deleted when `flags` is
    /// `None`). Deleting a node removes only the instances recorded under
    /// this store's business-key index entry.
    fn delete(&mut self, fact_ids: &[FactId], flags: Option<Vec<DeleteFlags>>) -> Result<()>;

    /// All nodes whose name and kind match. When `object_kind` is given,
    /// results are restricted to nodes with at least one neighbor of that
    /// kind.
    fn read_by_name(
        &self,
        name: &str,
        kind: NodeKind,
        object_kind: Option<NodeKind>,
    ) -> Result<Vec<Node>>;

    /// Business keys of all neighbors of `node_id` whose kind is in
    /// `accepted_kinds` (every kind accepted when the slice is empty).
    fn get_adjacent_node_ids(
        &self,
        node_id: &NodeId,
        accepted_kinds: &[NodeKind],
    ) -> Result<Vec<NodeId>>;

    /// Info for every edge connecting `node1_id` and `node2_id`, across all
    /// instance pairs of the two business keys.
    fn get_shared_ids(
        &self,
        node1_id: &NodeId,
        node2_id: &NodeId,
        id_kind: SharedIdKind,
    ) -> Result<Vec<SharedEdge>>;

    /// All facts connecting the two nodes. `NotFound` if either business key
    /// is absent.
    fn get_facts(&self, node1_id: &NodeId, node2_id: &NodeId) -> Result<Vec<Fact>>;

    /// Kind of the node under a business key. `NotFound` if absent.
    fn get_node_kind(&self, id: &NodeId) -> Result<NodeKind>;

    /// Without an id: store-wide counts per family. With an id: the number
    /// of physical instances recorded under that business key, reported in
    /// the matching family's field.
    fn count_items(&self, id: Option<&str>, id_kind: Option<IdKind>) -> Result<ItemCounts>;

    /// Whether any instance exists under the business key, in the given
    /// family.
    fn item_exist(&self, id: &str, id_kind: IdKind) -> Result<bool>;

    fn clear(&mut self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

/// Which graph backend a [`BackendConfig`] names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphBackendKind {
    /// The in-memory reference backend.
    InMemory,
}

/// Immutable backend configuration, resolved to a constructor once at
/// startup — never consulted per call. Unknown `kind` strings fail at
/// resolution time, not at first use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub kind: String,
    /// Backend-specific options (paths, capacities). Ignored by backends
    /// that do not need them.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl BackendConfig {
    pub fn in_memory() -> Self {
        Self {
            kind: "in_memory".to_string(),
            options: BTreeMap::new(),
        }
    }

    fn graph_kind(&self) -> Result<GraphBackendKind> {
        match self.kind.as_str() {
            "in_memory" => Ok(GraphBackendKind::InMemory),
            other => Err(MnemographError::Validation(format!(
                "unknown graph backend kind: {other}"
            ))),
        }
    }
}

/// Resolve a configuration to a live graph store. The configuration-string →
/// constructor mapping lives here and nowhere else.
pub fn open_graph(config: &BackendConfig) -> Result<Box<dyn GraphStore>> {
    match config.graph_kind()? {
        GraphBackendKind::InMemory => Ok(Box::new(in_memory::InMemoryGraph::new())),
    }
}

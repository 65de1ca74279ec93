//! Retrieval: four strategies for finding the facts relevant to a query.
//!
//! Every algorithm consumes the same three inputs — a [`GraphStore`], an
//! [`EmbeddingOracle`], and a [`QueryContext`] — and produces a ranked,
//! deduplicated fact set. Whole-query answers are memoized through
//! [`crate::MemoCache`] keyed on (algorithm configuration, query context),
//! so repeating a query never re-walks the graph.
//!
//! Two error-shape rules hold everywhere:
//!
//! - "no relevant facts" is [`RetrievalOutcome::NoMatch`], not an error —
//!   callers can tell an empty answer from a broken backend;
//! - a failed similarity/heuristic lookup excludes that one candidate, it
//!   never fails the whole query.

pub mod astar;
pub mod beam;
pub mod bfs;
pub mod circles;
pub mod mixture;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::graph::GraphStore;
use crate::memo::{KeyPart, MemoArgs};
use crate::model::{Fact, FactId, Node, NodeId};
use crate::Result;

// ---------------------------------------------------------------------------
// External oracle
// ---------------------------------------------------------------------------

/// Vector-similarity oracle supplied by the caller. Mnemograph never
/// generates embeddings itself.
///
/// `similarity_search` scores are **distances** in `[0, 1]` — `0.0` means
/// identical. Algorithms convert to similarity where they need reward
/// semantics.
pub trait EmbeddingOracle {
    fn encode(&self, text: &str) -> Result<Vec<f32>>;

    /// Rank `k` nearest ids for a query embedding, optionally restricted to
    /// an allow-list of candidate ids.
    fn similarity_search(
        &self,
        query: &[f32],
        candidate_ids: Option<&[String]>,
        k: usize,
    ) -> Result<Vec<(f32, String)>>;
}

// ---------------------------------------------------------------------------
// Query context
// ---------------------------------------------------------------------------

/// One query entity and the graph nodes it was linked to. Entity linking
/// happens upstream; retrieval only consumes its result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedGroup {
    /// Surface forms of the entity as mentioned in the query ("Alice",
    /// "alice's").
    pub mentions: Vec<String>,
    /// Graph nodes matched to the entity.
    pub nodes: Vec<Node>,
}

impl SeedGroup {
    pub fn new(mentions: Vec<String>, nodes: Vec<Node>) -> Self {
        Self { mentions, nodes }
    }

    /// A group with a single mention equal to the node name.
    pub fn for_node(node: Node) -> Self {
        Self {
            mentions: vec![node.name.clone()],
            nodes: vec![node],
        }
    }
}

/// A query plus the nodes its entities were linked to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryContext {
    pub query: String,
    pub seeds: Vec<SeedGroup>,
}

impl QueryContext {
    pub fn new(query: impl Into<String>, seeds: Vec<SeedGroup>) -> Self {
        Self {
            query: query.into(),
            seeds,
        }
    }

    /// All linked nodes across seed groups, in seed order.
    pub fn linked_nodes(&self) -> Vec<&Node> {
        self.seeds.iter().flat_map(|s| s.nodes.iter()).collect()
    }
}

impl MemoArgs for QueryContext {
    fn key_parts(&self) -> Vec<KeyPart> {
        vec![
            KeyPart::Text(self.query.clone()),
            // Linked nodes are an unordered set for caching purposes.
            KeyPart::Composite(self.linked_nodes().iter().map(|n| n.id().0).collect()),
        ]
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// The answer to one retrieval call. `NoMatch` is a successful call that
/// found nothing relevant — distinct from any `Err`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RetrievalOutcome {
    Found(Vec<Fact>),
    NoMatch,
}

impl RetrievalOutcome {
    /// `Found` for a non-empty set, `NoMatch` otherwise.
    pub fn from_facts(facts: Vec<Fact>) -> Self {
        if facts.is_empty() {
            RetrievalOutcome::NoMatch
        } else {
            RetrievalOutcome::Found(facts)
        }
    }

    pub fn facts(&self) -> &[Fact] {
        match self {
            RetrievalOutcome::Found(f) => f,
            RetrievalOutcome::NoMatch => &[],
        }
    }

    pub fn is_no_match(&self) -> bool {
        matches!(self, RetrievalOutcome::NoMatch)
    }
}

/// One retrieval strategy. The graph is borrowed per call so a single store
/// can serve several differently configured retrievers.
pub trait Retriever {
    fn retrieve(&mut self, graph: &dyn GraphStore, ctx: &QueryContext)
        -> Result<RetrievalOutcome>;
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Caller-supplied cooperative cancellation for long-running searches.
///
/// Search loops poll the token at iteration heads; on cancellation they stop
/// expanding and return the best-so-far partial result — never an error —
/// mirroring the A* spare-node fallback when a goal is unreachable.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Cosine distance in `[0, 1]` (0 = identical); a zero-magnitude vector is
/// maximally distant from everything.
pub(crate) fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    (1.0 - dot / (na * nb)).clamp(0.0, 1.0)
}

/// Fetch the facts along a set of node-pair edges, deduplicated by fact
/// identity so an edge shared by several paths is fetched once.
pub(crate) fn collect_pair_facts(
    graph: &dyn GraphStore,
    pairs: &[(NodeId, NodeId)],
) -> Result<Vec<Fact>> {
    let mut seen: HashSet<FactId> = HashSet::new();
    let mut out = Vec::new();
    for (a, b) in pairs {
        let facts = match graph.get_facts(a, b) {
            Ok(f) => f,
            // An endpoint deleted mid-walk is a miss, not a failure.
            Err(crate::MnemographError::NotFound(_)) => continue,
            Err(e) => return Err(e),
        };
        for fact in facts {
            if seen.insert(fact.id()) {
                out.push(fact);
            }
        }
    }
    Ok(out)
}

/// Append facts into `acc`, keeping first-seen order and dropping duplicate
/// fact ids.
pub(crate) fn merge_facts(acc: &mut Vec<Fact>, seen: &mut HashSet<FactId>, incoming: Vec<Fact>) {
    for fact in incoming {
        if seen.insert(fact.id()) {
            acc.push(fact);
        }
    }
}

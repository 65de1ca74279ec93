//! Bounded beam search: query-conditioned path expansion.
//!
//! The beam holds up to `max_paths` partial paths. Each round every path's
//! frontier enumerates candidate edges, scores them by similarity between
//! the edge fact's embedding and the query embedding, and the best
//! extensions survive — locally per path, then globally across the beam.
//! A path with no viable extension is finalized as *ended*; whatever is
//! still alive after `max_depth` rounds is finalized as *continuing*. A
//! configurable policy picks the final set from the two pools.
//!
//! Edge reward is `-ln(distance)` (equivalently `-ln(1 - similarity)`),
//! capped for near-identical embeddings, and the final path score is the
//! accumulated reward divided by `(path_length - 1)^mean_alpha` so longer
//! paths gain sub-linearly.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::graph::GraphStore;
use crate::kv::MemoryKv;
use crate::memo::{KeyPart, MemoArgs, MemoCache};
use crate::model::{Fact, FactId, NodeId, NodeKind};
use crate::retrieval::{
    cosine_distance, CancelToken, EmbeddingOracle, QueryContext, RetrievalOutcome, Retriever,
};
use crate::Result;

/// Which already-used graph elements a candidate edge may revisit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntersectionPolicy {
    /// No exclusion; paths may loop and overlap freely.
    AllowAll,
    /// A path never revisits its own nodes or edges.
    ExcludeOwnPath,
    /// A path also avoids nodes and edges claimed by any other tracked
    /// path, forcing the beam to spread.
    ExcludeAllPaths,
}

/// How the final top-`max_paths` set is assembled from the ended and
/// continuing pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizePolicy {
    EndedFirst,
    ContinuingFirst,
    /// Pool both and rank purely by final score.
    ScoreMixed,
}

#[derive(Debug, Clone)]
pub struct BeamConfig {
    /// Node kinds the beam may traverse. Empty = all kinds.
    pub accepted_kinds: Vec<NodeKind>,
    /// Beam width: tracked paths never exceed this.
    pub max_paths: usize,
    /// Expansion rounds before surviving paths finalize as continuing.
    pub max_depth: usize,
    /// Length-dampening exponent of the final path score.
    pub mean_alpha: f64,
    /// Reward cap for near-identical embeddings, where `-ln(distance)`
    /// diverges.
    pub score_cap: f64,
    pub intersection: IntersectionPolicy,
    pub finalize: FinalizePolicy,
}

impl Default for BeamConfig {
    fn default() -> Self {
        Self {
            accepted_kinds: vec![NodeKind::Object],
            max_paths: 8,
            max_depth: 4,
            mean_alpha: 0.5,
            score_cap: 16.0,
            intersection: IntersectionPolicy::ExcludeOwnPath,
            finalize: FinalizePolicy::ScoreMixed,
        }
    }
}

impl BeamConfig {
    fn fingerprint(&self) -> String {
        format!(
            "beam:kinds={:?}:paths={}:depth={}:alpha={}:cap={}:intersect={:?}:finalize={:?}",
            self.accepted_kinds, self.max_paths, self.max_depth, self.mean_alpha,
            self.score_cap, self.intersection, self.finalize
        )
    }
}

/// One partial path tracked by the beam.
#[derive(Debug, Clone)]
struct BeamPath {
    edges: Vec<Fact>,
    nodes: HashSet<NodeId>,
    edge_ids: HashSet<FactId>,
    frontier: NodeId,
    score: f64,
}

impl BeamPath {
    fn seed(node: NodeId) -> Self {
        Self {
            edges: Vec::new(),
            nodes: HashSet::from([node.clone()]),
            edge_ids: HashSet::new(),
            frontier: node,
            score: 0.0,
        }
    }

    fn extended(&self, fact: Fact, to: NodeId, reward: f64) -> Self {
        let mut next = self.clone();
        next.edge_ids.insert(fact.id());
        next.edges.push(fact);
        next.nodes.insert(to.clone());
        next.frontier = to;
        next.score += reward;
        next
    }

    /// `accumulated / (length - 1)^alpha`. Length counts nodes, so a
    /// single-edge path divides by one.
    fn final_score(&self, alpha: f64) -> f64 {
        let hops = self.edges.len().max(1) as f64;
        self.score / hops.powf(alpha)
    }
}

pub struct BeamRetriever {
    oracle: Arc<dyn EmbeddingOracle>,
    config: BeamConfig,
    memo: MemoCache<MemoryKv>,
    cancel: CancelToken,
}

impl BeamRetriever {
    pub fn new(oracle: Arc<dyn EmbeddingOracle>, config: BeamConfig) -> Self {
        let memo = MemoCache::new(MemoryKv::new(), vec![config.fingerprint()]);
        Self {
            oracle,
            config,
            memo,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Reward of one candidate edge against the query embedding, memoized
    /// by (query, fact id).
    fn edge_reward(&mut self, query: &str, query_emb: &[f32], fact: &Fact) -> Result<f64> {
        let key = [
            KeyPart::Text("edge".into()),
            KeyPart::Text(query.to_string()),
            KeyPart::Text(fact.id().0.clone()),
        ];
        if let Some(hit) = self.memo.load::<f64>(&key)? {
            return Ok(hit);
        }
        let fact_emb = self.oracle.encode(&fact.statement())?;
        let distance = cosine_distance(query_emb, &fact_emb) as f64;
        // -ln(distance) = -ln(1 - similarity); diverges as the embeddings
        // coincide, hence the cap.
        let reward = if distance <= f64::EPSILON {
            self.config.score_cap
        } else {
            (-distance.ln()).min(self.config.score_cap)
        };
        self.memo.save(&key, &reward)?;
        Ok(reward)
    }

    fn run(&mut self, graph: &dyn GraphStore, ctx: &QueryContext) -> Result<RetrievalOutcome> {
        let seeds = ctx.linked_nodes();
        if seeds.is_empty() {
            return Ok(RetrievalOutcome::NoMatch);
        }
        let query_emb = self.oracle.encode(&ctx.query)?;

        let mut live: Vec<BeamPath> = seeds
            .iter()
            .map(|n| BeamPath::seed(n.id()))
            .take(self.config.max_paths)
            .collect();
        let mut ended: Vec<BeamPath> = Vec::new();

        for round in 0..self.config.max_depth {
            if live.is_empty() || self.cancel.is_cancelled() {
                break;
            }

            // Elements claimed across the whole beam, for ExcludeAllPaths.
            let claimed_nodes: HashSet<NodeId> = live
                .iter()
                .flat_map(|p| p.nodes.iter().cloned())
                .collect();
            let claimed_edges: HashSet<FactId> = live
                .iter()
                .flat_map(|p| p.edge_ids.iter().cloned())
                .collect();

            let mut extensions: Vec<BeamPath> = Vec::new();
            for path in &live {
                let mut local: Vec<BeamPath> = Vec::new();
                let neighbors =
                    graph.get_adjacent_node_ids(&path.frontier, &self.config.accepted_kinds)?;
                for next in neighbors {
                    let blocked_node = match self.config.intersection {
                        IntersectionPolicy::AllowAll => false,
                        IntersectionPolicy::ExcludeOwnPath => path.nodes.contains(&next),
                        IntersectionPolicy::ExcludeAllPaths => claimed_nodes.contains(&next),
                    };
                    if blocked_node {
                        continue;
                    }
                    let facts = match graph.get_facts(&path.frontier, &next) {
                        Ok(f) => f,
                        Err(crate::MnemographError::NotFound(_)) => continue,
                        Err(e) => return Err(e),
                    };
                    for fact in facts {
                        let blocked_edge = match self.config.intersection {
                            IntersectionPolicy::AllowAll => false,
                            IntersectionPolicy::ExcludeOwnPath => {
                                path.edge_ids.contains(&fact.id())
                            }
                            IntersectionPolicy::ExcludeAllPaths => {
                                claimed_edges.contains(&fact.id())
                            }
                        };
                        if blocked_edge {
                            continue;
                        }
                        let reward = match self.edge_reward(&ctx.query, &query_emb, &fact) {
                            Ok(r) => r,
                            Err(e) => {
                                // One unscorable edge never fails the query.
                                debug!(error = %e, "edge scoring failed, skipping candidate");
                                continue;
                            }
                        };
                        local.push(path.extended(fact, next.clone(), reward));
                    }
                }
                if local.is_empty() {
                    ended.push(path.clone());
                    continue;
                }
                sort_paths(&mut local);
                local.truncate(self.config.max_paths);
                extensions.extend(local);
            }

            sort_paths(&mut extensions);
            extensions.truncate(self.config.max_paths);
            debug_assert!(extensions.len() <= self.config.max_paths);
            debug!(round, live = extensions.len(), ended = ended.len(), "beam round");
            live = extensions;
        }

        let continuing = live;
        let kept = self.finalize(ended, continuing);

        let mut seen: HashSet<FactId> = HashSet::new();
        let mut facts = Vec::new();
        for path in kept {
            for fact in path.edges {
                if seen.insert(fact.id()) {
                    facts.push(fact);
                }
            }
        }
        Ok(RetrievalOutcome::from_facts(facts))
    }

    fn finalize(&self, mut ended: Vec<BeamPath>, mut continuing: Vec<BeamPath>) -> Vec<BeamPath> {
        let alpha = self.config.mean_alpha;
        let by_final = |paths: &mut Vec<BeamPath>| {
            paths.sort_by(|a, b| {
                b.final_score(alpha)
                    .total_cmp(&a.final_score(alpha))
                    .then_with(|| a.frontier.cmp(&b.frontier))
            });
        };
        by_final(&mut ended);
        by_final(&mut continuing);

        let mut kept: Vec<BeamPath> = match self.config.finalize {
            FinalizePolicy::EndedFirst => ended.into_iter().chain(continuing).collect(),
            FinalizePolicy::ContinuingFirst => continuing.into_iter().chain(ended).collect(),
            FinalizePolicy::ScoreMixed => {
                let mut all: Vec<BeamPath> = ended.into_iter().chain(continuing).collect();
                by_final(&mut all);
                all
            }
        };
        kept.truncate(self.config.max_paths);
        kept
    }
}

/// Deterministic beam ordering: accumulated score descending, frontier id
/// as tie-break.
fn sort_paths(paths: &mut [BeamPath]) {
    paths.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.frontier.cmp(&b.frontier))
    });
}

impl Retriever for BeamRetriever {
    fn retrieve(
        &mut self,
        graph: &dyn GraphStore,
        ctx: &QueryContext,
    ) -> Result<RetrievalOutcome> {
        let mut parts = vec![KeyPart::Text("answer".into())];
        parts.extend(ctx.key_parts());
        if let Some(hit) = self.memo.load(&parts)? {
            return Ok(hit);
        }
        let outcome = self.run(graph, ctx)?;
        self.memo.save(&parts, &outcome)?;
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::in_memory::InMemoryGraph;
    use crate::model::Node;
    use crate::retrieval::test_support::TableOracle;
    use crate::retrieval::SeedGroup;

    fn simple(s: &str, r: &str, o: &str) -> Fact {
        Fact::simple(Node::object(s), r, Node::object(o))
    }

    fn ctx_for(names: &[&str]) -> QueryContext {
        QueryContext::new(
            "q",
            names
                .iter()
                .map(|n| SeedGroup::for_node(Node::object(*n)))
                .collect(),
        )
    }

    #[test]
    fn tracked_paths_never_exceed_max_paths() {
        // A hub with many spokes: every round offers more extensions than
        // the beam may keep.
        let mut g = InMemoryGraph::new();
        let facts: Vec<Fact> = (0..8).map(|i| simple("hub", "r", &format!("s{i}"))).collect();
        g.create(facts, None).unwrap();

        let mut r = BeamRetriever::new(
            Arc::new(TableOracle::new(2)),
            BeamConfig {
                max_paths: 3,
                max_depth: 2,
                ..BeamConfig::default()
            },
        );
        let outcome = r.retrieve(&g, &ctx_for(&["hub"])).unwrap();
        // Each kept path holds at most max_depth edges.
        assert!(outcome.facts().len() <= 3 * 2);
    }

    #[test]
    fn higher_similarity_branch_wins_the_beam() {
        let mut g = InMemoryGraph::new();
        g.create(
            vec![simple("start", "likes", "tea"), simple("start", "hates", "rain")],
            None,
        )
        .unwrap();

        let tea = simple("start", "likes", "tea");
        let rain = simple("start", "hates", "rain");
        let oracle = TableOracle::new(2)
            .with("q", vec![1.0, 0.0])
            .with(&tea.statement(), vec![1.0, 0.0])
            .with(&rain.statement(), vec![0.0, 1.0]);

        let mut r = BeamRetriever::new(
            Arc::new(oracle),
            BeamConfig {
                max_paths: 1,
                max_depth: 1,
                ..BeamConfig::default()
            },
        );
        let outcome = r.retrieve(&g, &ctx_for(&["start"])).unwrap();
        assert_eq!(outcome.facts().len(), 1);
        assert_eq!(outcome.facts()[0].id(), tea.id());
    }

    #[test]
    fn own_path_exclusion_prevents_backtracking() {
        let mut g = InMemoryGraph::new();
        g.create(vec![simple("a", "r", "b")], None).unwrap();

        let mut r = BeamRetriever::new(
            Arc::new(TableOracle::new(2)),
            BeamConfig {
                max_depth: 4,
                intersection: IntersectionPolicy::ExcludeOwnPath,
                ..BeamConfig::default()
            },
        );
        let outcome = r.retrieve(&g, &ctx_for(&["a"])).unwrap();
        // The a—b edge once; the path cannot oscillate back to a.
        assert_eq!(outcome.facts().len(), 1);
    }

    #[test]
    fn ended_paths_survive_finalization() {
        // b is a dead end after one hop; the path ends early but its edge
        // must still be reported.
        let mut g = InMemoryGraph::new();
        g.create(vec![simple("a", "r", "b")], None).unwrap();

        for finalize in [
            FinalizePolicy::EndedFirst,
            FinalizePolicy::ContinuingFirst,
            FinalizePolicy::ScoreMixed,
        ] {
            let mut r = BeamRetriever::new(
                Arc::new(TableOracle::new(2)),
                BeamConfig {
                    finalize,
                    ..BeamConfig::default()
                },
            );
            let outcome = r.retrieve(&g, &ctx_for(&["a"])).unwrap();
            assert_eq!(outcome.facts().len(), 1, "{finalize:?}");
        }
    }

    #[test]
    fn no_seeds_is_no_match() {
        let g = InMemoryGraph::new();
        let mut r = BeamRetriever::new(Arc::new(TableOracle::new(2)), BeamConfig::default());
        let outcome = r.retrieve(&g, &QueryContext::new("q", vec![])).unwrap();
        assert!(outcome.is_no_match());
    }

    #[test]
    fn length_dampening_divides_by_hop_count() {
        let path = BeamPath {
            edges: vec![simple("a", "r", "b"), simple("b", "r", "c")],
            nodes: HashSet::new(),
            edge_ids: HashSet::new(),
            frontier: Node::object("c").id(),
            score: 4.0,
        };
        assert!((path.final_score(1.0) - 2.0).abs() < 1e-9);
        assert!((path.final_score(0.5) - 4.0 / 2f64.sqrt()).abs() < 1e-9);
    }
}

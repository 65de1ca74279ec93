//! Heuristic shortest-path retrieval: pairwise A* between linked nodes.
//!
//! For every unordered pair of linked nodes the search walks the graph with
//! uniform edge cost 1, ordered by `g + h`. Three heuristics are available,
//! all built from the oracle's node-pair distance (`ip` = one minus cosine
//! similarity) and an internal bounded BFS shortest-path estimate. Every
//! heuristic sub-result is memoized by order-independent node pair, so the
//! quadratic pair loop never re-queries the oracle for a pair it has seen.
//!
//! If a goal is unreachable within the depth/expansion budget, the path to
//! the last-expanded ("spare") node is used instead — a truncated answer
//! beats none. Cancellation takes the same route.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::debug;

use crate::graph::GraphStore;
use crate::kv::MemoryKv;
use crate::memo::{KeyPart, MemoArgs, MemoCache};
use crate::model::{Node, NodeId, NodeKind};
use crate::retrieval::{
    collect_pair_facts, cosine_distance, CancelToken, EmbeddingOracle, QueryContext,
    RetrievalOutcome, Retriever,
};
use crate::Result;

/// Sentinel distance for unreachable pairs in the internal BFS.
const UNREACHABLE: f64 = 1.0e9;

/// Heuristic selection for [`AStarRetriever`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heuristic {
    /// `ip(n, goal)`: one minus cosine similarity of the two nodes'
    /// embeddings.
    Ip,
    /// `ip(n, goal) × bfs_shortest_path(n, goal)`.
    WeightWithShortPath,
    /// `bfs_shortest_path(n, goal) × mean(ip over consecutive nodes on the
    /// path taken so far, plus ip(n, goal))`.
    AvgWeightedWithShortPath,
}

#[derive(Debug, Clone)]
pub struct AStarConfig {
    pub heuristic: Heuristic,
    /// Node kinds the search may traverse. Empty = all kinds.
    pub accepted_kinds: Vec<NodeKind>,
    /// Maximum path depth (g) before a branch stops expanding.
    pub max_depth: usize,
    /// Maximum number of node expansions per pair before the spare-node
    /// fallback kicks in.
    pub max_passed_nodes: usize,
    /// Depth bound for the internal BFS shortest-path estimate.
    pub bfs_limit: usize,
}

impl Default for AStarConfig {
    fn default() -> Self {
        Self {
            heuristic: Heuristic::Ip,
            accepted_kinds: vec![NodeKind::Object],
            max_depth: 6,
            max_passed_nodes: 256,
            bfs_limit: 6,
        }
    }
}

impl AStarConfig {
    fn fingerprint(&self) -> String {
        format!(
            "astar:h={:?}:kinds={:?}:depth={}:passed={}:bfs={}",
            self.heuristic, self.accepted_kinds, self.max_depth, self.max_passed_nodes,
            self.bfs_limit
        )
    }
}

/// Priority-queue entry ordered by `f = g + h`, with deterministic
/// tie-breaks on depth then node id.
struct OpenEntry {
    f: f64,
    g: usize,
    node: NodeId,
}

impl PartialEq for OpenEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for OpenEntry {}
impl PartialOrd for OpenEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OpenEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the max-heap pops the lowest f first.
        other
            .f
            .total_cmp(&self.f)
            .then_with(|| other.g.cmp(&self.g))
            .then_with(|| other.node.cmp(&self.node))
    }
}

/// Pairwise A* retrieval over the linked nodes of a query.
pub struct AStarRetriever {
    oracle: Arc<dyn EmbeddingOracle>,
    config: AStarConfig,
    memo: MemoCache<MemoryKv>,
    cancel: CancelToken,
}

impl AStarRetriever {
    pub fn new(oracle: Arc<dyn EmbeddingOracle>, config: AStarConfig) -> Self {
        let memo = MemoCache::new(MemoryKv::new(), vec![config.fingerprint()]);
        Self {
            oracle,
            config,
            memo,
            cancel: CancelToken::new(),
        }
    }

    /// Install a caller-supplied cancellation token.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// `ip(a, b)`: one minus the cosine similarity of the two nodes'
    /// embeddings, memoized by order-independent pair. The oracle encodes
    /// each node's *rendering*, never a raw id.
    fn ip(&mut self, a: &NodeId, a_text: &str, b: &NodeId, b_text: &str) -> Result<f64> {
        let key = [
            KeyPart::Text("ip".into()),
            KeyPart::Composite(vec![a.0.clone(), b.0.clone()]),
        ];
        if let Some(hit) = self.memo.load::<f64>(&key)? {
            return Ok(hit);
        }
        let a_emb = self.oracle.encode(a_text)?;
        let b_emb = self.oracle.encode(b_text)?;
        let distance = cosine_distance(&a_emb, &b_emb) as f64;
        self.memo.save(&key, &distance)?;
        Ok(distance)
    }

    /// Bounded BFS path length between two nodes, memoized by
    /// order-independent pair; [`UNREACHABLE`] when no path exists within
    /// `bfs_limit` hops.
    fn bfs_shortest_path(
        &mut self,
        graph: &dyn GraphStore,
        a: &NodeId,
        b: &NodeId,
    ) -> Result<f64> {
        let key = [
            KeyPart::Text("bfs".into()),
            KeyPart::Composite(vec![a.0.clone(), b.0.clone()]),
        ];
        if let Some(hit) = self.memo.load::<f64>(&key)? {
            return Ok(hit);
        }

        let mut result = UNREACHABLE;
        let mut visited: HashSet<NodeId> = HashSet::from([a.clone()]);
        let mut queue: VecDeque<(NodeId, usize)> = VecDeque::from([(a.clone(), 0)]);
        while let Some((node, depth)) = queue.pop_front() {
            if &node == b {
                result = depth as f64;
                break;
            }
            if depth >= self.config.bfs_limit {
                continue;
            }
            for next in graph.get_adjacent_node_ids(&node, &self.config.accepted_kinds)? {
                if visited.insert(next.clone()) {
                    queue.push_back((next, depth + 1));
                }
            }
        }

        self.memo.save(&key, &result)?;
        Ok(result)
    }

    /// The mean `ip` over consecutive nodes on `path`, plus `ip(frontier,
    /// goal)`. Node text is resolved through `texts` (populated as the
    /// search discovers nodes); unresolvable hops are excluded from the
    /// mean.
    fn path_mean_ip(
        &mut self,
        path: &[NodeId],
        frontier: (&NodeId, &str),
        goal: (&NodeId, &str),
        texts: &HashMap<NodeId, String>,
    ) -> Result<f64> {
        let mut values = Vec::new();
        for pair in path.windows(2) {
            let (Some(a_text), Some(b_text)) = (texts.get(&pair[0]), texts.get(&pair[1])) else {
                continue;
            };
            let (a_text, b_text) = (a_text.clone(), b_text.clone());
            values.push(self.ip(&pair[0], &a_text, &pair[1], &b_text)?);
        }
        values.push(self.ip(frontier.0, frontier.1, goal.0, goal.1)?);
        Ok(values.iter().sum::<f64>() / values.len() as f64)
    }

    fn heuristic(
        &mut self,
        graph: &dyn GraphStore,
        candidate: (&NodeId, &str),
        goal: (&NodeId, &str),
        path_so_far: &[NodeId],
        texts: &HashMap<NodeId, String>,
    ) -> Result<f64> {
        match self.config.heuristic {
            Heuristic::Ip => self.ip(candidate.0, candidate.1, goal.0, goal.1),
            Heuristic::WeightWithShortPath => {
                let ip = self.ip(candidate.0, candidate.1, goal.0, goal.1)?;
                let path = self.bfs_shortest_path(graph, candidate.0, goal.0)?;
                Ok(ip * path)
            }
            Heuristic::AvgWeightedWithShortPath => {
                let path = self.bfs_shortest_path(graph, candidate.0, goal.0)?;
                let mean = self.path_mean_ip(path_so_far, candidate, goal, texts)?;
                Ok(path * mean)
            }
        }
    }

    /// Run A* from `start` to `goal`; returns the node-id path, falling back
    /// to the path reaching the last-expanded node when the goal stays out
    /// of reach.
    fn search_pair(
        &mut self,
        graph: &dyn GraphStore,
        start: &Node,
        goal: &Node,
    ) -> Result<Vec<NodeId>> {
        let start_id = start.id();
        let goal_id = goal.id();
        let goal_text = goal.render();

        let mut texts: HashMap<NodeId, String> = HashMap::new();
        texts.insert(start_id.clone(), start.render());
        texts.insert(goal_id.clone(), goal_text.clone());

        let mut open = BinaryHeap::new();
        let mut g_score: HashMap<NodeId, usize> = HashMap::from([(start_id.clone(), 0)]);
        let mut came_from: HashMap<NodeId, NodeId> = HashMap::new();
        let mut closed: HashSet<NodeId> = HashSet::new();
        open.push(OpenEntry {
            f: 0.0,
            g: 0,
            node: start_id.clone(),
        });

        let mut passed = 0usize;
        let mut spare = start_id.clone();

        while let Some(OpenEntry { g, node, .. }) = open.pop() {
            if node == goal_id {
                return Ok(reconstruct(&came_from, &node));
            }
            if !closed.insert(node.clone()) {
                continue;
            }
            spare = node.clone();
            passed += 1;
            if passed > self.config.max_passed_nodes || self.cancel.is_cancelled() {
                debug!(passed, "a* budget exhausted, using spare node");
                break;
            }
            if g >= self.config.max_depth {
                continue;
            }

            let path_so_far = reconstruct(&came_from, &node);
            for next in graph.get_adjacent_node_ids(&node, &self.config.accepted_kinds)? {
                let tentative = g + 1;
                if g_score.get(&next).is_some_and(|&prev| prev <= tentative) {
                    continue;
                }
                let next_text = match texts.get(&next) {
                    Some(t) => t.clone(),
                    None => {
                        // Adjacency reports ids; the heuristic needs the
                        // node's rendering.
                        let Some(node) = graph
                            .read_nodes(std::slice::from_ref(&next))?
                            .pop()
                            .flatten()
                        else {
                            // Vanished mid-walk; skip the candidate.
                            continue;
                        };
                        let t = node.render();
                        texts.insert(next.clone(), t.clone());
                        t
                    }
                };
                let h = match self.heuristic(
                    graph,
                    (&next, &next_text),
                    (&goal_id, &goal_text),
                    &path_so_far,
                    &texts,
                ) {
                    Ok(h) => h,
                    Err(e) => {
                        // One broken candidate never fails the query.
                        debug!(error = %e, "heuristic lookup failed, excluding candidate");
                        continue;
                    }
                };
                g_score.insert(next.clone(), tentative);
                came_from.insert(next.clone(), node.clone());
                open.push(OpenEntry {
                    f: tentative as f64 + h,
                    g: tentative,
                    node: next,
                });
            }
        }

        Ok(reconstruct(&came_from, &spare))
    }

    fn run(&mut self, graph: &dyn GraphStore, ctx: &QueryContext) -> Result<RetrievalOutcome> {
        let nodes = ctx.linked_nodes();
        let mut edge_pairs: Vec<(NodeId, NodeId)> = Vec::new();
        let mut seen_pairs: HashSet<(NodeId, NodeId)> = HashSet::new();

        for i in 0..nodes.len() {
            for j in (i + 1)..nodes.len() {
                if nodes[i].id() == nodes[j].id() {
                    continue;
                }
                let path = self.search_pair(graph, nodes[i], nodes[j])?;
                for hop in path.windows(2) {
                    let (a, b) = (hop[0].clone(), hop[1].clone());
                    let key = if a <= b {
                        (a.clone(), b.clone())
                    } else {
                        (b.clone(), a.clone())
                    };
                    if seen_pairs.insert(key) {
                        edge_pairs.push((a, b));
                    }
                }
            }
        }

        let facts = collect_pair_facts(graph, &edge_pairs)?;
        Ok(RetrievalOutcome::from_facts(facts))
    }
}

impl Retriever for AStarRetriever {
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

/// Walk `came_from` back from `end` to the path origin, returned in
/// origin-first order.
fn reconstruct(came_from: &HashMap<NodeId, NodeId>, end: &NodeId) -> Vec<NodeId> {
    let mut path = vec![end.clone()];
    let mut cursor = end;
    while let Some(prev) = came_from.get(cursor) {
        path.push(prev.clone());
        cursor = prev;
    }
    path.reverse();
    path
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::in_memory::InMemoryGraph;
    use crate::model::Fact;
    use crate::retrieval::test_support::TableOracle;
    use crate::retrieval::SeedGroup;

    fn chain_graph(names: &[&str]) -> InMemoryGraph {
        let mut g = InMemoryGraph::new();
        let facts: Vec<Fact> = names
            .windows(2)
            .map(|w| Fact::simple(Node::object(w[0]), "linked_to", Node::object(w[1])))
            .collect();
        g.create(facts, None).unwrap();
        g
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

    fn retriever(config: AStarConfig) -> AStarRetriever {
        AStarRetriever::new(Arc::new(TableOracle::new(2)), config)
    }

    #[test]
    fn finds_the_connecting_path_facts() {
        let g = chain_graph(&["a", "b", "c", "d"]);
        let mut r = retriever(AStarConfig::default());

        let outcome = r.retrieve(&g, &ctx_for(&["a", "d"])).unwrap();
        assert_eq!(outcome.facts().len(), 3, "all three hops of the chain");
    }

    #[test]
    fn constant_heuristic_matches_bfs_shortest_path_length() {
        // With the table oracle every unknown text scores a constant
        // distance, so A* must order purely by g — the returned path length
        // equals the true BFS shortest-path length.
        let mut g = chain_graph(&["a", "b", "c", "d", "e"]);
        // Shortcut a—x—e of length 2 beats the 4-hop chain.
        g.create(
            vec![
                Fact::simple(Node::object("a"), "linked_to", Node::object("x")),
                Fact::simple(Node::object("x"), "linked_to", Node::object("e")),
            ],
            Some(vec![
                crate::graph::CreateFlags {
                    create_subject: false,
                    create_object: true,
                },
                crate::graph::CreateFlags {
                    create_subject: false,
                    create_object: false,
                },
            ]),
        )
        .unwrap();

        let mut r = retriever(AStarConfig::default());
        let outcome = r.retrieve(&g, &ctx_for(&["a", "e"])).unwrap();
        assert_eq!(outcome.facts().len(), 2, "the 2-hop shortcut, not the chain");
    }

    #[test]
    fn unreachable_goal_falls_back_to_spare_path() {
        let mut g = chain_graph(&["a", "b"]);
        // "z" exists but is disconnected.
        g.create(
            vec![Fact::simple(Node::object("z"), "linked_to", Node::object("w"))],
            None,
        )
        .unwrap();

        let mut r = retriever(AStarConfig::default());
        let outcome = r.retrieve(&g, &ctx_for(&["a", "z"])).unwrap();
        // Spare path from a's island still yields the a—b edge.
        assert_eq!(outcome.facts().len(), 1);
    }

    #[test]
    fn pairwise_paths_deduplicate_shared_edges() {
        // Star: center c linked to a, b, d. Pairs (a,b), (a,d), (b,d) all
        // route through c; each edge must be fetched once.
        let mut g = InMemoryGraph::new();
        g.create(
            vec![
                Fact::simple(Node::object("c"), "linked_to", Node::object("a")),
                Fact::simple(Node::object("c"), "linked_to", Node::object("b")),
                Fact::simple(Node::object("c"), "linked_to", Node::object("d")),
            ],
            None,
        )
        .unwrap();

        let mut r = retriever(AStarConfig::default());
        let outcome = r.retrieve(&g, &ctx_for(&["a", "b", "d"])).unwrap();
        assert_eq!(outcome.facts().len(), 3);
    }

    #[test]
    fn repeated_query_is_served_from_the_memo() {
        let g = chain_graph(&["a", "b", "c"]);
        let mut r = retriever(AStarConfig::default());
        let ctx = ctx_for(&["a", "c"]);

        let first = r.retrieve(&g, &ctx).unwrap();
        let second = r.retrieve(&g, &ctx).unwrap();
        assert_eq!(first.facts().len(), second.facts().len());
    }

    #[test]
    fn cancellation_returns_partial_results_not_an_error() {
        let g = chain_graph(&["a", "b", "c", "d", "e", "f"]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut r = retriever(AStarConfig::default()).with_cancel(cancel);

        let outcome = r.retrieve(&g, &ctx_for(&["a", "f"])).unwrap();
        // Pre-cancelled: the search stops at the start node, yielding no
        // hops — a NoMatch, never an Err.
        assert!(outcome.is_no_match());
    }

    #[test]
    fn weighted_heuristics_still_reach_the_goal() {
        let g = chain_graph(&["a", "b", "c"]);
        for heuristic in [
            Heuristic::WeightWithShortPath,
            Heuristic::AvgWeightedWithShortPath,
        ] {
            let mut r = retriever(AStarConfig {
                heuristic,
                ..AStarConfig::default()
            });
            let outcome = r.retrieve(&g, &ctx_for(&["a", "c"])).unwrap();
            assert_eq!(outcome.facts().len(), 2, "{heuristic:?}");
        }
    }

    #[test]
    fn heuristic_embeds_node_renderings_not_raw_ids() {
        use std::cell::RefCell;

        #[derive(Default)]
        struct RecordingOracle {
            seen: RefCell<Vec<String>>,
        }

        impl EmbeddingOracle for RecordingOracle {
            fn encode(&self, text: &str) -> crate::Result<Vec<f32>> {
                self.seen.borrow_mut().push(text.to_string());
                Ok(vec![0.0, 0.0])
            }

            fn similarity_search(
                &self,
                _query: &[f32],
                _candidate_ids: Option<&[String]>,
                _k: usize,
            ) -> crate::Result<Vec<(f32, String)>> {
                Ok(Vec::new())
            }
        }

        let g = chain_graph(&["a", "b", "c"]);
        let oracle = Arc::new(RecordingOracle::default());
        let mut r = AStarRetriever::new(oracle.clone(), AStarConfig::default());
        r.retrieve(&g, &ctx_for(&["a", "c"])).unwrap();

        let seen = oracle.seen.borrow();
        assert!(
            seen.iter().any(|t| t == &Node::object("b").render()),
            "interior nodes are embedded by rendering"
        );
        assert!(
            seen.iter()
                .all(|t| !(t.len() == 64 && t.chars().all(|c| c.is_ascii_hexdigit()))),
            "raw content hashes never reach the oracle"
        );
    }

    #[test]
    fn no_linked_nodes_is_no_match() {
        let g = chain_graph(&["a", "b"]);
        let mut r = retriever(AStarConfig::default());
        let outcome = r.retrieve(&g, &QueryContext::new("q", vec![])).unwrap();
        assert!(outcome.is_no_match());
    }
}

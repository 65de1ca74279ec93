//! Naive breadth-first retrieval: bounded BFS out of every linked node,
//! collecting the fact behind every traversed edge.
//!
//! No query conditioning at all — the oracle is never consulted. This is the
//! cheap, recall-heavy baseline the smarter algorithms are measured against,
//! and the right tool when the query entities alone carry the signal.

use std::collections::{HashSet, VecDeque};

use crate::graph::GraphStore;
use crate::kv::MemoryKv;
use crate::memo::{KeyPart, MemoArgs, MemoCache};
use crate::model::{FactId, NodeId, NodeKind};
use crate::retrieval::{
    merge_facts, CancelToken, QueryContext, RetrievalOutcome, Retriever,
};
use crate::Result;

#[derive(Debug, Clone)]
pub struct BfsConfig {
    /// Node kinds the walk may traverse. Empty = all kinds.
    pub accepted_kinds: Vec<NodeKind>,
    /// Maximum hop distance from a seed.
    pub max_depth: usize,
    /// Neighbors considered per dequeued node.
    pub max_width: usize,
    /// Total node-dequeue budget per seed.
    pub max_passed_nodes: usize,
}

impl Default for BfsConfig {
    fn default() -> Self {
        Self {
            accepted_kinds: vec![NodeKind::Object],
            max_depth: 3,
            max_width: 16,
            max_passed_nodes: 256,
        }
    }
}

impl BfsConfig {
    fn fingerprint(&self) -> String {
        format!(
            "bfs:kinds={:?}:depth={}:width={}:passed={}",
            self.accepted_kinds, self.max_depth, self.max_width, self.max_passed_nodes
        )
    }
}

pub struct BfsRetriever {
    config: BfsConfig,
    memo: MemoCache<MemoryKv>,
    cancel: CancelToken,
}

impl BfsRetriever {
    pub fn new(config: BfsConfig) -> Self {
        let memo = MemoCache::new(MemoryKv::new(), vec![config.fingerprint()]);
        Self {
            config,
            memo,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Walk outward from one seed, appending the facts of every traversed
    /// edge into the accumulator as they are crossed.
    fn walk_seed(
        &self,
        graph: &dyn GraphStore,
        seed: &NodeId,
        acc: &mut Vec<crate::model::Fact>,
        seen: &mut HashSet<FactId>,
    ) -> Result<()> {
        let mut visited: HashSet<NodeId> = HashSet::from([seed.clone()]);
        let mut queue: VecDeque<(NodeId, usize)> = VecDeque::from([(seed.clone(), 0)]);
        let mut passed = 0usize;

        while let Some((node, depth)) = queue.pop_front() {
            if self.cancel.is_cancelled() || passed >= self.config.max_passed_nodes {
                break;
            }
            passed += 1;
            if depth >= self.config.max_depth {
                continue;
            }

            let neighbors = graph.get_adjacent_node_ids(&node, &self.config.accepted_kinds)?;
            for next in neighbors.into_iter().take(self.config.max_width) {
                let facts = match graph.get_facts(&node, &next) {
                    Ok(f) => f,
                    Err(crate::MnemographError::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                };
                merge_facts(acc, seen, facts);
                if visited.insert(next.clone()) {
                    queue.push_back((next, depth + 1));
                }
            }
        }
        Ok(())
    }

    fn run(&self, graph: &dyn GraphStore, ctx: &QueryContext) -> Result<RetrievalOutcome> {
        let mut acc = Vec::new();
        let mut seen = HashSet::new();
        for node in ctx.linked_nodes() {
            self.walk_seed(graph, &node.id(), &mut acc, &mut seen)?;
        }
        Ok(RetrievalOutcome::from_facts(acc))
    }
}

impl Retriever for BfsRetriever {
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
    use crate::model::{Fact, Node};
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

    #[test]
    fn collects_every_edge_within_depth() {
        let g = chain_graph(&["a", "b", "c", "d", "e"]);
        let mut r = BfsRetriever::new(BfsConfig {
            max_depth: 2,
            ..BfsConfig::default()
        });

        let outcome = r.retrieve(&g, &ctx_for(&["a"])).unwrap();
        // Depth 2 from a reaches c: edges a—b and b—c.
        assert_eq!(outcome.facts().len(), 2);
    }

    #[test]
    fn seeds_merge_without_duplicate_facts() {
        let g = chain_graph(&["a", "b", "c"]);
        let mut r = BfsRetriever::new(BfsConfig::default());

        // Both seeds reach both edges; each fact appears once.
        let outcome = r.retrieve(&g, &ctx_for(&["a", "c"])).unwrap();
        assert_eq!(outcome.facts().len(), 2);
    }

    #[test]
    fn max_width_caps_the_fan_out() {
        let mut g = InMemoryGraph::new();
        let facts: Vec<Fact> = (0..6)
            .map(|i| {
                Fact::simple(
                    Node::object("hub"),
                    "linked_to",
                    Node::object(format!("spoke{i}")),
                )
            })
            .collect();
        g.create(facts, None).unwrap();

        let mut r = BfsRetriever::new(BfsConfig {
            max_width: 3,
            ..BfsConfig::default()
        });
        let outcome = r.retrieve(&g, &ctx_for(&["hub"])).unwrap();
        assert_eq!(outcome.facts().len(), 3, "only the first three neighbors");
    }

    #[test]
    fn unknown_seed_yields_no_match() {
        let g = chain_graph(&["a", "b"]);
        let mut r = BfsRetriever::new(BfsConfig::default());
        let outcome = r.retrieve(&g, &ctx_for(&["nobody"])).unwrap();
        assert!(outcome.is_no_match());
    }

    #[test]
    fn cancellation_keeps_partial_results() {
        let g = chain_graph(&["a", "b", "c"]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut r = BfsRetriever::new(BfsConfig::default()).with_cancel(cancel);

        let outcome = r.retrieve(&g, &ctx_for(&["a"])).unwrap();
        assert!(outcome.is_no_match(), "pre-cancelled walk crosses no edges");
    }
}

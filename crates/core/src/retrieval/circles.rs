//! Water-circles retrieval: expanding rings around every seed entity,
//! prioritizing the places where the rings intersect.
//!
//! Each seed group grows a bounded BFS circle. Every traversed chain (the
//! edge path back to the seed) is scored by how many *other* seed groups it
//! touches — structurally, by running through a node another group's circle
//! has already visited, or textually, through endpoint names or property
//! values with light suffix stripping so "cats" still matches "cat". Chains
//! touching
//! two or more foreign groups outrank chains touching one, which outrank
//! plain edges; per-seed retention shrinks (50%, then 30%) as a seed
//! accumulates intersecting chains, so one well-connected entity cannot
//! flood the answer.
//!
//! Free-text evidence (`hyper`/`episodic` facts on the seed itself) is
//! ranked the same way — by foreign-mention count — and returned alongside
//! the chains. When neither signal shows up, the traversed edges themselves
//! are the fallback, capped.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::graph::GraphStore;
use crate::kv::MemoryKv;
use crate::memo::{KeyPart, MemoArgs, MemoCache};
use crate::model::{Fact, FactId, Node, NodeId, NodeKind};
use crate::retrieval::{
    merge_facts, CancelToken, QueryContext, RetrievalOutcome, Retriever, SeedGroup,
};
use crate::Result;

#[derive(Debug, Clone)]
pub struct WaterCirclesConfig {
    /// Node kinds the circles grow through. Empty = all kinds.
    pub accepted_kinds: Vec<NodeKind>,
    pub max_depth: usize,
    pub max_passed_nodes: usize,
    /// Base number of chains kept per seed before the shrinking thresholds
    /// apply.
    pub max_chains_per_seed: usize,
    /// Free-text facts kept per text kind, divided across seed groups.
    pub max_text_facts: usize,
    /// Cap on the traversed-edge fallback.
    pub fallback_edge_limit: usize,
}

impl Default for WaterCirclesConfig {
    fn default() -> Self {
        Self {
            accepted_kinds: vec![NodeKind::Object],
            max_depth: 3,
            max_passed_nodes: 256,
            max_chains_per_seed: 8,
            max_text_facts: 8,
            fallback_edge_limit: 16,
        }
    }
}

impl WaterCirclesConfig {
    fn fingerprint(&self) -> String {
        format!(
            "circles:kinds={:?}:depth={}:passed={}:chains={}:texts={}:fallback={}",
            self.accepted_kinds, self.max_depth, self.max_passed_nodes,
            self.max_chains_per_seed, self.max_text_facts, self.fallback_edge_limit
        )
    }
}

/// One traversal path from a seed, with the count of *other* seed groups it
/// textually touches.
#[derive(Debug, Clone)]
struct Chain {
    facts: Vec<Fact>,
    touched: usize,
}

pub struct WaterCirclesRetriever {
    config: WaterCirclesConfig,
    memo: MemoCache<MemoryKv>,
    cancel: CancelToken,
}

impl WaterCirclesRetriever {
    pub fn new(config: WaterCirclesConfig) -> Self {
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

    /// Grow one circle: BFS from `seed`, returning every traversed chain,
    /// the flat traversed-edge list for the fallback, and the set of nodes
    /// the circle reached (for cross-circle intersection checks).
    fn grow_circle(
        &self,
        graph: &dyn GraphStore,
        seed: &NodeId,
    ) -> Result<(Vec<Chain>, Vec<Fact>, HashSet<NodeId>)> {
        let mut chains: Vec<Chain> = Vec::new();
        let mut traversed: Vec<Fact> = Vec::new();
        let mut traversed_seen: HashSet<FactId> = HashSet::new();

        // Edge path from the seed to each settled node.
        let mut path_to: HashMap<NodeId, Vec<Fact>> = HashMap::from([(seed.clone(), Vec::new())]);
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

            let prefix = path_to.get(&node).cloned().unwrap_or_default();
            for next in graph.get_adjacent_node_ids(&node, &self.config.accepted_kinds)? {
                let facts = match graph.get_facts(&node, &next) {
                    Ok(f) => f,
                    Err(crate::MnemographError::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                };
                let link = facts.first().cloned();
                for fact in facts {
                    if !traversed_seen.insert(fact.id()) {
                        continue;
                    }
                    let mut chain_facts = prefix.clone();
                    chain_facts.push(fact.clone());
                    chains.push(Chain {
                        facts: chain_facts,
                        touched: 0,
                    });
                    traversed.push(fact);
                }
                if !path_to.contains_key(&next) {
                    let mut path = prefix.clone();
                    if let Some(fact) = link {
                        path.push(fact);
                    }
                    path_to.insert(next.clone(), path);
                    queue.push_back((next, depth + 1));
                }
            }
        }
        let visited: HashSet<NodeId> = path_to.into_keys().collect();
        Ok((chains, traversed, visited))
    }

    /// How many seed groups other than `own` the chain touches: through a
    /// node the other group's circle already visited, or textually through
    /// the chain's endpoint names and property values. The own seed nodes
    /// are not evidence — every chain of a circle runs through its seed.
    fn touch_count(
        chain: &Chain,
        groups: &[SeedGroup],
        visited: &[HashSet<NodeId>],
        own: usize,
    ) -> usize {
        let own_seed_ids: HashSet<NodeId> = groups[own].nodes.iter().map(|n| n.id()).collect();
        let mut texts: Vec<String> = Vec::new();
        let mut chain_nodes: HashSet<NodeId> = HashSet::new();
        for fact in &chain.facts {
            for node in [&fact.subject, &fact.object] {
                texts.push(node.name.clone());
                texts.extend(node.properties.values().cloned());
                let id = node.id();
                if !own_seed_ids.contains(&id) {
                    chain_nodes.insert(id);
                }
            }
        }
        groups
            .iter()
            .enumerate()
            .filter(|(i, group)| {
                if *i == own {
                    return false;
                }
                let structural = chain_nodes.iter().any(|id| visited[*i].contains(id));
                structural
                    || group
                        .mentions
                        .iter()
                        .any(|m| texts.iter().any(|t| mention_in_text(m, t)))
            })
            .count()
    }

    /// Shrinking retention: full cap while intersecting chains are scarce,
    /// 50% of the surplus band, 30% beyond that.
    fn retained_chain_count(&self, intersecting: usize) -> usize {
        let cap = self.config.max_chains_per_seed;
        if intersecting <= cap {
            intersecting
        } else if intersecting <= cap * 3 {
            (intersecting / 2).max(cap)
        } else {
            (intersecting * 3 / 10).max(cap)
        }
    }

    /// Free-text (`hyper`/`episodic`) facts attached to a seed node, ranked
    /// by foreign-mention count, capped per text kind.
    fn text_facts(
        &self,
        graph: &dyn GraphStore,
        seed: &Node,
        groups: &[SeedGroup],
        own: usize,
    ) -> Result<Vec<Fact>> {
        let per_kind = (self.config.max_text_facts / groups.len().max(1)).max(1);
        let mut out = Vec::new();

        for text_kind in [NodeKind::Hyper, NodeKind::Episodic] {
            let neighbors = graph.get_adjacent_node_ids(&seed.id(), &[text_kind])?;
            let mut ranked: Vec<(usize, Fact)> = Vec::new();
            for neighbor in neighbors {
                let facts = match graph.get_facts(&seed.id(), &neighbor) {
                    Ok(f) => f,
                    Err(crate::MnemographError::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                };
                for fact in facts {
                    let text_node = &fact.object;
                    let mut texts: Vec<&str> = vec![text_node.name.as_str()];
                    texts.extend(text_node.properties.values().map(|v| v.as_str()));
                    let foreign = groups
                        .iter()
                        .enumerate()
                        .filter(|(i, group)| {
                            *i != own
                                && group
                                    .mentions
                                    .iter()
                                    .any(|m| texts.iter().any(|t| mention_in_text(m, t)))
                        })
                        .count();
                    ranked.push((foreign, fact));
                }
            }
            ranked.sort_by(|(fa, a), (fb, b)| fb.cmp(fa).then_with(|| a.id().cmp(&b.id())));
            out.extend(ranked.into_iter().take(per_kind).map(|(_, f)| f));
        }
        Ok(out)
    }

    fn run(&self, graph: &dyn GraphStore, ctx: &QueryContext) -> Result<RetrievalOutcome> {
        let groups = &ctx.seeds;
        let mut acc: Vec<Fact> = Vec::new();
        let mut seen: HashSet<FactId> = HashSet::new();
        let mut all_traversed: Vec<Fact> = Vec::new();
        let mut any_intersecting = false;

        // First pass: grow every circle, so intersection checks can see each
        // other group's full visited set.
        let mut per_group_chains: Vec<Vec<Chain>> = Vec::with_capacity(groups.len());
        let mut visited_sets: Vec<HashSet<NodeId>> = Vec::with_capacity(groups.len());
        for group in groups {
            let mut chains: Vec<Chain> = Vec::new();
            let mut visited: HashSet<NodeId> = HashSet::new();
            for node in &group.nodes {
                let (c, traversed, v) = self.grow_circle(graph, &node.id())?;
                chains.extend(c);
                all_traversed.extend(traversed);
                visited.extend(v);
            }
            per_group_chains.push(chains);
            visited_sets.push(visited);
        }

        for (own, group) in groups.iter().enumerate() {
            let mut group_chains = std::mem::take(&mut per_group_chains[own]);
            for chain in &mut group_chains {
                chain.touched = Self::touch_count(chain, groups, &visited_sets, own);
            }

            // Intersecting chains first: ≥2 foreign groups, then exactly 1.
            group_chains.sort_by(|a, b| {
                b.touched
                    .cmp(&a.touched)
                    .then_with(|| a.facts.len().cmp(&b.facts.len()))
            });
            let intersecting = group_chains.iter().filter(|c| c.touched > 0).count();
            if intersecting > 0 {
                any_intersecting = true;
                let keep = self.retained_chain_count(intersecting);
                debug!(seed = own, intersecting, keep, "retaining intersecting chains");
                for chain in group_chains.into_iter().filter(|c| c.touched > 0).take(keep) {
                    merge_facts(&mut acc, &mut seen, chain.facts);
                }
            }

            for node in &group.nodes {
                let texts = self.text_facts(graph, node, groups, own)?;
                merge_facts(&mut acc, &mut seen, texts);
            }
        }

        if !any_intersecting && acc.is_empty() {
            // No cross-seed signal and no text evidence: fall back to the
            // raw circles.
            let mut fallback = Vec::new();
            let mut fallback_seen = HashSet::new();
            merge_facts(&mut fallback, &mut fallback_seen, all_traversed);
            fallback.truncate(self.config.fallback_edge_limit);
            return Ok(RetrievalOutcome::from_facts(fallback));
        }

        Ok(RetrievalOutcome::from_facts(acc))
    }
}

impl Retriever for WaterCirclesRetriever {
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
// Mention matching
// ---------------------------------------------------------------------------

/// Strip one common morphological suffix, longest first.
fn stem(word: &str) -> &str {
    for suffix in ["ing", "ed", "es", "s"] {
        if let Some(base) = word.strip_suffix(suffix) {
            if base.len() >= 2 {
                return base;
            }
        }
    }
    word
}

/// Whether `mention` occurs in `text`, word-wise, after lowercasing and
/// suffix stripping on both sides.
fn mention_in_text(mention: &str, text: &str) -> bool {
    let mention = mention.to_lowercase();
    let needle = stem(&mention);
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| !word.is_empty() && stem(word) == needle)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::in_memory::InMemoryGraph;

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
    fn mention_matching_strips_suffixes() {
        assert!(mention_in_text("cats", "a cat sat down"));
        assert!(mention_in_text("walk", "she walked home"));
        assert!(mention_in_text("alice", "Alice's report"));
        assert!(!mention_in_text("bob", "a cat sat down"));
    }

    #[test]
    fn cross_seed_chain_beats_single_seed_chains_under_a_strict_cap() {
        // alice has three plain branches and one chain leading to bob; with
        // a one-chain cap, the bob chain must be the one retained.
        let mut g = InMemoryGraph::new();
        g.create(
            vec![
                simple("alice", "visited", "paris"),
                simple("alice", "visited", "rome"),
                simple("alice", "visited", "oslo"),
                simple("alice", "works_with", "bob"),
            ],
            None,
        )
        .unwrap();

        let mut r = WaterCirclesRetriever::new(WaterCirclesConfig {
            max_chains_per_seed: 1,
            max_depth: 1,
            ..WaterCirclesConfig::default()
        });
        let outcome = r.retrieve(&g, &ctx_for(&["alice", "bob"])).unwrap();
        let works_with = simple("alice", "works_with", "bob");
        assert!(
            outcome.facts().iter().any(|f| f.id() == works_with.id()),
            "the bob-touching chain survives the cap"
        );
        assert!(
            !outcome
                .facts()
                .iter()
                .any(|f| f.relation.name == "visited"),
            "zero-touch chains are not retained when intersections exist"
        );
    }

    #[test]
    fn chains_meeting_another_circle_at_a_shared_node_are_intersecting() {
        // alice and bob both know carol; carol never appears in any query
        // mention, so the intersection is purely structural.
        let mut g = InMemoryGraph::new();
        g.create(
            vec![
                simple("alice", "knows", "carol"),
                simple("bob", "knows", "carol"),
                simple("alice", "visited", "paris"),
                simple("alice", "visited", "rome"),
                simple("alice", "visited", "oslo"),
            ],
            None,
        )
        .unwrap();

        let mut r = WaterCirclesRetriever::new(WaterCirclesConfig {
            max_chains_per_seed: 1,
            max_depth: 2,
            ..WaterCirclesConfig::default()
        });
        let outcome = r.retrieve(&g, &ctx_for(&["alice", "bob"])).unwrap();

        let knows_carol = simple("alice", "knows", "carol");
        assert!(
            outcome.facts().iter().any(|f| f.id() == knows_carol.id()),
            "the chain meeting bob's circle at carol survives the cap"
        );
        assert!(
            !outcome
                .facts()
                .iter()
                .any(|f| f.relation.name == "visited"),
            "single-seed chains are not retained when an intersection exists"
        );
    }

    #[test]
    fn text_facts_ranked_by_foreign_mentions() {
        let mut g = InMemoryGraph::new();
        let about_bob = Fact::hyper(Node::object("alice"), Node::hyper("alice mentors bob daily"));
        let about_tea = Fact::hyper(Node::object("alice"), Node::hyper("alice drinks green tea"));
        g.create(vec![about_bob.clone(), about_tea], None).unwrap();

        let mut r = WaterCirclesRetriever::new(WaterCirclesConfig {
            max_text_facts: 2, // two groups → one text fact per kind
            ..WaterCirclesConfig::default()
        });
        let outcome = r.retrieve(&g, &ctx_for(&["alice", "bob"])).unwrap();
        assert!(outcome.facts().iter().any(|f| f.id() == about_bob.id()));
        assert!(
            !outcome
                .facts()
                .iter()
                .any(|f| f.object.name.contains("tea")),
            "the bob-mentioning text outranks the tea one"
        );
    }

    #[test]
    fn no_intersections_falls_back_to_traversed_edges() {
        let mut g = InMemoryGraph::new();
        g.create(
            vec![simple("alice", "visited", "paris"), simple("paris", "in", "france")],
            None,
        )
        .unwrap();

        let mut r = WaterCirclesRetriever::new(WaterCirclesConfig::default());
        let outcome = r.retrieve(&g, &ctx_for(&["alice"])).unwrap();
        assert_eq!(outcome.facts().len(), 2, "both traversed edges returned");
    }

    #[test]
    fn fallback_respects_the_edge_limit() {
        let mut g = InMemoryGraph::new();
        let facts: Vec<Fact> = (0..10)
            .map(|i| simple("hub", "r", &format!("spoke{i}")))
            .collect();
        g.create(facts, None).unwrap();

        let mut r = WaterCirclesRetriever::new(WaterCirclesConfig {
            fallback_edge_limit: 4,
            ..WaterCirclesConfig::default()
        });
        let outcome = r.retrieve(&g, &ctx_for(&["hub"])).unwrap();
        assert_eq!(outcome.facts().len(), 4);
    }

    #[test]
    fn unknown_seed_is_no_match() {
        let g = InMemoryGraph::new();
        let mut r = WaterCirclesRetriever::new(WaterCirclesConfig::default());
        let outcome = r.retrieve(&g, &ctx_for(&["ghost"])).unwrap();
        assert!(outcome.is_no_match());
    }
}

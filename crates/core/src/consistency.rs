//! Consistency: detecting and retiring facts a newer fact supersedes.
//!
//! For every incoming fact the engine gathers candidate facts from the
//! graph neighborhood — which neighborhood depends on the relation kind —
//! and asks an external judge which of them the new fact makes obsolete.
//! Episodic facts are special-cased: a mention whose anchoring statements
//! are gone is structurally obsolete, no judgment call needed.
//!
//! Two hard rules:
//!
//! - a failed or unsuccessful judge call deletes **nothing**; the new fact
//!   is inserted regardless, so partial failure never blocks ingestion;
//! - ingestion is fact-by-fact, never batched, so later facts in the same
//!   call observe the deletions made for earlier ones.
//!
//! Obsolete facts lose their edge only; endpoint nodes stay, because other
//! facts may still reference them.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::graph::{CreateFlags, DeleteFlags, GraphStore, IdKind};
use crate::model::{Fact, FactId, NodeId, NodeKind, RelationKind};
use crate::Result;

// ---------------------------------------------------------------------------
// Judge
// ---------------------------------------------------------------------------

/// Whether the judge reached a usable verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JudgeStatus {
    Success,
    /// The judge ran but could not decide; treated exactly like an `Err`.
    Failure,
}

/// The judge's verdict: which of the offered incident facts the new fact
/// supersedes.
#[derive(Debug, Clone)]
pub struct JudgeDecision {
    pub status: JudgeStatus,
    pub obsolete: Vec<FactId>,
}

impl JudgeDecision {
    pub fn keep_all() -> Self {
        Self {
            status: JudgeStatus::Success,
            obsolete: Vec::new(),
        }
    }
}

/// External decision function for semantic obsolescence. Prompting and
/// model calls live behind this trait, outside the core.
pub trait ObsolescenceJudge {
    fn decide(&self, candidate: &Fact, incident: &[Fact]) -> Result<JudgeDecision>;
}

/// A judge that never retires anything; the engine degrades to plain
/// insertion.
pub struct KeepAllJudge;

impl ObsolescenceJudge for KeepAllJudge {
    fn decide(&self, _candidate: &Fact, _incident: &[Fact]) -> Result<JudgeDecision> {
        Ok(JudgeDecision::keep_all())
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// What one [`ConsistencyEngine::ingest`] call did.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub inserted: usize,
    pub deleted: Vec<FactId>,
}

pub struct ConsistencyEngine {
    judge: Box<dyn ObsolescenceJudge>,
}

impl ConsistencyEngine {
    pub fn new(judge: Box<dyn ObsolescenceJudge>) -> Self {
        Self { judge }
    }

    /// Insert `facts` one by one, retiring whatever each makes obsolete
    /// before the next is processed.
    pub fn ingest(&self, graph: &mut dyn GraphStore, facts: Vec<Fact>) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        for fact in facts {
            let obsolete = self.find_obsolete(graph, &fact)?;
            if !obsolete.is_empty() {
                debug!(count = obsolete.len(), fact = %fact.render(), "retiring superseded facts");
                let flags = vec![DeleteFlags::edge_only(); obsolete.len()];
                graph.delete(&obsolete, Some(flags))?;
                report.deleted.extend(obsolete);
            }

            let flags = CreateFlags {
                create_subject: !graph.item_exist(fact.subject.id().as_str(), IdKind::Node)?,
                create_object: !graph.item_exist(fact.object.id().as_str(), IdKind::Node)?,
            };
            graph.create(vec![fact], Some(vec![flags]))?;
            report.inserted += 1;
        }
        Ok(report)
    }

    /// The ids of existing facts the new fact supersedes. Kind-specific
    /// candidate gathering; semantic cases go through the judge, structural
    /// episodic cases do not.
    fn find_obsolete(&self, graph: &dyn GraphStore, fact: &Fact) -> Result<Vec<FactId>> {
        let obsolete = match fact.relation.kind {
            RelationKind::Simple => {
                let mut candidates = Vec::new();
                let mut seen = HashSet::new();
                for endpoint in [&fact.subject, &fact.object] {
                    self.gather_neighbor_facts(
                        graph,
                        &endpoint.name,
                        NodeKind::Object,
                        NodeKind::Object,
                        &mut candidates,
                        &mut seen,
                    )?;
                }
                self.judge_obsolete(fact, candidates)?
            }
            RelationKind::Hyper => {
                let mut candidates = Vec::new();
                let mut seen = HashSet::new();
                self.gather_neighbor_facts(
                    graph,
                    &fact.subject.name,
                    NodeKind::Object,
                    NodeKind::Hyper,
                    &mut candidates,
                    &mut seen,
                )?;
                self.judge_obsolete(fact, candidates)?
            }
            RelationKind::Episodic => match fact.subject.kind {
                NodeKind::Object => self.unanchored_mentions_of_object(graph, fact)?,
                NodeKind::Hyper => self.orphaned_mentions_of_hyper(graph, fact)?,
                _ => Vec::new(),
            },
            // Time edges are bookkeeping; they never supersede anything.
            RelationKind::Time => Vec::new(),
        };

        // A stale id would fail the delete batch; drop anything already gone.
        let mut live = Vec::new();
        for id in obsolete {
            if graph.item_exist(id.as_str(), IdKind::Fact)? {
                live.push(id);
            }
        }
        Ok(live)
    }

    /// All facts between nodes named `name` (of `node_kind`) and their
    /// neighbors of `neighbor_kind`, deduplicated into `out`.
    fn gather_neighbor_facts(
        &self,
        graph: &dyn GraphStore,
        name: &str,
        node_kind: NodeKind,
        neighbor_kind: NodeKind,
        out: &mut Vec<Fact>,
        seen: &mut HashSet<FactId>,
    ) -> Result<()> {
        for node in graph.read_by_name(name, node_kind, None)? {
            let node_id = node.id();
            for neighbor in graph.get_adjacent_node_ids(&node_id, &[neighbor_kind])? {
                for fact in graph.get_facts(&node_id, &neighbor)? {
                    if seen.insert(fact.id()) {
                        out.push(fact);
                    }
                }
            }
        }
        Ok(())
    }

    /// Hand the candidates to the judge; any failure means nothing is
    /// obsolete.
    fn judge_obsolete(&self, fact: &Fact, candidates: Vec<Fact>) -> Result<Vec<FactId>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        match self.judge.decide(fact, &candidates) {
            Ok(decision) if decision.status == JudgeStatus::Success => Ok(decision.obsolete),
            Ok(_) => {
                warn!(fact = %fact.render(), "judge reported failure, keeping all candidates");
                Ok(Vec::new())
            }
            Err(e) => {
                warn!(fact = %fact.render(), error = %e, "judge call failed, keeping all candidates");
                Ok(Vec::new())
            }
        }
    }

    /// Episodic fact whose subject is an `object` node: a mention on an
    /// object node is obsolete once the object and the episode share no
    /// `hyper` statement anymore.
    fn unanchored_mentions_of_object(
        &self,
        graph: &dyn GraphStore,
        fact: &Fact,
    ) -> Result<Vec<FactId>> {
        let mut obsolete = Vec::new();
        for node in graph.read_by_name(&fact.subject.name, NodeKind::Object, None)? {
            let node_id = node.id();
            let episodes = graph.get_adjacent_node_ids(&node_id, &[NodeKind::Episodic])?;
            if episodes.is_empty() {
                continue;
            }
            let own_hyper: HashSet<NodeId> = graph
                .get_adjacent_node_ids(&node_id, &[NodeKind::Hyper])?
                .into_iter()
                .collect();
            for episode in episodes {
                let shared = graph
                    .get_adjacent_node_ids(&episode, &[NodeKind::Hyper])?
                    .iter()
                    .any(|h| own_hyper.contains(h));
                if !shared {
                    for old in graph.get_facts(&node_id, &episode)? {
                        obsolete.push(old.id());
                    }
                }
            }
        }
        Ok(obsolete)
    }

    /// Episodic fact whose subject is a `hyper` node: a statement with no
    /// remaining `object` anchor drags all its mentions down with it.
    fn orphaned_mentions_of_hyper(
        &self,
        graph: &dyn GraphStore,
        fact: &Fact,
    ) -> Result<Vec<FactId>> {
        let mut obsolete = Vec::new();
        for node in graph.read_by_name(&fact.subject.name, NodeKind::Hyper, None)? {
            let node_id = node.id();
            let anchors = graph.get_adjacent_node_ids(&node_id, &[NodeKind::Object])?;
            if !anchors.is_empty() {
                continue;
            }
            for episode in graph.get_adjacent_node_ids(&node_id, &[NodeKind::Episodic])? {
                for old in graph.get_facts(&node_id, &episode)? {
                    obsolete.push(old.id());
                }
            }
        }
        Ok(obsolete)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

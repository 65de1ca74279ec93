//! In-memory reference implementation of [`GraphStore`].
//!
//! Arena + index layout: node and fact *instances* live in flat maps keyed by
//! a fresh ULID surrogate id; every relationship between them is an id
//! reference, never an embedded pointer, so self-links and cycles are plain
//! index loops with no ownership ambiguity.
//!
//! # Multi-instance dedup invariant
//!
//! One business key may map to *several* physical instances: each `create`
//! with `create_subject`/`create_object` set allocates a fresh instance, the
//! way facts inserted in different transactions without cross-referencing
//! land as separate rows in a real backend. The store compensates at edge
//! time — a new fact is connected across **every** instance pairing of its
//! endpoints' business keys — so a later read addressed by business key
//! observes every edge ever attached under it, no matter which instance the
//! edge was physically recorded against.
//!
//! Name lookups are O(n) full scans. This backend is a correctness
//! reference, not a performance target; production backends are expected to
//! index by business key.

use std::collections::{BTreeSet, HashMap, HashSet};

use ulid::Ulid;

use crate::graph::{
    CreateFlags, DeleteFlags, GraphStore, IdKind, ItemCounts, SharedEdge, SharedIdKind,
};
use crate::model::{Fact, FactId, Node, NodeId, NodeKind, RelationId};
use crate::{MnemographError, Result};

/// Surrogate id of one physical instance. ULIDs keep instance ids
/// time-sortable, which makes debugging dumps readable.
type InstanceId = String;

fn fresh_instance_id() -> InstanceId {
    Ulid::new().to_string()
}

/// The endpoints one fact instance was physically wired to.
#[derive(Debug, Clone)]
struct FactWiring {
    subject: InstanceId,
    object: InstanceId,
    time: Option<InstanceId>,
}

/// In-memory graph store: arenas for instances, business-key indices over
/// them, and adjacency sets per node instance.
#[derive(Debug, Default)]
pub struct InMemoryGraph {
    nodes: HashMap<InstanceId, Node>,
    facts: HashMap<InstanceId, Fact>,
    wiring: HashMap<InstanceId, FactWiring>,
    /// node instance → incident fact instances.
    edges: HashMap<InstanceId, HashSet<InstanceId>>,
    /// node instance → adjacent node instances.
    neighbors: HashMap<InstanceId, HashSet<InstanceId>>,
    /// Business-key indices. BTreeSet keeps per-key instance order
    /// deterministic.
    node_index: HashMap<NodeId, BTreeSet<InstanceId>>,
    relation_index: HashMap<RelationId, BTreeSet<InstanceId>>,
    fact_index: HashMap<FactId, BTreeSet<InstanceId>>,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh node instance and index it under its business key.
    fn alloc_node(&mut self, node: &Node) -> InstanceId {
        let inst = fresh_instance_id();
        self.nodes.insert(inst.clone(), node.clone());
        self.node_index
            .entry(node.id())
            .or_default()
            .insert(inst.clone());
        self.edges.entry(inst.clone()).or_default();
        self.neighbors.entry(inst.clone()).or_default();
        inst
    }

    /// All instances currently recorded under a node business key.
    fn node_instances(&self, id: &NodeId) -> Vec<InstanceId> {
        self.node_index
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Resolve the instance set an endpoint participates with: allocate a
    /// fresh instance when the flag asks for creation, then collect every
    /// instance under the business key (old and new alike).
    fn resolve_endpoint(&mut self, node: &Node, create: bool) -> Result<Vec<InstanceId>> {
        let id = node.id();
        if create {
            self.alloc_node(node);
        } else if !self.node_index.contains_key(&id) {
            return Err(MnemographError::NotFound(format!(
                "node {} ({}) referenced with create=false",
                node.name, id
            )));
        }
        Ok(self.node_instances(&id))
    }

    /// Time nodes are shared, never multiplied: reuse the existing instance
    /// for the business key if one exists.
    fn resolve_time(&mut self, node: &Node) -> InstanceId {
        let id = node.id();
        if let Some(inst) = self.node_index.get(&id).and_then(|s| s.iter().next()) {
            return inst.clone();
        }
        self.alloc_node(node)
    }

    fn link(&mut self, a: &InstanceId, b: &InstanceId) {
        self.neighbors.entry(a.clone()).or_default().insert(b.clone());
        self.neighbors.entry(b.clone()).or_default().insert(a.clone());
    }

    /// Drop the neighbor link between two instances unless some remaining
    /// fact still wires them together.
    fn unlink_if_disconnected(&mut self, a: &InstanceId, b: &InstanceId) {
        let still_wired = self
            .edges
            .get(a)
            .map(|facts| {
                facts.iter().any(|f| {
                    self.wiring.get(f).is_some_and(|w| {
                        let ends = [&w.subject, &w.object];
                        let time = w.time.as_ref();
                        (ends.contains(&a) || time == Some(a))
                            && (ends.contains(&b) || time == Some(b))
                    })
                })
            })
            .unwrap_or(false);
        if !still_wired {
            if let Some(set) = self.neighbors.get_mut(a) {
                set.remove(b);
            }
            if let Some(set) = self.neighbors.get_mut(b) {
                set.remove(a);
            }
        }
    }

    /// Tear one fact instance out of arenas, indices and adjacency.
    fn remove_fact_instance(&mut self, fact_inst: &InstanceId) {
        let Some(fact) = self.facts.remove(fact_inst) else {
            return;
        };
        let Some(wiring) = self.wiring.remove(fact_inst) else {
            return;
        };

        let fact_id = fact.id();
        let relation_id = fact.relation_id();
        if let Some(set) = self.fact_index.get_mut(&fact_id) {
            set.remove(fact_inst);
            if set.is_empty() {
                self.fact_index.remove(&fact_id);
            }
        }
        if let Some(set) = self.relation_index.get_mut(&relation_id) {
            set.remove(fact_inst);
            if set.is_empty() {
                self.relation_index.remove(&relation_id);
            }
        }

        let mut touched: Vec<InstanceId> = vec![wiring.subject.clone(), wiring.object.clone()];
        if let Some(t) = &wiring.time {
            touched.push(t.clone());
        }
        for inst in &touched {
            if let Some(set) = self.edges.get_mut(inst) {
                set.remove(fact_inst);
            }
        }
        // Neighbor links survive only while another fact still wires the
        // pair together.
        for i in 0..touched.len() {
            for j in (i + 1)..touched.len() {
                let (a, b) = (touched[i].clone(), touched[j].clone());
                self.unlink_if_disconnected(&a, &b);
            }
        }
    }

    /// Remove one node instance and cascade to any facts still wired to it.
    fn remove_node_instance(&mut self, node_inst: &InstanceId) {
        let incident: Vec<InstanceId> = self
            .edges
            .get(node_inst)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        for fact_inst in incident {
            self.remove_fact_instance(&fact_inst);
        }

        if let Some(node) = self.nodes.remove(node_inst) {
            let id = node.id();
            if let Some(set) = self.node_index.get_mut(&id) {
                set.remove(node_inst);
                if set.is_empty() {
                    self.node_index.remove(&id);
                }
            }
        }
        let adjacent: Vec<InstanceId> = self
            .neighbors
            .remove(node_inst)
            .map(|s| s.into_iter().collect())
            .unwrap_or_default();
        for other in adjacent {
            if let Some(set) = self.neighbors.get_mut(&other) {
                set.remove(node_inst);
            }
        }
        self.edges.remove(node_inst);
    }

    /// Distinct business keys of the facts connecting two instance sets,
    /// with one representative instance each.
    fn connecting_facts(
        &self,
        a_insts: &[InstanceId],
        b_insts: &[InstanceId],
    ) -> Vec<(FactId, InstanceId)> {
        let b_set: HashSet<&InstanceId> = b_insts.iter().collect();
        let mut seen: BTreeSet<FactId> = BTreeSet::new();
        let mut out = Vec::new();
        for a in a_insts {
            let Some(facts) = self.edges.get(a) else {
                continue;
            };
            for fact_inst in facts {
                let Some(w) = self.wiring.get(fact_inst) else {
                    continue;
                };
                let other = if &w.subject == a {
                    &w.object
                } else if &w.object == a {
                    &w.subject
                } else {
                    continue; // incident via the time anchor only
                };
                if !b_set.contains(other) {
                    continue;
                }
                if let Some(fact) = self.facts.get(fact_inst) {
                    if seen.insert(fact.id()) {
                        out.push((fact.id(), fact_inst.clone()));
                    }
                }
            }
        }
        out.sort_by(|(a, _), (b, _)| a.cmp(b));
        out
    }
}

impl GraphStore for InMemoryGraph {
    fn create(&mut self, facts: Vec<Fact>, flags: Option<Vec<CreateFlags>>) -> Result<()> {
        let flags = match flags {
            Some(f) if f.len() != facts.len() => {
                return Err(MnemographError::Validation(format!(
                    "flag list length {} does not match batch size {}",
                    f.len(),
                    facts.len()
                )));
            }
            Some(f) => f,
            None => vec![CreateFlags::default(); facts.len()],
        };

        // Duplicate fact ids within one batch fail before any mutation.
        let mut seen = HashSet::new();
        for fact in &facts {
            if !seen.insert(fact.id()) {
                return Err(MnemographError::Validation(format!(
                    "duplicate fact in batch: {}",
                    fact.render()
                )));
            }
        }

        for (fact, flag) in facts.into_iter().zip(flags) {
            let subject_insts = self.resolve_endpoint(&fact.subject, flag.create_subject)?;
            let object_insts = self.resolve_endpoint(&fact.object, flag.create_object)?;
            let time_inst = fact.time.as_ref().map(|t| self.resolve_time(t));

            let fact_id = fact.id();
            let relation_id = fact.relation_id();

            // Wire the fact across every instance pairing of its endpoints
            // so each instance's adjacency observes the edge.
            for s_inst in &subject_insts {
                for o_inst in &object_insts {
                    let fact_inst = fresh_instance_id();
                    self.facts.insert(fact_inst.clone(), fact.clone());
                    self.wiring.insert(
                        fact_inst.clone(),
                        FactWiring {
                            subject: s_inst.clone(),
                            object: o_inst.clone(),
                            time: time_inst.clone(),
                        },
                    );
                    self.fact_index
                        .entry(fact_id.clone())
                        .or_default()
                        .insert(fact_inst.clone());
                    self.relation_index
                        .entry(relation_id.clone())
                        .or_default()
                        .insert(fact_inst.clone());

                    self.edges
                        .entry(s_inst.clone())
                        .or_default()
                        .insert(fact_inst.clone());
                    self.edges
                        .entry(o_inst.clone())
                        .or_default()
                        .insert(fact_inst.clone());
                    self.link(s_inst, o_inst);

                    if let Some(t_inst) = &time_inst {
                        self.edges
                            .entry(t_inst.clone())
                            .or_default()
                            .insert(fact_inst.clone());
                        self.link(s_inst, t_inst);
                        self.link(o_inst, t_inst);
                    }
                }
            }
        }
        Ok(())
    }

    fn read(&self, fact_ids: &[FactId]) -> Result<Vec<Option<Fact>>> {
        Ok(fact_ids
            .iter()
            .map(|id| {
                self.fact_index
                    .get(id)
                    .and_then(|insts| insts.iter().next())
                    .and_then(|inst| self.facts.get(inst))
                    .cloned()
            })
            .collect())
    }

    fn read_nodes(&self, node_ids: &[NodeId]) -> Result<Vec<Option<Node>>> {
        Ok(node_ids
            .iter()
            .map(|id| {
                self.node_index
                    .get(id)
                    .and_then(|insts| insts.iter().next())
                    .and_then(|inst| self.nodes.get(inst))
                    .cloned()
            })
            .collect())
    }

    fn delete(&mut self, fact_ids: &[FactId], flags: Option<Vec<DeleteFlags>>) -> Result<()> {
        let flags = match flags {
            Some(f) if f.len() != fact_ids.len() => {
                return Err(MnemographError::Validation(format!(
                    "flag list length {} does not match batch size {}",
                    f.len(),
                    fact_ids.len()
                )));
            }
            Some(f) => f,
            None => vec![DeleteFlags::default(); fact_ids.len()],
        };

        for id in fact_ids {
            if !self.fact_index.contains_key(id) {
                return Err(MnemographError::NotFound(format!("fact {id}")));
            }
        }

        for (id, flag) in fact_ids.iter().zip(flags) {
            let insts: Vec<InstanceId> = self
                .fact_index
                .get(id)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default();

            let mut subjects = BTreeSet::new();
            let mut objects = BTreeSet::new();
            for inst in &insts {
                if let Some(w) = self.wiring.get(inst) {
                    subjects.insert(w.subject.clone());
                    objects.insert(w.object.clone());
                }
                self.remove_fact_instance(inst);
            }
            // Node removal touches only the instances this fact was wired
            // to, never other instances sharing the business key.
            if flag.delete_subject {
                for inst in subjects {
                    self.remove_node_instance(&inst);
                }
            }
            if flag.delete_object {
                for inst in objects {
                    self.remove_node_instance(&inst);
                }
            }
        }
        Ok(())
    }

    fn read_by_name(
        &self,
        name: &str,
        kind: NodeKind,
        object_kind: Option<NodeKind>,
    ) -> Result<Vec<Node>> {
        // Full scan by design, see the module docs.
        let mut out: Vec<Node> = Vec::new();
        let mut seen: BTreeSet<NodeId> = BTreeSet::new();
        let mut matches: Vec<(NodeId, &Node)> = self
            .nodes
            .values()
            .filter(|n| n.name == name && n.kind == kind)
            .map(|n| (n.id(), n))
            .collect();
        matches.sort_by(|(a, _), (b, _)| a.cmp(b));

        for (id, node) in matches {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(required) = object_kind {
                let has_neighbor = self
                    .get_adjacent_node_ids(&id, &[required])
                    .map(|v| !v.is_empty())
                    .unwrap_or(false);
                if !has_neighbor {
                    continue;
                }
            }
            out.push(node.clone());
        }
        Ok(out)
    }

    fn get_adjacent_node_ids(
        &self,
        node_id: &NodeId,
        accepted_kinds: &[NodeKind],
    ) -> Result<Vec<NodeId>> {
        let mut out: BTreeSet<NodeId> = BTreeSet::new();
        for inst in self.node_instances(node_id) {
            let Some(adjacent) = self.neighbors.get(&inst) else {
                continue;
            };
            for other in adjacent {
                let Some(node) = self.nodes.get(other) else {
                    continue;
                };
                if accepted_kinds.is_empty() || accepted_kinds.contains(&node.kind) {
                    out.insert(node.id());
                }
            }
        }
        // Instance fan-out never links two instances of one business key to
        // each other, so a same-key entry here can only come from a genuine
        // self-loop fact; keep it.
        Ok(out.into_iter().collect())
    }

    fn get_shared_ids(
        &self,
        node1_id: &NodeId,
        node2_id: &NodeId,
        id_kind: SharedIdKind,
    ) -> Result<Vec<SharedEdge>> {
        let a = self.node_instances(node1_id);
        let b = self.node_instances(node2_id);
        let connecting = self.connecting_facts(&a, &b);

        Ok(connecting
            .into_iter()
            .filter_map(|(fact_id, inst)| {
                let fact = self.facts.get(&inst)?;
                Some(match id_kind {
                    SharedIdKind::Fact => SharedEdge {
                        fact_id: Some(fact_id),
                        relation_id: None,
                    },
                    SharedIdKind::Relation => SharedEdge {
                        fact_id: None,
                        relation_id: Some(fact.relation_id()),
                    },
                    SharedIdKind::Both => SharedEdge {
                        fact_id: Some(fact_id),
                        relation_id: Some(fact.relation_id()),
                    },
                })
            })
            .collect())
    }

    fn get_facts(&self, node1_id: &NodeId, node2_id: &NodeId) -> Result<Vec<Fact>> {
        for id in [node1_id, node2_id] {
            if !self.node_index.contains_key(id) {
                return Err(MnemographError::NotFound(format!("node {id}")));
            }
        }
        let a = self.node_instances(node1_id);
        let b = self.node_instances(node2_id);
        Ok(self
            .connecting_facts(&a, &b)
            .into_iter()
            .filter_map(|(_, inst)| self.facts.get(&inst).cloned())
            .collect())
    }

    fn get_node_kind(&self, id: &NodeId) -> Result<NodeKind> {
        self.node_instances(id)
            .first()
            .and_then(|inst| self.nodes.get(inst))
            .map(|n| n.kind)
            .ok_or_else(|| MnemographError::NotFound(format!("node {id}")))
    }

    fn count_items(&self, id: Option<&str>, id_kind: Option<IdKind>) -> Result<ItemCounts> {
        match (id, id_kind) {
            (None, _) => Ok(ItemCounts {
                nodes: self.node_index.len(),
                relations: self.relation_index.len(),
                facts: self.fact_index.len(),
            }),
            (Some(id), Some(kind)) => {
                let mut counts = ItemCounts::default();
                match kind {
                    IdKind::Node => {
                        counts.nodes = self
                            .node_index
                            .get(&NodeId(id.to_string()))
                            .map_or(0, BTreeSet::len);
                    }
                    IdKind::Relation => {
                        counts.relations = self
                            .relation_index
                            .get(&RelationId(id.to_string()))
                            .map_or(0, BTreeSet::len);
                    }
                    IdKind::Fact => {
                        counts.facts = self
                            .fact_index
                            .get(&FactId(id.to_string()))
                            .map_or(0, BTreeSet::len);
                    }
                }
                Ok(counts)
            }
            (Some(_), None) => Err(MnemographError::Validation(
                "count_items with an id requires an id kind".into(),
            )),
        }
    }

    fn item_exist(&self, id: &str, id_kind: IdKind) -> Result<bool> {
        Ok(match id_kind {
            IdKind::Node => self.node_index.contains_key(&NodeId(id.to_string())),
            IdKind::Relation => self
                .relation_index
                .contains_key(&RelationId(id.to_string())),
            IdKind::Fact => self.fact_index.contains_key(&FactId(id.to_string())),
        })
    }

    fn clear(&mut self) -> Result<()> {
        *self = Self::default();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

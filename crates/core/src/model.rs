//! The fact model: nodes, relations, facts, and their content-derived ids.
//!
//! Identity is derived from content, never from storage. Every node, relation
//! and fact has a canonical string **rendering**; its id is the blake3 hash of
//! that rendering. Two nodes built from equal `(name, kind, properties)`
//! render identically and therefore share an id — that id is the *business
//! key*, distinct from any surrogate key a storage backend may assign to one
//! physical instance.
//!
//! All three types are immutable once constructed. An update is expressed by
//! inserting a new fact and deleting the obsolete one (see
//! [`crate::ConsistencyEngine`]), never by mutating in place.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{MnemographError, Result};

/// blake3 hex digest of a canonical rendering. The one hash function used for
/// every content-derived id in the crate (including memoization keys).
pub(crate) fn content_hash(s: &str) -> String {
    blake3::hash(s.as_bytes()).to_hex().to_string()
}

// ---------------------------------------------------------------------------
// Ids
// ---------------------------------------------------------------------------

macro_rules! content_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }
    };
}

content_id! {
    /// Business key of a [`Node`]: `blake3(node.render())`.
    NodeId
}
content_id! {
    /// Business key of a [`Relation`]: `blake3` of the owning fact's
    /// *statement* rendering (no time prefix), so every fact expressing the
    /// same statement shares one `RelationId` regardless of time.
    RelationId
}
content_id! {
    /// Business key of a [`Fact`]: hash over subject, relation, object and
    /// time ids — unlike [`RelationId`], this distinguishes by time.
    FactId
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// What a node represents in the knowledge graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// A concrete entity ("alice", "Acme").
    Object,
    /// A free-text statement attached to an object ("alice enjoys hiking").
    Hyper,
    /// An episode of raw source text a hyper statement was extracted from.
    Episodic,
    /// A point in time anchoring a fact.
    Time,
}

impl NodeKind {
    fn label(self) -> &'static str {
        match self {
            NodeKind::Object => "object",
            NodeKind::Hyper => "hyper",
            NodeKind::Episodic => "episodic",
            NodeKind::Time => "time",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A content-addressed graph node.
///
/// `properties` is a `BTreeMap` so the canonical rendering is independent of
/// insertion order — two nodes with the same properties in any order render
/// (and hash) identically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub properties: BTreeMap<String, String>,
    /// Rendering cached at construction time. Always `Some` for nodes built
    /// through the constructors; kept optional so deserialized legacy data
    /// re-renders lazily.
    stringified: Option<String>,
}

impl Node {
    /// Build a node, eagerly caching its canonical rendering.
    pub fn new(name: impl Into<String>, kind: NodeKind, properties: BTreeMap<String, String>) -> Self {
        let mut node = Self {
            name: name.into(),
            kind,
            properties,
            stringified: None,
        };
        node.stringified = Some(node.compute_rendering());
        node
    }

    /// An `Object` node with no properties.
    pub fn object(name: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Object, BTreeMap::new())
    }

    /// A `Hyper` node holding a free-text statement.
    pub fn hyper(text: impl Into<String>) -> Self {
        Self::new(text, NodeKind::Hyper, BTreeMap::new())
    }

    /// An `Episodic` node holding a source-text episode.
    pub fn episodic(text: impl Into<String>) -> Self {
        Self::new(text, NodeKind::Episodic, BTreeMap::new())
    }

    /// A `Time` node for a timestamp, named by its RFC 3339 form (UTC,
    /// second precision) so equal instants always produce equal ids.
    pub fn time(at: DateTime<Utc>) -> Self {
        Self::new(
            at.to_rfc3339_opts(SecondsFormat::Secs, true),
            NodeKind::Time,
            BTreeMap::new(),
        )
    }

    /// The canonical rendering: `{kind}:{name}` plus sorted properties.
    ///
    /// Pure in `(name, kind, properties)`; the cached copy is only a
    /// shortcut.
    pub fn render(&self) -> String {
        match &self.stringified {
            Some(s) => s.clone(),
            None => self.compute_rendering(),
        }
    }

    fn compute_rendering(&self) -> String {
        if self.properties.is_empty() {
            format!("{}:{}", self.kind, self.name)
        } else {
            let props: Vec<String> = self
                .properties
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            format!("{}:{}[{}]", self.kind, self.name, props.join(","))
        }
    }

    /// Business key: `blake3(render())`.
    pub fn id(&self) -> NodeId {
        NodeId(content_hash(&self.render()))
    }
}

// ---------------------------------------------------------------------------
// Relations
// ---------------------------------------------------------------------------

/// What kind of edge a relation expresses. Each kind constrains the node
/// kinds it may connect (enforced by [`Fact::new`]):
///
/// - `Simple`: object — object
/// - `Hyper`: object — hyper
/// - `Episodic`: object|hyper — episodic
/// - `Time`: fact — time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Simple,
    Hyper,
    Episodic,
    Time,
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelationKind::Simple => "simple",
            RelationKind::Hyper => "hyper",
            RelationKind::Episodic => "episodic",
            RelationKind::Time => "time",
        };
        f.write_str(s)
    }
}

/// A named, kinded edge label. A relation has no standalone identity — its id
/// is derived from the owning fact's statement rendering, see
/// [`Fact::relation_id`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub name: String,
    pub kind: RelationKind,
}

impl Relation {
    pub fn new(name: impl Into<String>, kind: RelationKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

// ---------------------------------------------------------------------------
// Facts
// ---------------------------------------------------------------------------

/// A knowledge fact: subject-relation-object, optionally anchored to a time
/// node (a quadruplet).
///
/// Identity splits in two:
///
/// - [`Fact::relation_id`] hashes the *statement* (no time prefix) — shared
///   by every fact expressing the same content;
/// - [`Fact::id`] hashes subject, relation, object **and** time ids — so the
///   same statement at two different times is two distinct facts sharing one
///   relation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub subject: Node,
    pub relation: Relation,
    pub object: Node,
    pub time: Option<Node>,
}

impl Fact {
    /// Build a fact, validating the relation kind against the node kinds it
    /// connects.
    pub fn new(subject: Node, relation: Relation, object: Node, time: Option<Node>) -> Result<Self> {
        let endpoint_ok = match relation.kind {
            RelationKind::Simple => {
                subject.kind == NodeKind::Object && object.kind == NodeKind::Object
            }
            RelationKind::Hyper => {
                subject.kind == NodeKind::Object && object.kind == NodeKind::Hyper
            }
            RelationKind::Episodic => {
                matches!(subject.kind, NodeKind::Object | NodeKind::Hyper)
                    && object.kind == NodeKind::Episodic
            }
            RelationKind::Time => object.kind == NodeKind::Time,
        };
        if !endpoint_ok {
            return Err(MnemographError::Validation(format!(
                "{} relation cannot connect {} to {}",
                relation.kind, subject.kind, object.kind
            )));
        }
        if relation.name.is_empty() {
            return Err(MnemographError::Validation(
                "relation name must not be empty".into(),
            ));
        }
        if let Some(t) = &time {
            if t.kind != NodeKind::Time {
                return Err(MnemographError::Validation(format!(
                    "time anchor must be a time node, got {}",
                    t.kind
                )));
            }
        }
        Ok(Self {
            subject,
            relation,
            object,
            time,
        })
    }

    /// A `Simple` fact between two object nodes.
    ///
    /// Intended for the common `(entity, relation, entity)` case; both nodes
    /// must be `Object`-kind (use [`Fact::new`] when kinds are dynamic).
    pub fn simple(subject: Node, relation_name: impl Into<String>, object: Node) -> Self {
        debug_assert_eq!(subject.kind, NodeKind::Object);
        debug_assert_eq!(object.kind, NodeKind::Object);
        Self {
            subject,
            relation: Relation::new(relation_name, RelationKind::Simple),
            object,
            time: None,
        }
    }

    /// A `Hyper` fact attaching a free-text statement to an object.
    pub fn hyper(subject: Node, statement: Node) -> Self {
        debug_assert_eq!(statement.kind, NodeKind::Hyper);
        Self {
            subject,
            relation: Relation::new("states", RelationKind::Hyper),
            object: statement,
            time: None,
        }
    }

    /// An `Episodic` fact linking an object or hyper node to its source
    /// episode.
    pub fn episodic(subject: Node, episode: Node) -> Self {
        debug_assert_eq!(episode.kind, NodeKind::Episodic);
        Self {
            subject,
            relation: Relation::new("mentioned_in", RelationKind::Episodic),
            object: episode,
            time: None,
        }
    }

    /// Anchor this fact to a time node.
    pub fn at(mut self, time: Node) -> Self {
        debug_assert_eq!(time.kind, NodeKind::Time);
        self.time = Some(time);
        self
    }

    /// The statement rendering — no time prefix. This is what
    /// [`Fact::relation_id`] hashes, so the same statement asserted at two
    /// times keeps one relation id.
    ///
    /// For hyper/episodic/time relations the statement *is* the object
    /// node's rendering; for simple relations it concatenates subject,
    /// relation and object.
    pub fn statement(&self) -> String {
        match self.relation.kind {
            RelationKind::Simple => format!(
                "{} {} {}",
                self.subject.render(),
                self.relation.name,
                self.object.render()
            ),
            RelationKind::Hyper | RelationKind::Episodic | RelationKind::Time => {
                self.object.render()
            }
        }
    }

    /// The full rendering: the statement, time-prefixed when a time node is
    /// present.
    pub fn render(&self) -> String {
        match &self.time {
            Some(t) => format!("[{}] {}", t.name, self.statement()),
            None => self.statement(),
        }
    }

    /// Relation business key: `blake3(statement())`. Shared by all facts
    /// with identical statement content.
    pub fn relation_id(&self) -> RelationId {
        RelationId(content_hash(&self.statement()))
    }

    /// Fact business key: hash over `subject.id ‖ relation_id ‖ object.id ‖
    /// time.id-or-empty`.
    pub fn id(&self) -> FactId {
        let time_part = self.time.as_ref().map(|t| t.id().0).unwrap_or_default();
        let joined = format!(
            "{}{}{}{}",
            self.subject.id().0,
            self.relation_id().0,
            self.object.id().0,
            time_part
        );
        FactId(content_hash(&joined))
    }

    /// Lift a legacy property-embedded timestamp into an explicit time node.
    ///
    /// Older ingest paths recorded time as a `"time"` property on the object
    /// node. The explicit time-node form is canonical; this is the single
    /// compatibility shim. No-op when the fact already has a time node or the
    /// property is absent/unparseable.
    pub fn promote_legacy_time(self) -> Self {
        if self.time.is_some() {
            return self;
        }
        let Some(raw) = self.object.properties.get("time") else {
            return self;
        };
        let Ok(parsed) = raw.parse::<DateTime<Utc>>() else {
            return self;
        };
        let mut props = self.object.properties.clone();
        props.remove("time");
        let object = Node::new(self.object.name.clone(), self.object.kind, props);
        Self {
            subject: self.subject,
            relation: self.relation,
            object,
            time: Some(Node::time(parsed)),
        }
    }
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn equal_inputs_produce_equal_node_ids() {
        let a = Node::new("alice", NodeKind::Object, props(&[("role", "ceo")]));
        let b = Node::new("alice", NodeKind::Object, props(&[("role", "ceo")]));
        assert_eq!(a.id(), b.id());
        assert_eq!(a.render(), b.render());
    }

    #[test]
    fn property_order_does_not_affect_id() {
        let a = Node::new(
            "alice",
            NodeKind::Object,
            props(&[("role", "ceo"), ("team", "exec")]),
        );
        let b = Node::new(
            "alice",
            NodeKind::Object,
            props(&[("team", "exec"), ("role", "ceo")]),
        );
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn changing_any_property_changes_the_id() {
        let base = Node::new("alice", NodeKind::Object, props(&[("role", "ceo")]));
        let renamed = Node::new("alicia", NodeKind::Object, props(&[("role", "ceo")]));
        let rekinded = Node::new("alice", NodeKind::Hyper, props(&[("role", "ceo")]));
        let reprop = Node::new("alice", NodeKind::Object, props(&[("role", "cto")]));
        assert_ne!(base.id(), renamed.id());
        assert_ne!(base.id(), rekinded.id());
        assert_ne!(base.id(), reprop.id());
    }

    #[test]
    fn time_nodes_with_equal_instants_share_an_id() {
        let at: DateTime<Utc> = "2020-06-01T12:00:00Z".parse().unwrap();
        assert_eq!(Node::time(at).id(), Node::time(at).id());
    }

    #[test]
    fn same_statement_different_time_shares_relation_id_not_fact_id() {
        let t1: DateTime<Utc> = "2020-01-01T00:00:00Z".parse().unwrap();
        let t2: DateTime<Utc> = "2023-01-01T00:00:00Z".parse().unwrap();

        let f1 = Fact::simple(Node::object("alice"), "works_at", Node::object("Acme"))
            .at(Node::time(t1));
        let f2 = Fact::simple(Node::object("alice"), "works_at", Node::object("Acme"))
            .at(Node::time(t2));

        assert_eq!(f1.relation_id(), f2.relation_id());
        assert_ne!(f1.id(), f2.id());
    }

    #[test]
    fn hyper_fact_renders_as_its_statement_node() {
        let f = Fact::hyper(Node::object("alice"), Node::hyper("alice enjoys hiking"));
        assert_eq!(f.statement(), "hyper:alice enjoys hiking");
    }

    #[test]
    fn time_prefix_appears_in_render_but_not_statement() {
        let at: DateTime<Utc> = "2020-01-01T00:00:00Z".parse().unwrap();
        let f = Fact::simple(Node::object("alice"), "works_at", Node::object("Acme"))
            .at(Node::time(at));
        assert!(f.render().starts_with("[2020-01-01T00:00:00Z]"));
        assert!(!f.statement().contains("2020"));
    }

    #[test]
    fn new_rejects_kind_mismatch() {
        let err = Fact::new(
            Node::object("alice"),
            Relation::new("states", RelationKind::Hyper),
            Node::object("Acme"), // hyper relation needs a hyper object node
            None,
        );
        assert!(matches!(err, Err(MnemographError::Validation(_))));
    }

    #[test]
    fn new_rejects_non_time_anchor() {
        let err = Fact::new(
            Node::object("alice"),
            Relation::new("works_at", RelationKind::Simple),
            Node::object("Acme"),
            Some(Node::object("not-a-time")),
        );
        assert!(matches!(err, Err(MnemographError::Validation(_))));
    }

    #[test]
    fn legacy_time_property_promotes_to_time_node() {
        let object = Node::new(
            "Acme",
            NodeKind::Object,
            props(&[("time", "2020-01-01T00:00:00Z")]),
        );
        let fact = Fact::simple(Node::object("alice"), "works_at", object).promote_legacy_time();

        let time = fact.time.clone().expect("time node should be promoted");
        assert_eq!(time.kind, NodeKind::Time);
        assert_eq!(time.name, "2020-01-01T00:00:00Z");
        assert!(!fact.object.properties.contains_key("time"));

        // Promoted form is identical to the canonical explicit form.
        let canonical = Fact::simple(Node::object("alice"), "works_at", Node::object("Acme"))
            .at(Node::time("2020-01-01T00:00:00Z".parse().unwrap()));
        assert_eq!(fact.id(), canonical.id());
    }

    #[test]
    fn promote_legacy_time_is_noop_without_property() {
        let fact = Fact::simple(Node::object("alice"), "works_at", Node::object("Acme"));
        let id = fact.id();
        assert_eq!(fact.promote_legacy_time().id(), id);
    }
}

//! High-level agent memory API built on Mnemograph.
//!
//! Wraps the content-addressed fact graph, the consistency engine and one
//! configured retrieval algorithm behind an API shaped for agent loops:
//! assert what you learned, recall what matters for the next prompt.
//!
//! # Usage
//!
//! ```rust
//! use mnemograph::{BfsConfig, BfsRetriever, KeepAllJudge};
//! use mnemograph_agent_memory::KnowledgeMemory;
//!
//! let mut memory = KnowledgeMemory::new(
//!     Box::new(KeepAllJudge),
//!     Box::new(BfsRetriever::new(BfsConfig::default())),
//! )
//! .unwrap();
//!
//! // Store a structured fact directly
//! memory.assert("alice", "works_at", "Acme").unwrap();
//!
//! // Query everything known about an entity
//! let facts = memory.facts_about("alice").unwrap();
//!
//! // Build a context block for the next prompt
//! let context = memory.assemble_context("where does alice work", 512).unwrap();
//! ```

use chrono::Utc;
use mnemograph::{
    open_graph, BackendConfig, ConsistencyEngine, Fact, FactId, GraphStore, IngestReport, Node,
    NodeKind, ObsolescenceJudge, QueryContext, Retriever, SeedGroup,
};

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error(transparent)]
    Core(#[from] mnemograph::MnemographError),
    /// The query mentioned no entity present in memory; recall has nothing
    /// to anchor on.
    #[error("no entity in query matched memory: {0}")]
    NoLinkedEntities(String),
}

pub type Result<T> = std::result::Result<T, MemoryError>;

/// High-level agent memory store.
///
/// Owns a graph backend, a [`ConsistencyEngine`] that retires superseded
/// facts on every write, and the retrieval algorithm used by
/// [`KnowledgeMemory::recall`].
pub struct KnowledgeMemory {
    graph: Box<dyn GraphStore>,
    engine: ConsistencyEngine,
    retriever: Box<dyn Retriever>,
}

impl KnowledgeMemory {
    /// An in-memory store with the given judge and retrieval algorithm.
    pub fn new(judge: Box<dyn ObsolescenceJudge>, retriever: Box<dyn Retriever>) -> Result<Self> {
        Self::with_backend(&BackendConfig::in_memory(), judge, retriever)
    }

    /// Open against an explicit backend configuration.
    pub fn with_backend(
        config: &BackendConfig,
        judge: Box<dyn ObsolescenceJudge>,
        retriever: Box<dyn Retriever>,
    ) -> Result<Self> {
        Ok(Self {
            graph: open_graph(config)?,
            engine: ConsistencyEngine::new(judge),
            retriever,
        })
    }

    /// Store a structured fact, stamped with the current time. Facts the
    /// new one supersedes are retired first.
    pub fn assert(&mut self, subject: &str, predicate: &str, object: &str) -> Result<FactId> {
        let fact = Fact::simple(Node::object(subject), predicate, Node::object(object))
            .at(Node::time(Utc::now()));
        let id = fact.id();
        self.engine.ingest(self.graph.as_mut(), vec![fact])?;
        Ok(id)
    }

    /// Attach a free-text statement to an entity.
    pub fn remember_statement(&mut self, entity: &str, text: &str) -> Result<FactId> {
        let fact = Fact::hyper(Node::object(entity), Node::hyper(text));
        let id = fact.id();
        self.engine.ingest(self.graph.as_mut(), vec![fact])?;
        Ok(id)
    }

    /// Ingest pre-built facts through the consistency engine, one by one.
    pub fn remember(&mut self, facts: Vec<Fact>) -> Result<IngestReport> {
        Ok(self.engine.ingest(self.graph.as_mut(), facts)?)
    }

    /// All facts incident to an entity, across every neighbor kind.
    pub fn facts_about(&self, entity: &str) -> Result<Vec<Fact>> {
        let mut out = Vec::new();
        for node in self.graph.read_by_name(entity, NodeKind::Object, None)? {
            let id = node.id();
            for neighbor in self.graph.get_adjacent_node_ids(&id, &[])? {
                out.extend(self.graph.get_facts(&id, &neighbor)?);
            }
        }
        out.sort_by_key(|f| f.id());
        out.dedup_by_key(|f| f.id());
        Ok(out)
    }

    /// Retrieve the facts relevant to a free-form query.
    ///
    /// Entity linking is deliberately naive: each query token is matched
    /// against entity names. Callers with a real linker should build a
    /// [`QueryContext`] themselves and go through the retriever directly.
    pub fn recall(&mut self, query: &str, limit: usize) -> Result<Vec<Fact>> {
        let ctx = self.link_query(query)?;
        let outcome = self.retriever.retrieve(self.graph.as_ref(), &ctx)?;
        let mut facts = outcome.facts().to_vec();
        facts.truncate(limit);
        Ok(facts)
    }

    /// Render recalled facts into a newline-joined context block of at most
    /// `max_chars` characters.
    pub fn assemble_context(&mut self, query: &str, max_chars: usize) -> Result<String> {
        let facts = self.recall(query, usize::MAX)?;
        let mut context = String::new();
        for fact in facts {
            let line = fact.render();
            if !context.is_empty() && context.len() + line.len() + 1 > max_chars {
                break;
            }
            if !context.is_empty() {
                context.push('\n');
            }
            context.push_str(&line);
        }
        Ok(context)
    }

    /// Token-wise entity linking: every query word that names a known
    /// entity becomes one seed group.
    fn link_query(&self, query: &str) -> Result<QueryContext> {
        let mut seeds = Vec::new();
        for token in query
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut nodes = self.graph.read_by_name(token, NodeKind::Object, None)?;
            if nodes.is_empty() {
                nodes = self
                    .graph
                    .read_by_name(&token.to_lowercase(), NodeKind::Object, None)?;
            }
            if !nodes.is_empty() {
                seeds.push(SeedGroup::new(vec![token.to_string()], nodes));
            }
        }
        if seeds.is_empty() {
            return Err(MemoryError::NoLinkedEntities(query.to_string()));
        }
        Ok(QueryContext::new(query, seeds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemograph::{
        BfsConfig, BfsRetriever, JudgeDecision, JudgeStatus, KeepAllJudge,
        Result as CoreResult,
    };

    /// Retires any candidate sharing the new fact's subject and relation
    /// name — a stand-in for the semantic judge.
    struct SameRelationJudge;

    impl ObsolescenceJudge for SameRelationJudge {
        fn decide(&self, candidate: &Fact, incident: &[Fact]) -> CoreResult<JudgeDecision> {
            let obsolete = incident
                .iter()
                .filter(|f| {
                    f.subject.id() == candidate.subject.id()
                        && f.relation.name == candidate.relation.name
                })
                .map(|f| f.id())
                .collect();
            Ok(JudgeDecision {
                status: JudgeStatus::Success,
                obsolete,
            })
        }
    }

    fn memory(judge: Box<dyn ObsolescenceJudge>) -> KnowledgeMemory {
        KnowledgeMemory::new(judge, Box::new(BfsRetriever::new(BfsConfig::default()))).unwrap()
    }

    #[test]
    fn assert_and_retrieve() {
        let mut memory = memory(Box::new(KeepAllJudge));
        memory.assert("alice", "works_at", "acme").unwrap();

        let facts = memory.facts_about("alice").unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].relation.name, "works_at");
    }

    #[test]
    fn multiple_facts_about_entity() {
        let mut memory = memory(Box::new(KeepAllJudge));
        memory.assert("freya", "attends", "sunrise primary").unwrap();
        memory.assert("freya", "lives_in", "leeds").unwrap();
        memory.remember_statement("freya", "freya loves the library").unwrap();

        assert_eq!(memory.facts_about("freya").unwrap().len(), 3);
    }

    #[test]
    fn newer_fact_replaces_the_superseded_one() {
        let mut memory = memory(Box::new(SameRelationJudge));
        memory.assert("alice", "works_at", "acme").unwrap();
        let globex = memory.assert("alice", "works_at", "globex").unwrap();

        let facts = memory.facts_about("alice").unwrap();
        assert_eq!(facts.len(), 1, "exactly one works_at fact remains");
        assert_eq!(facts[0].id(), globex);

        let recalled = memory.recall("Where does alice work?", 10).unwrap();
        assert_eq!(recalled.len(), 1);
        assert_eq!(recalled[0].id(), globex);
    }

    #[test]
    fn recall_without_linked_entities_is_an_error() {
        let mut memory = memory(Box::new(KeepAllJudge));
        memory.assert("alice", "works_at", "acme").unwrap();

        let err = memory.recall("what is the meaning of life", 10);
        assert!(matches!(err, Err(MemoryError::NoLinkedEntities(_))));
    }

    #[test]
    fn assemble_context_respects_the_budget() {
        let mut memory = memory(Box::new(KeepAllJudge));
        memory.assert("alice", "works_at", "acme").unwrap();
        memory.assert("alice", "lives_in", "leeds").unwrap();

        let full = memory.assemble_context("alice", 10_000).unwrap();
        assert_eq!(full.lines().count(), 2);

        let tight = memory.assemble_context("alice", 1).unwrap();
        assert_eq!(tight.lines().count(), 1, "always at least one line");
        let roomy_enough_for_one = memory.assemble_context("alice", full.len()).unwrap();
        assert!(roomy_enough_for_one.len() <= full.len());
    }
}

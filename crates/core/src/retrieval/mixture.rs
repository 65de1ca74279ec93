//! Mixture retrieval: two strategies, one answer.
//!
//! Runs any two retrievers over the same query and unions their fact sets
//! by fact identity, keeping the first retriever's ordering ahead of the
//! second's. The usual pairing is a path-connectivity algorithm with a
//! pure-similarity one, so neither recall profile is sacrificed.

use std::collections::HashSet;

use crate::graph::GraphStore;
use crate::retrieval::{merge_facts, QueryContext, RetrievalOutcome, Retriever};
use crate::Result;

pub struct MixtureRetriever {
    first: Box<dyn Retriever>,
    second: Box<dyn Retriever>,
}

impl MixtureRetriever {
    pub fn new(first: Box<dyn Retriever>, second: Box<dyn Retriever>) -> Self {
        Self { first, second }
    }
}

impl Retriever for MixtureRetriever {
    fn retrieve(
        &mut self,
        graph: &dyn GraphStore,
        ctx: &QueryContext,
    ) -> Result<RetrievalOutcome> {
        let mut acc = Vec::new();
        let mut seen = HashSet::new();
        merge_facts(
            &mut acc,
            &mut seen,
            self.first.retrieve(graph, ctx)?.facts().to_vec(),
        );
        merge_facts(
            &mut acc,
            &mut seen,
            self.second.retrieve(graph, ctx)?.facts().to_vec(),
        );
        Ok(RetrievalOutcome::from_facts(acc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::in_memory::InMemoryGraph;
    use crate::model::{Fact, Node};

    /// A canned retriever for composition tests.
    struct Fixed(Vec<Fact>);

    impl Retriever for Fixed {
        fn retrieve(
            &mut self,
            _graph: &dyn GraphStore,
            _ctx: &QueryContext,
        ) -> Result<RetrievalOutcome> {
            Ok(RetrievalOutcome::from_facts(self.0.clone()))
        }
    }

    fn simple(s: &str, r: &str, o: &str) -> Fact {
        Fact::simple(Node::object(s), r, Node::object(o))
    }

    #[test]
    fn unions_by_fact_identity() {
        let shared = simple("a", "r", "b");
        let only_first = simple("a", "r", "c");
        let only_second = simple("b", "r", "c");

        let mut mix = MixtureRetriever::new(
            Box::new(Fixed(vec![shared.clone(), only_first.clone()])),
            Box::new(Fixed(vec![shared.clone(), only_second.clone()])),
        );
        let g = InMemoryGraph::new();
        let ctx = QueryContext::new("q", vec![]);

        let outcome = mix.retrieve(&g, &ctx).unwrap();
        let ids: Vec<_> = outcome.facts().iter().map(|f| f.id()).collect();
        assert_eq!(ids, vec![shared.id(), only_first.id(), only_second.id()]);
    }

    #[test]
    fn two_empty_answers_stay_no_match() {
        let mut mix =
            MixtureRetriever::new(Box::new(Fixed(Vec::new())), Box::new(Fixed(Vec::new())));
        let g = InMemoryGraph::new();
        let outcome = mix.retrieve(&g, &QueryContext::new("q", vec![])).unwrap();
        assert!(outcome.is_no_match());
    }
}

//! Tag-condition query evaluator contract. The real
//! tag-query language parser is an out-of-scope external collaborator; the
//! core only needs something that can decide, for one log's tags, whether
//! it is a member of a merge. A trivial "accept everything" evaluator and
//! a small equality/AND combinator are provided so the merge iterator
//! has something concrete to filter logs with in tests.

use std::collections::BTreeMap;

pub trait QueryEvaluator: Send + Sync {
    fn matches(&self, tags: &BTreeMap<String, String>) -> bool;
}

/// Matches every log; the default when no filter is supplied.
pub struct AcceptAll;

impl QueryEvaluator for AcceptAll {
    fn matches(&self, _tags: &BTreeMap<String, String>) -> bool {
        true
    }
}

/// Matches logs whose tags contain every `(key, value)` pair in `terms`.
pub struct TagEquals {
    terms: BTreeMap<String, String>,
}

impl TagEquals {
    pub fn new(terms: BTreeMap<String, String>) -> Self {
        Self { terms }
    }
}

impl QueryEvaluator for TagEquals {
    fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        self.terms
            .iter()
            .all(|(k, v)| tags.get(k).map(|actual| actual == v).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_all_matches_everything() {
        assert!(AcceptAll.matches(&BTreeMap::new()));
    }

    #[test]
    fn tag_equals_requires_every_term() {
        let mut tags = BTreeMap::new();
        tags.insert("env".to_string(), "prod".to_string());
        tags.insert("region".to_string(), "eu".to_string());

        let mut terms = BTreeMap::new();
        terms.insert("env".to_string(), "prod".to_string());
        assert!(TagEquals::new(terms).matches(&tags));

        let mut terms = BTreeMap::new();
        terms.insert("env".to_string(), "staging".to_string());
        assert!(!TagEquals::new(terms).matches(&tags));
    }
}

//! Near-duplicate suppression by term-set Jaccard similarity.

use std::collections::HashSet;

use crate::memory::types::Observation;

/// Default similarity at or above which two observations are duplicates.
pub const DEFAULT_CLUSTER_THRESHOLD: f64 = 0.4;

/// Lowercased alphanumeric terms of title, narrative and facts.
pub fn term_set(observation: &Observation) -> HashSet<String> {
    let mut terms = HashSet::new();
    let texts = [observation.title.as_str(), observation.narrative.as_str()]
        .into_iter()
        .chain(observation.facts.iter().map(String::as_str));
    for text in texts {
        for term in text.split(|c: char| !c.is_alphanumeric()) {
            if !term.is_empty() {
                terms.insert(term.to_lowercase());
            }
        }
    }
    terms
}

/// `|a ∩ b| / |a ∪ b|`. Two empty sets share nothing and score 0.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Keep one representative per cluster of near-duplicates, preserving input
/// order. The first observation of a cluster wins. Returns the survivors and
/// the number removed.
pub fn cluster(observations: Vec<Observation>, threshold: f64) -> (Vec<Observation>, usize) {
    let total = observations.len();
    let mut kept: Vec<Observation> = Vec::with_capacity(total);
    let mut kept_terms: Vec<HashSet<String>> = Vec::with_capacity(total);

    for observation in observations {
        let terms = term_set(&observation);
        let duplicate = kept_terms.iter().any(|t| jaccard(t, &terms) >= threshold);
        if duplicate {
            tracing::trace!(id = %observation.id, "near-duplicate suppressed");
            continue;
        }
        kept_terms.push(terms);
        kept.push(observation);
    }

    let removed = total - kept.len();
    (kept, removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::Scope;

    fn obs(id: &str, title: &str, narrative: &str) -> Observation {
        Observation {
            id: id.into(),
            session_id: None,
            project: "demo".into(),
            scope: Scope::Project,
            obs_type: "discovery".into(),
            title: title.into(),
            subtitle: None,
            narrative: narrative.into(),
            facts: vec![],
            concepts: vec![],
            files: vec![],
            file_mtimes: Default::default(),
            prompt_number: None,
            retrieval_count: 0,
            created_at: String::new(),
            created_at_epoch: 0,
            score: None,
        }
    }

    #[test]
    fn jaccard_basics() {
        let a: HashSet<String> = ["x", "y"].iter().map(|s| s.to_string()).collect();
        let b: HashSet<String> = ["y", "z"].iter().map(|s| s.to_string()).collect();
        assert!((jaccard(&a, &b) - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(jaccard(&HashSet::new(), &HashSet::new()), 0.0);
    }

    #[test]
    fn duplicates_at_threshold_collapse_to_first() {
        // {a b c d} vs {a b c e}: 3/5 = 0.6
        let first = obs("1", "a b c", "d");
        let second = obs("2", "a b c", "e");
        let (kept, removed) = cluster(vec![first, second], 0.4);
        assert_eq!(removed, 1);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "1");
    }

    #[test]
    fn exactly_at_threshold_is_duplicate() {
        // {a b} vs {a b c d e}: 2/5 = 0.4
        let (kept, _) = cluster(vec![obs("1", "a b", ""), obs("2", "a b c", "d e")], 0.4);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn below_threshold_both_survive() {
        // {a b c} vs {c d e}: 1/5 = 0.2
        let (kept, removed) = cluster(vec![obs("1", "a b c", ""), obs("2", "c d e", "")], 0.4);
        assert_eq!(removed, 0);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn facts_count_toward_terms() {
        let mut a = obs("1", "alpha", "");
        a.facts = vec!["beta gamma".into()];
        let terms = term_set(&a);
        assert!(terms.contains("beta"));
        assert!(terms.contains("gamma"));
    }

    #[test]
    fn order_is_preserved() {
        let (kept, _) = cluster(
            vec![obs("1", "red", ""), obs("2", "green", ""), obs("3", "blue", "")],
            0.4,
        );
        let ids: Vec<&str> = kept.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }
}

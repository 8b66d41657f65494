//! Bounded ring of the most recent retrieval queries.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::Serialize;

pub const RECENT_QUERY_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentQuery {
    pub query: String,
    pub project: String,
    pub result_count: usize,
    pub used_vector: bool,
    pub at: String,
}

#[derive(Debug)]
pub struct RecentQueries {
    capacity: usize,
    entries: Mutex<VecDeque<RecentQuery>>,
}

impl Default for RecentQueries {
    fn default() -> Self {
        Self::with_capacity(RECENT_QUERY_CAPACITY)
    }
}

impl RecentQueries {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append an entry, evicting the oldest when full.
    pub fn record(&self, query: &str, project: &str, result_count: usize, used_vector: bool) {
        let entry = RecentQuery {
            query: query.to_string(),
            project: project.to_string(),
            result_count,
            used_vector,
            at: chrono::Utc::now().to_rfc3339(),
        };
        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<RecentQuery> {
        self.entries
            .lock()
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

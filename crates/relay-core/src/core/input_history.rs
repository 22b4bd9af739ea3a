//! Recall buffer for previously submitted input.

use std::collections::VecDeque;

/// Bounded, de-duplicated list of submitted lines, newest first.
#[derive(Debug, Clone)]
pub struct InputHistory {
    entries: VecDeque<String>,
    limit: usize,
}

impl InputHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    /// Records `text` as the newest entry. Blank input is ignored; an equal
    /// older entry moves to the front instead of being duplicated.
    pub fn push(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.entries.retain(|e| e != text);
        self.entries.push_front(text.to_string());
        self.entries.truncate(self.limit);
    }

    /// Entries containing `query` (case-insensitive), newest first.
    pub fn search(&self, query: &str) -> Vec<&str> {
        let needle = query.to_lowercase();
        self.entries
            .iter()
            .filter(|e| e.to_lowercase().contains(&needle))
            .map(String::as_str)
            .collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_dedupes_and_orders_newest_first() {
        let mut history = InputHistory::new(10);
        history.push("one");
        history.push("two");
        history.push("one");

        assert_eq!(history.entries().collect::<Vec<_>>(), vec!["one", "two"]);
    }

    #[test]
    fn test_limit_drops_oldest() {
        let mut history = InputHistory::new(2);
        history.push("a");
        history.push("b");
        history.push("c");

        assert_eq!(history.entries().collect::<Vec<_>>(), vec!["c", "b"]);
    }

    #[test]
    fn test_blank_input_ignored() {
        let mut history = InputHistory::new(5);
        history.push("   ");
        assert!(history.is_empty());
    }

    #[test]
    fn test_search_is_case_insensitive_substring() {
        let mut history = InputHistory::new(5);
        history.push("Fix the Parser");
        history.push("write tests");
        history.push("parse config");

        assert_eq!(history.search("PARSE"), vec!["parse config", "Fix the Parser"]);
        assert!(history.search("zzz").is_empty());
    }
}

//! The scalar-statistics sink layers report into.
//!
//! Layers push named scalars (`summarize`); what happens to them — TensorBoard
//! files, CSV, aggregation across ranks — is the summarizer's business. Flush
//! semantics are the implementation's own; `scalar` must be cheap.

/// Push-style consumer of per-step named statistics.
pub trait Summarizer: Send {
    /// Records `value` under `tag` at training step `step`.
    fn scalar(&mut self, tag: &str, step: i64, value: f64);
}

/// A summarizer that keeps everything in memory. Used by tests and small
/// drivers; doubles as the reference for the push contract.
#[derive(Debug, Default)]
pub struct InMemorySummary {
    records: Vec<(String, i64, f64)>,
}

impl InMemorySummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[(String, i64, f64)] {
        &self.records
    }

    /// The most recently recorded value for `tag`, if any.
    pub fn latest(&self, tag: &str) -> Option<f64> {
        self.records
            .iter()
            .rev()
            .find(|(t, _, _)| t == tag)
            .map(|&(_, _, v)| v)
    }
}

impl Summarizer for InMemorySummary {
    fn scalar(&mut self, tag: &str, step: i64, value: f64) {
        self.records.push((tag.to_string(), step, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_wins() {
        let mut s = InMemorySummary::new();
        s.scalar("loss", 0, 1.0);
        s.scalar("loss", 1, 0.5);
        s.scalar("acc", 1, 0.9);
        assert_eq!(s.latest("loss"), Some(0.5));
        assert_eq!(s.latest("acc"), Some(0.9));
        assert_eq!(s.latest("missing"), None);
        assert_eq!(s.records().len(), 3);
    }
}

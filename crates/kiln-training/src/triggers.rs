//! Log-line triggers for artifact rescans.
//!
//! This is a heuristic: a rule fires when every one of its needles occurs in a
//! line (case-insensitive). Artifacts written without a matching line are not
//! picked up.

use crate::artifacts::ArtifactKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRule {
    pub kind: ArtifactKind,
    /// Lowercase substrings that must all be present.
    pub all_of: Vec<String>,
}

impl TriggerRule {
    #[must_use]
    pub fn new(kind: ArtifactKind, needles: &[&str]) -> Self {
        Self { kind, all_of: needles.iter().map(|n| n.to_lowercase()).collect() }
    }

    fn matches_lowercase(&self, line: &str) -> bool {
        !self.all_of.is_empty() && self.all_of.iter().all(|needle| line.contains(needle.as_str()))
    }
}

/// Ordered list of rules; every matching rule fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerPolicy {
    rules: Vec<TriggerRule>,
}

impl TriggerPolicy {
    #[must_use]
    pub fn new(rules: Vec<TriggerRule>) -> Self {
        Self { rules }
    }

    /// Artifact kinds whose directories should be rescanned after `line`.
    #[must_use]
    pub fn triggered(&self, line: &str) -> Vec<ArtifactKind> {
        let lower = line.to_lowercase();
        let mut kinds = Vec::new();
        for rule in &self.rules {
            if rule.matches_lowercase(&lower) && !kinds.contains(&rule.kind) {
                kinds.push(rule.kind);
            }
        }
        kinds
    }
}

impl Default for TriggerPolicy {
    fn default() -> Self {
        Self::new(vec![
            TriggerRule::new(ArtifactKind::Sample, &["saved", "sample"]),
            TriggerRule::new(ArtifactKind::Checkpoint, &["checkpoint", "saved"]),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_trigger_is_case_insensitive() {
        let policy = TriggerPolicy::default();
        assert_eq!(policy.triggered("Saved SAMPLES to /app/output/run/samples"), vec![ArtifactKind::Sample]);
    }

    #[test]
    fn test_checkpoint_trigger() {
        let policy = TriggerPolicy::default();
        assert_eq!(policy.triggered("Checkpoint saved to run_000000250.safetensors"), vec![ArtifactKind::Checkpoint]);
    }

    #[test]
    fn test_both_rules_can_fire() {
        let policy = TriggerPolicy::default();
        assert_eq!(
            policy.triggered("saved sample images and checkpoint"),
            vec![ArtifactKind::Sample, ArtifactKind::Checkpoint]
        );
    }

    #[test]
    fn test_unrelated_lines_fire_nothing() {
        let policy = TriggerPolicy::default();
        assert!(policy.triggered("step 10/2000 loss=0.12").is_empty());
        assert!(policy.triggered("generating sample images").is_empty());
        assert!(policy.triggered("saved optimizer state").is_empty());
    }
}

//! Content-safety collaborator. The policy itself lives outside this crate; the
//! generation core only consults it through [`SafetyGate`].

use std::fmt::Debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConceptCheck {
    Allowed(String),
    Blocked(String),
}

pub trait SafetyGate: Send + Sync + Debug {
    fn sanitize_concept(&self, text: &str) -> String;
    fn validate_concept(&self, text: &str, max_length: usize) -> ConceptCheck;

    /// Wraps a fallback illustration instruction so it is safe to render.
    fn safe_illustration_prompt(&self, prompt: &str) -> String {
        format!("{}, soft colors, child-friendly, no text", prompt.trim())
    }
}

/// Minimal gate used by the CLI: whitespace cleanup, length bound and a short
/// blocklist. Real deployments plug in their own policy.
#[derive(Debug, Default)]
pub struct BasicSafetyGate;

const BLOCKED_TERMS: &[&str] = &["gore", "weapon", "kill", "murder", "blood", "nude"];

impl SafetyGate for BasicSafetyGate {
    fn sanitize_concept(&self, text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn validate_concept(&self, text: &str, max_length: usize) -> ConceptCheck {
        let clean = self.sanitize_concept(text);
        if clean.is_empty() {
            return ConceptCheck::Blocked("Please enter a story idea first.".to_string());
        }
        if clean.chars().count() > max_length {
            return ConceptCheck::Blocked(format!(
                "Story ideas must be {} characters or fewer.",
                max_length
            ));
        }
        let lower = clean.to_lowercase();
        let hit = lower
            .split(|c: char| !c.is_alphanumeric())
            .any(|word| BLOCKED_TERMS.contains(&word));
        if hit {
            return ConceptCheck::Blocked(
                "That idea isn't a good fit for a children's story. Try something gentler."
                    .to_string(),
            );
        }
        ConceptCheck::Allowed(clean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_gate() {
        let gate = BasicSafetyGate;
        assert_eq!(
            gate.validate_concept("  a  fox\n who reads ", 220),
            ConceptCheck::Allowed("a fox who reads".to_string())
        );
        assert!(matches!(gate.validate_concept("   ", 220), ConceptCheck::Blocked(_)));
        assert!(matches!(
            gate.validate_concept(&"a".repeat(300), 220),
            ConceptCheck::Blocked(_)
        ));
        assert!(matches!(
            gate.validate_concept("a knight with a weapon", 220),
            ConceptCheck::Blocked(_)
        ));
        // Substrings of blocked words are fine.
        assert!(matches!(
            gate.validate_concept("a skilled bloodhound puppy", 220),
            ConceptCheck::Allowed(_)
        ));
    }
}

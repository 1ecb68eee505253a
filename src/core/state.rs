use crate::core::error::GenerationError;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoryPage {
    pub page_number: usize,
    pub text: String,
    #[serde(rename = "imagePrompt")]
    pub illustration_prompt: String,
}

/// Parsed output of one generation attempt, before character repair.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoryDraft {
    pub title: String,
    pub author_line: String,
    pub moral: String,
    #[serde(default)]
    pub character_descriptions: String,
    pub pages: Vec<StoryPage>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct CharacterEntry {
    pub name: String,
    pub attributes: Vec<String>,
}

/// A draft after character-description repair.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub title: String,
    pub author_line: String,
    pub moral: String,
    pub character_descriptions: String,
    #[serde(default)]
    pub characters: Vec<CharacterEntry>,
    pub pages: Vec<StoryPage>,
}

#[derive(Debug)]
pub enum AttemptOutcome {
    Success(StoryDraft),
    RetryableFailure(GenerationError),
    TerminalFailure(GenerationError),
    Cancelled,
}

impl From<Result<StoryDraft, GenerationError>> for AttemptOutcome {
    fn from(result: Result<StoryDraft, GenerationError>) -> Self {
        match result {
            Ok(draft) => AttemptOutcome::Success(draft),
            Err(GenerationError::Cancelled) => AttemptOutcome::Cancelled,
            Err(e) if e.is_retryable() => AttemptOutcome::RetryableFailure(e),
            Err(e) => AttemptOutcome::TerminalFailure(e),
        }
    }
}

impl AttemptOutcome {
    pub fn into_result(self) -> Result<StoryDraft, GenerationError> {
        match self {
            AttemptOutcome::Success(draft) => Ok(draft),
            AttemptOutcome::RetryableFailure(e) | AttemptOutcome::TerminalFailure(e) => Err(e),
            AttemptOutcome::Cancelled => Err(GenerationError::Cancelled),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QaQuestion {
    pub text: String,
    pub suggested_answers: [String; 3],
    pub user_answer: Option<String>,
}

impl QaQuestion {
    pub fn is_answered(&self) -> bool {
        self.user_answer
            .as_deref()
            .map(|a| !a.trim().is_empty())
            .unwrap_or(false)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QaRound {
    pub round_number: usize,
    pub questions: Vec<QaQuestion>,
    pub done: bool,
}

impl QaRound {
    pub fn answered_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.questions.iter().filter(|q| q.is_answered()).map(|q| {
            (
                q.text.as_str(),
                q.user_answer.as_deref().unwrap_or_default().trim(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_story_draft_wire_shape() {
        let draft = StoryDraft {
            title: "T".into(),
            author_line: "A".into(),
            moral: "M".into(),
            character_descriptions: String::new(),
            pages: vec![StoryPage {
                page_number: 1,
                text: "x".into(),
                illustration_prompt: "y".into(),
            }],
        };
        let json = serde_json::to_value(&draft).unwrap();
        assert_eq!(json["authorLine"], "A");
        assert_eq!(json["pages"][0]["pageNumber"], 1);
        assert_eq!(json["pages"][0]["imagePrompt"], "y");
    }

    #[test]
    fn test_attempt_outcome_tagging() {
        assert!(matches!(
            AttemptOutcome::from(Err(GenerationError::Cancelled)),
            AttemptOutcome::Cancelled
        ));
        assert!(matches!(
            AttemptOutcome::from(Err(GenerationError::Timeout { seconds: 1 })),
            AttemptOutcome::RetryableFailure(_)
        ));
        assert!(matches!(
            AttemptOutcome::from(Err(GenerationError::NotConfigured("x".into()))),
            AttemptOutcome::TerminalFailure(_)
        ));
    }

    #[test]
    fn test_blank_answer_is_not_answered() {
        let q = QaQuestion {
            text: "Who?".into(),
            suggested_answers: ["a".into(), "b".into(), "c".into()],
            user_answer: Some("   ".into()),
        };
        assert!(!q.is_answered());
    }

    #[test]
    fn test_qa_round_wire_shape() {
        let round = QaRound {
            round_number: 2,
            questions: vec![QaQuestion {
                text: "Who?".into(),
                suggested_answers: ["a".into(), "b".into(), "c".into()],
                user_answer: Some("a".into()),
            }],
            done: false,
        };
        let json = serde_json::to_value(&round).unwrap();
        assert_eq!(json["roundNumber"], 2);
        assert_eq!(json["questions"][0]["suggestedAnswers"][2], "c");
        assert_eq!(json["questions"][0]["userAnswer"], "a");
        assert!(json.get("round_number").is_none());
    }
}

//! Concept enrichment through a few rounds of model-written questions.

use crate::core::config::{Audience, QA_MAX_ROUNDS, QA_MAX_TOKENS};
use crate::core::error::GenerationError;
use crate::core::state::{QaQuestion, QaRound};
use crate::services::llm::ChatPrompt;
use crate::services::prompts;
use crate::services::router::Router;
use crate::utils::text::{clean, first_json_array, first_json_object, strip_code_blocks};
use log::{debug, info, warn};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const QA_TEMPERATURE: f32 = 0.7;
const MAX_QUESTIONS_PER_ROUND: usize = 3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QaError {
    #[error("Could not parse follow-up questions from the AI response. Please try again.")]
    Unparsable,

    #[error("The AI didn't generate any questions. Please try again.")]
    NoQuestions,

    #[error("Answer at least one question before continuing.")]
    NothingAnswered,

    #[error("This question session has already finished.")]
    Finished,

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

/// What the caller should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QaStep {
    /// Present these questions to the user.
    Round(QaRound),
    /// The enriched concept, ready for story generation.
    Complete(String),
}

#[derive(Deserialize, Debug)]
struct QuestionDto {
    #[serde(default, alias = "text")]
    question: String,
    #[serde(default, alias = "suggestedAnswers")]
    suggestions: Vec<String>,
}

#[derive(Deserialize, Debug)]
struct RoundDto {
    #[serde(default)]
    questions: Vec<QuestionDto>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug)]
pub struct QaSession {
    router: Arc<Router>,
    audience: Audience,
    max_rounds: usize,
    concept: String,
    rounds: Vec<QaRound>,
    finished: bool,
}

impl QaSession {
    pub fn new(router: Arc<Router>, concept: &str, audience: Audience) -> Self {
        Self {
            router,
            audience,
            max_rounds: QA_MAX_ROUNDS,
            concept: concept.trim().to_string(),
            rounds: Vec::new(),
            finished: false,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    pub fn rounds(&self) -> &[QaRound] {
        &self.rounds
    }

    pub fn current_round(&self) -> Option<&QaRound> {
        self.rounds.last()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Requests the first round.
    pub async fn start(&mut self, cancel: &CancellationToken) -> Result<QaStep, QaError> {
        if self.finished {
            return Err(QaError::Finished);
        }
        if !self.rounds.is_empty() {
            return Ok(QaStep::Round(self.rounds[self.rounds.len() - 1].clone()));
        }
        self.fetch_round(1, cancel).await
    }

    /// Records an answer for a question of the current round. Returns false
    /// when there is no such question.
    pub fn answer(&mut self, question_index: usize, answer: &str) -> bool {
        let Some(round) = self.rounds.last_mut() else {
            return false;
        };
        match round.questions.get_mut(question_index) {
            Some(question) => {
                let answer = answer.trim();
                question.user_answer = (!answer.is_empty()).then(|| answer.to_string());
                true
            }
            None => false,
        }
    }

    /// At least one question of the current round has an answer.
    pub fn can_proceed(&self) -> bool {
        self.rounds
            .last()
            .map(|r| r.questions.iter().any(|q| q.is_answered()))
            .unwrap_or(false)
    }

    /// Submits the current round and either asks the next one or finishes.
    pub async fn submit_round(&mut self, cancel: &CancellationToken) -> Result<QaStep, QaError> {
        if self.finished {
            return Err(QaError::Finished);
        }
        if !self.can_proceed() {
            return Err(QaError::NothingAnswered);
        }

        let completed = self.rounds.len();
        let model_done = self.rounds.last().map(|r| r.done).unwrap_or(false);
        if model_done || completed >= self.max_rounds {
            info!(
                "Q&A finished after {} rounds (model done: {})",
                completed, model_done
            );
            return Ok(QaStep::Complete(self.finalize()));
        }
        self.fetch_round(completed + 1, cancel).await
    }

    /// Finishes without asking further rounds.
    pub fn finish_early(&mut self) -> Result<String, QaError> {
        if self.finished {
            return Err(QaError::Finished);
        }
        if !self.can_proceed() {
            return Err(QaError::NothingAnswered);
        }
        Ok(self.finalize())
    }

    pub fn enriched_concept(&self) -> String {
        prompts::compile_enriched_concept(&self.concept, &self.rounds)
    }

    fn finalize(&mut self) -> String {
        self.finished = true;
        self.enriched_concept()
    }

    async fn fetch_round(
        &mut self,
        round_number: usize,
        cancel: &CancellationToken,
    ) -> Result<QaStep, QaError> {
        let previous: Vec<(String, String)> = self
            .rounds
            .iter()
            .flat_map(|r| r.answered_pairs())
            .map(|(q, a)| (q.to_string(), a.to_string()))
            .collect();

        let prompt = ChatPrompt {
            system: prompts::qa_system_prompt(self.audience),
            user: prompts::qa_user_prompt(
                &self.concept,
                round_number,
                self.max_rounds,
                &previous,
                self.audience,
            ),
            temperature: QA_TEMPERATURE,
            max_tokens: QA_MAX_TOKENS,
        };

        let raw = self.router.chat(&prompt, cancel).await?;
        let (questions, done) = parse_round(&raw)?;
        debug!(
            "Round {} returned {} questions (done: {})",
            round_number,
            questions.len(),
            done
        );

        if questions.is_empty() {
            if self.rounds.is_empty() {
                return Err(QaError::NoQuestions);
            }
            return Ok(QaStep::Complete(self.finalize()));
        }

        let round = QaRound {
            round_number,
            questions,
            done,
        };
        self.rounds.push(round.clone());
        Ok(QaStep::Round(round))
    }
}

/// Parses a model reply into at most three complete questions and the
/// model's done flag.
pub fn parse_round(raw: &str) -> Result<(Vec<QaQuestion>, bool), QaError> {
    let body = strip_code_blocks(raw);
    let body = body.trim();

    let dto = parse_dto(body)
        .or_else(|| first_json_object(body).and_then(parse_dto))
        .or_else(|| first_json_array(body).and_then(parse_dto))
        .ok_or(QaError::Unparsable)?;

    let total = dto.questions.len();
    let questions: Vec<QaQuestion> = dto
        .questions
        .into_iter()
        .filter_map(into_question)
        .take(MAX_QUESTIONS_PER_ROUND)
        .collect();
    if questions.len() < total.min(MAX_QUESTIONS_PER_ROUND) {
        warn!("Dropped incomplete questions from Q&A reply");
    }
    Ok((questions, dto.done))
}

fn parse_dto(text: &str) -> Option<RoundDto> {
    if text.starts_with('[') {
        return serde_json::from_str::<Vec<QuestionDto>>(text)
            .ok()
            .map(|questions| RoundDto {
                questions,
                done: false,
            });
    }
    serde_json::from_str::<RoundDto>(text).ok()
}

fn into_question(dto: QuestionDto) -> Option<QaQuestion> {
    let text = clean(&dto.question);
    if text.is_empty() {
        return None;
    }
    let answers: Vec<String> = dto
        .suggestions
        .iter()
        .map(|s| clean(s))
        .filter(|s| !s.is_empty())
        .take(3)
        .collect();
    let suggested_answers: [String; 3] = answers.try_into().ok()?;
    Some(QaQuestion {
        text,
        suggested_answers,
        user_answer: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm::testing::MockBackend;

    fn reply(questions: &[(&str, [&str; 3])], done: bool) -> String {
        let questions: Vec<serde_json::Value> = questions
            .iter()
            .map(|(q, s)| serde_json::json!({ "question": q, "suggestions": s }))
            .collect();
        serde_json::json!({ "questions": questions, "done": done }).to_string()
    }

    #[tokio::test]
    async fn test_done_on_second_round_stops_early() {
        let backend = Arc::new(
            MockBackend::new("m")
                .then_chat(Ok(reply(
                    &[
                        ("Who is the hero?", ["A fox", "A cat", "A bear"]),
                        ("Where do they live?", ["A forest", "A city", "A boat"]),
                    ],
                    false,
                )))
                .then_chat(Ok(reply(
                    &[("What goes wrong?", ["Rain", "A lost map", "A storm"])],
                    true,
                ))),
        );
        let router = Arc::new(Router::new(backend.clone()));
        let mut session = QaSession::new(router, "A fox story", Audience::Kid);
        let cancel = CancellationToken::new();

        let QaStep::Round(first) = session.start(&cancel).await.unwrap() else {
            panic!("expected a round");
        };
        assert_eq!(first.round_number, 1);
        assert!(session.answer(0, "A fox"));
        assert!(session.answer(1, "A forest"));

        let QaStep::Round(second) = session.submit_round(&cancel).await.unwrap() else {
            panic!("expected a second round");
        };
        assert!(second.done);
        assert!(session.answer(0, "A lost map"));

        let QaStep::Complete(enriched) = session.submit_round(&cancel).await.unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(
            enriched,
            "A fox story\n\nAdditional story details:\n\
             - Who is the hero?: A fox\n\
             - Where do they live?: A forest\n\
             - What goes wrong?: A lost map\n"
        );
        assert_eq!(backend.call_count(), 2);
        assert!(session.is_finished());

        let requests = backend.requests.lock().unwrap();
        assert!(requests[1].contains("A: A forest"));
        assert!(requests[1].contains("round 2 of 4"));
    }

    #[tokio::test]
    async fn test_max_rounds_finalizes() {
        let backend = Arc::new(MockBackend::new("m").then_chat(Ok(reply(
            &[("Who?", ["a", "b", "c"])],
            false,
        ))));
        let router = Arc::new(Router::new(backend.clone()));
        let mut session = QaSession::new(router, "idea", Audience::Adult).with_max_rounds(1);
        let cancel = CancellationToken::new();
        session.start(&cancel).await.unwrap();
        session.answer(0, "b");
        assert_eq!(
            session.submit_round(&cancel).await.unwrap(),
            QaStep::Complete("idea\n\nAdditional story details:\n- Who?: b\n".into())
        );
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_submit_requires_an_answer() {
        let backend = Arc::new(MockBackend::new("m").then_chat(Ok(reply(
            &[("Who?", ["a", "b", "c"])],
            false,
        ))));
        let mut session = QaSession::new(Arc::new(Router::new(backend)), "idea", Audience::Kid);
        let cancel = CancellationToken::new();
        session.start(&cancel).await.unwrap();
        session.answer(0, "   ");
        assert_eq!(
            session.submit_round(&cancel).await.unwrap_err(),
            QaError::NothingAnswered
        );
        assert_eq!(session.finish_early().unwrap_err(), QaError::NothingAnswered);

        session.answer(0, "c");
        assert_eq!(
            session.finish_early().unwrap(),
            "idea\n\nAdditional story details:\n- Who?: c\n"
        );
    }

    #[tokio::test]
    async fn test_empty_first_round_fails() {
        let backend =
            Arc::new(MockBackend::new("m").then_chat(Ok(r#"{"questions":[],"done":true}"#.into())));
        let mut session = QaSession::new(Arc::new(Router::new(backend)), "idea", Audience::Kid);
        let err = session.start(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err, QaError::NoQuestions);
        assert_eq!(
            err.to_string(),
            "The AI didn't generate any questions. Please try again."
        );
    }

    #[test]
    fn test_parse_round_variants() {
        let raw = r#"```json
[{"text":"Name?","suggestedAnswers":["Pip","Bo","Lu","Extra"]},
 {"question":"Too few?","suggestions":["x",""]},
 {"question":"Three","suggestions":["1","2","3"]},
 {"question":"Four","suggestions":["1","2","3"]},
 {"question":"Five","suggestions":["1","2","3"]}]
```"#;
        let (questions, done) = parse_round(raw).unwrap();
        assert!(!done);
        assert_eq!(questions.len(), 3);
        assert_eq!(questions[0].text, "Name?");
        assert_eq!(questions[0].suggested_answers[2], "Lu");
        assert_eq!(questions[1].text, "Three");

        let (questions, done) =
            parse_round("Sure! {\"questions\":[],\"done\":true} Hope that helps.").unwrap();
        assert!(questions.is_empty());
        assert!(done);

        assert_eq!(parse_round("no json here").unwrap_err(), QaError::Unparsable);
    }
}

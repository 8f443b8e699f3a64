//! Typed consumers of extracted payloads.
//!
//! The service has renamed fields in these payloads more than once, so each
//! raw shape accepts every spelling seen so far. Entries that do not fit are
//! skipped; only a missing or non-array payload fails the extraction.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::extract_payload;
use crate::error::{ExtractResult, ExtractionError, preview};

/// Marker key of the quiz payload.
pub const QUIZ_TARGET: &str = "quiz";

/// Marker key of the flashcard payload.
pub const FLASHCARDS_TARGET: &str = "flashcards";

/// One multiple-choice question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuizQuestion {
    pub question: String,
    pub options: Vec<QuizOption>,
    pub hint: Option<String>,
    pub explanation: Option<String>,
}

impl QuizQuestion {
    /// Returns the first option marked correct.
    pub fn correct_option(&self) -> Option<&QuizOption> {
        self.options.iter().find(|o| o.is_correct)
    }
}

/// One answer option of a [`QuizQuestion`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuizOption {
    pub text: String,
    pub is_correct: bool,
    pub rationale: Option<String>,
}

/// One flashcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flashcard {
    pub front: String,
    pub back: String,
}

#[derive(Deserialize)]
struct RawQuestion {
    #[serde(alias = "q", alias = "prompt")]
    question: String,
    #[serde(default, alias = "answerOptions", alias = "answers", alias = "choices")]
    options: Vec<Value>,
    #[serde(default)]
    hint: Option<String>,
    #[serde(default, alias = "rationale")]
    explanation: Option<String>,
}

#[derive(Deserialize)]
struct RawOption {
    #[serde(alias = "option", alias = "answer")]
    text: String,
    #[serde(default, alias = "isCorrect", alias = "correct")]
    is_correct: bool,
    #[serde(default)]
    rationale: Option<String>,
}

#[derive(Deserialize)]
struct RawFlashcard {
    #[serde(alias = "f", alias = "question", alias = "term")]
    front: String,
    #[serde(alias = "b", alias = "answer", alias = "definition")]
    back: String,
}

/// Extracts quiz questions from a call result.
pub fn quiz_questions(value: &Value) -> ExtractResult<Vec<QuizQuestion>> {
    let payload = extract_payload(value, QUIZ_TARGET)?;
    let entries = as_array(&payload.value, QUIZ_TARGET)?;
    Ok(entries.iter().filter_map(parse_question).collect())
}

/// Extracts flashcards from a call result.
pub fn flashcards(value: &Value) -> ExtractResult<Vec<Flashcard>> {
    let payload = extract_payload(value, FLASHCARDS_TARGET)?;
    let entries = as_array(&payload.value, FLASHCARDS_TARGET)?;
    Ok(entries.iter().filter_map(parse_flashcard).collect())
}

fn as_array<'a>(value: &'a Value, target: &str) -> ExtractResult<&'a Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| ExtractionError::UnexpectedShape {
            target: target.to_string(),
            expected: "an array",
            preview: preview(&value.to_string()),
        })
}

fn parse_question(entry: &Value) -> Option<QuizQuestion> {
    let raw: RawQuestion = match serde_json::from_value(entry.clone()) {
        Ok(raw) => raw,
        Err(e) => {
            debug!(error = %e, "skipping malformed quiz entry");
            return None;
        }
    };

    let options = raw
        .options
        .iter()
        .filter_map(parse_option)
        .collect();

    Some(QuizQuestion {
        question: raw.question,
        options,
        hint: raw.hint,
        explanation: raw.explanation,
    })
}

fn parse_option(entry: &Value) -> Option<QuizOption> {
    // Older payloads store options as bare strings with no correctness flag.
    if let Some(text) = entry.as_str() {
        return Some(QuizOption {
            text: text.to_string(),
            is_correct: false,
            rationale: None,
        });
    }
    let raw: RawOption = serde_json::from_value(entry.clone())
        .map_err(|e| debug!(error = %e, "skipping malformed quiz option"))
        .ok()?;
    Some(QuizOption {
        text: raw.text,
        is_correct: raw.is_correct,
        rationale: raw.rationale,
    })
}

fn parse_flashcard(entry: &Value) -> Option<Flashcard> {
    let raw: RawFlashcard = serde_json::from_value(entry.clone())
        .map_err(|e| debug!(error = %e, "skipping malformed flashcard"))
        .ok()?;
    Some(Flashcard {
        front: raw.front,
        back: raw.back,
    })
}

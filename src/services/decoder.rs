//! Turns whatever a backend returned into a [`StoryDraft`].
//!
//! Decode stages, first success wins:
//! 1. the whole payload as a story object
//! 2. a `{"story": {...}}` wrapper
//! 3. a transport envelope (chat-completion or `{"content": ...}`), whose inner
//!    text is decoded again
//! 4. the substring between the first `{` and the last `}`

use crate::core::error::GenerationError;
use crate::core::safety::{BasicSafetyGate, SafetyGate};
use crate::core::state::{StoryDraft, StoryPage};
use crate::utils::text::{clean, first_json_object, strip_code_blocks};
use log::debug;
use serde::Deserialize;
use serde_json::Value;

pub const DEFAULT_TITLE: &str = "StoryFox Book";
pub const DEFAULT_AUTHOR_LINE: &str = "Written by StoryFox";
pub const DEFAULT_MORAL: &str = "Kindness and curiosity guide every adventure.";
pub const DEFAULT_PAGE_TEXT: &str = "A gentle moment unfolds.";

#[derive(Debug, Clone)]
pub struct DecodeOptions {
    pub page_count: usize,
    pub fallback_concept: String,
    /// Append generic pages when the backend under-delivers.
    pub pad_missing_pages: bool,
}

impl DecodeOptions {
    pub fn new(page_count: usize, fallback_concept: &str) -> Self {
        Self {
            page_count,
            fallback_concept: fallback_concept.to_string(),
            pad_missing_pages: false,
        }
    }

    pub fn padded(mut self, pad: bool) -> Self {
        self.pad_missing_pages = pad;
        self
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct StoryDto {
    #[serde(default)]
    title: Option<String>,
    #[serde(default, alias = "author_line", alias = "author")]
    author_line: Option<String>,
    #[serde(default)]
    moral: Option<String>,
    #[serde(default, alias = "character_descriptions")]
    character_descriptions: Option<String>,
    pages: Vec<PageDto>,
}

#[derive(Deserialize, Debug)]
struct PageDto {
    #[serde(default, rename = "pageNumber", alias = "page_number", alias = "page")]
    page_number: Option<Value>,
    #[serde(default)]
    text: Option<String>,
    #[serde(
        default,
        rename = "imagePrompt",
        alias = "illustrationPrompt",
        alias = "image_prompt"
    )]
    image_prompt: Option<String>,
}

impl PageDto {
    fn declared_number(&self) -> Option<i64> {
        match self.page_number.as_ref()? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct StoryEnvelope {
    story: StoryDto,
}

/// Decodes without padding, using the built-in safety gate for fallback prompts.
pub fn decode(raw: &str, page_count: usize, concept: &str) -> Result<StoryDraft, GenerationError> {
    decode_with(raw, &DecodeOptions::new(page_count, concept), &BasicSafetyGate)
}

pub fn decode_with(
    raw: &str,
    options: &DecodeOptions,
    gate: &dyn SafetyGate,
) -> Result<StoryDraft, GenerationError> {
    let dto = decode_dto(raw).ok_or(GenerationError::Unparsable)?;
    let draft = normalize(dto, options, gate);
    if draft.pages.is_empty() {
        return Err(GenerationError::ContentRejected);
    }
    Ok(draft)
}

fn decode_dto(raw: &str) -> Option<StoryDto> {
    let text = strip_code_blocks(raw);
    if text.is_empty() {
        return None;
    }

    if let Some(dto) = parse_story(&text) {
        debug!("Decoded story payload directly");
        return Some(dto);
    }

    if let Some(inner) = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| extract_text_content(&v))
    {
        let inner = strip_code_blocks(&inner);
        if let Some(dto) = parse_story(&inner).or_else(|| scan_braces(&inner)) {
            debug!("Decoded story from transport envelope");
            return Some(dto);
        }
    }

    let dto = scan_braces(&text);
    if dto.is_some() {
        debug!("Decoded story by brace scan");
    }
    dto
}

// Stages 1 and 2.
fn parse_story(text: &str) -> Option<StoryDto> {
    if let Ok(dto) = serde_json::from_str::<StoryDto>(text) {
        return Some(dto);
    }
    serde_json::from_str::<StoryEnvelope>(text)
        .ok()
        .map(|env| env.story)
}

fn scan_braces(text: &str) -> Option<StoryDto> {
    first_json_object(text).and_then(parse_story)
}

/// Pulls the generated text out of a transport envelope.
pub fn extract_text_content(value: &Value) -> Option<String> {
    let object = value.as_object()?;

    if let Some(content) = object.get("content").and_then(Value::as_str) {
        return Some(content.to_string());
    }

    if let Some(story) = object.get("story").filter(|s| s.is_object()) {
        return serde_json::to_string(story).ok();
    }

    let message = object
        .get("choices")?
        .as_array()?
        .first()?
        .get("message")?;
    match message.get("content")? {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let parts: Vec<&str> = items
                .iter()
                .filter_map(|item| {
                    item.get("text")
                        .and_then(Value::as_str)
                        .or_else(|| item.get("output_text").and_then(Value::as_str))
                })
                .collect();
            (!parts.is_empty()).then(|| parts.join("\n"))
        }
        _ => None,
    }
}

fn normalize(dto: StoryDto, options: &DecodeOptions, gate: &dyn SafetyGate) -> StoryDraft {
    let fallback_prompt = gate.safe_illustration_prompt(&format!(
        "A gentle scene inspired by {}",
        options.fallback_concept
    ));

    // Pages without a number keep their position relative to numbered ones.
    let mut indexed: Vec<(i64, PageDto)> = dto
        .pages
        .into_iter()
        .enumerate()
        .map(|(i, p)| (p.declared_number().unwrap_or(i as i64 + 1), p))
        .collect();
    indexed.sort_by_key(|(n, _)| *n);
    indexed.dedup_by_key(|(n, _)| *n);

    let limit = if options.page_count == 0 {
        indexed.len()
    } else {
        options.page_count
    };

    let mut pages: Vec<StoryPage> = indexed
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(offset, (_, page))| StoryPage {
            page_number: offset + 1,
            text: or_default(clean(page.text.as_deref().unwrap_or_default()), DEFAULT_PAGE_TEXT),
            illustration_prompt: or_default(
                clean(page.image_prompt.as_deref().unwrap_or_default()),
                &fallback_prompt,
            ),
        })
        .collect();

    if options.pad_missing_pages && !pages.is_empty() {
        while pages.len() < limit {
            pages.push(StoryPage {
                page_number: pages.len() + 1,
                text: DEFAULT_PAGE_TEXT.to_string(),
                illustration_prompt: fallback_prompt.clone(),
            });
        }
    }

    StoryDraft {
        title: or_default(clean(dto.title.as_deref().unwrap_or_default()), DEFAULT_TITLE),
        author_line: or_default(
            clean(dto.author_line.as_deref().unwrap_or_default()),
            DEFAULT_AUTHOR_LINE,
        ),
        moral: or_default(clean(dto.moral.as_deref().unwrap_or_default()), DEFAULT_MORAL),
        character_descriptions: dto
            .character_descriptions
            .unwrap_or_default()
            .trim()
            .to_string(),
        pages,
    }
}

fn or_default(value: String, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}

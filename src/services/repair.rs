//! Character description repair.
//!
//! Small models often return an empty or one-word `characterDescriptions`
//! field. The illustration prompts are asked to name the character first, so
//! names and visual keywords can be recovered from them instead.

use crate::core::state::{CharacterEntry, Story, StoryDraft, StoryPage};
use crate::utils::text::{clean, collapse_whitespace};
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

const MAX_CHARACTERS: usize = 4;
const MAX_ATTRIBUTES: usize = 5;
const MAX_NAME_WORDS: usize = 5;
const ENOUGH_DETAILS: usize = 3;
const NO_DETAILS: &str = "main character";

const SCENE_STARTERS: &[&str] = &[
    "a", "an", "the", "in", "on", "at", "with", "under", "inside", "outside",
];

const COLOR_WORDS: &[&str] = &[
    "red", "blue", "green", "yellow", "orange", "purple", "pink", "white", "black", "brown",
    "golden", "silver", "bright", "dark", "light", "spotted", "striped", "fluffy", "tiny",
    "small", "big", "tall",
];

const CLOTHING_WORDS: &[&str] = &[
    "dress", "hat", "scarf", "cape", "boots", "shirt", "coat", "crown", "ribbon", "bow",
    "glasses", "vest", "apron", "jacket",
];

const SPECIES_WORDS: &[&str] = &[
    "fox", "rabbit", "bunny", "bear", "cat", "dog", "mouse", "owl", "deer", "bird", "dragon",
    "unicorn", "frog", "turtle", "squirrel", "hedgehog", "penguin", "lion", "wolf", "elephant",
    "puppy", "kitten",
];

static SENTENCE_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.\s+([A-Z])").unwrap());
static NON_LETTER: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\p{L}\s]").unwrap());

/// Returns usable character descriptions for `pages`, deriving them from the
/// illustration prompts when the supplied ones are too thin.
pub fn repair(descriptions: &str, pages: &[StoryPage], title: &str) -> String {
    let cleaned = normalize(descriptions);
    if is_adequate(&cleaned) {
        return cleaned;
    }

    let extracted = extract_from_prompts(pages);
    debug!(
        "Character descriptions for '{}' inadequate, derived {} line(s)",
        title,
        extracted.lines().count()
    );

    match (cleaned.is_empty(), extracted.is_empty()) {
        (_, true) => cleaned,
        (true, false) => extracted,
        (false, false) => format!("{}\n{}", cleaned, extracted),
    }
}

/// Repairs the descriptions of a decoded draft and attaches parsed entries.
pub fn enrich(draft: StoryDraft) -> Story {
    let character_descriptions =
        repair(&draft.character_descriptions, &draft.pages, &draft.title);
    let characters = parse_entries(&character_descriptions);
    Story {
        title: draft.title,
        author_line: draft.author_line,
        moral: draft.moral,
        character_descriptions,
        characters,
        pages: draft.pages,
    }
}

/// Parses `"Name - a, b, c"` lines. Lines without the separator are skipped.
pub fn parse_entries(descriptions: &str) -> Vec<CharacterEntry> {
    descriptions
        .lines()
        .filter_map(|line| {
            let (name, rest) = line.split_once(" - ")?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            let (mut species, others): (Vec<String>, Vec<String>) = rest
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .partition(|a| mentions_species(a));
            species.extend(others);
            species.truncate(MAX_ATTRIBUTES);
            Some(CharacterEntry {
                name: name.to_string(),
                attributes: species,
            })
        })
        .take(MAX_CHARACTERS)
        .collect()
}

fn mentions_species(attribute: &str) -> bool {
    attribute
        .to_lowercase()
        .split_whitespace()
        .any(|w| SPECIES_WORDS.contains(&w))
}

fn normalize(descriptions: &str) -> String {
    let mut cleaned = clean(descriptions);
    if cleaned.is_empty() {
        return cleaned;
    }

    // One-line "A - x. B - y." lists get a line per character.
    if !cleaned.contains('\n') && cleaned.contains(" - ") {
        cleaned = SENTENCE_BREAK.replace_all(&cleaned, ".\n$1").into_owned();
    }

    cleaned
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_adequate(descriptions: &str) -> bool {
    descriptions.lines().map(str::trim).any(|line| {
        let words = line.split_whitespace().count();
        (line.contains(" - ") && words >= 4) || words >= 5
    })
}

fn extract_from_prompts(pages: &[StoryPage]) -> String {
    let prompts: Vec<&str> = pages
        .iter()
        .map(|p| p.illustration_prompt.trim())
        .filter(|p| !p.is_empty())
        .collect();
    let leads: Vec<String> = prompts.iter().map(|p| leading_capitalised(p).0).collect();

    let mut names: Vec<String> = Vec::new();
    for prompt in &prompts {
        if let Some(name) = name_candidate(prompt, &leads) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }

    names
        .iter()
        .take(MAX_CHARACTERS)
        .map(|name| {
            let details = appearance_details(name, pages);
            if details.is_empty() {
                format!("{} - {}", name, NO_DETAILS)
            } else {
                format!("{} - {}", name, details.join(", "))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Text before the first comma. Without one, the leading capitalised words
/// count only when a species follows them ("Pip the fox") or when they also
/// lead another prompt.
fn name_candidate(prompt: &str, leads: &[String]) -> Option<String> {
    if let Some((head, _)) = prompt.split_once(',') {
        let head = collapse_whitespace(head);
        if is_likely_name(&head) {
            return Some(head);
        }
    }

    let (candidate, rest) = leading_capitalised(prompt);
    if !is_likely_name(&candidate) {
        return None;
    }
    let introduces_species = match rest.as_slice() {
        [first, ..] if is_species(first) => true,
        [article, second, ..] if article.eq_ignore_ascii_case("the") => is_species(second),
        _ => false,
    };
    let recurring = leads.iter().filter(|l| **l == candidate).count() >= 2;
    (introduces_species || recurring).then_some(candidate)
}

/// Leading capitalised words, punctuation trimmed, plus the next two words.
fn leading_capitalised(prompt: &str) -> (String, Vec<&str>) {
    let mut words = prompt.split_whitespace().peekable();
    let mut leading: Vec<&str> = Vec::new();
    while let Some(word) = words.next_if(|w| w.chars().next().is_some_and(char::is_uppercase)) {
        if leading.len() == MAX_NAME_WORDS {
            break;
        }
        let trimmed = word.trim_end_matches(|c: char| !c.is_alphanumeric());
        leading.push(trimmed);
        if trimmed.len() != word.len() {
            break;
        }
    }
    let rest = words
        .take(2)
        .map(|w| w.trim_end_matches(|c: char| !c.is_alphanumeric()))
        .collect();
    (leading.join(" "), rest)
}

fn is_species(word: &str) -> bool {
    SPECIES_WORDS.contains(&word.to_lowercase().as_str())
}

fn is_likely_name(candidate: &str) -> bool {
    let words: Vec<&str> = candidate.split_whitespace().collect();
    let Some(first) = words.first() else {
        return false;
    };
    if words.len() > MAX_NAME_WORDS {
        return false;
    }
    if !candidate.chars().next().is_some_and(char::is_uppercase) {
        return false;
    }
    !SCENE_STARTERS.contains(&first.to_lowercase().as_str())
}

// Species words go to the front; the scan stops once a page brings the total
// to three.
fn appearance_details(name: &str, pages: &[StoryPage]) -> Vec<String> {
    let needle = name.to_lowercase();
    let mut found: Vec<String> = Vec::new();

    for page in pages {
        let lower = page.illustration_prompt.to_lowercase();
        if !lower.contains(&needle) {
            continue;
        }
        let letters = NON_LETTER.replace_all(&lower, " ");
        for word in letters.split_whitespace() {
            if found.iter().any(|f| f == word) {
                continue;
            }
            if SPECIES_WORDS.contains(&word) {
                found.insert(0, word.to_string());
            } else if COLOR_WORDS.contains(&word) || CLOTHING_WORDS.contains(&word) {
                found.push(word.to_string());
            }
        }
        if found.len() >= ENOUGH_DETAILS {
            break;
        }
    }

    found.truncate(MAX_ATTRIBUTES);
    found
}

use once_cell::sync::Lazy;
use regex::Regex;

static BOLD_ITALIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*{3}(.+?)\*{3}").unwrap());
static BOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*{2}(.+?)\*{2}").unwrap());
static ITALIC_STAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^|\s)\*(\S|\S.*?\S)\*($|\s|[.,!?])").unwrap());
static BOLD_UNDERSCORE: Lazy<Regex> = Lazy::new(|| Regex::new(r"__(.+?)__").unwrap());
static ITALIC_UNDERSCORE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^|\s)_(\S|\S.*?\S)_($|\s|[.,!?])").unwrap());
static HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#{1,6}\s+").unwrap());
static MULTI_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s{2,}").unwrap());

/// Removes markdown emphasis and headings, straightens curly quotes, drops
/// quotes wrapping the whole value and collapses whitespace.
pub fn clean(text: &str) -> String {
    let mut s = text.trim().to_string();

    // Longest markers first so no orphaned asterisks remain.
    s = BOLD_ITALIC.replace_all(&s, "$1").into_owned();
    s = BOLD.replace_all(&s, "$1").into_owned();
    s = replace_until_stable(&ITALIC_STAR, s);
    s = BOLD_UNDERSCORE.replace_all(&s, "$1").into_owned();
    s = replace_until_stable(&ITALIC_UNDERSCORE, s);
    s = HEADING.replace_all(&s, "").into_owned();

    s = s
        .replace('\u{201C}', "\"")
        .replace('\u{201D}', "\"")
        .replace('\u{2018}', "'")
        .replace('\u{2019}', "'");

    if s.starts_with('"') && s.ends_with('"') && s.chars().count() > 2 {
        s = s[1..s.len() - 1].to_string();
    }

    s = MULTI_SPACE.replace_all(&s, " ").into_owned();
    s.trim().to_string()
}

// Adjacent emphasised words share the separating whitespace, so a single pass
// can skip every other match.
fn replace_until_stable(re: &Regex, mut s: String) -> String {
    for _ in 0..4 {
        let next = re.replace_all(&s, "${1}${2}${3}").into_owned();
        if next == s {
            break;
        }
        s = next;
    }
    s
}

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json").trim_end_matches("```").trim().to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```").trim_end_matches("```").trim().to_string()
    } else {
        s.to_string()
    }
}

/// Substring from the first `{` to the last `}`.
pub fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

/// Substring from the first `[` to the last `]`.
pub fn first_json_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (start < end).then(|| &text[start..=end])
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// At most `max_chars` characters, cut on a char boundary.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

//! Post-processing: deterministic cleanup of model replies.
//!
//! Even well-prompted models occasionally wrap a JSON reply in ```` ```json ````
//! fences, add a sentence before it, or return a single object where a list
//! was asked for. The rules here turn a page reply into a list of record
//! objects and a SQL reply into plain SQL text, without touching content.
//!
//! ## Page replies
//!
//! 1. Normalise line endings and strip invisible Unicode
//! 2. Strip outer code fences
//! 3. Parse the first JSON value in the text
//! 4. Shape it into records: an array is kept, `{"questions": [...]}` is
//!    unwrapped, any other object becomes a one-element array
//! 5. Tag every record object that lacks one with `"page": <n>`

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Turn a raw page reply into the records persisted for that page.
///
/// Returns a human-readable reason when the reply has no usable JSON.
pub fn records_from_reply(reply: &str, page_number: usize) -> Result<Vec<Value>, String> {
    let text = remove_invisible_chars(&normalise_line_endings(reply));
    let text = strip_code_fences(&text);

    let value = extract_json(&text).ok_or_else(|| {
        let preview: String = text.trim().chars().take(80).collect();
        format!("no JSON value found in reply: {preview:?}")
    })?;

    let mut records = shape_records(value)?;
    tag_page(&mut records, page_number);
    Ok(records)
}

/// Apply the SQL cleanup rules to a raw model reply.
pub fn clean_sql(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = strip_code_fences(&s);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    ensure_final_newline(&s)
}

// ── Rule 1: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 2: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 3: Strip outer code fences ──────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z]*[ \t]*\n(.*?)\n?```\s*$").unwrap());

static RE_INNER_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z]*[ \t]*\n(.*?)\n?```").unwrap());

/// Remove a fence around the whole reply, or failing that, return the body
/// of the first fenced block when the reply has prose around it.
pub fn strip_code_fences(input: &str) -> String {
    let trimmed = input.trim();
    if let Some(caps) = RE_OUTER_FENCES.captures(trimmed) {
        return caps[1].to_string();
    }
    if let Some(caps) = RE_INNER_FENCE.captures(trimmed) {
        return caps[1].to_string();
    }
    input.to_string()
}

// ── Rule 4: Extract the first JSON value ─────────────────────────────────────

/// Parse the whole text as JSON, or the first array/object that starts
/// somewhere inside it.
pub fn extract_json(input: &str) -> Option<Value> {
    let trimmed = input.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }

    for (start, _) in trimmed.match_indices(['[', '{']) {
        let mut stream = serde_json::Deserializer::from_str(&trimmed[start..]).into_iter::<Value>();
        if let Some(Ok(v)) = stream.next() {
            return Some(v);
        }
    }
    None
}

// ── Rule 5: Shape into records ───────────────────────────────────────────────

fn shape_records(value: Value) -> Result<Vec<Value>, String> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("questions") {
            Some(Value::Array(items)) => Ok(items),
            Some(other) => {
                map.insert("questions".to_string(), other);
                Ok(vec![Value::Object(map)])
            }
            None => Ok(vec![Value::Object(map)]),
        },
        other => Err(format!(
            "expected a JSON array or object, got {}",
            json_kind(&other)
        )),
    }
}

// ── Rule 6: Tag records with their page ──────────────────────────────────────

fn tag_page(records: &mut [Value], page_number: usize) {
    for record in records {
        if let Value::Object(map) = record {
            map.entry("page").or_insert_with(|| Value::from(page_number));
        }
    }
}

// ── Shared helpers ───────────────────────────────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{}\n", trimmed)
    }
}

/// Article + kind of a JSON value, for messages: `an object`, `a number`.
pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

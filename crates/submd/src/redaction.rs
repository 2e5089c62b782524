//! PII scrubbing for artifact contents.
//!
//! Two layers: pattern scrubbing over free text (emails, phone numbers,
//! SSNs, card numbers, bearer/API tokens) and key-based scrubbing over JSON
//! (any value under a sensitive key is replaced wholesale). The scrub count
//! is reported so callers can record how much was removed; a post-scrub
//! scan backs the strict mode.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

pub const REDACTED: &str = "[REDACTED]";

lazy_static! {
    static ref EMAIL: Regex =
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email regex");
    static ref PHONE: Regex =
        Regex::new(r"\+?\d[\d\s().-]{7,}\d").expect("phone regex");
    static ref SSN: Regex = Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("ssn regex");
    static ref CARD: Regex =
        Regex::new(r"\b(?:\d[ -]?){13,19}\b").expect("card regex");
    static ref TOKEN: Regex =
        Regex::new(r"(?i)\b(?:bearer\s+[A-Za-z0-9._~+/=-]{8,}|sk-[A-Za-z0-9]{8,})")
            .expect("token regex");
}

/// Keys whose values are scrubbed wholesale, case-insensitively.
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "authorization",
    "ssn",
    "cvv",
    "card_number",
];

fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|k| lowered == *k)
}

/// Replace every PII pattern match in a string. Returns the scrubbed text
/// and the number of replacements made.
pub fn scrub_text(text: &str) -> (String, u32) {
    let mut scrubbed = text.to_string();
    let mut count: u32 = 0;
    for pattern in [&*TOKEN, &*EMAIL, &*SSN, &*CARD, &*PHONE] {
        let matches = pattern.find_iter(&scrubbed).count() as u32;
        if matches > 0 {
            scrubbed = pattern.replace_all(&scrubbed, REDACTED).into_owned();
            count += matches;
        }
    }
    (scrubbed, count)
}

/// Count PII pattern matches without modifying anything.
pub fn scan_text(text: &str) -> u32 {
    let mut count: u32 = 0;
    for pattern in [&*TOKEN, &*EMAIL, &*SSN, &*CARD, &*PHONE] {
        count += pattern.find_iter(text).count() as u32;
    }
    count
}

/// Deep-scrub a JSON value in place. Sensitive keys are replaced wholesale;
/// every string leaf goes through pattern scrubbing.
pub fn scrub_value(value: &mut Value) -> u32 {
    match value {
        Value::String(text) => {
            let (scrubbed, count) = scrub_text(text);
            if count > 0 {
                *text = scrubbed;
            }
            count
        }
        Value::Array(items) => items.iter_mut().map(scrub_value).sum(),
        Value::Object(map) => {
            let mut count = 0;
            for (key, entry) in map.iter_mut() {
                if is_sensitive_key(key) {
                    if !matches!(entry, Value::Null) {
                        *entry = Value::String(REDACTED.to_string());
                        count += 1;
                    }
                } else {
                    count += scrub_value(entry);
                }
            }
            count
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => 0,
    }
}

/// Count remaining PII matches across all string leaves of a JSON value.
pub fn scan_value(value: &Value) -> u32 {
    match value {
        Value::String(text) => scan_text(text),
        Value::Array(items) => items.iter().map(scan_value).sum(),
        Value::Object(map) => map.values().map(scan_value).sum(),
        Value::Null | Value::Bool(_) | Value::Number(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn emails_are_scrubbed_with_placeholder() {
        let (scrubbed, count) = scrub_text("contact us at owner@acme.example for details");
        assert_eq!(count, 1);
        assert_eq!(scrubbed, format!("contact us at {REDACTED} for details"));
        assert_eq!(scan_text(&scrubbed), 0);
    }

    #[test]
    fn ssn_and_card_patterns_are_scrubbed() {
        let (scrubbed, count) = scrub_text("ssn 123-45-6789 card 4111 1111 1111 1111");
        assert_eq!(count, 2);
        assert!(!scrubbed.contains("123-45-6789"));
        assert!(!scrubbed.contains("4111"));
    }

    #[test]
    fn long_card_numbers_up_to_nineteen_digits_are_scrubbed() {
        let (scrubbed, count) = scrub_text("card 6011 1111 1111 1111 111 on file");
        assert_eq!(count, 1);
        assert_eq!(scrubbed, format!("card {REDACTED} on file"));
    }

    #[test]
    fn bearer_tokens_are_scrubbed() {
        let (scrubbed, count) = scrub_text("Authorization: Bearer abcdef123456.xyz");
        assert_eq!(count, 1);
        assert!(scrubbed.contains(REDACTED));
    }

    #[test]
    fn plain_prose_is_untouched() {
        let text = "Acme Plumbing fixes leaks in the greater metro area.";
        let (scrubbed, count) = scrub_text(text);
        assert_eq!(count, 0);
        assert_eq!(scrubbed, text);
    }

    #[test]
    fn sensitive_keys_are_scrubbed_wholesale() {
        let mut value = json!({
            "name": "Acme",
            "password": "hunter2",
            "nested": { "api_key": "not-even-token-shaped" }
        });
        let count = scrub_value(&mut value);
        assert_eq!(count, 2);
        assert_eq!(value["password"], REDACTED);
        assert_eq!(value["nested"]["api_key"], REDACTED);
        assert_eq!(value["name"], "Acme");
    }

    #[test]
    fn string_leaves_are_pattern_scrubbed_deeply() {
        let mut value = json!({
            "contacts": ["owner@acme.example", "no pii here"],
            "note": "call +1 (555) 010-0199"
        });
        let count = scrub_value(&mut value);
        assert_eq!(count, 2);
        assert_eq!(value["contacts"][0], REDACTED);
        assert_eq!(value["contacts"][1], "no pii here");
        assert_eq!(scan_value(&value), 0);
    }
}

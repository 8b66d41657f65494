//! `<private>` tag handling.
//!
//! Anything between `<private>` and `</private>` (case-insensitive, across
//! lines) is removed before text is stored. A prompt with nothing left after
//! stripping is entirely private.

use std::sync::LazyLock;

use regex::Regex;

static PRIVATE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<private>.*?</private>").expect("valid private-tag regex")
});

/// Remove private blocks and trim the result.
pub fn strip_private(text: &str) -> String {
    PRIVATE_BLOCK.replace_all(text, "").trim().to_string()
}

/// Whether `text` has no content outside private blocks.
pub fn is_entirely_private(text: &str) -> bool {
    strip_private(text).is_empty()
}

/// Strip private blocks from every string inside a JSON value.
pub fn strip_private_json(value: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::String(s) => Value::String(strip_private(s)),
        Value::Array(items) => Value::Array(items.iter().map(strip_private_json).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), strip_private_json(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_blocks_case_insensitively() {
        assert_eq!(
            strip_private("keep <PRIVATE>secret\nkey</Private> this"),
            "keep  this"
        );
    }

    #[test]
    fn entirely_private_prompts() {
        assert!(is_entirely_private("<private>all of it</private>"));
        assert!(is_entirely_private("  <private>a</private>\n<private>b</private> "));
        assert!(!is_entirely_private("<private>a</private> visible"));
        assert!(is_entirely_private(""));
    }

    #[test]
    fn json_strings_are_cleaned() {
        let v = serde_json::json!({"cmd": "echo <private>pw</private>hi", "n": 1});
        let cleaned = strip_private_json(&v);
        assert_eq!(cleaned["cmd"], "echo hi");
        assert_eq!(cleaned["n"], 1);
    }
}

//! Response cleaning and JSON decoding for oracle output.

use planindex_shared::OracleError;
use serde::de::DeserializeOwned;

/// Syntax errors this close to the end of the text are treated as truncation.
const TRUNCATION_WINDOW: usize = 50;

/// Strip markdown code fences and surrounding prose from an oracle response,
/// leaving the outermost JSON object or array.
pub fn clean_json_response(raw: &str) -> String {
    let mut text = raw.trim();

    if let Some(rest) = text.strip_prefix("```") {
        // Drop the language tag line (```json, ```JSON, or nothing).
        text = match rest.find('\n') {
            Some(idx) => &rest[idx + 1..],
            None => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
        };
        text = text.trim_end();
        if let Some(stripped) = text.strip_suffix("```") {
            text = stripped;
        }
        text = text.trim();
    } else if text.len() >= 2 && text.starts_with('`') && text.ends_with('`') {
        text = text.trim_matches('`').trim();
    }

    let start = text.find(['{', '[']);
    let Some(start) = start else {
        return text.to_string();
    };
    let closer = if text.as_bytes()[start] == b'{' { '}' } else { ']' };
    match text.rfind(closer) {
        Some(end) if end > start => text[start..=end].to_string(),
        _ => text[start..].to_string(),
    }
}

/// Clean and decode an oracle response.
///
/// Failures come back as [`OracleError::Malformed`]; `truncated` is set when
/// the text ended early or the syntax error sits within the last few bytes.
pub fn parse_json<T: DeserializeOwned>(raw: &str) -> Result<T, OracleError> {
    let cleaned = clean_json_response(raw);
    serde_json::from_str(&cleaned).map_err(|e| {
        let truncated = e.is_eof()
            || (e.is_syntax()
                && cleaned.len().saturating_sub(error_offset(&cleaned, &e)) <= TRUNCATION_WINDOW);
        OracleError::malformed(
            format!("{e} (response length {})", cleaned.len()),
            truncated,
        )
    })
}

/// Byte offset of a serde_json error position.
fn error_offset(text: &str, e: &serde_json::Error) -> usize {
    let line = e.line().max(1);
    let preceding: usize = text
        .split_inclusive('\n')
        .take(line - 1)
        .map(str::len)
        .sum();
    preceding + e.column()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn strips_json_fence() {
        let raw = "```json\n{\"a\": 1}\n```";
        assert_eq!(clean_json_response(raw), "{\"a\": 1}");
    }

    #[test]
    fn strips_bare_fence() {
        let raw = "```\n[1, 2]\n```\n";
        assert_eq!(clean_json_response(raw), "[1, 2]");
    }

    #[test]
    fn strips_single_backticks() {
        assert_eq!(clean_json_response("`{\"a\": 1}`"), "{\"a\": 1}");
    }

    #[test]
    fn trims_surrounding_prose() {
        let raw = "Here is the analysis:\n{\"a\": {\"b\": 2}}\nLet me know!";
        assert_eq!(clean_json_response(raw), "{\"a\": {\"b\": 2}}");
    }

    #[test]
    fn leaves_unterminated_tail_alone() {
        assert_eq!(clean_json_response("ok {\"a\": [1,"), "{\"a\": [1,");
    }

    #[test]
    fn fenced_and_raw_decode_identically() {
        let fenced: Value = parse_json("```json\n{\"x\": [1, 2]}\n```").unwrap();
        let raw: Value = parse_json("{\"x\": [1, 2]}").unwrap();
        assert_eq!(fenced, raw);
    }

    #[test]
    fn eof_is_truncation() {
        let err = parse_json::<Value>("{\"x\": [1, 2").unwrap_err();
        assert!(matches!(err, OracleError::Malformed { truncated: true, .. }));
    }

    #[test]
    fn early_syntax_error_is_not_truncation() {
        let mut raw = String::from("{\"x\": nope, \"pad\": \"");
        raw.push_str(&"y".repeat(200));
        raw.push_str("\"}");
        let err = parse_json::<Value>(&raw).unwrap_err();
        assert!(matches!(err, OracleError::Malformed { truncated: false, .. }));
    }

    #[test]
    fn type_mismatch_is_not_truncation() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct Needs {
            value: u32,
        }
        let err = parse_json::<Needs>("{\"other\": 1}").unwrap_err();
        assert!(matches!(err, OracleError::Malformed { truncated: false, .. }));
    }
}

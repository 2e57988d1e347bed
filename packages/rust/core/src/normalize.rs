//! Sheet-reference normalization.
//!
//! `"A-101"`, `"A101"`, `"a.101"` and `"3/A-101"` all reduce to `"A101"`, so
//! references written in any of those styles match the same sheet.

use std::sync::LazyLock;

use regex::Regex;

static SHEET_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]+\d").expect("valid regex"));

/// Reduce a sheet or detail reference to its matching key.
pub fn normalize(reference: &str) -> String {
    if reference.contains('/') {
        // Detail callout: "3/A-501" is detail 3 on sheet A-501.
        if let Some(segment) = reference
            .split('/')
            .map(strip_separators)
            .find(|part| SHEET_SEGMENT.is_match(part))
        {
            return segment;
        }
    }
    strip_separators(reference)
}

fn strip_separators(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, '-' | '.') && !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separator_variants_match() {
        let keys: Vec<_> = ["A-101", "A101", "A.101", "a 101", " A-101 "]
            .iter()
            .map(|r| normalize(r))
            .collect();
        assert!(keys.iter().all(|k| k == "A101"), "{keys:?}");
    }

    #[test]
    fn dotted_sheet_numbers() {
        assert_eq!(normalize("AS2.1"), "AS21");
        assert_eq!(normalize("M3.2"), "M32");
    }

    #[test]
    fn detail_callouts_keep_sheet_segment() {
        assert_eq!(normalize("3/A-501"), "A501");
        assert_eq!(normalize("A-501/3"), "A501");
        assert_eq!(normalize("12 / s-201"), "S201");
    }

    #[test]
    fn trailing_qualifiers_are_kept() {
        assert_eq!(normalize("A-101 (ALT)"), "A101(ALT)");
        assert_ne!(normalize("A-101 (ALT)"), normalize("A-101"));
    }

    #[test]
    fn callout_without_sheet_segment_falls_back() {
        assert_eq!(normalize("3/4"), "3/4");
    }

    #[test]
    fn empty_input() {
        assert_eq!(normalize(""), "");
    }
}

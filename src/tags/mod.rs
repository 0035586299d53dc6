//! The Tag Extractor: pulls user-authored tags from a trailing `Tag:`
//! line in a file, case-insensitive, comma-separated, filtered through a
//! super-blacklist (substring removal) then an exact-match blacklist then
//! length/shape checks.

use once_cell::sync::Lazy;
use regex::Regex;

static TAG_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*Tag:\s*(.+)\s*$").unwrap());

static ALL_DIGITS_OR_PUNCT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\d\p{P}\s]+$").unwrap());

pub struct TagExtractor {
    super_blacklist: Vec<Regex>,
    blacklist: Vec<String>,
}

impl Default for TagExtractor {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

impl TagExtractor {
    pub fn new(super_blacklist_patterns: Vec<String>, blacklist: Vec<String>) -> Self {
        let super_blacklist = super_blacklist_patterns
            .into_iter()
            .filter_map(|p| Regex::new(&p).ok())
            .collect();
        let blacklist = blacklist.into_iter().map(|s| s.to_lowercase()).collect();
        Self { super_blacklist, blacklist }
    }

    /// Extract tags from file content. Looks at the last non-empty line
    /// matching the `Tag:` pattern (case-insensitive); earlier matches are
    /// ignored since only a trailing tag line is meaningful.
    pub fn extract(&self, content: &str) -> Vec<String> {
        let last_match = content
            .lines()
            .rev()
            .find_map(|line| TAG_LINE.captures(line).map(|c| c[1].to_string()));

        let Some(raw) = last_match else {
            return Vec::new();
        };

        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();

        for piece in split_on_separators(&raw) {
            let mut tag = piece.trim().to_string();
            if tag.is_empty() {
                continue;
            }

            for pattern in &self.super_blacklist {
                tag = pattern.replace_all(&tag, "").to_string();
            }
            tag = tag.trim().to_string();
            if tag.is_empty() {
                continue;
            }

            let normalized = tag.to_lowercase();
            if self.blacklist.contains(&normalized) {
                continue;
            }

            if !passes_shape_filters(&tag) {
                continue;
            }

            if seen.insert(normalized.clone()) {
                out.push(tag);
            }
        }

        out
    }
}

fn split_on_separators(raw: &str) -> Vec<&str> {
    raw.split([',', '，', '、']).collect()
}

fn passes_shape_filters(tag: &str) -> bool {
    let char_count = tag.chars().count();
    if char_count < 2 || char_count > 50 {
        return false;
    }
    if ALL_DIGITS_OR_PUNCT.is_match(tag) {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_simple_comma_separated_tags() {
        let extractor = TagExtractor::default();
        let content = "alpha bravo\nTag: foo, bar";
        assert_eq!(extractor.extract(content), vec!["foo", "bar"]);
    }

    #[test]
    fn case_insensitive_tag_keyword() {
        let extractor = TagExtractor::default();
        let content = "body text\ntag: one, two";
        assert_eq!(extractor.extract(content), vec!["one", "two"]);
    }

    #[test]
    fn uses_last_matching_line_not_first() {
        let extractor = TagExtractor::default();
        let content = "Tag: old, stale\nmore text\nTag: new, fresh";
        assert_eq!(extractor.extract(content), vec!["new", "fresh"]);
    }

    #[test]
    fn handles_fullwidth_and_japanese_separators() {
        let extractor = TagExtractor::default();
        let content = "Tag: foo，bar、baz";
        assert_eq!(extractor.extract(content), vec!["foo", "bar", "baz"]);
    }

    #[test]
    fn dedups_preserving_first_seen_order() {
        let extractor = TagExtractor::default();
        let content = "Tag: foo, bar, foo, Foo";
        assert_eq!(extractor.extract(content), vec!["foo", "bar"]);
    }

    #[test]
    fn drops_all_digit_or_punctuation_tags() {
        let extractor = TagExtractor::default();
        let content = "Tag: 123, ---, valid";
        assert_eq!(extractor.extract(content), vec!["valid"]);
    }

    #[test]
    fn drops_too_short_and_too_long_tags() {
        let extractor = TagExtractor::default();
        let long = "x".repeat(51);
        let content = format!("Tag: a, {long}, ok");
        assert_eq!(extractor.extract(&content), vec!["ok"]);
    }

    #[test]
    fn exact_match_blacklist_drops_tag() {
        let extractor = TagExtractor::new(Vec::new(), vec!["banned".to_string()]);
        let content = "Tag: banned, allowed";
        assert_eq!(extractor.extract(content), vec!["allowed"]);
    }

    #[test]
    fn super_blacklist_strips_substring_before_other_filters() {
        let extractor = TagExtractor::new(vec!["^#".to_string()], Vec::new());
        let content = "Tag: #project, normal";
        assert_eq!(extractor.extract(content), vec!["project", "normal"]);
    }

    #[test]
    fn no_tag_line_returns_empty() {
        let extractor = TagExtractor::default();
        assert!(extractor.extract("just some text").is_empty());
    }
}

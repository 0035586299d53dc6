//! Text normalization shared by the chunker and the tag extractor.

pub const EMPTY_CONTENT_SENTINEL: &str = "[EMPTY_CONTENT]";

/// Strip a fixed set of emoji ranges, collapse runs of whitespace to a
/// single space, and trim. An empty result is replaced by a sentinel so
/// downstream code never has to special-case the empty string; callers
/// exclude the sentinel from embedding.
pub fn normalize_text(input: &str) -> String {
    let stripped: String = input.chars().filter(|c| !is_stripped_emoji(*c)).collect();

    let mut out = String::with_capacity(stripped.len());
    let mut last_was_space = false;
    for c in stripped.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    let trimmed = out.trim().to_string();
    if trimmed.is_empty() {
        EMPTY_CONTENT_SENTINEL.to_string()
    } else {
        trimmed
    }
}

fn is_stripped_emoji(c: char) -> bool {
    let code = c as u32;
    matches!(code,
        0x1F300..=0x1FAFF // misc symbols/pictographs, emoticons, transport, supplemental
        | 0x2600..=0x27BF // misc symbols and dingbats
        | 0x1F1E6..=0x1F1FF // regional indicators
        | 0xFE0F // variation selector-16
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_whitespace_and_trims() {
        assert_eq!(normalize_text("  hello   world  \n\n"), "hello world");
    }

    #[test]
    fn strips_emoji() {
        assert_eq!(normalize_text("hello 🎉 world"), "hello world");
    }

    #[test]
    fn empty_input_becomes_sentinel() {
        assert_eq!(normalize_text("   \n\t  "), EMPTY_CONTENT_SENTINEL);
    }

    #[test]
    fn all_emoji_input_becomes_sentinel() {
        assert_eq!(normalize_text("🎉🎊✨"), EMPTY_CONTENT_SENTINEL);
    }
}

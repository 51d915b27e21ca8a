//! Text processing utilities

use fuzzy_matcher::{skim::SkimMatcherV2, FuzzyMatcher};

/// Text processing utilities
pub struct TextProcessor {
    fuzzy_matcher: SkimMatcherV2,
}

impl Default for TextProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl TextProcessor {
    /// Create a new text processor
    pub fn new() -> Self {
        Self {
            fuzzy_matcher: SkimMatcherV2::default(),
        }
    }

    /// Perform fuzzy matching on a list of candidates
    pub fn fuzzy_match<'a>(&self, pattern: &str, candidates: &'a [String]) -> Vec<(&'a String, i64)> {
        let mut matches: Vec<(&String, i64)> = candidates
            .iter()
            .filter_map(|candidate| {
                self.fuzzy_matcher
                    .fuzzy_match(candidate, pattern)
                    .map(|score| (candidate, score))
            })
            .collect();

        // Higher is better
        matches.sort_by(|a, b| b.1.cmp(&a.1));
        matches
    }

    /// Rank candidate names against free text, best first.
    ///
    /// Every word of `text` is matched separately and scores are summed, so
    /// a tool named `read_file` ranks well for "read the config file".
    /// Candidates in `exclude` never appear in the output.
    pub fn rank_candidates(&self, text: &str, candidates: &[String], exclude: &[&str]) -> Vec<String> {
        let words: Vec<&str> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 2)
            .collect();

        let mut scored: Vec<(i64, &String)> = candidates
            .iter()
            .filter(|c| !exclude.contains(&c.as_str()))
            .map(|candidate| {
                let score = words
                    .iter()
                    .filter_map(|word| self.fuzzy_matcher.fuzzy_match(candidate, word))
                    .sum::<i64>();
                (score, candidate)
            })
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        scored.into_iter().map(|(_, c)| c.clone()).collect()
    }
}

/// Truncate text to a maximum number of characters with an ellipsis
pub fn truncate(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        text.to_string()
    } else if max_chars <= 3 {
        "...".to_string()
    } else {
        let kept: String = text.chars().take(max_chars - 3).collect();
        format!("{}...", kept)
    }
}

/// Split text into chunks of at most `size` characters.
///
/// Used to replay recorded transcripts the way a model stream would deliver them.
pub fn chunk_chars(text: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

/// Strip a surrounding markdown code fence (```json ... ```) if present
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let body = match rest.find('\n') {
            Some(newline) => &rest[newline + 1..],
            None => rest,
        };
        body.trim_end().strip_suffix("```").unwrap_or(body).trim()
    } else {
        trimmed
    }
}

/// Extract the first balanced JSON object from free text.
///
/// String literals are honoured so braces inside values do not confuse the scan.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => in_string = false,
                _ => escaped = false,
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("hello world", 20), "hello world");
        assert_eq!(truncate("hello world", 8), "hello...");
        assert_eq!(truncate("hi", 2), "hi");
        assert_eq!(truncate("hello", 3), "...");
        assert_eq!(truncate("héllo wörld", 8), "héllo...");
    }

    #[test]
    fn test_chunk_chars() {
        let chunks = chunk_chars("abcdefg", 3);
        assert_eq!(chunks, vec!["abc", "def", "g"]);
        assert_eq!(chunk_chars("ab", 0), vec!["a", "b"]);
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn test_extract_json_object_ignores_braces_in_strings() {
        let text = r#"Here you go: {"tool": "write_file", "input": {"content": "fn main() { }"}} done"#;
        let json = extract_json_object(text).unwrap();
        assert!(json.starts_with("{\"tool\""));
        assert!(json.ends_with("}}"));
        assert!(extract_json_object("no json").is_none());
    }

    #[test]
    fn test_rank_candidates_excludes_and_orders() {
        let processor = TextProcessor::new();
        let tools = vec![
            "web_search".to_string(),
            "read_file".to_string(),
            "write_file".to_string(),
        ];
        let ranked = processor.rank_candidates("read the config file", &tools, &["write_file"]);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0], "read_file");
        assert!(!ranked.contains(&"write_file".to_string()));
    }
}

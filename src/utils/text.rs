use regex::{Regex, RegexBuilder};
use std::collections::BTreeMap;

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

/// Pulls the outermost JSON object or array out of a model reply that may
/// carry prose or code fences around it. Control characters are dropped
/// first, since models like to emit raw newlines inside strings.
pub fn extract_json(response: &str) -> Option<String> {
    let cleaned: String = response.chars().filter(|c| !c.is_control()).collect();
    let cleaned = strip_code_blocks(&cleaned);

    let start = cleaned.find(['{', '['])?;
    let close = if cleaned[start..].starts_with('{') { '}' } else { ']' };
    let end = cleaned.rfind(close)?;
    if end < start {
        return None;
    }
    Some(cleaned[start..=end].to_string())
}

/// Whole-word, case-insensitive pronunciation substitutions plus the quote
/// and punctuation cleanup speech engines stumble on.
pub struct TextPreprocessor {
    rules: Vec<(Regex, String)>,
}

impl TextPreprocessor {
    pub fn new(dictionary: &BTreeMap<String, String>) -> Self {
        let rules = dictionary
            .iter()
            .filter_map(|(word, spoken)| {
                let pattern = format!(r"\b{}\b", regex::escape(word));
                match RegexBuilder::new(&pattern).case_insensitive(true).build() {
                    Ok(re) => Some((re, spoken.clone())),
                    Err(e) => {
                        log::warn!("Skipping pronunciation entry '{}': {}", word, e);
                        None
                    }
                }
            })
            .collect();
        Self { rules }
    }

    pub fn apply(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (re, spoken) in &self.rules {
            out = re.replace_all(&out, regex::NoExpand(spoken)).into_owned();
        }
        out.replace(['«', '»', '"'], "")
            .replace("!.", "!")
            .replace(".!", "!")
            .replace("?.", "?")
            .replace(".?", "?")
            .trim()
            .to_string()
    }
}

//! Keyword-based use-case detection for `model_id = "auto"`.
//!
//! Detection is advisory and deterministic: the first category (in table
//! order) with the most keyword hits wins, ties resolved by table order, and
//! a prompt with no hits is `general`.

use std::collections::BTreeMap;

pub const GENERAL: &str = "general";

#[derive(Debug, Clone)]
pub struct UseCaseDetector {
    /// Ordered `(category, keywords)`; keywords are lowercase.
    table: Vec<(String, Vec<String>)>,
}

impl Default for UseCaseDetector {
    fn default() -> Self {
        let table = [
            (
                "coding",
                &[
                    "code", "function", "debug", "error", "stack trace", "refactor", "compile",
                    "bug", "rust", "python", "javascript", "sql", "regex", "api", "unit test",
                ][..],
            ),
            (
                "reasoning",
                &[
                    "analy", "reason", "compare", "tradeoff", "prove", "explain why", "logic",
                    "math", "calculate", "step by step", "evaluate",
                ][..],
            ),
            (
                "creative",
                &[
                    "story", "poem", "write a song", "lyrics", "fiction", "character", "creative",
                    "imagine", "haiku", "novel",
                ][..],
            ),
        ];
        Self {
            table: table
                .iter()
                .map(|(c, kws)| (c.to_string(), kws.iter().map(|k| k.to_string()).collect()))
                .collect(),
        }
    }
}

impl UseCaseDetector {
    /// Replace the keyword table; category order follows the map's key order.
    pub fn from_keywords(keywords: &BTreeMap<String, Vec<String>>) -> Self {
        Self {
            table: keywords
                .iter()
                .filter(|(c, _)| c.as_str() != GENERAL)
                .map(|(c, kws)| (c.clone(), kws.iter().map(|k| k.to_lowercase()).collect()))
                .collect(),
        }
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.table.iter().map(|(c, _)| c.as_str())
    }

    pub fn detect(&self, prompt: &str) -> &str {
        let text = prompt.to_lowercase();
        let mut best: Option<(&str, usize)> = None;
        for (category, keywords) in &self.table {
            let hits = keywords.iter().filter(|k| text.contains(k.as_str())).count();
            if hits > 0 && best.map_or(true, |(_, n)| hits > n) {
                best = Some((category.as_str(), hits));
            }
        }
        best.map_or(GENERAL, |(c, _)| c)
    }

    /// Model recommended for `category`, falling back to the `general` entry.
    pub fn recommend<'a>(
        &self,
        category: &str,
        recommendations: &'a BTreeMap<String, String>,
    ) -> Option<&'a str> {
        recommendations
            .get(category)
            .or_else(|| recommendations.get(GENERAL))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_categories() {
        let d = UseCaseDetector::default();
        assert_eq!(d.detect("Please debug this Rust function"), "coding");
        assert_eq!(d.detect("Compare these two plans and evaluate the tradeoff"), "reasoning");
        assert_eq!(d.detect("Write a short poem about autumn"), "creative");
        assert_eq!(d.detect("hi there"), GENERAL);
    }

    #[test]
    fn test_recommendation_falls_back_to_general() {
        let d = UseCaseDetector::default();
        let mut recs = BTreeMap::new();
        recs.insert("general".to_string(), "m-chat-a".to_string());
        recs.insert("coding".to_string(), "m-code".to_string());
        assert_eq!(d.recommend("coding", &recs), Some("m-code"));
        assert_eq!(d.recommend("creative", &recs), Some("m-chat-a"));
        assert_eq!(d.recommend("creative", &BTreeMap::new()), None);
    }

    #[test]
    fn test_custom_keywords() {
        let mut kw = BTreeMap::new();
        kw.insert("legal".to_string(), vec!["Contract".to_string(), "clause".to_string()]);
        let d = UseCaseDetector::from_keywords(&kw);
        assert_eq!(d.detect("review this contract clause"), "legal");
        assert_eq!(d.detect("write some code"), GENERAL);
    }
}

//! Structured payload normalization
//!
//! Classifies decoded payloads into metadata updates and rewrites inline
//! `[n]` citation markers into domain labels for search-augmented providers.

use crate::constants::{PROVIDER_EXTRA_KEY, SOURCES_HEADING, TAG_CITATIONS, TAG_WEB_RESOURCES};
use crate::types::{PayloadKind, ResponseProvider};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::collections::HashMap;

lazy_static! {
    static ref CITATION_MARKER: Regex = Regex::new(r"\[(\d{1,3})\]").expect("Invalid citation regex");
    static ref PARTIAL_MARKER: Regex = Regex::new(r"\[\d{0,3}$").expect("Invalid partial marker regex");
}

#[derive(Debug, Clone, Copy)]
pub struct NormalizerConfig {
    pub rewrite_citation_markers: bool,
}

impl NormalizerConfig {
    pub fn for_provider(provider: ResponseProvider) -> Self {
        Self {
            rewrite_citation_markers: provider.is_search_augmented(),
        }
    }
}

/// What the assembler should do with a classified payload.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadAction {
    /// Citation set; recorded for the sources section and stored under `citations`.
    Citations(Vec<String>),
    /// Store `value` under `key`, replacing an earlier payload of that kind.
    Merge { key: String, value: Value },
    /// Store `value` under `key` and replace the answer text with `text`.
    Supersede { key: String, value: Value, text: String },
    /// Unrecognized tag, kept verbatim under the provider extra map.
    Extra { tag: String, value: Value },
}

pub struct PayloadNormalizer {
    config: NormalizerConfig,
    /// Latest citation list, indexed by marker number minus one.
    citations: Vec<String>,
    /// Every citation seen this turn, first-seen order, exact-match dedup.
    collected: Vec<String>,
    domain_counts: HashMap<String, usize>,
    held_back: String,
}

impl PayloadNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self {
            config,
            citations: Vec::new(),
            collected: Vec::new(),
            domain_counts: HashMap::new(),
            held_back: String::new(),
        }
    }

    pub fn classify(&mut self, kind: PayloadKind, value: Value) -> PayloadAction {
        match kind {
            PayloadKind::Citations => {
                let urls = extract_urls(&value);
                for url in &urls {
                    if !self.collected.contains(url) {
                        self.collected.push(url.clone());
                    }
                }
                self.citations = urls.clone();
                PayloadAction::Citations(urls)
            }
            PayloadKind::WebResources | PayloadKind::PageSpeed => PayloadAction::Merge {
                key: kind.tag().to_string(),
                value,
            },
            PayloadKind::Images | PayloadKind::Video => {
                let urls = extract_urls(&value);
                if urls.is_empty() {
                    return PayloadAction::Merge {
                        key: kind.tag().to_string(),
                        value,
                    };
                }
                let text = render_media(&kind, &urls);
                PayloadAction::Supersede {
                    key: kind.tag().to_string(),
                    value,
                    text,
                }
            }
            PayloadKind::Extra(tag) => {
                tracing::debug!("[⚙️ ] Preserving unrecognized payload '{}'", tag);
                PayloadAction::Extra { tag, value }
            }
        }
    }

    /// Rewrites citation markers in a text delta. A marker cut off at the end
    /// of the delta is held back and completed by the next one.
    pub fn normalize_text(&mut self, text: &str) -> String {
        if !self.config.rewrite_citation_markers {
            return text.to_string();
        }

        let mut combined = std::mem::take(&mut self.held_back);
        combined.push_str(text);

        if let Some(m) = PARTIAL_MARKER.find(&combined) {
            self.held_back = combined[m.start()..].to_string();
            combined.truncate(m.start());
        }

        self.rewrite_markers(&combined)
    }

    /// Text still held back plus the sources section, if any citations were seen.
    pub fn finish(&mut self) -> (String, Option<String>) {
        let tail = std::mem::take(&mut self.held_back);
        let tail = if self.config.rewrite_citation_markers {
            self.rewrite_markers(&tail)
        } else {
            tail
        };
        (tail, render_sources(&self.collected))
    }

    pub fn reset(&mut self) {
        self.citations.clear();
        self.collected.clear();
        self.domain_counts.clear();
        self.held_back.clear();
    }

    fn rewrite_markers(&mut self, text: &str) -> String {
        if self.citations.is_empty() {
            return text.to_string();
        }
        let citations = &self.citations;
        let counts = &mut self.domain_counts;
        CITATION_MARKER
            .replace_all(text, |caps: &Captures| {
                let label = caps
                    .get(1)
                    .and_then(|n| n.as_str().parse::<usize>().ok())
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|idx| citations.get(idx))
                    .map(|url| domain_label(url, counts));
                match label {
                    Some(l) => l,
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}

fn domain_label(url: &str, counts: &mut HashMap<String, usize>) -> String {
    let domain = domain_of(url);
    let seen = counts.entry(domain.clone()).or_insert(0);
    let label = if *seen == 0 {
        domain
    } else {
        format!("{} +{}", domain, seen)
    };
    *seen += 1;
    label
}

/// Host of a URL without a leading `www.`; the raw string when it does not parse.
pub fn domain_of(url: &str) -> String {
    match url::Url::parse(url.trim()) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => host.trim_start_matches("www.").to_string(),
            None => url.trim().to_string(),
        },
        Err(_) => url.trim().to_string(),
    }
}

/// Pulls URLs out of a payload: plain strings, objects with `url`/`link`/`src`,
/// arrays of either, or an object holding `urls`.
pub fn extract_urls(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
        Value::Array(items) => items.iter().flat_map(extract_urls).collect(),
        Value::Object(map) => {
            for key in ["url", "link", "src"] {
                if let Some(Value::String(s)) = map.get(key) {
                    return vec![s.trim().to_string()];
                }
            }
            match map.get("urls") {
                Some(urls) => extract_urls(urls),
                None => Vec::new(),
            }
        }
        _ => Vec::new(),
    }
}

fn render_media(kind: &PayloadKind, urls: &[String]) -> String {
    urls.iter()
        .map(|u| match kind {
            PayloadKind::Video => format!("[video]({})", u),
            _ => format!("![image]({})", u),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// `### Sources` block listing each URL once, in first-seen order.
pub fn render_sources(urls: &[String]) -> Option<String> {
    let mut unique: Vec<&String> = Vec::new();
    for url in urls {
        if !unique.contains(&url) {
            unique.push(url);
        }
    }
    if unique.is_empty() {
        return None;
    }
    let items = unique
        .iter()
        .map(|u| format!("- {}", u))
        .collect::<Vec<_>>()
        .join("\n");
    Some(format!("\n\n{}\n{}", SOURCES_HEADING, items))
}

/// Sources block for a persisted turn, from its citations or, failing that,
/// its web resources.
pub fn sources_block_from_metadata(metadata: &Map<String, Value>) -> Option<String> {
    let from_citations = metadata.get(TAG_CITATIONS).map(extract_urls).unwrap_or_default();
    if !from_citations.is_empty() {
        return render_sources(&from_citations);
    }
    let from_resources = metadata
        .get(TAG_WEB_RESOURCES)
        .map(extract_urls)
        .unwrap_or_default();
    render_sources(&from_resources)
}

/// Stores an unrecognized payload under the provider extra map, keyed by tag.
pub fn merge_extra(metadata: &mut Map<String, Value>, tag: String, value: Value) {
    let entry = metadata
        .entry(PROVIDER_EXTRA_KEY.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    if let Value::Object(extras) = entry {
        extras.insert(tag, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn search_normalizer() -> PayloadNormalizer {
        PayloadNormalizer::new(NormalizerConfig::for_provider(ResponseProvider::Perplexity))
    }

    #[test]
    fn test_markers_become_domain_labels() {
        let mut n = search_normalizer();
        n.classify(
            PayloadKind::Citations,
            json!(["https://www.a.com/x", "https://a.com/y", "https://b.org"]),
        );
        let out = n.normalize_text("One [1], two [2], three [3], again [1].");
        assert_eq!(out, "One a.com, two a.com +1, three b.org, again a.com +2.");
    }

    #[test]
    fn test_unknown_marker_is_left_alone() {
        let mut n = search_normalizer();
        n.classify(PayloadKind::Citations, json!(["https://a.com"]));
        assert_eq!(n.normalize_text("see [4]"), "see [4]");
    }

    #[test]
    fn test_split_marker_is_held_back() {
        let mut n = search_normalizer();
        n.classify(PayloadKind::Citations, json!(["https://a.com"]));
        assert_eq!(n.normalize_text("fact [1"), "fact ");
        assert_eq!(n.normalize_text("] end"), "a.com end");
    }

    #[test]
    fn test_non_search_provider_keeps_markers() {
        let mut n = PayloadNormalizer::new(NormalizerConfig::for_provider(ResponseProvider::OpenAi));
        n.classify(PayloadKind::Citations, json!(["https://a.com"]));
        assert_eq!(n.normalize_text("x [1"), "x [1");
    }

    #[test]
    fn test_sources_are_deduplicated_in_first_seen_order() {
        let mut n = search_normalizer();
        n.classify(PayloadKind::Citations, json!(["http://b.com", "http://a.com"]));
        n.classify(PayloadKind::Citations, json!(["http://a.com", "http://c.com"]));
        let (tail, sources) = n.finish();
        assert!(tail.is_empty());
        assert_eq!(
            sources.as_deref(),
            Some("\n\n### Sources\n- http://b.com\n- http://a.com\n- http://c.com")
        );
    }

    #[test]
    fn test_sources_rendering_is_deterministic() {
        let urls = vec!["http://x.com".to_string(), "http://x.com".to_string()];
        assert_eq!(render_sources(&urls), render_sources(&urls));
        assert_eq!(render_sources(&[]), None);
    }

    #[test]
    fn test_image_payload_supersedes_text() {
        let mut n = search_normalizer();
        let action = n.classify(PayloadKind::Images, json!([{"url": "https://cdn/x.png"}]));
        match action {
            PayloadAction::Supersede { key, text, .. } => {
                assert_eq!(key, "images");
                assert_eq!(text, "![image](https://cdn/x.png)");
            }
            other => panic!("Expected Supersede, got {:?}", other),
        }
    }

    #[test]
    fn test_extra_payload_is_preserved() {
        let mut meta = Map::new();
        merge_extra(&mut meta, "usage".into(), json!({"n": 1}));
        merge_extra(&mut meta, "trace".into(), json!("abc"));
        assert_eq!(meta[PROVIDER_EXTRA_KEY]["usage"]["n"], 1);
        assert_eq!(meta[PROVIDER_EXTRA_KEY]["trace"], "abc");
    }

    #[test]
    fn test_domain_of_falls_back_to_raw() {
        assert_eq!(domain_of("https://www.example.com/a?b"), "example.com");
        assert_eq!(domain_of("not a url"), "not a url");
    }
}

//! Message filtering before storage.
//!
//! A [`MessageFilter`] is built once from the `[filter]` config section and
//! checked against every normalized record. Records that do not match are
//! still seen by the continuity tracker but are never stored.
//!
//! Exclusions always win. The remaining criteria are combined with
//! [`FilterMode::All`] (every criterion must hold) or [`FilterMode::Any`]
//! (one is enough). A filter with no criteria matches everything.

use crate::config::FilterConfig;
use crate::error::{Error, Result};
use crate::types::MessageRecord;
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How criteria are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    #[default]
    All,
    Any,
}

/// Built-in keyword lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeywordPreset {
    /// Cyber threat intelligence
    Cti,
    Crypto,
    News,
}

const CTI_KEYWORDS: &[&str] = &[
    "malware", "ransomware", "trojan", "backdoor", "rootkit", "botnet", "worm", "spyware",
    "keylogger", "rat", "ddos", "phishing", "exploit", "vulnerability", "cve-", "zero-day",
    "0day", "breach", "hack", "attack", "ioc", "indicator", "hash", "md5", "sha256",
    "ip address", "domain", "url", "c2", "c&c", "cobalt strike", "metasploit", "mimikatz",
    "powershell",
];

const CRYPTO_KEYWORDS: &[&str] = &[
    "bitcoin", "btc", "ethereum", "eth", "crypto", "wallet", "blockchain", "defi", "nft",
    "token", "exchange", "trading", "pump", "dump", "moon",
];

const NEWS_KEYWORDS: &[&str] = &[
    "breaking", "urgent", "update", "official", "announcement", "confirmed", "reported",
];

impl KeywordPreset {
    pub fn keywords(&self) -> &'static [&'static str] {
        match self {
            KeywordPreset::Cti => CTI_KEYWORDS,
            KeywordPreset::Crypto => CRYPTO_KEYWORDS,
            KeywordPreset::News => NEWS_KEYWORDS,
        }
    }

    /// Case-insensitive filter matching any keyword of the preset.
    pub fn filter(&self) -> MessageFilter {
        let mut filter = MessageFilter::new(FilterMode::Any);
        filter.keywords = self
            .keywords()
            .iter()
            .filter_map(|kw| literal(kw, false).ok())
            .collect();
        filter
    }
}

/// Outcome of checking one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterResult {
    pub matched: bool,
    /// Criteria that held, empty unless `matched`
    pub matched_filters: Vec<&'static str>,
    /// Text matched by keywords and patterns, empty unless `matched`
    pub matched_keywords: Vec<String>,
}

/// Compiled filter criteria.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    mode: FilterMode,
    keywords: Vec<Regex>,
    patterns: Vec<Regex>,
    exclude: Vec<Regex>,
    min_date: Option<DateTime<Utc>>,
    max_date: Option<DateTime<Utc>>,
    min_views: Option<u64>,
    min_reactions: Option<u64>,
    min_forwards: Option<u64>,
    has_media: Option<bool>,
    media_types: Vec<String>,
    min_text_length: Option<usize>,
    max_text_length: Option<usize>,
}

impl MessageFilter {
    pub fn new(mode: FilterMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    /// Popular content only.
    pub fn viral(min_views: u64) -> Self {
        Self {
            min_views: Some(min_views),
            ..Default::default()
        }
    }

    /// Build the configured filter, or `None` when no criterion is set.
    pub fn from_config(config: &FilterConfig) -> Result<Option<Self>> {
        let case = config.case_sensitive;
        let mut keywords = config.keywords.clone();
        let mut patterns = config.patterns.clone();

        if let Some(preset) = config.preset {
            keywords.extend(preset.keywords().iter().map(|kw| kw.to_string()));
        }
        if let Some(path) = &config.keywords_file {
            let (file_keywords, file_patterns) = load_keywords_file(path)?;
            keywords.extend(file_keywords);
            patterns.extend(file_patterns);
        }

        let filter = Self {
            mode: config.mode,
            keywords: keywords
                .iter()
                .map(|kw| literal(kw, case))
                .collect::<Result<_>>()?,
            patterns: patterns
                .iter()
                .map(|p| pattern(p, case))
                .collect::<Result<_>>()?,
            exclude: config
                .exclude
                .iter()
                .map(|kw| literal(kw, case))
                .collect::<Result<_>>()?,
            min_date: config.min_date,
            max_date: config.max_date,
            min_views: config.min_views,
            min_reactions: config.min_reactions,
            min_forwards: config.min_forwards,
            has_media: config.has_media,
            media_types: config
                .media_types
                .iter()
                .map(|t| t.to_lowercase())
                .collect(),
            min_text_length: config.min_text_length,
            max_text_length: config.max_text_length,
        };

        if filter.criteria().is_empty() {
            return Ok(None);
        }
        tracing::info!(
            mode = ?filter.mode,
            criteria = ?filter.criteria(),
            keywords = filter.keywords.len(),
            patterns = filter.patterns.len(),
            "Message filter active"
        );
        Ok(Some(filter))
    }

    /// Names of the configured criteria, exclusions included.
    pub fn criteria(&self) -> Vec<&'static str> {
        let flags = [
            (!self.exclude.is_empty(), "exclude"),
            (!self.keywords.is_empty(), "keywords"),
            (!self.patterns.is_empty(), "regex"),
            (self.min_date.is_some(), "min_date"),
            (self.max_date.is_some(), "max_date"),
            (self.min_views.is_some(), "min_views"),
            (self.min_reactions.is_some(), "min_reactions"),
            (self.min_forwards.is_some(), "min_forwards"),
            (self.has_media.is_some(), "has_media"),
            (!self.media_types.is_empty(), "media_type"),
            (self.min_text_length.is_some(), "min_text_length"),
            (self.max_text_length.is_some(), "max_text_length"),
        ];
        flags
            .into_iter()
            .filter_map(|(set, name)| set.then_some(name))
            .collect()
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    /// Check one record.
    pub fn matches(&self, record: &MessageRecord) -> FilterResult {
        let text = record.text.as_str();

        if self.exclude.iter().any(|re| re.is_match(text)) {
            return FilterResult {
                matched: false,
                matched_filters: vec!["excluded"],
                matched_keywords: vec![],
            };
        }

        let mut results = Vec::new();
        let mut matched_filters = Vec::new();
        let mut matched_keywords = Vec::new();
        let mut check = |name: &'static str, held: bool| {
            results.push(held);
            if held {
                matched_filters.push(name);
            }
        };

        for (name, list) in [("keywords", &self.keywords), ("regex", &self.patterns)] {
            if list.is_empty() {
                continue;
            }
            let found: Vec<String> = list
                .iter()
                .filter_map(|re| re.find(text))
                .map(|m| m.as_str().to_string())
                .collect();
            check(name, !found.is_empty());
            matched_keywords.extend(found);
        }

        if let Some(min) = self.min_date {
            check("min_date", record.posted_at >= min);
        }
        if let Some(max) = self.max_date {
            check("max_date", record.posted_at <= max);
        }
        if let Some(min) = self.min_views {
            check("min_views", record.views.unwrap_or(0) >= min);
        }
        if let Some(min) = self.min_reactions {
            let total: u64 = record.reactions.iter().map(|r| r.count).sum();
            check("min_reactions", total >= min);
        }
        if let Some(min) = self.min_forwards {
            check("min_forwards", record.forwards.unwrap_or(0) >= min);
        }
        if let Some(want) = self.has_media {
            check("has_media", record.has_media() == want);
        }
        // Only applies to records that carry media
        if !self.media_types.is_empty() && record.has_media() {
            let held = record.media.iter().any(|media| {
                let kind = media.kind.as_str();
                let mime = media.mime_type.as_deref().unwrap_or("").to_lowercase();
                self.media_types
                    .iter()
                    .any(|t| kind.contains(t.as_str()) || mime.contains(t.as_str()))
            });
            check("media_type", held);
        }
        let length = text.chars().count();
        if let Some(min) = self.min_text_length {
            check("min_text_length", length >= min);
        }
        if let Some(max) = self.max_text_length {
            check("max_text_length", length <= max);
        }

        let matched = match self.mode {
            _ if results.is_empty() => true,
            FilterMode::All => results.iter().all(|held| *held),
            FilterMode::Any => results.iter().any(|held| *held),
        };

        if matched {
            FilterResult {
                matched,
                matched_filters,
                matched_keywords,
            }
        } else {
            FilterResult::default()
        }
    }
}

/// Read a keywords file: one keyword per line, `/pattern/` for a regex,
/// `#` for comments.
pub fn load_keywords_file(path: &Path) -> Result<(Vec<String>, Vec<String>)> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "failed to read keywords file {}: {}",
            path.display(),
            e
        ))
    })?;

    let mut keywords = Vec::new();
    let mut patterns = Vec::new();
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.strip_prefix('/').and_then(|l| l.strip_suffix('/')) {
            Some(pattern) if !pattern.is_empty() => patterns.push(pattern.to_string()),
            _ => keywords.push(line.to_string()),
        }
    }
    Ok((keywords, patterns))
}

/// Compile a user-supplied pattern, reporting it as a config error.
pub(crate) fn pattern(source: &str, case_sensitive: bool) -> Result<Regex> {
    RegexBuilder::new(source)
        .case_insensitive(!case_sensitive)
        .build()
        .map_err(|e| Error::Config(format!("invalid filter pattern {:?}: {}", source, e)))
}

fn literal(keyword: &str, case_sensitive: bool) -> Result<Regex> {
    pattern(&regex::escape(keyword), case_sensitive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BackendKind, IdProvenance, MediaKind, MediaRef, Reaction};
    use chrono::TimeZone;

    fn record(text: &str) -> MessageRecord {
        MessageRecord {
            channel_id: 1,
            channel_name: "news".into(),
            message_id: Some(1),
            id_provenance: IdProvenance::Authoritative,
            posted_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            text: text.to_string(),
            views: Some(500),
            forwards: Some(3),
            reply_count: None,
            reactions: vec![
                Reaction {
                    label: "👍".into(),
                    count: 4,
                },
                Reaction {
                    label: "🔥".into(),
                    count: 2,
                },
            ],
            media: vec![],
            forwarded_from: None,
            edited_at: None,
            is_pinned: false,
            backend: BackendKind::Api,
            collected_at: Utc::now(),
        }
    }

    fn build(config: FilterConfig) -> MessageFilter {
        MessageFilter::from_config(&config).unwrap().unwrap()
    }

    #[test]
    fn test_no_criteria_builds_nothing() {
        assert!(MessageFilter::from_config(&FilterConfig::default())
            .unwrap()
            .is_none());
        assert!(MessageFilter::new(FilterMode::All).matches(&record("x")).matched);
    }

    #[test]
    fn test_keywords_are_case_insensitive_substrings() {
        let filter = build(FilterConfig {
            keywords: vec!["Ransom".into(), "c&c".into()],
            ..Default::default()
        });
        let result = filter.matches(&record("New RANSOMWARE strain"));
        assert!(result.matched);
        assert_eq!(result.matched_filters, vec!["keywords"]);
        assert_eq!(result.matched_keywords, vec!["RANSOM"]);
        assert!(filter.matches(&record("moved its C&C server")).matched);
        assert!(!filter.matches(&record("weather report")).matched);
    }

    #[test]
    fn test_case_sensitive_keywords() {
        let filter = build(FilterConfig {
            keywords: vec!["BTC".into()],
            case_sensitive: true,
            ..Default::default()
        });
        assert!(filter.matches(&record("BTC up")).matched);
        assert!(!filter.matches(&record("btc up")).matched);
    }

    #[test]
    fn test_regex_patterns() {
        let filter = build(FilterConfig {
            patterns: vec![r"cve-\d{4}-\d+".into()],
            ..Default::default()
        });
        let result = filter.matches(&record("Patch for CVE-2024-3094 released"));
        assert!(result.matched);
        assert_eq!(result.matched_filters, vec!["regex"]);
        assert_eq!(result.matched_keywords, vec!["CVE-2024-3094"]);
        assert!(!filter.matches(&record("CVE pending")).matched);
    }

    #[test]
    fn test_invalid_pattern_is_a_config_error() {
        let err = MessageFilter::from_config(&FilterConfig {
            patterns: vec!["(unclosed".into()],
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("(unclosed"));
    }

    #[test]
    fn test_exclusions_win_in_any_mode() {
        let filter = build(FilterConfig {
            mode: FilterMode::Any,
            keywords: vec!["exploit".into()],
            exclude: vec!["advert".into()],
            min_views: Some(1),
            ..Default::default()
        });
        let result = filter.matches(&record("exploit kit ADVERT"));
        assert!(!result.matched);
        assert_eq!(result.matched_filters, vec!["excluded"]);
        assert!(filter.matches(&record("exploit kit")).matched);
    }

    #[test]
    fn test_date_range() {
        let filter = build(FilterConfig {
            min_date: Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
            max_date: Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()),
            ..Default::default()
        });
        assert!(filter.matches(&record("x")).matched);

        let mut late = record("x");
        late.posted_at = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        assert!(!filter.matches(&late).matched);

        let mut early = record("x");
        early.posted_at = Utc.with_ymd_and_hms(2024, 2, 28, 0, 0, 0).unwrap();
        assert!(!filter.matches(&early).matched);
    }

    #[test]
    fn test_engagement_thresholds() {
        let views = build(FilterConfig {
            min_views: Some(500),
            ..Default::default()
        });
        assert!(views.matches(&record("x")).matched);
        let mut unknown = record("x");
        unknown.views = None;
        assert!(!views.matches(&unknown).matched);

        // 4 + 2 reactions
        let reactions = build(FilterConfig {
            min_reactions: Some(6),
            ..Default::default()
        });
        assert!(reactions.matches(&record("x")).matched);
        let reactions = build(FilterConfig {
            min_reactions: Some(7),
            ..Default::default()
        });
        assert!(!reactions.matches(&record("x")).matched);

        let forwards = build(FilterConfig {
            min_forwards: Some(4),
            ..Default::default()
        });
        assert!(!forwards.matches(&record("x")).matched);
    }

    #[test]
    fn test_media_presence_and_type() {
        let mut photo = record("x");
        photo.media.push(MediaRef {
            kind: MediaKind::Photo,
            url: None,
            mime_type: Some("image/jpeg".into()),
        });

        let has_media = build(FilterConfig {
            has_media: Some(true),
            ..Default::default()
        });
        assert!(has_media.matches(&photo).matched);
        assert!(!has_media.matches(&record("x")).matched);

        let videos = build(FilterConfig {
            media_types: vec!["Video".into()],
            ..Default::default()
        });
        assert!(!videos.matches(&photo).matched);
        // Records without media are not judged by type
        assert!(videos.matches(&record("x")).matched);

        let jpeg = build(FilterConfig {
            media_types: vec!["jpeg".into()],
            ..Default::default()
        });
        assert!(jpeg.matches(&photo).matched);
    }

    #[test]
    fn test_text_length_counts_characters() {
        let filter = build(FilterConfig {
            min_text_length: Some(3),
            max_text_length: Some(5),
            ..Default::default()
        });
        assert!(!filter.matches(&record("привет")).matched);
        assert!(filter.matches(&record("ёжик")).matched);
        assert!(!filter.matches(&record("hi")).matched);
    }

    #[test]
    fn test_all_versus_any() {
        let base = FilterConfig {
            keywords: vec!["launch".into()],
            min_views: Some(10_000),
            ..Default::default()
        };
        let all = build(base.clone());
        assert!(!all.matches(&record("launch day")).matched);

        let any = build(FilterConfig {
            mode: FilterMode::Any,
            ..base
        });
        let result = any.matches(&record("launch day"));
        assert!(result.matched);
        assert_eq!(result.matched_filters, vec!["keywords"]);
    }

    #[test]
    fn test_presets() {
        let cti = KeywordPreset::Cti.filter();
        assert_eq!(cti.mode(), FilterMode::Any);
        assert!(cti.matches(&record("Mimikatz dump found")).matched);
        assert!(!cti.matches(&record("lunch menu")).matched);
        assert!(KeywordPreset::Crypto.filter().matches(&record("Bitcoin ETF")).matched);
        assert!(KeywordPreset::News.filter().matches(&record("BREAKING: ...")).matched);

        let viral = MessageFilter::viral(10_000);
        assert!(!viral.matches(&record("x")).matched);

        let configured = build(FilterConfig {
            preset: Some(KeywordPreset::Crypto),
            ..Default::default()
        });
        assert!(configured.matches(&record("new defi token")).matched);
    }

    #[test]
    fn test_keywords_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keywords.txt");
        std::fs::write(&path, "# threat words\nbotnet\n\n/apt\\d+/\n/\n").unwrap();

        let (keywords, patterns) = load_keywords_file(&path).unwrap();
        assert_eq!(keywords, vec!["botnet", "/"]);
        assert_eq!(patterns, vec!["apt\\d+"]);

        let filter = build(FilterConfig {
            mode: FilterMode::Any,
            keywords_file: Some(path),
            ..Default::default()
        });
        assert!(filter.matches(&record("APT29 activity")).matched);
        assert_eq!(filter.criteria(), vec!["keywords", "regex"]);

        assert!(load_keywords_file(&dir.path().join("missing.txt")).is_err());
    }
}

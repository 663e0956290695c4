//! Source catalog: which providers to query and how.
//!
//! Loaded from TOML or YAML (by file extension), or from the embedded
//! default catalog. Validation happens before any request is sent.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pricewatch_http::template::has_placeholder;

use crate::blocking::DEFAULT_BLOCKING_THRESHOLD;
use crate::extract::ExtractorConfig;
use crate::model::SourceId;
use crate::rate::{AdaptiveConfig, SecondsRange, MAX_SECS};
use crate::retry::{ForbiddenPolicy, RetryPolicy};

const DEFAULT_CATALOG: &str = include_str!("../../seed_data/sources.toml");

#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("Failed to parse TOML catalog: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Failed to parse YAML catalog: {0}")]
    Yaml(#[from] serde_yml::Error),
    #[error("Failed to read catalog {path}: {error}")]
    Io {
        path: String,
        #[source]
        error: std::io::Error,
    },
    #[error("Unsupported catalog format: {0} (expected .toml, .yaml or .yml)")]
    Format(String),
    #[error("Catalog has no enabled sources")]
    Empty,
    #[error("Duplicate source name: {0}")]
    DuplicateSource(String),
    #[error("Unknown source: {0}")]
    UnknownSource(String),
    #[error("Source {name}: {reason}")]
    Invalid { name: String, reason: String },
    #[error("Source {name}: invalid pattern: {reason}")]
    InvalidPattern { name: String, reason: String },
    #[error("Hint dependencies form a cycle between: {0}")]
    HintCycle(String),
}

fn default_threshold() -> u32 {
    DEFAULT_BLOCKING_THRESHOLD
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> f64 {
    15.0
}

fn default_pause_secs() -> SecondsRange {
    SecondsRange::new(10.0, 20.0)
}

fn default_max_probes() -> usize {
    8
}

fn default_prefix_len() -> usize {
    3
}

fn default_fixed_workers() -> usize {
    2
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    /// Same-class rejections per source before a blocking alert.
    #[serde(default = "default_threshold")]
    pub blocking_threshold: u32,
    #[serde(rename = "source", default)]
    pub sources: Vec<SourceConfig>,
}

/// How a product is looked up on a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LookupConfig {
    /// Direct identifier lookup; templates are tried in order.
    Id { urls: Vec<String> },
    /// Product pages live under a category path that has to be guessed.
    Category {
        url: String,
        categories: Vec<String>,
        #[serde(default = "default_max_probes")]
        max_probes: usize,
        #[serde(default = "default_prefix_len")]
        prefix_len: usize,
    },
    /// Free-text search by product name.
    Name {
        url: String,
        #[serde(default)]
        search_each_hint: bool,
        /// Names found by this source become extra hints.
        #[serde(default)]
        hints_from: Option<SourceId>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PoolConfig {
    Fixed {
        #[serde(default = "default_fixed_workers")]
        workers: usize,
    },
    Adaptive(AdaptiveConfig),
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::Fixed {
            workers: default_fixed_workers(),
        }
    }
}

/// Think-time policy for non-adaptive pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacingMode {
    #[default]
    Human,
    #[serde(rename = "none")]
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeriodicPause {
    pub every: usize,
    pub secs: SecondsRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: SourceId,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    #[serde(default)]
    pub referer: Option<String>,
    /// Best matches scoring below this are reported as not found.
    #[serde(default)]
    pub min_match_score: f64,
    #[serde(default)]
    pub pacing: PacingMode,
    #[serde(default)]
    pub pause_every: Option<usize>,
    #[serde(default = "default_pause_secs")]
    pub pause_secs: SecondsRange,
    pub lookup: LookupConfig,
    pub extractor: ExtractorConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl SourceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    pub fn hints_from(&self) -> Option<&SourceId> {
        match &self.lookup {
            LookupConfig::Name { hints_from, .. } => hints_from.as_ref(),
            _ => None,
        }
    }

    pub fn is_adaptive(&self) -> bool {
        matches!(self.pool, PoolConfig::Adaptive(_))
    }

    pub fn pause(&self) -> Option<PeriodicPause> {
        self.pause_every.map(|every| PeriodicPause {
            every,
            secs: self.pause_secs,
        })
    }

    fn invalid(&self, reason: impl Into<String>) -> CatalogError {
        CatalogError::Invalid {
            name: self.name.to_string(),
            reason: reason.into(),
        }
    }

    /// Checks everything that does not depend on other sources.
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.name.as_str().trim().is_empty() {
            return Err(self.invalid("source name is empty"));
        }
        if !(self.timeout_secs > 0.0 && self.timeout_secs <= MAX_SECS) {
            return Err(self.invalid(format!("timeout_secs must be within (0, {}]", MAX_SECS)));
        }
        if !(0.0..=100.0).contains(&self.min_match_score) {
            return Err(self.invalid("min_match_score must be within 0-100"));
        }
        if self.pause_every == Some(0) {
            return Err(self.invalid("pause_every must be at least 1"));
        }
        if !self.pause_secs.is_valid() {
            return Err(self.invalid("pause_secs range is inverted, negative or too long"));
        }

        match &self.lookup {
            LookupConfig::Id { urls } => {
                if urls.is_empty() {
                    return Err(self.invalid("id lookup needs at least one URL"));
                }
                if let Some(url) = urls.iter().find(|u| !has_placeholder(u, "id")) {
                    return Err(self.invalid(format!("URL template {:?} has no {{id}}", url)));
                }
            }
            LookupConfig::Category {
                url,
                categories,
                max_probes,
                ..
            } => {
                if !has_placeholder(url, "category") || !has_placeholder(url, "id") {
                    return Err(self.invalid("category URL needs {category} and {id}"));
                }
                if categories.iter().all(|c| c.trim().is_empty()) {
                    return Err(self.invalid("category lookup needs at least one category"));
                }
                if *max_probes == 0 {
                    return Err(self.invalid("max_probes must be at least 1"));
                }
            }
            LookupConfig::Name {
                url, hints_from, ..
            } => {
                if !has_placeholder(url, "query") {
                    return Err(self.invalid("search URL needs {query}"));
                }
                if hints_from.as_ref() == Some(&self.name) {
                    return Err(self.invalid("hints_from cannot reference itself"));
                }
            }
        }

        match &self.pool {
            PoolConfig::Fixed { workers } if *workers == 0 => {
                return Err(self.invalid("workers must be at least 1"));
            }
            PoolConfig::Adaptive(adaptive) => adaptive.check().map_err(|r| self.invalid(r))?,
            PoolConfig::Fixed { .. } => {}
        }

        if !self.retry.cooldown_429.is_valid() {
            return Err(self.invalid("cooldown_429 range is inverted, negative or too long"));
        }
        if let ForbiddenPolicy::Retry { cooldown, .. } = &self.retry.forbidden {
            if !cooldown.is_valid() {
                return Err(self.invalid("403 cooldown range is inverted, negative or too long"));
            }
        }

        self.extractor.build(self.name.as_str())?;
        Ok(())
    }
}

impl Catalog {
    pub fn from_toml_str(raw: &str) -> Result<Self, CatalogError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, CatalogError> {
        Ok(serde_yml::from_str(raw)?)
    }

    /// Reads a catalog file, choosing the format from its extension.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path).map_err(|error| CatalogError::Io {
            path: path.display().to_string(),
            error,
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("toml") => Self::from_toml_str(&raw),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&raw),
            _ => Err(CatalogError::Format(path.display().to_string())),
        }
    }

    /// The catalog shipped with the binary.
    pub fn default_catalog() -> Result<Self, CatalogError> {
        Self::from_toml_str(DEFAULT_CATALOG)
    }

    pub fn get(&self, name: &SourceId) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| &s.name == name)
    }

    pub fn names(&self) -> Vec<SourceId> {
        self.sources.iter().map(|s| s.name.clone()).collect()
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        if !self.sources.iter().any(|s| s.enabled) {
            return Err(CatalogError::Empty);
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(&source.name) {
                return Err(CatalogError::DuplicateSource(source.name.to_string()));
            }
        }

        for source in &self.sources {
            source.validate()?;
            if let Some(provider) = source.hints_from() {
                if !seen.contains(provider) {
                    return Err(CatalogError::UnknownSource(provider.to_string()));
                }
            }
        }

        self.stages()?;
        Ok(())
    }

    /// Keeps the enabled sources only.
    pub fn enabled(mut self) -> Self {
        self.retain(|s| s.enabled);
        self
    }

    /// Restricts the catalog to the named sources.
    pub fn select(mut self, names: &[SourceId]) -> Result<Self, CatalogError> {
        if let Some(unknown) = names.iter().find(|n| self.get(n).is_none()) {
            return Err(CatalogError::UnknownSource(unknown.to_string()));
        }
        self.retain(|s| names.contains(&s.name));
        Ok(self)
    }

    /// Drops sources and clears hint dependencies on the dropped ones.
    fn retain(&mut self, keep: impl Fn(&SourceConfig) -> bool) {
        self.sources.retain(|s| keep(s));
        let kept: HashSet<SourceId> = self.sources.iter().map(|s| s.name.clone()).collect();
        for source in &mut self.sources {
            let name = source.name.clone();
            if let LookupConfig::Name { hints_from, .. } = &mut source.lookup {
                if hints_from.as_ref().is_some_and(|p| !kept.contains(p)) {
                    tracing::warn!(
                        "{} takes hints from {}, which is not part of this run",
                        name,
                        hints_from.as_ref().map(|p| p.as_str()).unwrap_or_default()
                    );
                    *hints_from = None;
                }
            }
        }
    }

    /// Groups sources into stages: every source runs after the source it
    /// takes hints from. Sources keep their catalog order within a stage.
    pub fn stages(&self) -> Result<Vec<Vec<SourceId>>, CatalogError> {
        let mut placed: HashSet<&SourceId> = HashSet::new();
        let mut remaining: Vec<&SourceConfig> = self.sources.iter().collect();
        let mut stages = Vec::new();

        while !remaining.is_empty() {
            let (ready, blocked): (Vec<&SourceConfig>, Vec<&SourceConfig>) =
                remaining.into_iter().partition(|s| {
                    s.hints_from()
                        .map_or(true, |p| placed.contains(p) || !self.sources.iter().any(|o| &o.name == p))
                });
            if ready.is_empty() {
                let names: Vec<&str> = blocked.iter().map(|s| s.name.as_str()).collect();
                return Err(CatalogError::HintCycle(names.join(", ")));
            }
            placed.extend(ready.iter().map(|s| &s.name));
            stages.push(ready.iter().map(|s| s.name.clone()).collect());
            remaining = blocked;
        }
        Ok(stages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: &str = r#"
        blocking_threshold = 3

        [[source]]
        name = "alpha"
        pacing = "none"

        [source.lookup]
        mode = "id"
        urls = ["https://alpha.test/p/{id}"]

        [source.extractor]
        kind = "pattern"
        price = '<b>(.*?)</b>'

        [[source]]
        name = "beta"
        min_match_score = 60.0

        [source.lookup]
        mode = "name"
        url = "https://beta.test/search?q={query}"
        hints_from = "alpha"

        [source.extractor]
        kind = "json_attribute"
        attribute = "data-item"

        [source.pool]
        kind = "adaptive"
        max_workers = 20
    "#;

    #[test]
    fn default_catalog_is_valid() {
        let catalog = Catalog::default_catalog().unwrap();
        catalog.validate().unwrap();
        assert_eq!(catalog.sources.len(), 4);
        let stages = catalog.stages().unwrap();
        assert_eq!(stages.len(), 2);
        assert!(stages[0].contains(&SourceId::new("medi-market")));
        assert!(stages[1].contains(&SourceId::new("newpharma")));
        assert!(catalog
            .get(&SourceId::new("multipharma"))
            .unwrap()
            .is_adaptive());
    }

    #[test]
    fn parse_small_toml() {
        let catalog = Catalog::from_toml_str(SMALL).unwrap();
        catalog.validate().unwrap();
        assert_eq!(catalog.blocking_threshold, 3);

        let alpha = &catalog.sources[0];
        assert!(alpha.enabled);
        assert_eq!(alpha.pacing, PacingMode::Off);
        assert_eq!(alpha.pool, PoolConfig::Fixed { workers: 2 });
        assert_eq!(alpha.timeout(), Duration::from_secs(15));
        assert_eq!(alpha.retry, RetryPolicy::default());

        let beta = &catalog.sources[1];
        assert_eq!(beta.hints_from(), Some(&SourceId::new("alpha")));
        match &beta.pool {
            PoolConfig::Adaptive(cfg) => {
                assert_eq!(cfg.max_workers, 20);
                assert_eq!(cfg.initial_workers, 10);
            }
            other => panic!("unexpected pool {:?}", other),
        }
    }

    #[test]
    fn parse_yaml() {
        let raw = r#"
source:
  - name: gamma
    lookup:
      mode: category
      url: "https://gamma.test/{category}/{id}"
      categories: [sante, bebe]
    extractor:
      kind: pattern
      price: "<b>(.*?)</b>"
    pause_every: 20
"#;
        let catalog = Catalog::from_yaml_str(raw).unwrap();
        catalog.validate().unwrap();
        let gamma = &catalog.sources[0];
        assert_eq!(
            gamma.pause(),
            Some(PeriodicPause {
                every: 20,
                secs: SecondsRange::new(10.0, 20.0)
            })
        );
        match &gamma.lookup {
            LookupConfig::Category {
                max_probes,
                prefix_len,
                ..
            } => {
                assert_eq!(*max_probes, 8);
                assert_eq!(*prefix_len, 3);
            }
            other => panic!("unexpected lookup {:?}", other),
        }
    }

    #[test]
    fn load_rejects_unknown_extension() {
        let err = Catalog::load(Path::new("catalog.json")).unwrap_err();
        assert!(matches!(err, CatalogError::Io { .. } | CatalogError::Format(_)));
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut catalog = Catalog::from_toml_str(SMALL).unwrap();
        let mut dup = catalog.sources[0].clone();
        dup.enabled = false;
        catalog.sources.push(dup);
        assert!(matches!(
            catalog.validate(),
            Err(CatalogError::DuplicateSource(name)) if name == "alpha"
        ));
    }

    #[test]
    fn missing_placeholder_rejected() {
        let mut catalog = Catalog::from_toml_str(SMALL).unwrap();
        catalog.sources[0].lookup = LookupConfig::Id {
            urls: vec!["https://alpha.test/p/".into()],
        };
        assert!(matches!(catalog.validate(), Err(CatalogError::Invalid { .. })));
    }

    #[test]
    fn zero_workers_rejected() {
        let mut catalog = Catalog::from_toml_str(SMALL).unwrap();
        catalog.sources[0].pool = PoolConfig::Fixed { workers: 0 };
        assert!(matches!(catalog.validate(), Err(CatalogError::Invalid { .. })));
    }

    #[test]
    fn inverted_cooldown_rejected() {
        let mut catalog = Catalog::from_toml_str(SMALL).unwrap();
        catalog.sources[1].retry.cooldown_429 = SecondsRange::new(90.0, 60.0);
        assert!(matches!(catalog.validate(), Err(CatalogError::Invalid { .. })));
    }

    #[test]
    fn oversized_durations_rejected() {
        let mut catalog = Catalog::from_toml_str(SMALL).unwrap();
        catalog.sources[0].timeout_secs = 1e20;
        assert!(matches!(
            catalog.validate(),
            Err(CatalogError::Invalid { name, .. }) if name == "alpha"
        ));

        let mut catalog = Catalog::from_toml_str(SMALL).unwrap();
        catalog.sources[0].pause_every = Some(5);
        catalog.sources[0].pause_secs = SecondsRange::new(1e20, 1e20);
        assert!(matches!(catalog.validate(), Err(CatalogError::Invalid { .. })));

        let mut catalog = Catalog::from_toml_str(SMALL).unwrap();
        if let PoolConfig::Adaptive(cfg) = &mut catalog.sources[1].pool {
            cfg.max_delay_secs = 1e20;
        }
        assert!(matches!(
            catalog.validate(),
            Err(CatalogError::Invalid { name, .. }) if name == "beta"
        ));

        let mut catalog = Catalog::from_toml_str(SMALL).unwrap();
        catalog.sources[0].timeout_secs = MAX_SECS;
        catalog.sources[1].retry.cooldown_429 = SecondsRange::new(0.0, MAX_SECS);
        catalog.validate().unwrap();
    }

    #[test]
    fn unknown_provider_rejected() {
        let raw = SMALL.replace(r#"hints_from = "alpha""#, r#"hints_from = "nobody""#);
        let catalog = Catalog::from_toml_str(&raw).unwrap();
        assert!(matches!(
            catalog.validate(),
            Err(CatalogError::UnknownSource(name)) if name == "nobody"
        ));
    }

    #[test]
    fn hint_cycle_rejected() {
        let mut catalog = Catalog::from_toml_str(SMALL).unwrap();
        catalog.sources[0].lookup = LookupConfig::Name {
            url: "https://alpha.test/?q={query}".into(),
            search_each_hint: false,
            hints_from: Some(SourceId::new("beta")),
        };
        assert!(matches!(catalog.validate(), Err(CatalogError::HintCycle(_))));
    }

    #[test]
    fn empty_catalog_rejected() {
        let catalog = Catalog::from_toml_str("").unwrap();
        assert!(matches!(catalog.validate(), Err(CatalogError::Empty)));
    }

    #[test]
    fn select_clears_dangling_hints() {
        let catalog = Catalog::from_toml_str(SMALL).unwrap();
        let only_beta = catalog.select(&[SourceId::new("beta")]).unwrap();
        assert_eq!(only_beta.sources.len(), 1);
        assert_eq!(only_beta.sources[0].hints_from(), None);
        assert_eq!(only_beta.stages().unwrap().len(), 1);
    }

    #[test]
    fn select_unknown_source() {
        let catalog = Catalog::from_toml_str(SMALL).unwrap();
        assert!(matches!(
            catalog.select(&[SourceId::new("zeta")]),
            Err(CatalogError::UnknownSource(_))
        ));
    }

    #[test]
    fn enabled_drops_disabled_sources() {
        let mut catalog = Catalog::from_toml_str(SMALL).unwrap();
        catalog.sources[0].enabled = false;
        let catalog = catalog.enabled();
        assert_eq!(catalog.names(), vec![SourceId::new("beta")]);
    }
}

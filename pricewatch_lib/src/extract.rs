//! Page extractors: turn a fetched body into name/price candidates.
//!
//! Both extractors are configured from the catalog and compiled once per
//! run. A page that does not parse simply yields no candidates.

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use pricewatch_http::template::fill_template;

use crate::catalog::CatalogError;
use crate::model::ProductId;

/// One product found on a page. Search pages usually yield several.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Candidate {
    pub name: Option<String>,
    pub price: Option<f64>,
}

impl Candidate {
    pub fn new(name: impl Into<String>, price: f64) -> Self {
        Self {
            name: Some(name.into()),
            price: Some(price),
        }
    }
}

pub trait Extractor: Send + Sync {
    fn extract(&self, body: &str, product_id: &ProductId) -> Vec<Candidate>;
}

/// Parses a displayed price such as `12,40 €`, `€ 1.234,50` or `9.99`.
pub fn parse_price(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .replace('€', "")
        .replace("EUR", "")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
        .collect();
    let normalized = if cleaned.contains(',') {
        // Comma is the decimal separator; dots are thousands separators.
        cleaned.replace('.', "").replace(',', ".")
    } else {
        cleaned
    };
    let value: f64 = normalized.parse().ok()?;
    (value.is_finite() && value >= 0.0).then_some(value)
}

/// Decodes the handful of HTML entities found in attribute values and text.
pub fn decode_entities(raw: &str) -> String {
    raw.replace("&quot;", "\"")
        .replace("&#34;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractorConfig {
    Pattern(PatternConfig),
    JsonAttribute(JsonAttributeConfig),
}

impl ExtractorConfig {
    pub fn build(&self, source: &str) -> Result<Arc<dyn Extractor>, CatalogError> {
        match self {
            Self::Pattern(cfg) => Ok(Arc::new(PatternExtractor::new(cfg, source)?)),
            Self::JsonAttribute(cfg) => Ok(Arc::new(JsonAttributeExtractor::new(cfg, source)?)),
        }
    }
}

/// Regular expressions with the value in capture group 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Splits a listing page into one block per candidate.
    #[serde(default)]
    pub item: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub price: String,
    /// Literal text that must appear in the page, e.g. `BE0{id}`.
    #[serde(default)]
    pub require_id: Option<String>,
}

fn compile(pattern: &str, source: &str) -> Result<Regex, CatalogError> {
    Regex::new(pattern).map_err(|e| CatalogError::InvalidPattern {
        name: source.to_string(),
        reason: e.to_string(),
    })
}

pub struct PatternExtractor {
    item: Option<Regex>,
    name: Option<Regex>,
    price: Regex,
    require_id: Option<String>,
    tags: Regex,
}

impl PatternExtractor {
    pub fn new(cfg: &PatternConfig, source: &str) -> Result<Self, CatalogError> {
        Ok(Self {
            item: cfg.item.as_deref().map(|p| compile(p, source)).transpose()?,
            name: cfg.name.as_deref().map(|p| compile(p, source)).transpose()?,
            price: compile(&cfg.price, source)?,
            require_id: cfg.require_id.clone(),
            tags: compile(r"<[^>]*>", source)?,
        })
    }

    fn capture(&self, re: &Regex, block: &str) -> Option<String> {
        let raw = re.captures(block)?.get(1)?.as_str();
        let text = decode_entities(&self.tags.replace_all(raw, " "));
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        (!text.is_empty()).then_some(text)
    }
}

impl Extractor for PatternExtractor {
    fn extract(&self, body: &str, product_id: &ProductId) -> Vec<Candidate> {
        if let Some(marker) = &self.require_id {
            let marker = fill_template(marker, &[("id", product_id.as_str())]);
            if !body.contains(&marker) {
                return Vec::new();
            }
        }

        let blocks: Vec<&str> = match &self.item {
            Some(item) => item.find_iter(body).map(|m| m.as_str()).collect(),
            None => vec![body],
        };

        blocks
            .into_iter()
            .filter_map(|block| {
                let name = self.name.as_ref().and_then(|re| self.capture(re, block));
                let price = self
                    .capture(&self.price, block)
                    .and_then(|p| parse_price(&p));
                if name.is_none() && price.is_none() {
                    return None;
                }
                Some(Candidate { name, price })
            })
            .collect()
    }
}

fn default_pointer() -> String {
    "/ecommerce/items".to_string()
}

fn default_name_field() -> String {
    "item_name".to_string()
}

fn default_price_field() -> String {
    "price".to_string()
}

/// Entity-encoded JSON carried in an HTML attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonAttributeConfig {
    pub attribute: String,
    /// JSON pointer to the item array (or a single item object).
    #[serde(default = "default_pointer")]
    pub pointer: String,
    #[serde(default = "default_name_field")]
    pub name_field: String,
    #[serde(default = "default_price_field")]
    pub price_field: String,
}

pub struct JsonAttributeExtractor {
    attribute: Regex,
    pointer: String,
    name_field: String,
    price_field: String,
}

impl JsonAttributeExtractor {
    pub fn new(cfg: &JsonAttributeConfig, source: &str) -> Result<Self, CatalogError> {
        let pattern = format!(
            r#"{}\s*=\s*(?:"([^"]*)"|'([^']*)')"#,
            regex::escape(&cfg.attribute)
        );
        Ok(Self {
            attribute: compile(&pattern, source)?,
            pointer: cfg.pointer.clone(),
            name_field: cfg.name_field.clone(),
            price_field: cfg.price_field.clone(),
        })
    }

    fn candidate(&self, item: &serde_json::Value) -> Option<Candidate> {
        let name = item
            .get(&self.name_field)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let price = match item.get(&self.price_field)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => parse_price(s),
            _ => None,
        };
        if name.is_none() && price.is_none() {
            return None;
        }
        Some(Candidate { name, price })
    }
}

impl Extractor for JsonAttributeExtractor {
    fn extract(&self, body: &str, _product_id: &ProductId) -> Vec<Candidate> {
        let mut out = Vec::new();
        for cap in self.attribute.captures_iter(body) {
            let Some(raw) = cap.get(1).or_else(|| cap.get(2)) else {
                continue;
            };
            let decoded = decode_entities(raw.as_str());
            let value: serde_json::Value = match serde_json::from_str(&decoded) {
                Ok(value) => value,
                Err(e) => {
                    tracing::trace!("Skipping unparsable attribute payload: {}", e);
                    continue;
                }
            };
            match value.pointer(&self.pointer) {
                Some(serde_json::Value::Array(items)) => {
                    out.extend(items.iter().filter_map(|item| self.candidate(item)));
                }
                Some(item @ serde_json::Value::Object(_)) => out.extend(self.candidate(item)),
                _ => {}
            }
        }
        out
    }
}

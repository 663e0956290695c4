//! Identifiers, hints and per-fetch results shared by every stage of a run.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize, Serializer};

/// Opaque product key (e.g. a national product code). Unique within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
    pub fn new(id: impl Into<String>) -> Self {
        let id: String = id.into();
        Self(id.trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first `len` characters, used to group related identifiers.
    pub fn prefix(&self, len: usize) -> &str {
        match self.0.char_indices().nth(len) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProductId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ProductId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Name of a configured data provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Where a product name hint came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HintOrigin {
    /// Supplied with the input list.
    Input,
    /// Discovered by an earlier source.
    Source(SourceId),
}

impl fmt::Display for HintOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Source(source) => write!(f, "{}", source),
        }
    }
}

impl Serialize for HintOrigin {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A display name for a product, tagged with its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductHint {
    pub name: String,
    pub origin: HintOrigin,
}

impl ProductHint {
    pub fn input(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            origin: HintOrigin::Input,
        }
    }

    pub fn from_source(name: impl Into<String>, source: &SourceId) -> Self {
        Self {
            name: name.into(),
            origin: HintOrigin::Source(source.clone()),
        }
    }

    pub fn is_usable(&self) -> bool {
        is_usable_name(&self.name)
    }
}

/// Blank names and the `NA` placeholders used by spreadsheets carry no
/// information.
pub fn is_usable_name(name: &str) -> bool {
    let trimmed = name.trim();
    !(trimmed.is_empty() || trimmed.eq_ignore_ascii_case("na") || trimmed.eq_ignore_ascii_case("n/a"))
}

/// One input row: an identifier plus whatever names are known for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub id: ProductId,
    pub hints: Vec<ProductHint>,
    /// Reference price from the input list. Reported, never aggregated.
    pub base_price: Option<f64>,
}

impl Product {
    pub fn new(id: impl Into<ProductId>) -> Self {
        Self {
            id: id.into(),
            hints: Vec::new(),
            base_price: None,
        }
    }

    /// Adds an input-provided name. Unusable names are ignored.
    pub fn with_name(mut self, name: &str) -> Self {
        if is_usable_name(name) {
            self.hints.push(ProductHint::input(name.trim()));
        }
        self
    }

    /// Non-finite prices are ignored.
    pub fn with_base_price(mut self, price: f64) -> Self {
        if price.is_finite() {
            self.base_price = Some(price);
        }
        self
    }

    pub fn with_hint(mut self, hint: ProductHint) -> Self {
        if hint.is_usable() {
            self.hints.push(hint);
        }
        self
    }

    pub fn usable_hints(&self) -> impl Iterator<Item = &ProductHint> {
        self.hints.iter().filter(|h| h.is_usable())
    }

    /// The input-provided name, if any.
    pub fn input_name(&self) -> Option<&str> {
        self.hints
            .iter()
            .find(|h| h.origin == HintOrigin::Input)
            .map(|h| h.name.as_str())
    }
}

/// Drops repeated identifiers, keeping the first occurrence.
///
/// Returns the deduplicated list and the number of dropped rows.
pub fn dedup_products(products: Vec<Product>) -> (Vec<Product>, usize) {
    let mut seen = HashSet::new();
    let before = products.len();
    let unique: Vec<Product> = products
        .into_iter()
        .filter(|p| seen.insert(p.id.clone()))
        .collect();
    let dropped = before - unique.len();
    (unique, dropped)
}

/// Terminal outcome of one (product, source) lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Found,
    /// The source answered but has no (acceptable) match.
    NotFound,
    /// The source kept rejecting requests with 403/429.
    Blocked,
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Found => f.write_str("found"),
            Self::NotFound => f.write_str("not found"),
            Self::Blocked => f.write_str("blocked"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchResult {
    pub product_id: ProductId,
    pub source: SourceId,
    pub price: Option<f64>,
    pub matched_name: Option<String>,
    /// Fuzzy match score in `[0, 100]`; absent for identifier lookups.
    pub match_score: Option<f64>,
    /// Which hint produced `match_score`.
    pub match_source: Option<HintOrigin>,
    pub status: FetchStatus,
}

impl FetchResult {
    pub fn found(
        product_id: ProductId,
        source: SourceId,
        price: f64,
        matched_name: Option<String>,
    ) -> Self {
        Self {
            product_id,
            source,
            price: Some(price),
            matched_name,
            match_score: None,
            match_source: None,
            status: FetchStatus::Found,
        }
    }

    pub fn not_found(product_id: ProductId, source: SourceId) -> Self {
        Self {
            product_id,
            source,
            price: None,
            matched_name: None,
            match_score: None,
            match_source: None,
            status: FetchStatus::NotFound,
        }
    }

    pub fn blocked(product_id: ProductId, source: SourceId) -> Self {
        Self {
            status: FetchStatus::Blocked,
            ..Self::not_found(product_id, source)
        }
    }

    pub fn with_match(mut self, score: f64, origin: HintOrigin) -> Self {
        self.match_score = Some(score.clamp(0.0, 100.0));
        self.match_source = Some(origin);
        self
    }
}

//! Merge of per-source results into one record per product, plus per-source
//! run summaries.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::blocking::{BlockCode, BlockingDetector};
use crate::matcher::MatchQuality;
use crate::model::{FetchResult, FetchStatus, HintOrigin, Product, ProductId, SourceId};
use crate::rate::RateSnapshot;

/// Rounds half away from zero to two decimals.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedRecord {
    pub product_id: ProductId,
    /// Name given in the input list.
    pub name: Option<String>,
    /// Reference price given in the input list; not part of `mean`/`min`.
    pub base_price: Option<f64>,
    pub prices: BTreeMap<SourceId, f64>,
    pub match_scores: BTreeMap<SourceId, f64>,
    pub match_sources: BTreeMap<SourceId, HintOrigin>,
    /// Mean of the present prices, rounded to cents.
    pub mean: Option<f64>,
    pub min: Option<f64>,
}

impl AggregatedRecord {
    fn empty(product: &Product) -> Self {
        Self {
            product_id: product.id.clone(),
            name: product.input_name().map(str::to_string),
            base_price: product.base_price,
            prices: BTreeMap::new(),
            match_scores: BTreeMap::new(),
            match_sources: BTreeMap::new(),
            mean: None,
            min: None,
        }
    }
}

/// Builds exactly one record per product, in input order.
///
/// Only `found` results with a finite price count; statistics are never
/// padded with zeros.
pub fn aggregate(products: &[Product], results: &[FetchResult]) -> Vec<AggregatedRecord> {
    let mut by_product: HashMap<&ProductId, Vec<&FetchResult>> = HashMap::new();
    for result in results {
        by_product.entry(&result.product_id).or_default().push(result);
    }

    products
        .iter()
        .map(|product| {
            let mut record = AggregatedRecord::empty(product);
            for result in by_product.get(&product.id).into_iter().flatten() {
                if result.status != FetchStatus::Found {
                    continue;
                }
                let Some(price) = result.price.filter(|p| p.is_finite()) else {
                    continue;
                };
                record.prices.insert(result.source.clone(), price);
                if let Some(score) = result.match_score {
                    record.match_scores.insert(result.source.clone(), score);
                }
                if let Some(origin) = &result.match_source {
                    record
                        .match_sources
                        .insert(result.source.clone(), origin.clone());
                }
            }

            if !record.prices.is_empty() {
                let sum: f64 = record.prices.values().sum();
                record.mean = Some(round2(sum / record.prices.len() as f64));
                record.min = record.prices.values().copied().reduce(f64::min);
            }
            record
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QualityCounts {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

/// Per-source outcome counts, match quality and blocking counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSummary {
    pub source: SourceId,
    pub total: usize,
    pub found: usize,
    pub not_found: usize,
    pub blocked: usize,
    /// Found / total, as a percentage.
    pub coverage: f64,
    pub mean_score: Option<f64>,
    pub quality: QualityCounts,
    /// Which hint produced the accepted matches.
    pub origins: BTreeMap<String, usize>,
    pub forbidden_count: u32,
    pub rate_limited_count: u32,
    pub rate: Option<RateSnapshot>,
}

impl SourceSummary {
    pub fn from_results(
        source: &SourceId,
        results: &[FetchResult],
        detector: &BlockingDetector,
        rate: Option<RateSnapshot>,
    ) -> Self {
        let mine: Vec<&FetchResult> = results.iter().filter(|r| &r.source == source).collect();
        let count = |status: FetchStatus| mine.iter().filter(|r| r.status == status).count();
        let found = count(FetchStatus::Found);

        let scores: Vec<f64> = mine
            .iter()
            .filter(|r| r.status == FetchStatus::Found)
            .filter_map(|r| r.match_score)
            .collect();
        let mut quality = QualityCounts::default();
        for score in &scores {
            match MatchQuality::from_score(*score) {
                MatchQuality::High => quality.high += 1,
                MatchQuality::Medium => quality.medium += 1,
                MatchQuality::Low => quality.low += 1,
            }
        }

        let mut origins = BTreeMap::new();
        for origin in mine
            .iter()
            .filter(|r| r.status == FetchStatus::Found)
            .filter_map(|r| r.match_source.as_ref())
        {
            *origins.entry(origin.to_string()).or_insert(0) += 1;
        }

        Self {
            source: source.clone(),
            total: mine.len(),
            found,
            not_found: count(FetchStatus::NotFound),
            blocked: count(FetchStatus::Blocked),
            coverage: if mine.is_empty() {
                0.0
            } else {
                round2(found as f64 * 100.0 / mine.len() as f64)
            },
            mean_score: (!scores.is_empty())
                .then(|| round2(scores.iter().sum::<f64>() / scores.len() as f64)),
            quality,
            origins,
            forbidden_count: detector.count(source, BlockCode::Forbidden),
            rate_limited_count: detector.count(source, BlockCode::RateLimited),
            rate,
        }
    }
}

//! Product list loading.
//!
//! Accepts the `;`-separated grid layout (`name;id[;base price]`) or a plain
//! list with one id per line. A header row whose id cell reads `id`, `cnk` or
//! `product_id` is skipped.

use std::path::Path;

use anyhow::{Context, Result};
use pricewatch_lib::extract::parse_price;
use pricewatch_lib::Product;

const HEADER_IDS: &[&str] = &["id", "cnk", "product_id"];

pub fn read_products(path: &Path) -> Result<Vec<Product>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read product list {}", path.display()))?;
    parse_products(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn parse_products(raw: &str) -> Result<Vec<Product>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(raw.as_bytes());

    let mut products = Vec::new();
    for record in reader.records() {
        let record = record?;
        let (name, id) = match record.len() {
            0 => continue,
            1 => (None, record.get(0).unwrap_or_default()),
            _ => (record.get(0), record.get(1).unwrap_or_default()),
        };
        if id.is_empty() || HEADER_IDS.iter().any(|h| id.eq_ignore_ascii_case(h)) {
            continue;
        }
        let mut product = Product::new(id);
        if let Some(name) = name {
            product = product.with_name(name);
        }
        if let Some(price) = record.get(2).and_then(parse_price) {
            product = product.with_base_price(price);
        }
        products.push(product);
    }
    Ok(products)
}

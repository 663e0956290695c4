//! Advisory category hints for sources that can only be probed by category.
//!
//! Input lists tend to be sorted, so the category that matched the previous
//! row, or another product sharing an id prefix, is a good first guess.
//! Entries are written only on a hit; concurrent writers simply overwrite
//! each other.

use dashmap::DashMap;

use crate::model::ProductId;

pub struct LookupCache {
    /// Input position -> category that matched it.
    adjacent: DashMap<usize, String>,
    /// Id prefix -> category that last matched a product with that prefix.
    by_prefix: DashMap<String, String>,
    prefix_len: usize,
}

impl LookupCache {
    pub fn new(prefix_len: usize) -> Self {
        Self {
            adjacent: DashMap::new(),
            by_prefix: DashMap::new(),
            prefix_len,
        }
    }

    /// Categories in probing order: the previous row's category, then the
    /// prefix category, then the rest by increasing length and name.
    pub fn search_order(&self, index: usize, id: &ProductId, categories: &[String]) -> Vec<String> {
        let mut order: Vec<String> = Vec::with_capacity(categories.len());

        if index > 0 {
            if let Some(cat) = self.adjacent.get(&(index - 1)) {
                if categories.contains(cat.value()) {
                    order.push(cat.value().clone());
                }
            }
        }
        if let Some(cat) = self.by_prefix.get(id.prefix(self.prefix_len)) {
            if categories.contains(cat.value()) && !order.contains(cat.value()) {
                order.push(cat.value().clone());
            }
        }

        let mut rest: Vec<&String> = categories.iter().filter(|c| !order.contains(c)).collect();
        rest.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
        rest.dedup();
        order.extend(rest.into_iter().cloned());
        order
    }

    pub fn record_hit(&self, index: usize, id: &ProductId, category: &str) {
        self.adjacent.insert(index, category.to_string());
        self.by_prefix
            .insert(id.prefix(self.prefix_len).to_string(), category.to_string());
    }

    pub fn len(&self) -> usize {
        self.adjacent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adjacent.is_empty()
    }
}

//! CLI subcommand implementations.

pub mod run;
pub mod sources;

use std::path::Path;

use anyhow::{Context, Result};
use pricewatch_lib::Catalog;

/// The catalog named on the command line (or by `PRICEWATCH_CATALOG`), else
/// the built-in one.
pub fn load_catalog(path: Option<&Path>) -> Result<Catalog> {
    match path {
        Some(path) => Catalog::load(path)
            .with_context(|| format!("Failed to load catalog {}", path.display())),
        None => Catalog::default_catalog().context("Built-in catalog is invalid"),
    }
}

//! The `sources` subcommand: show and validate the source catalog.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use pricewatch_lib::catalog::{LookupConfig, PacingMode, PoolConfig};
use pricewatch_lib::{Catalog, SourceId};
use serde::Serialize;
use tabled::{Table, Tabled};

use crate::output::print_json;

#[derive(Args)]
pub struct SourcesArgs {
    /// Source catalog (TOML or YAML); defaults to the built-in catalog
    #[arg(long, env = "PRICEWATCH_CATALOG")]
    pub catalog: Option<PathBuf>,

    /// Print the catalog as JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled, Serialize)]
struct SourceRow {
    #[tabled(rename = "Stage")]
    stage: usize,
    #[tabled(rename = "Source")]
    name: String,
    #[tabled(rename = "Enabled")]
    enabled: bool,
    #[tabled(rename = "Lookup")]
    lookup: String,
    #[tabled(rename = "Pool")]
    pool: String,
    #[tabled(rename = "Pacing")]
    pacing: String,
    #[tabled(rename = "Hints from")]
    hints_from: String,
}

fn build_source_rows(catalog: &Catalog) -> Result<Vec<SourceRow>> {
    let stage_of: HashMap<SourceId, usize> = catalog
        .stages()?
        .into_iter()
        .enumerate()
        .flat_map(|(n, stage)| stage.into_iter().map(move |name| (name, n + 1)))
        .collect();

    Ok(catalog
        .sources
        .iter()
        .map(|s| SourceRow {
            stage: stage_of.get(&s.name).copied().unwrap_or_default(),
            name: s.name.to_string(),
            enabled: s.enabled,
            lookup: match &s.lookup {
                LookupConfig::Id { urls } => format!("id ({} urls)", urls.len()),
                LookupConfig::Category { categories, .. } => {
                    format!("category ({} paths)", categories.len())
                }
                LookupConfig::Name {
                    search_each_hint, ..
                } => {
                    if *search_each_hint {
                        "name (every hint)".to_string()
                    } else {
                        "name".to_string()
                    }
                }
            },
            pool: match &s.pool {
                PoolConfig::Fixed { workers } => format!("fixed x{}", workers),
                PoolConfig::Adaptive(a) => {
                    format!("adaptive {}-{}", a.min_workers, a.max_workers)
                }
            },
            pacing: if s.is_adaptive() {
                "adaptive".to_string()
            } else {
                match s.pacing {
                    PacingMode::Human => "human".to_string(),
                    PacingMode::Off => "none".to_string(),
                }
            },
            hints_from: s.hints_from().map(|p| p.to_string()).unwrap_or_default(),
        })
        .collect())
}

pub fn run(args: &SourcesArgs) -> Result<()> {
    let catalog = super::load_catalog(args.catalog.as_deref())?;
    catalog.validate()?;

    if args.json {
        print_json(&catalog);
    } else {
        println!("{}", Table::new(build_source_rows(&catalog)?));
    }
    Ok(())
}

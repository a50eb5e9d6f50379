use serde::{Deserialize, Serialize};

use crate::error::CoreResult;

/// One downloadable file offered by a catalog. Only `url` drives a transfer;
/// the other fields are for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub url: String,
    pub size: Option<String>,
    pub date: Option<String>,
}

/// Produces catalog entries, for example from a remote directory listing.
pub trait CatalogSource: Send + Sync {
    fn entries(&self) -> CoreResult<Vec<CatalogEntry>>;
}

/// A fixed list of entries.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    entries: Vec<CatalogEntry>,
}

impl StaticCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }
}

impl CatalogSource for StaticCatalog {
    fn entries(&self) -> CoreResult<Vec<CatalogEntry>> {
        Ok(self.entries.clone())
    }
}

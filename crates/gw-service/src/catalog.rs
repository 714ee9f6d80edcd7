//! Grid lookup for the facade.

use parking_lot::RwLock;
use std::collections::HashMap;

use gw_core::Network;

/// Anything that can hand out a network by id.
pub trait GridSource: Send + Sync {
    fn network(&self, grid_id: &str) -> Option<Network>;
    fn grid_ids(&self) -> Vec<String>;
}

/// In-memory grid registry.
#[derive(Default)]
pub struct GridCatalog {
    grids: RwLock<HashMap<String, Network>>,
}

impl GridCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, grid_id: impl Into<String>, network: Network) {
        self.grids.write().insert(grid_id.into(), network);
    }

    pub fn remove(&self, grid_id: &str) -> bool {
        self.grids.write().remove(grid_id).is_some()
    }
}

impl GridSource for GridCatalog {
    fn network(&self, grid_id: &str) -> Option<Network> {
        self.grids.read().get(grid_id).cloned()
    }

    fn grid_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.grids.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_round_trip() {
        let catalog = GridCatalog::new();
        assert!(catalog.network("ieee14").is_none());
        catalog.insert("ieee14", Network::new());
        catalog.insert("ieee9", Network::new());
        assert!(catalog.network("ieee14").is_some());
        assert_eq!(catalog.grid_ids(), vec!["ieee14", "ieee9"]);
        assert!(catalog.remove("ieee9"));
        assert!(!catalog.remove("ieee9"));
    }
}

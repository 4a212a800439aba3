//! Collaborator seam for dealer, product and territory master data
//!
//! Master data is owned elsewhere; the quota core only needs to resolve ids and
//! fetch display fields. `StaticDirectory` serves it from memory, loaded from a
//! JSON export.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dealer {
    pub id: i64,
    pub name: String,
    pub territory: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub unit: Option<String>,
}

/// Read access to master data
#[async_trait]
pub trait Directory: Send + Sync {
    async fn resolve_dealer(&self, dealer_id: i64) -> Result<Option<Dealer>>;

    async fn resolve_product(&self, product_id: i64) -> Result<Option<Product>>;

    async fn territory_exists(&self, territory: &str) -> Result<bool>;
}

/// On-disk layout of a directory export
#[derive(Debug, Default, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    territories: Vec<String>,
    #[serde(default)]
    dealers: Vec<Dealer>,
    #[serde(default)]
    products: Vec<Product>,
}

/// In-memory directory
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    territories: HashSet<String>,
    dealers: HashMap<i64, Dealer>,
    products: HashMap<i64, Product>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read directory file {}", path.display()))?;
        let directory = Self::from_json(&raw)
            .with_context(|| format!("Failed to parse directory file {}", path.display()))?;
        info!(
            "Loaded directory from {}: {} territories, {} dealers, {} products",
            path.display(),
            directory.territories.len(),
            directory.dealers.len(),
            directory.products.len()
        );
        Ok(directory)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let file: DirectoryFile = serde_json::from_str(raw)?;
        let mut directory = Self::new();
        for territory in file.territories {
            directory = directory.with_territory(territory);
        }
        for dealer in file.dealers {
            directory = directory.with_dealer(dealer);
        }
        for product in file.products {
            directory = directory.with_product(product);
        }
        Ok(directory)
    }

    pub fn with_territory(mut self, territory: impl Into<String>) -> Self {
        self.territories.insert(territory.into());
        self
    }

    /// Registers the dealer and its territory
    pub fn with_dealer(mut self, dealer: Dealer) -> Self {
        self.territories.insert(dealer.territory.clone());
        self.dealers.insert(dealer.id, dealer);
        self
    }

    pub fn with_product(mut self, product: Product) -> Self {
        self.products.insert(product.id, product);
        self
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn resolve_dealer(&self, dealer_id: i64) -> Result<Option<Dealer>> {
        Ok(self.dealers.get(&dealer_id).cloned())
    }

    async fn resolve_product(&self, product_id: i64) -> Result<Option<Product>> {
        Ok(self.products.get(&product_id).cloned())
    }

    async fn territory_exists(&self, territory: &str) -> Result<bool> {
        Ok(self.territories.contains(territory))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_json() {
        let directory = StaticDirectory::from_json(
            r#"{
                "territories": ["South"],
                "dealers": [{ "id": 1, "name": "Rahman Traders", "territory": "North" }],
                "products": [{ "id": 10, "name": "Cement 50kg", "unit": "bag" }]
            }"#,
        )
        .unwrap();

        let dealer = directory.resolve_dealer(1).await.unwrap().unwrap();
        assert_eq!(dealer.territory, "North");
        assert!(directory.resolve_dealer(2).await.unwrap().is_none());
        assert_eq!(
            directory.resolve_product(10).await.unwrap().unwrap().unit.as_deref(),
            Some("bag")
        );
        // Dealer territories count as known territories
        assert!(directory.territory_exists("North").await.unwrap());
        assert!(directory.territory_exists("South").await.unwrap());
        assert!(!directory.territory_exists("East").await.unwrap());
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(StaticDirectory::from_json("not json").is_err());
    }
}

//! Quota allocation: create, top-up, remove and list daily quotas
//!
//! A ceiling can never be moved below what has already been sold, and a quota
//! row can only be removed while nothing has been sold against it.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::database::{finish, is_unique_violation, mutation_error, with_read_retry, Database};
use crate::directory::Directory;
use crate::entity::quotas;
use crate::error::{QuotaError, Result};
use crate::ledger::{self, QuotaAvailability, QuotaKey, QuotaRecord};

/// Maximum attempts when a concurrent allocation creates the same row first
const MAX_UPSERT_ATTEMPTS: u32 = 3;

/// One (product, territory, ceiling) tuple for a given day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub product_id: i64,
    pub territory: String,
    pub max_quantity: i64,
}

/// Per-tuple result of a bulk allocation
#[derive(Debug)]
pub struct BulkAllocationOutcome {
    pub request: AllocationRequest,
    pub result: Result<QuotaRecord>,
}

/// Filter for listing one day's quotas
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaQuery {
    pub date: NaiveDate,
    #[serde(default)]
    pub territory: Option<String>,
    #[serde(default)]
    pub product_id: Option<i64>,
}

impl QuotaQuery {
    pub fn for_date(date: NaiveDate) -> Self {
        Self {
            date,
            territory: None,
            product_id: None,
        }
    }
}

/// Totals for one product across all territories of a day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductUsage {
    pub product_id: i64,
    pub territories: usize,
    pub max_quantity: i64,
    pub sold_quantity: i64,
    pub remaining_quantity: i64,
}

enum Upsert {
    Done(quotas::Model),
    /// Row appeared or changed underneath us; try again
    Raced,
}

/// Administrative quota operations
pub struct QuotaAllocator {
    db: Arc<Database>,
    directory: Arc<dyn Directory>,
}

impl QuotaAllocator {
    pub fn new(db: Arc<Database>, directory: Arc<dyn Directory>) -> Self {
        Self { db, directory }
    }

    /// Create the quota row, or change its ceiling if it already exists
    pub async fn allocate_or_update(
        &self,
        date: NaiveDate,
        request: &AllocationRequest,
    ) -> Result<QuotaRecord> {
        if request.max_quantity < 0 {
            return Err(QuotaError::InvalidQuantity(format!(
                "max_quantity must not be negative, got {}",
                request.max_quantity
            )));
        }
        self.validate_target(request.product_id, &request.territory).await?;

        let key = QuotaKey::new(date, request.product_id, request.territory.clone());
        let mut attempts = 0;

        loop {
            attempts += 1;

            let txn = self.db.begin().await.map_err(mutation_error)?;
            let result = upsert(&txn, &key, request.max_quantity).await;

            match finish(txn, result).await? {
                Upsert::Done(model) => {
                    info!(
                        "Quota {} set to {} (sold {}, remaining {})",
                        key,
                        model.max_quantity,
                        model.sold_quantity,
                        model.remaining_quantity()
                    );
                    return Ok(model.into());
                }
                Upsert::Raced if attempts < MAX_UPSERT_ATTEMPTS => {
                    warn!(
                        "Concurrent allocation on quota {}, retrying ({}/{})",
                        key, attempts, MAX_UPSERT_ATTEMPTS
                    );
                }
                Upsert::Raced => {
                    return Err(QuotaError::Other(anyhow::anyhow!(
                        "Quota {} kept changing during allocation, giving up after {} attempts",
                        key,
                        MAX_UPSERT_ATTEMPTS
                    )));
                }
            }
        }
    }

    /// Apply every tuple independently; one bad tuple does not block the rest
    pub async fn allocate_bulk(
        &self,
        date: NaiveDate,
        requests: Vec<AllocationRequest>,
    ) -> Vec<BulkAllocationOutcome> {
        let mut outcomes = Vec::with_capacity(requests.len());

        for request in requests {
            let result = self.allocate_or_update(date, &request).await;
            if let Err(e) = &result {
                warn!(
                    "Bulk allocation for product {} in {} on {} failed: {}",
                    request.product_id, request.territory, date, e
                );
            }
            outcomes.push(BulkAllocationOutcome { request, result });
        }

        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        info!(
            "Bulk allocation for {}: {} succeeded, {} failed",
            date,
            outcomes.len() - failed,
            failed
        );
        outcomes
    }

    /// Delete a quota row that nothing has been sold against
    pub async fn remove(&self, key: &QuotaKey) -> Result<QuotaRecord> {
        let txn = self.db.begin().await.map_err(mutation_error)?;

        let result = async {
            let model = match ledger::lookup_for_update(&txn, key)
                .await
                .map_err(mutation_error)?
            {
                QuotaAvailability::Allocated(model) => model,
                QuotaAvailability::Unallocated => {
                    return Err(QuotaError::QuotaNotFound(key.clone()))
                }
            };

            if !ledger::try_remove(&txn, key).await.map_err(mutation_error)? {
                let sold = ledger::lookup(&txn, key).await.map_err(mutation_error)?.sold();
                return Err(QuotaError::QuotaInUse {
                    key: key.clone(),
                    sold,
                });
            }
            Ok(model)
        }
        .await;

        let removed = finish(txn, result).await?;
        info!("Quota {} removed (max was {})", key, removed.max_quantity);
        Ok(removed.into())
    }

    /// Current state of one quota row
    pub async fn get(&self, key: &QuotaKey) -> Result<QuotaRecord> {
        let conn = self.db.connection();
        with_read_retry("quota lookup", || ledger::lookup(conn, key))
            .await?
            .into_model()
            .map(QuotaRecord::from)
            .ok_or_else(|| QuotaError::QuotaNotFound(key.clone()))
    }

    /// List one day's quotas, optionally narrowed to a territory and/or product
    pub async fn query(&self, query: &QuotaQuery) -> Result<Vec<QuotaRecord>> {
        let conn = self.db.connection();
        let rows = with_read_retry("quota query", || {
            ledger::find(conn, query.date, query.territory.as_deref(), query.product_id)
        })
        .await?;

        debug!("Quota query for {} returned {} rows", query.date, rows.len());
        Ok(rows.into_iter().map(QuotaRecord::from).collect())
    }

    /// Per-product totals for one day, for dashboards
    pub async fn usage_summary(&self, date: NaiveDate) -> Result<Vec<ProductUsage>> {
        let records = self.query(&QuotaQuery::for_date(date)).await?;

        let mut by_product: BTreeMap<i64, ProductUsage> = BTreeMap::new();
        for record in records {
            let usage = by_product
                .entry(record.product_id)
                .or_insert_with(|| ProductUsage {
                    product_id: record.product_id,
                    territories: 0,
                    max_quantity: 0,
                    sold_quantity: 0,
                    remaining_quantity: 0,
                });
            usage.territories += 1;
            usage.max_quantity = usage.max_quantity.saturating_add(record.max_quantity);
            usage.sold_quantity = usage.sold_quantity.saturating_add(record.sold_quantity);
            usage.remaining_quantity = usage
                .remaining_quantity
                .saturating_add(record.remaining_quantity);
        }
        Ok(by_product.into_values().collect())
    }

    async fn validate_target(&self, product_id: i64, territory: &str) -> Result<()> {
        if self.directory.resolve_product(product_id).await?.is_none() {
            return Err(QuotaError::UnknownProduct(product_id));
        }
        if !self.directory.territory_exists(territory).await? {
            return Err(QuotaError::UnknownTerritory(territory.to_string()));
        }
        Ok(())
    }
}

async fn upsert(
    txn: &sea_orm::DatabaseTransaction,
    key: &QuotaKey,
    max_quantity: i64,
) -> Result<Upsert> {
    if ledger::try_set_max(txn, key, max_quantity)
        .await
        .map_err(mutation_error)?
    {
        let model = ledger::lookup(txn, key)
            .await
            .map_err(mutation_error)?
            .into_model()
            .ok_or_else(|| {
                QuotaError::LedgerInconsistent(format!("quota {} vanished after update", key))
            })?;
        return Ok(Upsert::Done(model));
    }

    match ledger::lookup_for_update(txn, key)
        .await
        .map_err(mutation_error)?
    {
        QuotaAvailability::Allocated(model) if model.sold_quantity > max_quantity => {
            Err(QuotaError::QuotaBelowConsumed {
                key: key.clone(),
                requested_max: max_quantity,
                sold: model.sold_quantity,
            })
        }
        // MySQL reports zero changed rows when the ceiling is already this value
        QuotaAvailability::Allocated(model) if model.max_quantity == max_quantity => {
            Ok(Upsert::Done(model))
        }
        QuotaAvailability::Allocated(_) => Ok(Upsert::Raced),
        QuotaAvailability::Unallocated => match ledger::insert(txn, key, max_quantity).await {
            Ok(model) => Ok(Upsert::Done(model)),
            Err(e) if is_unique_violation(&e) => Ok(Upsert::Raced),
            Err(e) => Err(mutation_error(e)),
        },
    }
}

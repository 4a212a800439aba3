//! Order admission against daily quotas
//!
//! One admission is one database transaction: lock every quota row the order
//! touches in canonical key order, check every line, consume every line, and
//! persist the order. Any failure rolls the whole transaction back, so an order
//! is either admitted in full or leaves the ledger untouched.

use chrono::{NaiveDate, Utc};
use sea_orm::{entity::*, DatabaseTransaction};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::database::{finish, is_unique_violation, mutation_error, Database};
use crate::entity::{order_lines, orders};
use crate::error::{QuotaError, Result};
use crate::ledger::{self, QuotaKey, QuotaRecord};
use crate::orders::{ActorRole, Channel, OrderLineRequest};

/// An order ready for admission. Parties and products are already validated.
#[derive(Debug, Clone)]
pub struct OrderDraft {
    pub order_id: String,
    pub request_key: Option<String>,
    pub date: NaiveDate,
    pub territory: String,
    pub dealer_id: i64,
    pub created_by: String,
    pub actor_role: ActorRole,
    pub channel: Channel,
    pub lines: Vec<OrderLineRequest>,
}

impl OrderDraft {
    /// Quota row a line of this order draws from
    pub fn quota_key(&self, product_id: i64) -> QuotaKey {
        QuotaKey::new(self.date, product_id, self.territory.clone())
    }

    /// Total demand per quota row, in canonical key order
    fn demand(&self) -> Result<BTreeMap<QuotaKey, i64>> {
        let mut demand = BTreeMap::new();
        for line in &self.lines {
            let total = demand.entry(self.quota_key(line.product_id)).or_insert(0i64);
            *total = total.checked_add(line.quantity).ok_or_else(|| {
                QuotaError::InvalidQuantity(format!(
                    "product {}: total quantity overflows",
                    line.product_id
                ))
            })?;
        }
        Ok(demand)
    }
}

/// A committed order and the state of the quotas it consumed
#[derive(Debug, Clone)]
pub struct AdmittedOrder {
    pub order: orders::Model,
    pub lines: Vec<order_lines::Model>,
    pub quotas: Vec<QuotaRecord>,
}

/// Rejects empty orders and non-positive quantities
pub fn validate_lines(lines: &[OrderLineRequest]) -> Result<()> {
    if lines.is_empty() {
        return Err(QuotaError::EmptyOrder);
    }
    for line in lines {
        if line.quantity <= 0 {
            return Err(QuotaError::InvalidQuantity(format!(
                "product {}: quantity must be positive, got {}",
                line.product_id, line.quantity
            )));
        }
    }
    Ok(())
}

/// Admission controller
pub struct AdmissionController {
    db: Arc<Database>,
}

impl AdmissionController {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Check and consume quota for every line, and persist the order, atomically
    pub async fn admit(&self, draft: OrderDraft) -> Result<AdmittedOrder> {
        validate_lines(&draft.lines)?;
        let demand = draft.demand()?;

        let txn = self.db.begin().await.map_err(mutation_error)?;
        let result = admit_in_txn(&txn, &draft, &demand).await;
        let admitted = finish(txn, result).await?;

        info!(
            "Order {} admitted for dealer {} in {} on {} ({} lines, {} quota rows)",
            admitted.order.order_id,
            draft.dealer_id,
            draft.territory,
            draft.date,
            admitted.lines.len(),
            demand.len()
        );
        Ok(admitted)
    }
}

async fn admit_in_txn(
    txn: &DatabaseTransaction,
    draft: &OrderDraft,
    demand: &BTreeMap<QuotaKey, i64>,
) -> Result<AdmittedOrder> {
    // Lock every row before checking any of them
    let mut available = HashMap::with_capacity(demand.len());
    for key in demand.keys() {
        let availability = ledger::lookup_for_update(txn, key)
            .await
            .map_err(mutation_error)?;
        available.insert(key.clone(), availability.remaining());
    }

    // Check in submission order so the rejection names the first failing line
    for line in &draft.lines {
        let key = draft.quota_key(line.product_id);
        let requested = demand.get(&key).copied().unwrap_or(line.quantity);
        let remaining = available.get(&key).copied().unwrap_or(0);
        if requested > remaining {
            debug!(
                "Order {} rejected: quota {} has {} remaining, {} requested",
                draft.order_id, key, remaining, requested
            );
            return Err(QuotaError::InsufficientQuota {
                key,
                requested,
                remaining,
            });
        }
    }

    for (key, quantity) in demand {
        if !ledger::try_consume(txn, key, *quantity)
            .await
            .map_err(mutation_error)?
        {
            // Only reachable where the backend could not hold the row lock
            let remaining = ledger::lookup(txn, key)
                .await
                .map_err(mutation_error)?
                .remaining();
            return Err(QuotaError::InsufficientQuota {
                key: key.clone(),
                requested: *quantity,
                remaining,
            });
        }
    }

    let order = orders::ActiveModel {
        order_id: Set(draft.order_id.clone()),
        request_key: Set(draft.request_key.clone()),
        dealer_id: Set(draft.dealer_id),
        territory: Set(draft.territory.clone()),
        order_date: Set(draft.date),
        created_by: Set(draft.created_by.clone()),
        actor_role: Set(draft.actor_role.as_str().to_string()),
        channel: Set(draft.channel.as_str().to_string()),
        created_at: Set(Utc::now()),
    }
    .insert(txn)
    .await
    .map_err(|e| match &draft.request_key {
        Some(request_key) if is_unique_violation(&e) => {
            QuotaError::DuplicateRequestKey(request_key.clone())
        }
        _ => mutation_error(e),
    })?;

    let lines: Vec<order_lines::Model> = draft
        .lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            let key = draft.quota_key(line.product_id);
            order_lines::Model {
                order_id: draft.order_id.clone(),
                line_no: i as i32 + 1,
                product_id: line.product_id,
                quantity: line.quantity,
                quota_date: key.date,
                quota_product_id: key.product_id,
                quota_territory: key.territory,
            }
        })
        .collect();

    order_lines::Entity::insert_many(lines.iter().map(|line| order_lines::ActiveModel {
        order_id: Set(line.order_id.clone()),
        line_no: Set(line.line_no),
        product_id: Set(line.product_id),
        quantity: Set(line.quantity),
        quota_date: Set(line.quota_date),
        quota_product_id: Set(line.quota_product_id),
        quota_territory: Set(line.quota_territory.clone()),
    }))
    .exec_without_returning(txn)
    .await
    .map_err(mutation_error)?;

    let mut quotas = Vec::with_capacity(demand.len());
    for key in demand.keys() {
        if let Some(model) = ledger::lookup(txn, key)
            .await
            .map_err(mutation_error)?
            .into_model()
        {
            quotas.push(QuotaRecord::from(model));
        }
    }

    Ok(AdmittedOrder {
        order,
        lines,
        quotas,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()
    }

    async fn setup() -> (Arc<Database>, AdmissionController) {
        let db = Database::new(&DatabaseConfig::new("sqlite::memory:"))
            .await
            .unwrap();
        db.create_schema().await.unwrap();
        let db = Arc::new(db);
        (db.clone(), AdmissionController::new(db))
    }

    fn draft(order_id: &str, lines: &[(i64, i64)]) -> OrderDraft {
        OrderDraft {
            order_id: order_id.to_string(),
            request_key: None,
            date: date(),
            territory: "North".to_string(),
            dealer_id: 1,
            created_by: "tso-7".to_string(),
            actor_role: ActorRole::Tso,
            channel: Channel::Web,
            lines: lines
                .iter()
                .map(|&(product_id, quantity)| OrderLineRequest {
                    product_id,
                    quantity,
                })
                .collect(),
        }
    }

    async fn sold(db: &Database, product_id: i64) -> i64 {
        ledger::lookup(db.connection(), &QuotaKey::new(date(), product_id, "North"))
            .await
            .unwrap()
            .sold()
    }

    async fn stored_orders(db: &Database) -> usize {
        orders::Entity::find()
            .all(db.connection())
            .await
            .unwrap()
            .len()
    }

    async fn stored_lines(db: &Database) -> usize {
        order_lines::Entity::find()
            .all(db.connection())
            .await
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn test_admit_consumes_and_persists() {
        let (db, controller) = setup().await;
        ledger::insert(db.connection(), &QuotaKey::new(date(), 1, "North"), 5)
            .await
            .unwrap();

        let admitted = controller.admit(draft("o-1", &[(1, 3)])).await.unwrap();
        assert_eq!(admitted.order.order_id, "o-1");
        assert_eq!(admitted.lines.len(), 1);
        assert_eq!(admitted.lines[0].quota_territory, "North");
        assert_eq!(admitted.quotas[0].remaining_quantity, 2);
        assert_eq!(sold(&db, 1).await, 3);

        let stored = order_lines::Entity::find()
            .all(db.connection())
            .await
            .unwrap();
        assert_eq!(stored, admitted.lines);
    }

    #[tokio::test]
    async fn test_unallocated_product_is_rejected() {
        let (db, controller) = setup().await;

        match controller.admit(draft("o-1", &[(1, 1)])).await {
            Err(QuotaError::InsufficientQuota { remaining, .. }) => assert_eq!(remaining, 0),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(stored_orders(&db).await, 0);
    }

    #[tokio::test]
    async fn test_all_or_nothing() {
        let (db, controller) = setup().await;
        ledger::insert(db.connection(), &QuotaKey::new(date(), 1, "North"), 10)
            .await
            .unwrap();
        ledger::insert(db.connection(), &QuotaKey::new(date(), 2, "North"), 2)
            .await
            .unwrap();

        match controller.admit(draft("o-1", &[(1, 5), (2, 3)])).await {
            Err(QuotaError::InsufficientQuota {
                key,
                requested,
                remaining,
            }) => {
                assert_eq!(key.product_id, 2);
                assert_eq!(requested, 3);
                assert_eq!(remaining, 2);
            }
            other => panic!("unexpected result: {other:?}"),
        }

        assert_eq!(sold(&db, 1).await, 0);
        assert_eq!(sold(&db, 2).await, 0);
        assert_eq!(stored_orders(&db).await, 0);
        assert_eq!(stored_lines(&db).await, 0);
    }

    #[tokio::test]
    async fn test_rejection_names_first_failing_line() {
        let (db, controller) = setup().await;
        ledger::insert(db.connection(), &QuotaKey::new(date(), 1, "North"), 1)
            .await
            .unwrap();
        ledger::insert(db.connection(), &QuotaKey::new(date(), 2, "North"), 1)
            .await
            .unwrap();

        // Product 2 is submitted first, so it is the one reported
        match controller.admit(draft("o-1", &[(2, 4), (1, 4)])).await {
            Err(QuotaError::InsufficientQuota { key, .. }) => assert_eq!(key.product_id, 2),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_product_lines_are_summed() {
        let (db, controller) = setup().await;
        ledger::insert(db.connection(), &QuotaKey::new(date(), 1, "North"), 5)
            .await
            .unwrap();

        // 3 + 3 exceeds 5 even though each line alone fits
        match controller.admit(draft("o-1", &[(1, 3), (1, 3)])).await {
            Err(QuotaError::InsufficientQuota {
                requested,
                remaining,
                ..
            }) => {
                assert_eq!(requested, 6);
                assert_eq!(remaining, 5);
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let admitted = controller
            .admit(draft("o-2", &[(1, 2), (1, 3)]))
            .await
            .unwrap();
        assert_eq!(admitted.lines.len(), 2);
        assert_eq!(admitted.lines[1].line_no, 2);
        assert_eq!(sold(&db, 1).await, 5);
    }

    #[tokio::test]
    async fn test_invalid_lines() {
        let (_db, controller) = setup().await;
        assert!(matches!(
            controller.admit(draft("o-1", &[])).await,
            Err(QuotaError::EmptyOrder)
        ));
        assert!(matches!(
            controller.admit(draft("o-1", &[(1, 0)])).await,
            Err(QuotaError::InvalidQuantity(_))
        ));
        assert!(matches!(
            controller.admit(draft("o-1", &[(1, -2)])).await,
            Err(QuotaError::InvalidQuantity(_))
        ));
    }

    #[tokio::test]
    async fn test_overflowing_total_is_rejected() {
        let (db, controller) = setup().await;
        ledger::insert(db.connection(), &QuotaKey::new(date(), 1, "North"), 10)
            .await
            .unwrap();

        assert!(matches!(
            controller
                .admit(draft("o-1", &[(1, i64::MAX), (1, i64::MAX)]))
                .await,
            Err(QuotaError::InvalidQuantity(_))
        ));
        assert_eq!(sold(&db, 1).await, 0);
        assert_eq!(stored_orders(&db).await, 0);
    }

    #[tokio::test]
    async fn test_request_key_reuse_is_reported() {
        let (db, controller) = setup().await;
        ledger::insert(db.connection(), &QuotaKey::new(date(), 1, "North"), 10)
            .await
            .unwrap();

        let mut first = draft("o-1", &[(1, 2)]);
        first.request_key = Some("req-1".to_string());
        controller.admit(first).await.unwrap();

        let mut second = draft("o-2", &[(1, 2)]);
        second.request_key = Some("req-1".to_string());
        assert!(matches!(
            controller.admit(second).await,
            Err(QuotaError::DuplicateRequestKey(k)) if k == "req-1"
        ));
        // The losing attempt consumed nothing
        assert_eq!(sold(&db, 1).await, 2);
    }
}

//! Order lifecycle: create, get, list and delete
//!
//! Creation validates parties and products, then hands the order to the
//! admission controller. Deletion returns every line's quantity to the quota it
//! was drawn from, in the same transaction that removes the order.

use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::{
    entity::*, query::*, ConnectionTrait, DatabaseTransaction, DbBackend, PaginatorTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::admission::{self, AdmissionController, OrderDraft};
use crate::database::{finish, mutation_error, with_read_retry, Database};
use crate::directory::Directory;
use crate::entity::{order_lines, orders};
use crate::error::{QuotaError, Result};
use crate::ledger::{self, QuotaKey, QuotaRecord};

const DEFAULT_PAGE_SIZE: u64 = 50;
const MAX_PAGE_SIZE: u64 = 500;

/// Who placed the order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActorRole {
    #[default]
    Tso,
    Dealer,
    Admin,
}

impl ActorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorRole::Tso => "TSO",
            ActorRole::Dealer => "DEALER",
            ActorRole::Admin => "ADMIN",
        }
    }
}

/// Where the order came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    #[default]
    Web,
    Mobile,
    Import,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Web => "WEB",
            Channel::Mobile => "MOBILE",
            Channel::Import => "IMPORT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLineRequest {
    pub product_id: i64,
    pub quantity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub date: NaiveDate,
    pub territory: String,
    pub dealer_id: i64,
    pub lines: Vec<OrderLineRequest>,
    pub created_by: String,
    #[serde(default)]
    pub actor_role: ActorRole,
    #[serde(default)]
    pub channel: Channel,
    /// Client idempotency key; a repeated key returns the original order
    #[serde(default)]
    pub request_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedOrder {
    pub order_id: String,
    pub line_count: usize,
    /// True when an earlier order with the same request key was returned
    pub replayed: bool,
    /// Quota state right after admission; empty for replays
    pub quotas: Vec<QuotaRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLineView {
    pub line_no: i32,
    pub product_id: i64,
    pub product_name: Option<String>,
    pub quantity: i64,
    pub quota: QuotaKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderView {
    pub order_id: String,
    pub request_key: Option<String>,
    pub dealer_id: i64,
    pub dealer_name: Option<String>,
    pub territory: String,
    pub order_date: NaiveDate,
    pub created_by: String,
    pub actor_role: String,
    pub channel: String,
    pub created_at: DateTime<Utc>,
    pub lines: Vec<OrderLineView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSummary {
    pub order_id: String,
    pub dealer_id: i64,
    pub territory: String,
    pub order_date: NaiveDate,
    pub created_by: String,
    pub actor_role: String,
    pub channel: String,
    pub created_at: DateTime<Utc>,
    pub line_count: usize,
    pub total_quantity: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderFilter {
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub territory: Option<String>,
    #[serde(default)]
    pub dealer_id: Option<i64>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoredLine {
    pub line_no: i32,
    pub quota: QuotaKey,
    pub quantity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletedOrder {
    pub order_id: String,
    pub restored: Vec<RestoredLine>,
}

/// Order lifecycle manager
pub struct OrderManager {
    db: Arc<Database>,
    directory: Arc<dyn Directory>,
    admission: AdmissionController,
    admission_timeout: Duration,
}

impl OrderManager {
    pub fn new(
        db: Arc<Database>,
        directory: Arc<dyn Directory>,
        admission_timeout: Duration,
    ) -> Self {
        Self {
            admission: AdmissionController::new(db.clone()),
            db,
            directory,
            admission_timeout,
        }
    }

    /// Validate, admit and persist a new order.
    ///
    /// Without a request key, retrying after `UnknownOutcome` may create a second
    /// order; callers should look the order up first.
    pub async fn create(&self, request: CreateOrderRequest) -> Result<CreatedOrder> {
        admission::validate_lines(&request.lines)?;
        self.validate_parties(&request).await?;

        if let Some(request_key) = &request.request_key {
            if let Some(existing) = self.find_by_request_key(request_key).await? {
                info!(
                    "Request key {} already produced order {}, replaying",
                    request_key, existing.order_id
                );
                return Ok(existing);
            }
        }

        let draft = OrderDraft {
            order_id: Uuid::new_v4().to_string(),
            request_key: request.request_key,
            date: request.date,
            territory: request.territory,
            dealer_id: request.dealer_id,
            created_by: request.created_by,
            actor_role: request.actor_role,
            channel: request.channel,
            lines: request.lines,
        };
        let order_id = draft.order_id.clone();

        match tokio::time::timeout(self.admission_timeout, self.admission.admit(draft)).await {
            Ok(Ok(admitted)) => Ok(CreatedOrder {
                order_id: admitted.order.order_id,
                line_count: admitted.lines.len(),
                replayed: false,
                quotas: admitted.quotas,
            }),
            Ok(Err(QuotaError::DuplicateRequestKey(request_key))) => {
                // A concurrent request with the same key committed first
                self.find_by_request_key(&request_key).await?.ok_or_else(|| {
                    QuotaError::UnknownOutcome(format!(
                        "request key {} conflicted but no order holds it",
                        request_key
                    ))
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    "Admission of order {} timed out after {:?}",
                    order_id, self.admission_timeout
                );
                Err(QuotaError::UnknownOutcome(format!(
                    "admission of order {} timed out after {:?}; look the order up before retrying",
                    order_id, self.admission_timeout
                )))
            }
        }
    }

    /// Order with its lines and display data
    pub async fn get(&self, order_id: &str) -> Result<OrderView> {
        let conn = self.db.connection();

        let order = with_read_retry("order lookup", || {
            orders::Entity::find_by_id(order_id.to_string()).one(conn)
        })
        .await?
        .ok_or_else(|| QuotaError::OrderNotFound(order_id.to_string()))?;

        let lines = with_read_retry("order lines lookup", || {
            order_lines::Entity::find()
                .filter(order_lines::Column::OrderId.eq(order_id))
                .order_by_asc(order_lines::Column::LineNo)
                .all(conn)
        })
        .await?;

        let dealer_name = match self.directory.resolve_dealer(order.dealer_id).await {
            Ok(dealer) => dealer.map(|d| d.name),
            Err(e) => {
                warn!("Failed to resolve dealer {}: {}", order.dealer_id, e);
                None
            }
        };

        let mut line_views = Vec::with_capacity(lines.len());
        for line in lines {
            let product_name = match self.directory.resolve_product(line.product_id).await {
                Ok(product) => product.map(|p| p.name),
                Err(e) => {
                    warn!("Failed to resolve product {}: {}", line.product_id, e);
                    None
                }
            };
            line_views.push(OrderLineView {
                line_no: line.line_no,
                product_id: line.product_id,
                product_name,
                quantity: line.quantity,
                quota: line_key(&line),
            });
        }

        Ok(OrderView {
            order_id: order.order_id,
            request_key: order.request_key,
            dealer_id: order.dealer_id,
            dealer_name,
            territory: order.territory,
            order_date: order.order_date,
            created_by: order.created_by,
            actor_role: order.actor_role,
            channel: order.channel,
            created_at: order.created_at,
            lines: line_views,
        })
    }

    /// Delete an order and return its quantities to the quota ledger
    pub async fn delete(&self, order_id: &str) -> Result<DeletedOrder> {
        let txn = self.db.begin().await.map_err(mutation_error)?;
        let result = delete_in_txn(&txn, order_id).await;
        let deleted = finish(txn, result).await?;

        info!(
            "Order {} deleted, {} units restored across {} lines",
            order_id,
            deleted.restored.iter().map(|r| r.quantity).sum::<i64>(),
            deleted.restored.len()
        );
        Ok(deleted)
    }

    /// Newest first
    pub async fn list(&self, filter: &OrderFilter) -> Result<Vec<OrderSummary>> {
        let conn = self.db.connection();
        let limit = filter.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = filter.offset.unwrap_or(0);

        let mut select = orders::Entity::find();
        if let Some(date) = filter.date {
            select = select.filter(orders::Column::OrderDate.eq(date));
        }
        if let Some(territory) = &filter.territory {
            select = select.filter(orders::Column::Territory.eq(territory.as_str()));
        }
        if let Some(dealer_id) = filter.dealer_id {
            select = select.filter(orders::Column::DealerId.eq(dealer_id));
        }
        if let Some(created_by) = &filter.created_by {
            select = select.filter(orders::Column::CreatedBy.eq(created_by.as_str()));
        }
        let select = select
            .order_by_desc(orders::Column::CreatedAt)
            .order_by_asc(orders::Column::OrderId)
            .offset(offset)
            .limit(limit);

        let orders = with_read_retry("order listing", || select.clone().all(conn))
            .await?;
        if orders.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = orders.iter().map(|o| o.order_id.clone()).collect();
        let lines = with_read_retry("order listing lines", || {
            order_lines::Entity::find()
                .filter(order_lines::Column::OrderId.is_in(ids.clone()))
                .all(conn)
        })
        .await?;

        let mut totals: HashMap<String, (usize, i64)> = HashMap::new();
        for line in lines {
            let entry = totals.entry(line.order_id).or_insert((0, 0));
            entry.0 += 1;
            entry.1 = entry.1.saturating_add(line.quantity);
        }

        Ok(orders
            .into_iter()
            .map(|order| {
                let (line_count, total_quantity) =
                    totals.get(&order.order_id).copied().unwrap_or((0, 0));
                OrderSummary {
                    order_id: order.order_id,
                    dealer_id: order.dealer_id,
                    territory: order.territory,
                    order_date: order.order_date,
                    created_by: order.created_by,
                    actor_role: order.actor_role,
                    channel: order.channel,
                    created_at: order.created_at,
                    line_count,
                    total_quantity,
                }
            })
            .collect())
    }

    async fn validate_parties(&self, request: &CreateOrderRequest) -> Result<()> {
        let dealer = self
            .directory
            .resolve_dealer(request.dealer_id)
            .await?
            .ok_or(QuotaError::UnknownDealer(request.dealer_id))?;
        if dealer.territory != request.territory {
            return Err(QuotaError::TerritoryMismatch {
                dealer_id: dealer.id,
                dealer_territory: dealer.territory,
                territory: request.territory.clone(),
            });
        }
        for line in &request.lines {
            if self.directory.resolve_product(line.product_id).await?.is_none() {
                return Err(QuotaError::UnknownProduct(line.product_id));
            }
        }
        Ok(())
    }

    async fn find_by_request_key(&self, request_key: &str) -> Result<Option<CreatedOrder>> {
        let conn = self.db.connection();
        let order = with_read_retry("request key lookup", || {
            orders::Entity::find()
                .filter(orders::Column::RequestKey.eq(request_key))
                .one(conn)
        })
        .await?;

        let Some(order) = order else {
            return Ok(None);
        };

        let line_count = with_read_retry("request key line count", || {
            order_lines::Entity::find()
                .filter(order_lines::Column::OrderId.eq(order.order_id.as_str()))
                .count(conn)
        })
        .await?;

        Ok(Some(CreatedOrder {
            order_id: order.order_id,
            line_count: line_count as usize,
            replayed: true,
            quotas: Vec::new(),
        }))
    }
}

fn line_key(line: &order_lines::Model) -> QuotaKey {
    QuotaKey::new(line.quota_date, line.quota_product_id, line.quota_territory.clone())
}

async fn delete_in_txn(txn: &DatabaseTransaction, order_id: &str) -> Result<DeletedOrder> {
    let mut select = orders::Entity::find_by_id(order_id.to_string());
    if txn.get_database_backend() != DbBackend::Sqlite {
        select = select.lock_exclusive();
    }
    let order = select
        .one(txn)
        .await
        .map_err(mutation_error)?
        .ok_or_else(|| QuotaError::OrderNotFound(order_id.to_string()))?;

    let lines = order_lines::Entity::find()
        .filter(order_lines::Column::OrderId.eq(order.order_id.as_str()))
        .order_by_asc(order_lines::Column::LineNo)
        .all(txn)
        .await
        .map_err(mutation_error)?;

    // The row delete doubles as the existence check against a concurrent delete
    let removed = orders::Entity::delete_by_id(order.order_id.clone())
        .exec(txn)
        .await
        .map_err(mutation_error)?;
    if removed.rows_affected != 1 {
        return Err(QuotaError::OrderNotFound(order_id.to_string()));
    }
    order_lines::Entity::delete_many()
        .filter(order_lines::Column::OrderId.eq(order.order_id.as_str()))
        .exec(txn)
        .await
        .map_err(mutation_error)?;

    let mut restore: BTreeMap<QuotaKey, i64> = BTreeMap::new();
    for line in &lines {
        *restore.entry(line_key(line)).or_insert(0) += line.quantity;
    }
    for (key, quantity) in &restore {
        if !ledger::try_restore(txn, key, *quantity)
            .await
            .map_err(mutation_error)?
        {
            let sold = ledger::lookup(txn, key).await.map_err(mutation_error)?.sold();
            return Err(QuotaError::LedgerInconsistent(format!(
                "order {} cannot return {} units to quota {} with {} sold",
                order_id, quantity, key, sold
            )));
        }
    }

    Ok(DeletedOrder {
        order_id: order.order_id,
        restored: lines
            .iter()
            .map(|line| RestoredLine {
                line_no: line.line_no,
                quota: line_key(line),
                quantity: line.quantity,
            })
            .collect(),
    })
}

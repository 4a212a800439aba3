//! Quota ledger store primitives
//!
//! Every change to `sold_quantity` or `max_quantity` is one guarded conditional
//! UPDATE. The affected-row count is the compare-and-swap result, so the
//! read-remaining / compute / write sequence never happens in application memory.
//! Callers run these inside a transaction and resolve a failed guard by reading
//! the row again through the same transaction.

use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{entity::*, query::*, ConnectionTrait, DbBackend, DbErr};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::entity::quotas;

/// Identity of one quota row: one product, one territory, one calendar day
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuotaKey {
    pub date: NaiveDate,
    pub product_id: i64,
    pub territory: String,
}

impl QuotaKey {
    pub fn new(date: NaiveDate, product_id: i64, territory: impl Into<String>) -> Self {
        Self {
            date,
            product_id,
            territory: territory.into(),
        }
    }

    fn condition(&self) -> Condition {
        Condition::all()
            .add(quotas::Column::QuotaDate.eq(self.date))
            .add(quotas::Column::ProductId.eq(self.product_id))
            .add(quotas::Column::Territory.eq(self.territory.as_str()))
    }
}

impl fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.date, self.product_id, self.territory)
    }
}

/// Quota row as exposed to callers, with the derived remaining quantity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub date: NaiveDate,
    pub product_id: i64,
    pub territory: String,
    pub max_quantity: i64,
    pub sold_quantity: i64,
    pub remaining_quantity: i64,
    pub updated_at: DateTime<Utc>,
}

impl QuotaRecord {
    pub fn key(&self) -> QuotaKey {
        QuotaKey::new(self.date, self.product_id, self.territory.clone())
    }
}

impl From<quotas::Model> for QuotaRecord {
    fn from(model: quotas::Model) -> Self {
        Self {
            remaining_quantity: model.remaining_quantity(),
            date: model.quota_date,
            product_id: model.product_id,
            territory: model.territory,
            max_quantity: model.max_quantity,
            sold_quantity: model.sold_quantity,
            updated_at: model.updated_at,
        }
    }
}

/// Result of a quota lookup. A missing row means nothing may be sold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaAvailability {
    Allocated(quotas::Model),
    Unallocated,
}

impl QuotaAvailability {
    pub fn remaining(&self) -> i64 {
        match self {
            QuotaAvailability::Allocated(model) => model.remaining_quantity(),
            QuotaAvailability::Unallocated => 0,
        }
    }

    pub fn sold(&self) -> i64 {
        match self {
            QuotaAvailability::Allocated(model) => model.sold_quantity,
            QuotaAvailability::Unallocated => 0,
        }
    }

    pub fn into_model(self) -> Option<quotas::Model> {
        match self {
            QuotaAvailability::Allocated(model) => Some(model),
            QuotaAvailability::Unallocated => None,
        }
    }
}

/// Read a quota row
pub async fn lookup<C>(conn: &C, key: &QuotaKey) -> Result<QuotaAvailability, DbErr>
where
    C: ConnectionTrait,
{
    let found = quotas::Entity::find()
        .filter(key.condition())
        .one(conn)
        .await?;
    Ok(found.map_or(QuotaAvailability::Unallocated, QuotaAvailability::Allocated))
}

/// Read a quota row and hold its row lock until the surrounding transaction ends.
///
/// SQLite has no row locks; it serializes writers on the whole database instead.
pub async fn lookup_for_update<C>(conn: &C, key: &QuotaKey) -> Result<QuotaAvailability, DbErr>
where
    C: ConnectionTrait,
{
    let mut select = quotas::Entity::find().filter(key.condition());
    if conn.get_database_backend() != DbBackend::Sqlite {
        select = select.lock_exclusive();
    }
    let found = select.one(conn).await?;
    Ok(found.map_or(QuotaAvailability::Unallocated, QuotaAvailability::Allocated))
}

/// `sold += quantity` if it stays within `max`. Returns false when the guard fails
/// or the row does not exist.
pub async fn try_consume<C>(conn: &C, key: &QuotaKey, quantity: i64) -> Result<bool, DbErr>
where
    C: ConnectionTrait,
{
    let result = quotas::Entity::update_many()
        .col_expr(
            quotas::Column::SoldQuantity,
            Expr::col(quotas::Column::SoldQuantity).add(quantity),
        )
        .col_expr(quotas::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(key.condition())
        .filter(
            Expr::col(quotas::Column::SoldQuantity)
                .lte(Expr::col(quotas::Column::MaxQuantity).sub(quantity)),
        )
        .exec(conn)
        .await?;
    Ok(result.rows_affected == 1)
}

/// `sold -= quantity` if it stays non-negative
pub async fn try_restore<C>(conn: &C, key: &QuotaKey, quantity: i64) -> Result<bool, DbErr>
where
    C: ConnectionTrait,
{
    let result = quotas::Entity::update_many()
        .col_expr(
            quotas::Column::SoldQuantity,
            Expr::col(quotas::Column::SoldQuantity).sub(quantity),
        )
        .col_expr(quotas::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(key.condition())
        .filter(quotas::Column::SoldQuantity.gte(quantity))
        .exec(conn)
        .await?;
    Ok(result.rows_affected == 1)
}

/// `max = max_quantity` if nothing beyond it has been sold.
///
/// MySQL reports changed rows rather than matched rows, so a no-op update also
/// returns false; callers re-read to tell it apart from a failed guard.
pub async fn try_set_max<C>(conn: &C, key: &QuotaKey, max_quantity: i64) -> Result<bool, DbErr>
where
    C: ConnectionTrait,
{
    let result = quotas::Entity::update_many()
        .col_expr(quotas::Column::MaxQuantity, Expr::value(max_quantity))
        .col_expr(quotas::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(key.condition())
        .filter(quotas::Column::SoldQuantity.lte(max_quantity))
        .exec(conn)
        .await?;
    Ok(result.rows_affected == 1)
}

/// Delete the row only while nothing has been sold against it
pub async fn try_remove<C>(conn: &C, key: &QuotaKey) -> Result<bool, DbErr>
where
    C: ConnectionTrait,
{
    let result = quotas::Entity::delete_many()
        .filter(key.condition())
        .filter(quotas::Column::SoldQuantity.eq(0))
        .exec(conn)
        .await?;
    Ok(result.rows_affected == 1)
}

/// Insert a fresh row with nothing sold. Fails with a unique violation if the
/// key already exists.
pub async fn insert<C>(conn: &C, key: &QuotaKey, max_quantity: i64) -> Result<quotas::Model, DbErr>
where
    C: ConnectionTrait,
{
    let now = Utc::now();
    let row = quotas::ActiveModel {
        quota_date: Set(key.date),
        product_id: Set(key.product_id),
        territory: Set(key.territory.clone()),
        max_quantity: Set(max_quantity),
        sold_quantity: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
    };
    row.insert(conn).await
}

/// Filtered listing for one day
pub async fn find<C>(
    conn: &C,
    date: NaiveDate,
    territory: Option<&str>,
    product_id: Option<i64>,
) -> Result<Vec<quotas::Model>, DbErr>
where
    C: ConnectionTrait,
{
    let mut select = quotas::Entity::find().filter(quotas::Column::QuotaDate.eq(date));
    if let Some(territory) = territory {
        select = select.filter(quotas::Column::Territory.eq(territory));
    }
    if let Some(product_id) = product_id {
        select = select.filter(quotas::Column::ProductId.eq(product_id));
    }
    select
        .order_by_asc(quotas::Column::Territory)
        .order_by_asc(quotas::Column::ProductId)
        .all(conn)
        .await
}

//! orders entity
//! Committed orders; rows are only ever inserted or deleted whole

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub order_id: String,  // UUID v4
    #[sea_orm(unique)]
    pub request_key: Option<String>,  // client idempotency key
    #[sea_orm(indexed)]
    pub dealer_id: i64,
    pub territory: String,
    #[sea_orm(indexed)]
    pub order_date: Date,
    pub created_by: String,
    pub actor_role: String,  // TSO, DEALER, ADMIN
    pub channel: String,  // WEB, MOBILE, IMPORT
    #[sea_orm(column_type = "TimestampWithTimeZone")]
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_lines::Entity")]
    OrderLines,
}

impl Related<super::order_lines::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderLines.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

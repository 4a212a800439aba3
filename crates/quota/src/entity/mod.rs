//! Sea-ORM entities for the quota ledger and order ledger tables

pub mod order_lines;
pub mod orders;
pub mod quotas;

// Re-export entities for convenience
pub use order_lines::Entity as OrderLines;
pub use orders::Entity as Orders;
pub use quotas::Entity as Quotas;

//! Quota ledger and order admission for the distributor order service
//!
//! This crate provides:
//! - Sea-ORM entities for the quota ledger and the order ledger
//! - Quota allocation (single, bulk, removal, queries)
//! - All-or-nothing order admission against daily per-product, per-territory quotas
//! - Order lifecycle (create, get, list, delete with quota restoration)
//! - HTTP+JSON service exposing the operations above
//!
//! Can be used as a library or standalone binary

pub mod admission;
pub mod allocator;
pub mod config;
pub mod database;
pub mod directory;
pub mod entity;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod orders;
pub mod service;

// Re-export commonly used types
pub use admission::{AdmissionController, AdmittedOrder, OrderDraft};
pub use allocator::{AllocationRequest, BulkAllocationOutcome, QuotaAllocator, QuotaQuery};
pub use config::{DatabaseConfig, ServiceConfig};
pub use database::Database;
pub use directory::{Dealer, Directory, Product, StaticDirectory};
pub use error::{ErrorCategory, QuotaError, Result};
pub use ledger::{QuotaAvailability, QuotaKey, QuotaRecord};
pub use orders::{CreateOrderRequest, OrderFilter, OrderLineRequest, OrderManager};
pub use service::{AppState, QuotaServiceRunner};

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shiftledger shared types
//!
//! Types owned by the tenant-management side of the product that the billing
//! engine reads and transitions, plus the Postgres pool and migration helpers
//! used by every binary.

pub mod db;
pub mod tenant;

pub use db::{create_pool, run_migrations, DbConfig};
pub use tenant::{ParseTenantStatusError, Tenant, TenantStatus};

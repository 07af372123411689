#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! EnrollHub Shared
//!
//! Types and helpers used by both the engine library and the worker:
//! coverage tiers, basis-point money math, and Postgres pool setup.

pub mod db;
pub mod money;
pub mod types;

pub use db::{create_pool, run_migrations, DbError};
pub use money::{apply_bps_half_up, BPS_DENOMINATOR};
pub use types::CoverageTier;

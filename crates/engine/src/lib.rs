// Engine crate clippy configuration
#![allow(clippy::result_large_err)] // EngineError carries codes and timestamps for actionable rejections
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! EnrollHub Pricing & Commission Engine
//!
//! Prices membership enrollments and turns their first activation into a
//! chain of commissions walked up a concurrently edited agent hierarchy.
//!
//! ## Features
//!
//! - **Discount Codes**: Validate and consume codes with usage caps and windows
//! - **Pricing**: Monthly charge from plan, add-ons, discount and processing fee
//! - **Agent Hierarchy**: Upline reassignment with cycle prevention and level cascade
//! - **Commissions**: Direct plus override commissions, exactly once per enrollment
//! - **Enrollment Reconciler**: Payment, consent and cancel events drive activation
//! - **Invariants**: Read-only consistency checks over persisted state

pub mod commission;
pub mod config;
pub mod discount;
pub mod enrollment;
pub mod error;
pub mod hierarchy;
pub mod invariants;
pub mod pricing;
pub mod retry;
pub mod store;


use std::sync::Arc;

use sqlx::PgPool;

// Commissions
pub use commission::{
    ActivationOutcome, Commission, CommissionEngine, CommissionRole, CommissionStatus,
    CommissionTotals,
};

// Config
pub use config::EngineConfig;

// Discounts
pub use discount::{
    AppliedDiscount, DiscountCode, DiscountConsumption, DiscountDuration, DiscountService,
    DiscountShape, DiscountTerms, DiscountValidation,
};

// Enrollments
pub use enrollment::{
    ConsentRecord, ConsentResolution, Enrollment, EnrollmentReconciler, EnrollmentStatus,
    NewEnrollment, PaymentEvent, PaymentOutcome, PendingReason, ReconcileOutcome, StatusChange,
};

// Error
pub use error::{EngineError, EngineResult};

// Hierarchy
pub use hierarchy::{
    Agent, AgentHierarchy, HierarchyService, NewAgent, OverrideRateBounds, ReassignmentResult,
    UplineChange,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Pricing
pub use pricing::{AddOn, AddOnPrices, Plan, PriceBreakdown, PricingCalculator};

// Store
pub use store::{BatchOutcome, EngineStore, MemoryStore, PgStore};

/// Combined engine services over one store
pub struct EnrollmentEngine<S> {
    pub config: EngineConfig,
    pub store: Arc<S>,
    pub discounts: DiscountService<S>,
    pub pricing: PricingCalculator,
    pub hierarchy: HierarchyService<S>,
    pub commissions: CommissionEngine<S>,
    pub reconciler: EnrollmentReconciler<S>,
    pub invariants: InvariantChecker<S>,
}

impl<S: EngineStore> EnrollmentEngine<S> {
    /// Create the engine with explicit config
    pub fn new(config: EngineConfig, store: Arc<S>) -> Self {
        let retry = config.retry_policy();
        let pricing = PricingCalculator::new(config.processing_fee_bps);
        let discounts = DiscountService::new(Arc::clone(&store), retry);
        let commissions =
            CommissionEngine::new(Arc::clone(&store), config.max_hierarchy_depth, retry);
        let hierarchy = HierarchyService::new(
            Arc::clone(&store),
            OverrideRateBounds {
                min_cents: config.override_rate_min_cents,
                max_cents: config.override_rate_max_cents,
            },
            retry,
        );
        let reconciler = EnrollmentReconciler::new(
            Arc::clone(&store),
            discounts.clone(),
            pricing,
            commissions.clone(),
            retry,
        );

        Self {
            invariants: InvariantChecker::new(Arc::clone(&store)),
            config,
            store,
            discounts,
            pricing,
            hierarchy,
            commissions,
            reconciler,
        }
    }
}

impl EnrollmentEngine<MemoryStore> {
    /// Engine over an empty in-process store
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(config, Arc::new(MemoryStore::new()))
    }
}

impl EnrollmentEngine<PgStore> {
    /// Create the engine from environment variables over a Postgres pool
    pub fn from_env(pool: PgPool) -> Self {
        Self::new(EngineConfig::from_env(), Arc::new(PgStore::new(pool)))
    }
}

//! Persistence seam
//!
//! Every write the engine makes is conditional: on a usage counter, a
//! hierarchy version, an enrollment version, a commission status or the
//! absence of a direct commission. Implementations must apply each
//! conditional write atomically and report whether it took effect.

mod memory;
mod postgres;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::commission::{Commission, CommissionStatus};
use crate::discount::DiscountCode;
use crate::enrollment::Enrollment;
use crate::error::EngineResult;
use crate::hierarchy::{Agent, HierarchyEdit, HierarchySnapshot};
use crate::pricing::{AddOn, Plan};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Result of a commission batch insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every row in the batch was written
    Inserted,
    /// A direct commission for the enrollment already existed; nothing written
    AlreadyExists,
}

#[async_trait]
pub trait EngineStore: Send + Sync + 'static {
    // Catalog

    async fn plan(&self, id: Uuid) -> EngineResult<Option<Plan>>;

    /// Add-ons among `ids` that exist; missing ids are simply absent
    async fn add_ons(&self, ids: &[Uuid]) -> EngineResult<Vec<AddOn>>;

    async fn agent(&self, id: Uuid) -> EngineResult<Option<Agent>>;

    // Discount codes

    /// Look up by normalized code
    async fn discount_code(&self, code: &str) -> EngineResult<Option<DiscountCode>>;

    /// Increment `current_uses` only if it still equals `expected_uses` and
    /// stays within `max_uses`
    async fn compare_and_swap_uses(&self, id: Uuid, expected_uses: i32) -> EngineResult<bool>;

    async fn list_discount_codes(&self) -> EngineResult<Vec<DiscountCode>>;

    // Hierarchy

    /// All agents read at one point in time
    async fn hierarchy_snapshot(&self) -> EngineResult<HierarchySnapshot>;

    /// Write the edit and bump the version, only if the version is unchanged
    async fn commit_hierarchy_edit(&self, edit: HierarchyEdit) -> EngineResult<bool>;

    // Enrollments

    async fn enrollment(&self, id: Uuid) -> EngineResult<Option<Enrollment>>;

    async fn insert_enrollment(&self, enrollment: &Enrollment) -> EngineResult<()>;

    /// Replace the stored enrollment if its version is still `expected_version`
    async fn update_enrollment(
        &self,
        enrollment: &Enrollment,
        expected_version: i64,
    ) -> EngineResult<bool>;

    /// Flip an enrollment to its first activation and write its commissions
    /// in one step, only if its version is still `expected_version`
    ///
    /// Returns `false` with nothing written when the version moved. A batch
    /// that collides with existing commission rows is a `Conflict` and
    /// nothing is written.
    async fn activate_enrollment(
        &self,
        enrollment: &Enrollment,
        expected_version: i64,
        batch: &[Commission],
    ) -> EngineResult<bool>;

    /// Enrollments marked as commissioned that have no direct commission
    async fn commissioned_enrollments_without_direct(&self) -> EngineResult<Vec<Uuid>>;

    /// Enrollments carrying commissions without a first-activation marker
    async fn commissions_without_activation(&self) -> EngineResult<Vec<Uuid>>;

    // Commissions

    async fn has_direct_commission(&self, enrollment_id: Uuid) -> EngineResult<bool>;

    /// Insert the whole batch, or nothing if the enrollment already has a
    /// direct commission
    async fn insert_commission_batch(&self, batch: &[Commission]) -> EngineResult<BatchOutcome>;

    async fn commissions_for_enrollment(&self, enrollment_id: Uuid)
        -> EngineResult<Vec<Commission>>;

    /// Commissions for an agent created in `[from, to)`
    async fn commissions_for_agent(
        &self,
        agent_id: Uuid,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> EngineResult<Vec<Commission>>;

    async fn commission(&self, id: Uuid) -> EngineResult<Option<Commission>>;

    /// Set the status if it is still `expected`
    async fn update_commission_status(
        &self,
        id: Uuid,
        expected: CommissionStatus,
        next: CommissionStatus,
    ) -> EngineResult<bool>;
}

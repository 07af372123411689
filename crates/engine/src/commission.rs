//! Commission engine
//!
//! Turns a qualifying enrollment activation into one direct commission for
//! the enrolling agent plus one override commission per eligible upline.
//!
//! ## Guarantees
//!
//! - **Exactly once per enrollment**: the store inserts the whole set as one
//!   batch and refuses it if a direct commission for the enrollment already
//!   exists, so duplicate webhook deliveries resolve to `NoOp`.
//! - **One snapshot**: the upline walk runs on a single hierarchy read, never
//!   on per-ancestor queries that could straddle an admin edit.
//! - **All or nothing**: if the hierarchy cannot be read nothing is written;
//!   the direct commission is never paid without its overrides.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::enrollment::{Enrollment, EnrollmentStatus};
use crate::error::{EngineError, EngineResult};
use crate::hierarchy::AgentHierarchy;
use crate::pricing::Plan;
use crate::retry::RetryPolicy;
use crate::store::{BatchOutcome, EngineStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionRole {
    /// Paid to the agent who enrolled the member
    Direct,
    /// Paid to an upline of the enrolling agent
    Override,
}

impl CommissionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommissionRole::Direct => "direct",
            CommissionRole::Override => "override",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(CommissionRole::Direct),
            "override" => Some(CommissionRole::Override),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionStatus {
    Pending,
    Approved,
    Paid,
}

impl CommissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommissionStatus::Pending => "pending",
            CommissionStatus::Approved => "approved",
            CommissionStatus::Paid => "paid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CommissionStatus::Pending),
            "approved" => Some(CommissionStatus::Approved),
            "paid" => Some(CommissionStatus::Paid),
            _ => None,
        }
    }

    /// Commissions move forward one step at a time.
    pub fn can_advance_to(&self, next: CommissionStatus) -> bool {
        matches!(
            (self, next),
            (CommissionStatus::Pending, CommissionStatus::Approved)
                | (CommissionStatus::Approved, CommissionStatus::Paid)
        )
    }
}

impl std::fmt::Display for CommissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commission {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub agent_id: Uuid,
    pub amount_cents: i64,
    pub role: CommissionRole,
    /// 0 for the enrolling agent, then one per upline step
    pub depth: u32,
    pub status: CommissionStatus,
    pub created_at: OffsetDateTime,
}

/// What an activation produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "commissions", rename_all = "snake_case")]
pub enum ActivationOutcome {
    Created(Vec<Commission>),
    /// The enrollment was already commissioned
    NoOp,
}

impl ActivationOutcome {
    pub fn commissions(&self) -> &[Commission] {
        match self {
            ActivationOutcome::Created(commissions) => commissions,
            ActivationOutcome::NoOp => &[],
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, ActivationOutcome::NoOp)
    }
}

/// Dashboard totals for one agent over `[from, to)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommissionTotals {
    pub agent_id: Uuid,
    pub from: OffsetDateTime,
    pub to: OffsetDateTime,
    pub direct_cents: i64,
    pub override_cents: i64,
    pub total_cents: i64,
    pub commission_count: usize,
}

/// Build the full commission set for an activation
///
/// Pure: reads only the given plan and hierarchy snapshot.
pub fn build_commission_batch(
    enrollment: &Enrollment,
    plan: &Plan,
    hierarchy: &AgentHierarchy,
    max_depth: usize,
    now: OffsetDateTime,
) -> EngineResult<Vec<Commission>> {
    let agent_id = enrollment.enrolling_agent_id;
    if hierarchy.get(agent_id).is_none() {
        return Err(EngineError::AgentNotFound(agent_id));
    }

    let mut batch = vec![Commission {
        id: Uuid::new_v4(),
        enrollment_id: enrollment.id,
        agent_id,
        amount_cents: plan.direct_commission_cents,
        role: CommissionRole::Direct,
        depth: 0,
        status: CommissionStatus::Pending,
        created_at: now,
    }];

    batch.extend(
        hierarchy
            .upline_chain(agent_id, max_depth)
            .into_iter()
            .filter(|link| hierarchy.can_receive_overrides(link.agent.id))
            .map(|link| Commission {
                id: Uuid::new_v4(),
                enrollment_id: enrollment.id,
                agent_id: link.agent.id,
                amount_cents: link.agent.override_rate_cents,
                role: CommissionRole::Override,
                depth: link.depth,
                status: CommissionStatus::Pending,
                created_at: now,
            }),
    );

    Ok(batch)
}

pub(crate) fn log_created(enrollment: &Enrollment, batch: &[Commission]) {
    let total_cents: i64 = batch.iter().map(|c| c.amount_cents).sum();
    tracing::info!(
        enrollment_id = %enrollment.id,
        enrolling_agent_id = %enrollment.enrolling_agent_id,
        commissions = batch.len(),
        total_cents,
        "Created commissions for enrollment activation"
    );
}

pub struct CommissionEngine<S> {
    store: Arc<S>,
    max_depth: usize,
    retry: RetryPolicy,
}

impl<S> Clone for CommissionEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            max_depth: self.max_depth,
            retry: self.retry,
        }
    }
}

impl<S: EngineStore> CommissionEngine<S> {
    pub fn new(store: Arc<S>, max_depth: usize, retry: RetryPolicy) -> Self {
        Self {
            store,
            max_depth,
            retry,
        }
    }

    /// Materialize commissions for an enrollment's qualifying activation
    ///
    /// Safe to call any number of times for the same enrollment: only the
    /// first successful call creates rows, every later one returns `NoOp`.
    pub async fn on_enrollment_activated(
        &self,
        enrollment_id: Uuid,
    ) -> EngineResult<ActivationOutcome> {
        self.retry
            .run("on_enrollment_activated", || self.try_activate(enrollment_id))
            .await
    }

    async fn try_activate(&self, enrollment_id: Uuid) -> EngineResult<ActivationOutcome> {
        let enrollment = self
            .store
            .enrollment(enrollment_id)
            .await?
            .ok_or(EngineError::EnrollmentNotFound(enrollment_id))?;
        if enrollment.status == EnrollmentStatus::Cancelled {
            return Err(EngineError::EnrollmentCancelled(enrollment_id));
        }

        let Some(batch) = self.prepare_batch(&enrollment).await? else {
            return Ok(ActivationOutcome::NoOp);
        };

        match self.store.insert_commission_batch(&batch).await? {
            BatchOutcome::Inserted => {
                log_created(&enrollment, &batch);
                Ok(ActivationOutcome::Created(batch))
            }
            BatchOutcome::AlreadyExists => {
                tracing::info!(
                    enrollment_id = %enrollment_id,
                    "Concurrent activation already commissioned enrollment"
                );
                Ok(ActivationOutcome::NoOp)
            }
        }
    }

    /// Build the commission set for an enrollment without writing it
    ///
    /// `None` when the enrollment already has its direct commission.
    pub(crate) async fn prepare_batch(
        &self,
        enrollment: &Enrollment,
    ) -> EngineResult<Option<Vec<Commission>>> {
        if self.store.has_direct_commission(enrollment.id).await? {
            tracing::info!(enrollment_id = %enrollment.id, "Enrollment already commissioned");
            return Ok(None);
        }

        let plan = self
            .store
            .plan(enrollment.plan_id)
            .await?
            .ok_or(EngineError::PlanNotFound(enrollment.plan_id))?;

        let snapshot = self.store.hierarchy_snapshot().await.map_err(|e| {
            tracing::error!(
                enrollment_id = %enrollment.id,
                error = %e,
                "Hierarchy snapshot unavailable, refusing partial commission set"
            );
            match e {
                EngineError::Database(msg) => EngineError::Retriable(msg),
                other => other,
            }
        })?;
        let hierarchy_version = snapshot.version;
        let hierarchy = AgentHierarchy::from(snapshot);

        let batch = build_commission_batch(
            enrollment,
            &plan,
            &hierarchy,
            self.max_depth,
            OffsetDateTime::now_utc(),
        )?;
        tracing::debug!(
            enrollment_id = %enrollment.id,
            hierarchy_version,
            commissions = batch.len(),
            "Built commission batch"
        );
        Ok(Some(batch))
    }

    /// Sum an agent's commissions created in `[from, to)`
    pub async fn commission_totals(
        &self,
        agent_id: Uuid,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> EngineResult<CommissionTotals> {
        if to < from {
            return Err(EngineError::InvalidInput(format!(
                "date range ends ({}) before it starts ({})",
                to, from
            )));
        }

        let commissions = self.store.commissions_for_agent(agent_id, from, to).await?;

        let (direct_cents, override_cents) =
            commissions
                .iter()
                .fold((0_i64, 0_i64), |(direct, overrides), c| match c.role {
                    CommissionRole::Direct => (direct + c.amount_cents, overrides),
                    CommissionRole::Override => (direct, overrides + c.amount_cents),
                });

        Ok(CommissionTotals {
            agent_id,
            from,
            to,
            direct_cents,
            override_cents,
            total_cents: direct_cents + override_cents,
            commission_count: commissions.len(),
        })
    }

    pub async fn commissions_for_enrollment(
        &self,
        enrollment_id: Uuid,
    ) -> EngineResult<Vec<Commission>> {
        self.store.commissions_for_enrollment(enrollment_id).await
    }

    /// Move a commission one step along `pending -> approved -> paid`
    pub async fn advance_status(
        &self,
        commission_id: Uuid,
        next: CommissionStatus,
    ) -> EngineResult<Commission> {
        self.retry
            .run("advance_commission_status", || {
                self.try_advance(commission_id, next)
            })
            .await
    }

    async fn try_advance(
        &self,
        commission_id: Uuid,
        next: CommissionStatus,
    ) -> EngineResult<Commission> {
        let commission = self
            .store
            .commission(commission_id)
            .await?
            .ok_or(EngineError::CommissionNotFound(commission_id))?;

        if !commission.status.can_advance_to(next) {
            return Err(EngineError::InvalidStatusChange {
                from: commission.status,
                to: next,
            });
        }

        let swapped = self
            .store
            .update_commission_status(commission_id, commission.status, next)
            .await?;
        if !swapped {
            return Err(EngineError::Conflict(format!(
                "commission {} changed status concurrently",
                commission_id
            )));
        }

        tracing::info!(
            commission_id = %commission_id,
            from = %commission.status,
            to = %next,
            "Advanced commission status"
        );
        Ok(Commission {
            status: next,
            ..commission
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrollment::{EnrollmentStatus, PendingReason};
    use crate::hierarchy::Agent;
    use enrollhub_shared::CoverageTier;

    fn agent(upline: Option<&Agent>, rate: i64) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            name: "agent".into(),
            upline_agent_id: upline.map(|u| u.id),
            hierarchy_level: upline.map(|u| u.hierarchy_level + 1).unwrap_or(0),
            override_rate_cents: rate,
            override_eligible: None,
        }
    }

    fn enrollment_for(agent_id: Uuid, plan: &Plan) -> Enrollment {
        let now = OffsetDateTime::now_utc();
        Enrollment {
            id: Uuid::new_v4(),
            plan_id: plan.id,
            coverage_tier: CoverageTier::Individual,
            add_on_ids: vec![],
            applied_discount: None,
            status: EnrollmentStatus::Pending,
            pending_reason: Some(PendingReason::PaymentRequired),
            consent: None,
            enrolling_agent_id: agent_id,
            price_snapshot: None,
            first_activated_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn plan() -> Plan {
        Plan {
            id: Uuid::new_v4(),
            name: "Essentials".into(),
            base_price_cents: 10_000,
            feature_tier: "standard".into(),
            direct_commission_cents: 2_500,
        }
    }

    #[test]
    fn test_status_moves_forward_one_step() {
        use CommissionStatus::*;
        assert!(Pending.can_advance_to(Approved));
        assert!(Approved.can_advance_to(Paid));
        assert!(!Pending.can_advance_to(Paid));
        assert!(!Paid.can_advance_to(Approved));
        assert!(!Approved.can_advance_to(Approved));
    }

    #[test]
    fn test_batch_pays_each_upline_its_own_rate() {
        let c = agent(None, 300);
        let b = agent(Some(&c), 500);
        let a = agent(Some(&b), 900);
        let hierarchy = AgentHierarchy::from_agents([a.clone(), b.clone(), c.clone()]);
        let plan = plan();
        let enrollment = enrollment_for(a.id, &plan);

        let batch =
            build_commission_batch(&enrollment, &plan, &hierarchy, 16, OffsetDateTime::now_utc())
                .unwrap();

        let rows: Vec<_> = batch
            .iter()
            .map(|c| (c.agent_id, c.role, c.depth, c.amount_cents))
            .collect();
        assert_eq!(
            rows,
            vec![
                (a.id, CommissionRole::Direct, 0, 2_500),
                (b.id, CommissionRole::Override, 1, 500),
                (c.id, CommissionRole::Override, 2, 300),
            ]
        );
        assert!(batch.iter().all(|c| c.status == CommissionStatus::Pending));
    }

    #[test]
    fn test_batch_skips_disabled_upline_but_keeps_depth() {
        let root = agent(None, 300);
        let mut mid = agent(Some(&root), 500);
        mid.override_eligible = Some(false);
        let enrolling = agent(Some(&mid), 900);
        let hierarchy =
            AgentHierarchy::from_agents([root.clone(), mid.clone(), enrolling.clone()]);
        let plan = plan();
        let enrollment = enrollment_for(enrolling.id, &plan);

        let batch =
            build_commission_batch(&enrollment, &plan, &hierarchy, 16, OffsetDateTime::now_utc())
                .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].agent_id, root.id);
        assert_eq!(batch[1].depth, 2);
    }

    #[test]
    fn test_batch_stops_at_max_depth() {
        let root = agent(None, 300);
        let mid = agent(Some(&root), 500);
        let enrolling = agent(Some(&mid), 900);
        let hierarchy =
            AgentHierarchy::from_agents([root.clone(), mid.clone(), enrolling.clone()]);
        let plan = plan();
        let enrollment = enrollment_for(enrolling.id, &plan);

        let batch =
            build_commission_batch(&enrollment, &plan, &hierarchy, 1, OffsetDateTime::now_utc())
                .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].agent_id, mid.id);
        assert_eq!(batch[1].depth, 1);
    }

    #[test]
    fn test_root_enrolling_agent_gets_only_direct() {
        let solo = agent(None, 300);
        let hierarchy = AgentHierarchy::from_agents([solo.clone()]);
        let plan = plan();
        let enrollment = enrollment_for(solo.id, &plan);

        let batch =
            build_commission_batch(&enrollment, &plan, &hierarchy, 16, OffsetDateTime::now_utc())
                .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].role, CommissionRole::Direct);
    }

    #[test]
    fn test_unknown_enrolling_agent_is_rejected() {
        let hierarchy = AgentHierarchy::default();
        let plan = plan();
        let enrollment = enrollment_for(Uuid::new_v4(), &plan);
        assert!(matches!(
            build_commission_batch(&enrollment, &plan, &hierarchy, 16, OffsetDateTime::now_utc()),
            Err(EngineError::AgentNotFound(_))
        ));
    }

    #[test]
    fn test_activation_outcome_accessors() {
        assert!(ActivationOutcome::NoOp.is_noop());
        assert!(ActivationOutcome::NoOp.commissions().is_empty());
        assert!(!ActivationOutcome::Created(vec![]).is_noop());
    }
}

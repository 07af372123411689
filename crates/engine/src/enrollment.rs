//! Enrollment state reconciler
//!
//! Gates when an enrollment may trigger the commission engine.
//!
//! ```text
//!            payment succeeded / consent resolved
//!   pending ─────────────────────────────────────▶ active
//!      ▲  ◀────────────── payment failed ─────────────┘
//!      │
//!      └─ any state ── cancel ──▶ cancelled (terminal)
//! ```
//!
//! Only the first arrival in `active` snapshots the price and runs the
//! commission engine, and its commissions are written in the same store
//! operation as the status flip. Later re-activations (a renewal retry that
//! succeeds after a decline) flip the status and nothing else.

use std::sync::Arc;

use enrollhub_shared::CoverageTier;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::commission::{log_created, ActivationOutcome, CommissionEngine};
use crate::discount::{AppliedDiscount, DiscountService};
use crate::error::{EngineError, EngineResult};
use crate::pricing::{AddOn, PriceBreakdown, PricingCalculator};
use crate::retry::RetryPolicy;
use crate::store::EngineStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Pending,
    Active,
    Cancelled,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Pending => "pending",
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EnrollmentStatus::Pending),
            "active" => Some(EnrollmentStatus::Active),
            "cancelled" => Some(EnrollmentStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an enrollment is waiting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PendingReason {
    /// Initial state: no payment yet
    PaymentRequired,
    /// A charge was declined; a later successful payment resolves it
    PaymentFailed { category: String },
    /// Needs an admin consent resolution; payment alone does not resolve it
    PolicyException { detail: String },
}

impl PendingReason {
    pub fn needs_consent(&self) -> bool {
        matches!(self, PendingReason::PolicyException { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub consent_type: String,
    pub notes: String,
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub coverage_tier: CoverageTier,
    pub add_on_ids: Vec<Uuid>,
    /// Captured at enrollment time, never re-validated
    pub applied_discount: Option<AppliedDiscount>,
    pub status: EnrollmentStatus,
    pub pending_reason: Option<PendingReason>,
    pub consent: Option<ConsentRecord>,
    pub enrolling_agent_id: Uuid,
    /// Price charged at first activation
    pub price_snapshot: Option<PriceBreakdown>,
    /// Set once, on the qualifying activation
    pub first_activated_at: Option<OffsetDateTime>,
    /// Bumped on every write; writes are conditioned on it
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Enrollment {
    pub fn is_commissioned(&self) -> bool {
        self.first_activated_at.is_some()
    }
}

// Collaborator inputs

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentOutcome {
    Succeeded,
    Failed { category: String },
}

/// Payment status notification. Delivered at least once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub enrollment_id: Uuid,
    pub outcome: PaymentOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentResolution {
    pub enrollment_id: Uuid,
    pub consent_type: String,
    pub consent_notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEnrollment {
    pub plan_id: Uuid,
    pub coverage_tier: CoverageTier,
    pub add_on_ids: Vec<Uuid>,
    pub discount_code: Option<String>,
    pub enrolling_agent_id: Uuid,
}

/// Everything that can happen to an enrollment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollmentEvent {
    PaymentSucceeded,
    PaymentFailed { category: String },
    ConsentResolved { consent_type: String, notes: String },
    PolicyException { detail: String },
    Cancel,
}

impl From<PaymentOutcome> for EnrollmentEvent {
    fn from(outcome: PaymentOutcome) -> Self {
        match outcome {
            PaymentOutcome::Succeeded => EnrollmentEvent::PaymentSucceeded,
            PaymentOutcome::Failed { category } => EnrollmentEvent::PaymentFailed { category },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Activate,
    ToPending(PendingReason),
    Cancel,
    Unchanged,
}

/// Decide what an event does to an enrollment, without side effects
pub fn next_transition(
    enrollment: &Enrollment,
    event: &EnrollmentEvent,
) -> EngineResult<Transition> {
    use EnrollmentEvent as E;
    use EnrollmentStatus as S;

    match (enrollment.status, event) {
        (S::Cancelled, _) => Err(EngineError::EnrollmentCancelled(enrollment.id)),
        (_, E::Cancel) => Ok(Transition::Cancel),

        (S::Pending, E::PaymentSucceeded) => match &enrollment.pending_reason {
            Some(reason) if reason.needs_consent() => {
                Err(EngineError::ConsentRequired(enrollment.id))
            }
            _ => Ok(Transition::Activate),
        },
        (S::Active, E::PaymentSucceeded) => Ok(Transition::Unchanged),

        // A policy hold outranks a payment failure: only consent lifts it
        (S::Pending, E::PaymentFailed { .. })
            if enrollment
                .pending_reason
                .as_ref()
                .is_some_and(PendingReason::needs_consent) =>
        {
            Ok(Transition::Unchanged)
        }
        (_, E::PaymentFailed { category }) => {
            let category = category.trim();
            let category = if category.is_empty() {
                "payment_failed"
            } else {
                category
            };
            Ok(Transition::ToPending(PendingReason::PaymentFailed {
                category: category.to_string(),
            }))
        }

        (S::Pending, E::ConsentResolved {
            consent_type,
            notes,
        }) => {
            if consent_type.trim().is_empty() || notes.trim().is_empty() {
                return Err(EngineError::InvalidInput(
                    "consent type and notes are both required".to_string(),
                ));
            }
            Ok(Transition::Activate)
        }
        (S::Active, E::ConsentResolved { .. }) => Ok(Transition::Unchanged),

        (S::Pending, E::PolicyException { detail }) => {
            if detail.trim().is_empty() {
                return Err(EngineError::InvalidInput(
                    "policy exception needs a detail".to_string(),
                ));
            }
            Ok(Transition::ToPending(PendingReason::PolicyException {
                detail: detail.trim().to_string(),
            }))
        }
        (S::Active, E::PolicyException { .. }) => Err(EngineError::InvalidTransition(format!(
            "enrollment {} is active; only pending enrollments can be flagged",
            enrollment.id
        ))),
    }
}

/// What a reconcile call did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum StatusChange {
    Unchanged,
    FirstActivation {
        price: PriceBreakdown,
        commissions: ActivationOutcome,
    },
    /// Back to active after a failure; no commissions
    Reactivated,
    MovedToPending,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileOutcome {
    pub enrollment: Enrollment,
    pub change: StatusChange,
}

pub struct EnrollmentReconciler<S> {
    store: Arc<S>,
    discounts: DiscountService<S>,
    pricing: PricingCalculator,
    commissions: CommissionEngine<S>,
    retry: RetryPolicy,
}

impl<S> Clone for EnrollmentReconciler<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            discounts: self.discounts.clone(),
            pricing: self.pricing,
            commissions: self.commissions.clone(),
            retry: self.retry,
        }
    }
}

impl<S: EngineStore> EnrollmentReconciler<S> {
    pub fn new(
        store: Arc<S>,
        discounts: DiscountService<S>,
        pricing: PricingCalculator,
        commissions: CommissionEngine<S>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            discounts,
            pricing,
            commissions,
            retry,
        }
    }

    /// Create a pending enrollment
    ///
    /// A supplied discount code is consumed here, once every other input has
    /// been checked, and its terms are captured on the enrollment.
    pub async fn register_enrollment(
        &self,
        new: NewEnrollment,
        as_of: OffsetDateTime,
    ) -> EngineResult<Enrollment> {
        self.store
            .plan(new.plan_id)
            .await?
            .ok_or(EngineError::PlanNotFound(new.plan_id))?;
        self.store
            .agent(new.enrolling_agent_id)
            .await?
            .ok_or(EngineError::AgentNotFound(new.enrolling_agent_id))?;
        self.load_add_ons(&new.add_on_ids).await?;

        let applied_discount = match new.discount_code.as_deref() {
            Some(code) if !code.trim().is_empty() => {
                Some(self.discounts.consume(code, as_of).await?.applied)
            }
            _ => None,
        };

        let now = OffsetDateTime::now_utc();
        let enrollment = Enrollment {
            id: Uuid::new_v4(),
            plan_id: new.plan_id,
            coverage_tier: new.coverage_tier,
            add_on_ids: new.add_on_ids,
            applied_discount,
            status: EnrollmentStatus::Pending,
            pending_reason: Some(PendingReason::PaymentRequired),
            consent: None,
            enrolling_agent_id: new.enrolling_agent_id,
            price_snapshot: None,
            first_activated_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        self.store.insert_enrollment(&enrollment).await?;

        tracing::info!(
            enrollment_id = %enrollment.id,
            plan_id = %enrollment.plan_id,
            enrolling_agent_id = %enrollment.enrolling_agent_id,
            discount_code = ?enrollment.applied_discount.as_ref().map(|d| d.code.as_str()),
            "Registered pending enrollment"
        );
        Ok(enrollment)
    }

    /// Apply a payment notification
    pub async fn handle_payment_event(&self, event: PaymentEvent) -> EngineResult<ReconcileOutcome> {
        self.apply_event(event.enrollment_id, event.outcome.into())
            .await
    }

    /// Resolve a pending enrollment with an admin consent record
    pub async fn resolve_consent(
        &self,
        resolution: ConsentResolution,
    ) -> EngineResult<ReconcileOutcome> {
        self.apply_event(
            resolution.enrollment_id,
            EnrollmentEvent::ConsentResolved {
                consent_type: resolution.consent_type.trim().to_string(),
                notes: resolution.consent_notes.trim().to_string(),
            },
        )
        .await
    }

    /// Hold a pending enrollment until consent is recorded
    pub async fn flag_policy_exception(
        &self,
        enrollment_id: Uuid,
        detail: &str,
    ) -> EngineResult<ReconcileOutcome> {
        self.apply_event(
            enrollment_id,
            EnrollmentEvent::PolicyException {
                detail: detail.to_string(),
            },
        )
        .await
    }

    pub async fn cancel(&self, enrollment_id: Uuid) -> EngineResult<ReconcileOutcome> {
        self.apply_event(enrollment_id, EnrollmentEvent::Cancel).await
    }

    /// Price a later billing cycle with the discount captured at enrollment
    pub async fn renewal_quote(
        &self,
        enrollment_id: Uuid,
        cycles_elapsed: u32,
    ) -> EngineResult<PriceBreakdown> {
        let enrollment = self.load(enrollment_id).await?;
        if enrollment.status == EnrollmentStatus::Cancelled {
            return Err(EngineError::EnrollmentCancelled(enrollment_id));
        }
        self.quote(&enrollment, cycles_elapsed).await
    }

    pub async fn enrollment(&self, enrollment_id: Uuid) -> EngineResult<Enrollment> {
        self.load(enrollment_id).await
    }

    async fn apply_event(
        &self,
        enrollment_id: Uuid,
        event: EnrollmentEvent,
    ) -> EngineResult<ReconcileOutcome> {
        let result = self
            .retry
            .run("reconcile_enrollment", || {
                self.try_apply(enrollment_id, &event)
            })
            .await;

        if let Err(e) = &result {
            tracing::warn!(
                enrollment_id = %enrollment_id,
                event = ?event,
                reason = e.reason(),
                error = %e,
                "Enrollment event rejected"
            );
        }
        result
    }

    async fn try_apply(
        &self,
        enrollment_id: Uuid,
        event: &EnrollmentEvent,
    ) -> EngineResult<ReconcileOutcome> {
        let enrollment = self.load(enrollment_id).await?;
        let transition = next_transition(&enrollment, event)?;

        let now = OffsetDateTime::now_utc();
        let mut updated = enrollment.clone();
        updated.version = enrollment.version + 1;
        updated.updated_at = now;

        let mut first_activation_batch = None;
        let change = match transition {
            Transition::Unchanged => {
                tracing::debug!(
                    enrollment_id = %enrollment_id,
                    status = %enrollment.status,
                    "Event leaves enrollment unchanged"
                );
                return Ok(ReconcileOutcome {
                    enrollment,
                    change: StatusChange::Unchanged,
                });
            }
            Transition::Activate => {
                updated.status = EnrollmentStatus::Active;
                updated.pending_reason = None;
                if let EnrollmentEvent::ConsentResolved {
                    consent_type,
                    notes,
                } = event
                {
                    updated.consent = Some(ConsentRecord {
                        consent_type: consent_type.clone(),
                        notes: notes.clone(),
                        recorded_at: now,
                    });
                }

                if enrollment.is_commissioned() {
                    StatusChange::Reactivated
                } else {
                    let price = self.quote(&enrollment, 0).await?;
                    let batch = self
                        .commissions
                        .prepare_batch(&enrollment)
                        .await?
                        .unwrap_or_default();
                    updated.price_snapshot = Some(price);
                    updated.first_activated_at = Some(now);
                    let commissions = if batch.is_empty() {
                        ActivationOutcome::NoOp
                    } else {
                        ActivationOutcome::Created(batch.clone())
                    };
                    first_activation_batch = Some(batch);
                    StatusChange::FirstActivation { price, commissions }
                }
            }
            Transition::ToPending(reason) => {
                updated.status = EnrollmentStatus::Pending;
                updated.pending_reason = Some(reason);
                StatusChange::MovedToPending
            }
            Transition::Cancel => {
                updated.status = EnrollmentStatus::Cancelled;
                updated.pending_reason = None;
                StatusChange::Cancelled
            }
        };

        // Commissions land with the status flip or not at all
        let written = match &first_activation_batch {
            Some(batch) => {
                self.store
                    .activate_enrollment(&updated, enrollment.version, batch)
                    .await?
            }
            None => {
                self.store
                    .update_enrollment(&updated, enrollment.version)
                    .await?
            }
        };
        if !written {
            return Err(EngineError::Conflict(format!(
                "enrollment {} changed since version {}",
                enrollment_id, enrollment.version
            )));
        }

        if let Some(batch) = first_activation_batch.filter(|b| !b.is_empty()) {
            log_created(&updated, &batch);
        }

        tracing::info!(
            enrollment_id = %enrollment_id,
            from = %enrollment.status,
            to = %updated.status,
            pending_reason = ?updated.pending_reason,
            change = change_label(&change),
            "Enrollment status reconciled"
        );

        Ok(ReconcileOutcome {
            enrollment: updated,
            change,
        })
    }

    async fn quote(
        &self,
        enrollment: &Enrollment,
        cycles_elapsed: u32,
    ) -> EngineResult<PriceBreakdown> {
        let plan = self
            .store
            .plan(enrollment.plan_id)
            .await?
            .ok_or(EngineError::PlanNotFound(enrollment.plan_id))?;
        let add_ons = self.load_add_ons(&enrollment.add_on_ids).await?;

        Ok(self.pricing.compute_monthly(
            &plan,
            &add_ons,
            enrollment.applied_discount.as_ref().map(|d| &d.terms),
            enrollment.coverage_tier,
            cycles_elapsed,
        ))
    }

    async fn load(&self, enrollment_id: Uuid) -> EngineResult<Enrollment> {
        self.store
            .enrollment(enrollment_id)
            .await?
            .ok_or(EngineError::EnrollmentNotFound(enrollment_id))
    }

    async fn load_add_ons(&self, ids: &[Uuid]) -> EngineResult<Vec<AddOn>> {
        let add_ons = self.store.add_ons(ids).await?;
        if let Some(missing) = ids
            .iter()
            .find(|id| !add_ons.iter().any(|a| a.id == **id))
        {
            return Err(EngineError::AddOnNotFound(*missing));
        }
        Ok(add_ons)
    }
}

fn change_label(change: &StatusChange) -> &'static str {
    match change {
        StatusChange::Unchanged => "unchanged",
        StatusChange::FirstActivation { .. } => "first_activation",
        StatusChange::Reactivated => "reactivated",
        StatusChange::MovedToPending => "moved_to_pending",
        StatusChange::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enrollment(status: EnrollmentStatus, reason: Option<PendingReason>) -> Enrollment {
        let now = OffsetDateTime::now_utc();
        Enrollment {
            id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            coverage_tier: CoverageTier::Individual,
            add_on_ids: vec![],
            applied_discount: None,
            status,
            pending_reason: reason,
            consent: None,
            enrolling_agent_id: Uuid::new_v4(),
            price_snapshot: None,
            first_activated_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn consent(consent_type: &str, notes: &str) -> EnrollmentEvent {
        EnrollmentEvent::ConsentResolved {
            consent_type: consent_type.into(),
            notes: notes.into(),
        }
    }

    fn policy_hold() -> Option<PendingReason> {
        Some(PendingReason::PolicyException {
            detail: "age over plan limit".into(),
        })
    }

    #[test]
    fn test_payment_activates_pending() {
        let e = enrollment(EnrollmentStatus::Pending, Some(PendingReason::PaymentRequired));
        assert_eq!(
            next_transition(&e, &EnrollmentEvent::PaymentSucceeded).unwrap(),
            Transition::Activate
        );

        let declined = enrollment(
            EnrollmentStatus::Pending,
            Some(PendingReason::PaymentFailed {
                category: "card_declined".into(),
            }),
        );
        assert_eq!(
            next_transition(&declined, &EnrollmentEvent::PaymentSucceeded).unwrap(),
            Transition::Activate
        );
    }

    #[test]
    fn test_payment_cannot_clear_policy_exception() {
        let e = enrollment(EnrollmentStatus::Pending, policy_hold());
        assert!(matches!(
            next_transition(&e, &EnrollmentEvent::PaymentSucceeded),
            Err(EngineError::ConsentRequired(id)) if id == e.id
        ));
    }

    #[test]
    fn test_consent_resolves_any_pending() {
        for reason in [
            policy_hold(),
            Some(PendingReason::PaymentRequired),
            Some(PendingReason::PaymentFailed {
                category: "card_declined".into(),
            }),
        ] {
            let e = enrollment(EnrollmentStatus::Pending, reason);
            assert_eq!(
                next_transition(&e, &consent("verbal", "confirmed by phone")).unwrap(),
                Transition::Activate
            );
        }
    }

    #[test]
    fn test_payment_failure_keeps_policy_hold() {
        let held = enrollment(EnrollmentStatus::Pending, policy_hold());
        assert_eq!(
            next_transition(
                &held,
                &EnrollmentEvent::PaymentFailed {
                    category: "card_declined".into()
                }
            )
            .unwrap(),
            Transition::Unchanged
        );
    }

    #[test]
    fn test_consent_requires_type_and_notes() {
        let held = enrollment(EnrollmentStatus::Pending, policy_hold());
        assert!(matches!(
            next_transition(&held, &consent("", "notes")),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            next_transition(&held, &consent("written", "   ")),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_failure_moves_active_back_to_pending() {
        let e = enrollment(EnrollmentStatus::Active, None);
        assert_eq!(
            next_transition(
                &e,
                &EnrollmentEvent::PaymentFailed {
                    category: "card_declined".into()
                }
            )
            .unwrap(),
            Transition::ToPending(PendingReason::PaymentFailed {
                category: "card_declined".into()
            })
        );
    }

    #[test]
    fn test_blank_failure_category_gets_default() {
        let e = enrollment(EnrollmentStatus::Active, None);
        assert_eq!(
            next_transition(&e, &EnrollmentEvent::PaymentFailed { category: " ".into() }).unwrap(),
            Transition::ToPending(PendingReason::PaymentFailed {
                category: "payment_failed".into()
            })
        );
    }

    #[test]
    fn test_duplicate_success_on_active_is_unchanged() {
        let e = enrollment(EnrollmentStatus::Active, None);
        assert_eq!(
            next_transition(&e, &EnrollmentEvent::PaymentSucceeded).unwrap(),
            Transition::Unchanged
        );
    }

    #[test]
    fn test_cancelled_is_terminal() {
        let e = enrollment(EnrollmentStatus::Cancelled, None);
        for event in [
            EnrollmentEvent::PaymentSucceeded,
            EnrollmentEvent::PaymentFailed {
                category: "x".into(),
            },
            consent("verbal", "ok"),
            EnrollmentEvent::Cancel,
        ] {
            assert!(matches!(
                next_transition(&e, &event),
                Err(EngineError::EnrollmentCancelled(_))
            ));
        }
    }

    #[test]
    fn test_cancel_from_any_live_state() {
        for status in [EnrollmentStatus::Pending, EnrollmentStatus::Active] {
            let e = enrollment(status, None);
            assert_eq!(
                next_transition(&e, &EnrollmentEvent::Cancel).unwrap(),
                Transition::Cancel
            );
        }
    }

    #[test]
    fn test_only_pending_can_be_flagged() {
        let flag = EnrollmentEvent::PolicyException {
            detail: "pre-existing condition review".into(),
        };
        let pending = enrollment(EnrollmentStatus::Pending, Some(PendingReason::PaymentRequired));
        assert!(matches!(
            next_transition(&pending, &flag).unwrap(),
            Transition::ToPending(PendingReason::PolicyException { .. })
        ));

        let active = enrollment(EnrollmentStatus::Active, None);
        assert!(matches!(
            next_transition(&active, &flag),
            Err(EngineError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_pending_reason_serializes_tagged() {
        let json = serde_json::to_value(PendingReason::PaymentFailed {
            category: "card_declined".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "payment_failed");
        assert_eq!(json["category"], "card_declined");
    }
}

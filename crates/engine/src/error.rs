//! Engine error types

use time::OffsetDateTime;
use uuid::Uuid;

use crate::commission::CommissionStatus;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // Discount code validation
    #[error("Discount code not found: {0}")]
    DiscountNotFound(String),

    #[error("Discount code {0} is inactive")]
    DiscountInactive(String),

    #[error("Discount code {code} is not valid until {valid_from}")]
    DiscountNotYetValid {
        code: String,
        valid_from: OffsetDateTime,
    },

    #[error("Discount code {code} expired at {valid_until}")]
    DiscountExpired {
        code: String,
        valid_until: OffsetDateTime,
    },

    #[error("Discount code {code} has reached its limit of {max_uses} uses")]
    DiscountExhausted { code: String, max_uses: i32 },

    // Hierarchy
    #[error("Cannot assign {upline_id} as upline of {agent_id}: {upline_id} is in that agent's downline")]
    Cycle { agent_id: Uuid, upline_id: Uuid },

    #[error("Agent {0} cannot be its own upline")]
    SelfReference(Uuid),

    #[error("Override rate of {rate_cents} cents is outside the allowed range {min_cents}..={max_cents}")]
    InvalidOverrideRate {
        rate_cents: i64,
        min_cents: i64,
        max_cents: i64,
    },

    // Lookups
    #[error("Agent not found: {0}")]
    AgentNotFound(Uuid),

    #[error("Plan not found: {0}")]
    PlanNotFound(Uuid),

    #[error("Add-on not found: {0}")]
    AddOnNotFound(Uuid),

    #[error("Enrollment not found: {0}")]
    EnrollmentNotFound(Uuid),

    #[error("Commission not found: {0}")]
    CommissionNotFound(Uuid),

    // Enrollment lifecycle
    #[error("Invalid enrollment transition: {0}")]
    InvalidTransition(String),

    #[error("Enrollment {0} is pending a policy exception and needs a consent resolution")]
    ConsentRequired(Uuid),

    #[error("Enrollment {0} is cancelled")]
    EnrollmentCancelled(Uuid),

    #[error("Commission status cannot move from {from} to {to}")]
    InvalidStatusChange {
        from: CommissionStatus,
        to: CommissionStatus,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Concurrency / infrastructure
    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    #[error("Temporarily unavailable, retry later: {0}")]
    Retriable(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl EngineError {
    /// Stable machine-readable reason, suitable for showing the caller why a
    /// code or edit was refused.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::DiscountNotFound(_) => "not_found",
            EngineError::DiscountInactive(_) => "inactive",
            EngineError::DiscountNotYetValid { .. } => "not_yet_valid",
            EngineError::DiscountExpired { .. } => "expired",
            EngineError::DiscountExhausted { .. } => "exhausted",
            EngineError::Cycle { .. } => "cycle",
            EngineError::SelfReference(_) => "self_reference",
            EngineError::InvalidOverrideRate { .. } => "invalid_override_rate",
            EngineError::AgentNotFound(_) => "agent_not_found",
            EngineError::PlanNotFound(_) => "plan_not_found",
            EngineError::AddOnNotFound(_) => "add_on_not_found",
            EngineError::EnrollmentNotFound(_) => "enrollment_not_found",
            EngineError::CommissionNotFound(_) => "commission_not_found",
            EngineError::InvalidTransition(_) => "invalid_transition",
            EngineError::ConsentRequired(_) => "consent_required",
            EngineError::EnrollmentCancelled(_) => "cancelled",
            EngineError::InvalidStatusChange { .. } => "invalid_status_change",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::Conflict(_) => "conflict",
            EngineError::Retriable(_) => "retriable",
            EngineError::Database(_) => "database",
        }
    }

    /// Whether the payment webhook should redeliver the event.
    pub fn is_retriable(&self) -> bool {
        matches!(self, EngineError::Retriable(_) | EngineError::Conflict(_))
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                EngineError::Retriable(err.to_string())
            }
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                // serialization_failure, deadlock_detected, unique_violation
                Some("40001") | Some("40P01") | Some("23505") => {
                    EngineError::Conflict(db_err.message().to_string())
                }
                _ => EngineError::Database(err.to_string()),
            },
            _ => EngineError::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discount_reasons_are_actionable() {
        let code = "WELCOME20".to_string();
        assert_eq!(
            EngineError::DiscountExhausted {
                code: code.clone(),
                max_uses: 1
            }
            .reason(),
            "exhausted"
        );
        assert_eq!(
            EngineError::DiscountExpired {
                code: code.clone(),
                valid_until: OffsetDateTime::UNIX_EPOCH
            }
            .reason(),
            "expired"
        );
        assert_eq!(EngineError::DiscountInactive(code).reason(), "inactive");
    }

    #[test]
    fn test_cycle_message_names_both_agents() {
        let agent_id = Uuid::new_v4();
        let upline_id = Uuid::new_v4();
        let err = EngineError::Cycle {
            agent_id,
            upline_id,
        };
        let msg = err.to_string();
        assert!(msg.contains(&agent_id.to_string()));
        assert!(msg.contains(&upline_id.to_string()));
        assert_eq!(err.reason(), "cycle");
    }

    #[test]
    fn test_only_infrastructure_errors_are_retriable() {
        assert!(EngineError::Retriable("pool timed out".into()).is_retriable());
        assert!(EngineError::Conflict("version moved".into()).is_retriable());
        assert!(!EngineError::SelfReference(Uuid::new_v4()).is_retriable());
        assert!(!EngineError::Database("syntax error".into()).is_retriable());
    }

    #[test]
    fn test_pool_timeout_maps_to_retriable() {
        let err: EngineError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, EngineError::Retriable(_)));
    }
}

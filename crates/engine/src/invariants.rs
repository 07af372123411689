//! Engine Invariants Module
//!
//! Runnable consistency checks over persisted state. Safe to run at any time,
//! including while the engine is serving traffic: every check only reads.
//!
//! ## Checks
//!
//! 1. **hierarchy_acyclic**: no agent is its own ancestor
//! 2. **hierarchy_levels_consistent**: stored levels match the upline chain
//! 3. **discount_uses_within_cap**: no code was used past `max_uses`
//! 4. **commissioned_enrollments_have_direct**: every first activation paid
//!    its enrolling agent
//! 5. **commissions_require_activation**: no commission belongs to an
//!    enrollment that never activated

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::hierarchy::AgentHierarchy;
use crate::store::EngineStore;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Agents, codes or enrollments involved
    pub entity_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money is being paid or discounted incorrectly
    Critical,
    /// Data inconsistency that needs attention
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

pub struct InvariantChecker<S> {
    store: Arc<S>,
}

impl<S> Clone for InvariantChecker<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: EngineStore> InvariantChecker<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> EngineResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        let hierarchy = self.hierarchy().await?;
        violations.extend(check_hierarchy_acyclic(&hierarchy));
        violations.extend(check_hierarchy_levels(&hierarchy));
        violations.extend(self.check_discount_uses_within_cap().await?);
        violations.extend(self.check_commissioned_enrollments_have_direct().await?);
        violations.extend(self.check_commissions_require_activation().await?);

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> EngineResult<Vec<InvariantViolation>> {
        match name {
            "hierarchy_acyclic" => Ok(check_hierarchy_acyclic(&self.hierarchy().await?)),
            "hierarchy_levels_consistent" => Ok(check_hierarchy_levels(&self.hierarchy().await?)),
            "discount_uses_within_cap" => self.check_discount_uses_within_cap().await,
            "commissioned_enrollments_have_direct" => {
                self.check_commissioned_enrollments_have_direct().await
            }
            "commissions_require_activation" => self.check_commissions_require_activation().await,
            _ => Err(EngineError::InvalidInput(format!(
                "unknown invariant check '{}'",
                name
            ))),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "hierarchy_acyclic",
            "hierarchy_levels_consistent",
            "discount_uses_within_cap",
            "commissioned_enrollments_have_direct",
            "commissions_require_activation",
        ]
    }

    async fn hierarchy(&self) -> EngineResult<AgentHierarchy> {
        Ok(self.store.hierarchy_snapshot().await?.into())
    }

    /// Invariant 3: `current_uses <= max_uses` for every capped code
    async fn check_discount_uses_within_cap(&self) -> EngineResult<Vec<InvariantViolation>> {
        let codes = self.store.list_discount_codes().await?;

        Ok(codes
            .into_iter()
            .filter_map(|code| {
                let max_uses = code.max_uses?;
                (code.current_uses > max_uses).then(|| InvariantViolation {
                    invariant: "discount_uses_within_cap".to_string(),
                    entity_ids: vec![code.id],
                    description: format!(
                        "Discount code {} used {} times against a cap of {}",
                        code.code, code.current_uses, max_uses
                    ),
                    context: serde_json::json!({
                        "code": code.code,
                        "current_uses": code.current_uses,
                        "max_uses": max_uses,
                    }),
                    severity: ViolationSeverity::Critical,
                })
            })
            .collect())
    }

    /// Invariant 4: a commissioned enrollment always has its direct row
    ///
    /// Overrides without a direct commission would mean a partial batch.
    async fn check_commissioned_enrollments_have_direct(
        &self,
    ) -> EngineResult<Vec<InvariantViolation>> {
        let missing = self.store.commissioned_enrollments_without_direct().await?;
        if missing.is_empty() {
            return Ok(vec![]);
        }

        Ok(vec![InvariantViolation {
            invariant: "commissioned_enrollments_have_direct".to_string(),
            description: format!(
                "{} activated enrollment(s) have no direct commission",
                missing.len()
            ),
            context: serde_json::json!({ "enrollment_count": missing.len() }),
            entity_ids: missing,
            severity: ViolationSeverity::High,
        }])
    }

    /// Invariant 5: commissions only follow a first activation
    async fn check_commissions_require_activation(&self) -> EngineResult<Vec<InvariantViolation>> {
        let orphaned = self.store.commissions_without_activation().await?;
        if orphaned.is_empty() {
            return Ok(vec![]);
        }

        Ok(vec![InvariantViolation {
            invariant: "commissions_require_activation".to_string(),
            description: format!(
                "{} enrollment(s) carry commissions but never activated",
                orphaned.len()
            ),
            context: serde_json::json!({ "enrollment_count": orphaned.len() }),
            entity_ids: orphaned,
            severity: ViolationSeverity::Critical,
        }])
    }
}

/// Invariant 1: the upline graph is a forest
fn check_hierarchy_acyclic(hierarchy: &AgentHierarchy) -> Vec<InvariantViolation> {
    let Some(first) = hierarchy.find_cycle() else {
        return vec![];
    };

    // Everyone on the loop through `first`
    let mut members = vec![first];
    let mut current = hierarchy.get(first).and_then(|a| a.upline_agent_id);
    while let Some(id) = current {
        if id == first || members.contains(&id) {
            break;
        }
        members.push(id);
        current = hierarchy.get(id).and_then(|a| a.upline_agent_id);
    }

    vec![InvariantViolation {
        invariant: "hierarchy_acyclic".to_string(),
        description: format!(
            "Agent {} is its own ancestor through {} upline step(s)",
            first,
            members.len()
        ),
        context: serde_json::json!({ "cycle_length": members.len() }),
        entity_ids: members,
        severity: ViolationSeverity::Critical,
    }]
}

/// Invariant 2: `hierarchy_level` equals the upline chain length
fn check_hierarchy_levels(hierarchy: &AgentHierarchy) -> Vec<InvariantViolation> {
    hierarchy
        .agents()
        .filter_map(|agent| {
            // Cyclic or dangling chains are reported by the acyclic check
            let derived = hierarchy.derived_level(agent.id)?;
            (derived != agent.hierarchy_level).then(|| InvariantViolation {
                invariant: "hierarchy_levels_consistent".to_string(),
                entity_ids: vec![agent.id],
                description: format!(
                    "Agent '{}' stored at level {} but its upline chain implies {}",
                    agent.name, agent.hierarchy_level, derived
                ),
                context: serde_json::json!({
                    "stored_level": agent.hierarchy_level,
                    "derived_level": derived,
                }),
                severity: ViolationSeverity::High,
            })
        })
        .collect()
}

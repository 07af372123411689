//! In-process store for tests and embedded use
//!
//! One lock guards all state, so every conditional write is trivially atomic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{BatchOutcome, EngineStore};
use crate::commission::{Commission, CommissionRole, CommissionStatus};
use crate::discount::DiscountCode;
use crate::enrollment::Enrollment;
use crate::error::{EngineError, EngineResult};
use crate::hierarchy::{Agent, HierarchyAuditEntry, HierarchyEdit, HierarchySnapshot};
use crate::pricing::{AddOn, Plan};

#[derive(Debug, Default)]
struct State {
    plans: HashMap<Uuid, Plan>,
    add_ons: HashMap<Uuid, AddOn>,
    discount_codes: HashMap<Uuid, DiscountCode>,
    agents: HashMap<Uuid, Agent>,
    hierarchy_version: i64,
    audit: Vec<HierarchyAuditEntry>,
    enrollments: HashMap<Uuid, Enrollment>,
    commissions: Vec<Commission>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    hierarchy_unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_plan(&self, plan: Plan) {
        self.state.write().await.plans.insert(plan.id, plan);
    }

    pub async fn seed_add_on(&self, add_on: AddOn) {
        self.state.write().await.add_ons.insert(add_on.id, add_on);
    }

    pub async fn seed_discount_code(&self, code: DiscountCode) {
        self.state
            .write()
            .await
            .discount_codes
            .insert(code.id, code);
    }

    /// Insert an agent as-is, without level derivation or cycle checks
    pub async fn seed_agent(&self, agent: Agent) {
        let mut state = self.state.write().await;
        state.agents.insert(agent.id, agent);
        state.hierarchy_version += 1;
    }

    /// Insert an enrollment as-is
    pub async fn seed_enrollment(&self, enrollment: Enrollment) {
        self.state
            .write()
            .await
            .enrollments
            .insert(enrollment.id, enrollment);
    }

    /// Make hierarchy reads fail as if the backing store were unreachable
    pub fn set_hierarchy_unavailable(&self, unavailable: bool) {
        self.hierarchy_unavailable
            .store(unavailable, Ordering::SeqCst);
    }

    pub async fn audit_log(&self) -> Vec<HierarchyAuditEntry> {
        self.state.read().await.audit.clone()
    }

    pub async fn commission_count(&self) -> usize {
        self.state.read().await.commissions.len()
    }
}

/// Would any row in `batch` break the one-direct or one-per-agent rule
fn batch_collides(existing: &[Commission], batch: &[Commission]) -> bool {
    batch.iter().any(|new| {
        existing.iter().any(|c| {
            c.enrollment_id == new.enrollment_id
                && (c.role == CommissionRole::Direct || c.agent_id == new.agent_id)
        })
    })
}

#[async_trait]
impl EngineStore for MemoryStore {
    async fn plan(&self, id: Uuid) -> EngineResult<Option<Plan>> {
        Ok(self.state.read().await.plans.get(&id).cloned())
    }

    async fn add_ons(&self, ids: &[Uuid]) -> EngineResult<Vec<AddOn>> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.add_ons.get(id).cloned())
            .collect())
    }

    async fn agent(&self, id: Uuid) -> EngineResult<Option<Agent>> {
        Ok(self.state.read().await.agents.get(&id).cloned())
    }

    async fn discount_code(&self, code: &str) -> EngineResult<Option<DiscountCode>> {
        Ok(self
            .state
            .read()
            .await
            .discount_codes
            .values()
            .find(|d| d.code == code)
            .cloned())
    }

    async fn compare_and_swap_uses(&self, id: Uuid, expected_uses: i32) -> EngineResult<bool> {
        let mut state = self.state.write().await;
        let Some(discount) = state.discount_codes.get_mut(&id) else {
            return Ok(false);
        };
        if discount.current_uses != expected_uses {
            return Ok(false);
        }
        if discount
            .max_uses
            .is_some_and(|max| discount.current_uses >= max)
        {
            return Ok(false);
        }
        discount.current_uses += 1;
        Ok(true)
    }

    async fn list_discount_codes(&self) -> EngineResult<Vec<DiscountCode>> {
        Ok(self
            .state
            .read()
            .await
            .discount_codes
            .values()
            .cloned()
            .collect())
    }

    async fn hierarchy_snapshot(&self) -> EngineResult<HierarchySnapshot> {
        if self.hierarchy_unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::Retriable(
                "hierarchy store unavailable".to_string(),
            ));
        }
        let state = self.state.read().await;
        Ok(HierarchySnapshot {
            version: state.hierarchy_version,
            agents: state.agents.values().cloned().collect(),
        })
    }

    async fn commit_hierarchy_edit(&self, edit: HierarchyEdit) -> EngineResult<bool> {
        let mut state = self.state.write().await;
        if state.hierarchy_version != edit.expected_version {
            return Ok(false);
        }
        for agent in edit.upserts {
            state.agents.insert(agent.id, agent);
        }
        if let Some(entry) = edit.audit {
            state.audit.push(entry);
        }
        state.hierarchy_version += 1;
        Ok(true)
    }

    async fn enrollment(&self, id: Uuid) -> EngineResult<Option<Enrollment>> {
        Ok(self.state.read().await.enrollments.get(&id).cloned())
    }

    async fn insert_enrollment(&self, enrollment: &Enrollment) -> EngineResult<()> {
        let mut state = self.state.write().await;
        if state.enrollments.contains_key(&enrollment.id) {
            return Err(EngineError::Conflict(format!(
                "enrollment {} already exists",
                enrollment.id
            )));
        }
        state.enrollments.insert(enrollment.id, enrollment.clone());
        Ok(())
    }

    async fn update_enrollment(
        &self,
        enrollment: &Enrollment,
        expected_version: i64,
    ) -> EngineResult<bool> {
        let mut state = self.state.write().await;
        match state.enrollments.get_mut(&enrollment.id) {
            Some(stored) if stored.version == expected_version => {
                *stored = enrollment.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn activate_enrollment(
        &self,
        enrollment: &Enrollment,
        expected_version: i64,
        batch: &[Commission],
    ) -> EngineResult<bool> {
        let mut state = self.state.write().await;
        match state.enrollments.get(&enrollment.id) {
            Some(stored) if stored.version == expected_version => {}
            _ => return Ok(false),
        }
        if batch_collides(&state.commissions, batch) {
            return Err(EngineError::Conflict(format!(
                "enrollment {} was commissioned concurrently",
                enrollment.id
            )));
        }
        state.commissions.extend_from_slice(batch);
        state.enrollments.insert(enrollment.id, enrollment.clone());
        Ok(true)
    }

    async fn commissions_without_activation(&self) -> EngineResult<Vec<Uuid>> {
        let state = self.state.read().await;
        let mut ids: Vec<Uuid> = state
            .commissions
            .iter()
            .map(|c| c.enrollment_id)
            .filter(|id| {
                state
                    .enrollments
                    .get(id)
                    .map_or(true, |e| e.first_activated_at.is_none())
            })
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn commissioned_enrollments_without_direct(&self) -> EngineResult<Vec<Uuid>> {
        let state = self.state.read().await;
        Ok(state
            .enrollments
            .values()
            .filter(|e| e.first_activated_at.is_some())
            .filter(|e| {
                !state
                    .commissions
                    .iter()
                    .any(|c| c.enrollment_id == e.id && c.role == CommissionRole::Direct)
            })
            .map(|e| e.id)
            .collect())
    }

    async fn has_direct_commission(&self, enrollment_id: Uuid) -> EngineResult<bool> {
        Ok(self
            .state
            .read()
            .await
            .commissions
            .iter()
            .any(|c| c.enrollment_id == enrollment_id && c.role == CommissionRole::Direct))
    }

    async fn insert_commission_batch(&self, batch: &[Commission]) -> EngineResult<BatchOutcome> {
        let mut state = self.state.write().await;
        if batch_collides(&state.commissions, batch) {
            return Ok(BatchOutcome::AlreadyExists);
        }
        state.commissions.extend_from_slice(batch);
        Ok(BatchOutcome::Inserted)
    }

    async fn commissions_for_enrollment(
        &self,
        enrollment_id: Uuid,
    ) -> EngineResult<Vec<Commission>> {
        let mut found: Vec<_> = self
            .state
            .read()
            .await
            .commissions
            .iter()
            .filter(|c| c.enrollment_id == enrollment_id)
            .cloned()
            .collect();
        found.sort_by_key(|c| c.depth);
        Ok(found)
    }

    async fn commissions_for_agent(
        &self,
        agent_id: Uuid,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> EngineResult<Vec<Commission>> {
        Ok(self
            .state
            .read()
            .await
            .commissions
            .iter()
            .filter(|c| c.agent_id == agent_id && c.created_at >= from && c.created_at < to)
            .cloned()
            .collect())
    }

    async fn commission(&self, id: Uuid) -> EngineResult<Option<Commission>> {
        Ok(self
            .state
            .read()
            .await
            .commissions
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn update_commission_status(
        &self,
        id: Uuid,
        expected: CommissionStatus,
        next: CommissionStatus,
    ) -> EngineResult<bool> {
        let mut state = self.state.write().await;
        match state.commissions.iter_mut().find(|c| c.id == id) {
            Some(c) if c.status == expected => {
                c.status = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

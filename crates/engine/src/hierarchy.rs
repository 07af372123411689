//! Agent reporting hierarchy
//!
//! Agents form a forest through their nullable upline pointer. The in-memory
//! [`AgentHierarchy`] keeps a parent -> children index next to the agents so
//! that downline closures and level cascades never scan the whole table.
//!
//! Edits are planned against a snapshot and committed by the store only if
//! the hierarchy version is unchanged, so a concurrent edit forces a re-plan
//! instead of interleaving with this one.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::retry::RetryPolicy;
use crate::store::EngineStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    /// None = top of the tree
    pub upline_agent_id: Option<Uuid>,
    /// Derived: 0 for a root, otherwise upline level + 1
    pub hierarchy_level: u32,
    /// Flat override paid to this agent per downline enrollment
    pub override_rate_cents: i64,
    /// Admin setting for override eligibility. `None` derives it from
    /// whether the agent has at least one downline.
    pub override_eligible: Option<bool>,
}

/// Consistent read of every agent, tagged with the hierarchy version
#[derive(Debug, Clone, Default)]
pub struct HierarchySnapshot {
    pub version: i64,
    pub agents: Vec<Agent>,
}

/// Audit row for an admin edit. `reason` is free text and never used in logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyAuditEntry {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub previous_upline_id: Option<Uuid>,
    pub new_upline_id: Option<Uuid>,
    pub previous_rate_cents: Option<i64>,
    pub new_rate_cents: i64,
    pub reason: String,
    pub recorded_at: OffsetDateTime,
}

/// Agent records to write if the hierarchy is still at `expected_version`
#[derive(Debug, Clone)]
pub struct HierarchyEdit {
    pub expected_version: i64,
    pub upserts: Vec<Agent>,
    pub audit: Option<HierarchyAuditEntry>,
}

/// One step of an upline walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainLink<'a> {
    /// 1 for the direct upline, 2 for its upline, ...
    pub depth: u32,
    pub agent: &'a Agent,
}

#[derive(Debug, Clone, Default)]
pub struct AgentHierarchy {
    agents: HashMap<Uuid, Agent>,
    children: HashMap<Uuid, Vec<Uuid>>,
}

impl AgentHierarchy {
    pub fn from_agents(agents: impl IntoIterator<Item = Agent>) -> Self {
        let mut hierarchy = Self::default();
        for agent in agents {
            hierarchy.insert(agent);
        }
        hierarchy
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&Agent> {
        self.agents.get(&id)
    }

    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    pub fn children_of(&self, id: Uuid) -> &[Uuid] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn can_receive_overrides(&self, id: Uuid) -> bool {
        self.agents
            .get(&id)
            .map(|agent| {
                agent
                    .override_eligible
                    .unwrap_or_else(|| !self.children_of(id).is_empty())
            })
            .unwrap_or(false)
    }

    /// Every agent below `id`, breadth-first. Excludes `id` itself.
    pub fn downline_closure(&self, id: Uuid) -> HashSet<Uuid> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<Uuid> = self.children_of(id).iter().copied().collect();

        while let Some(next) = queue.pop_front() {
            if next == id || !seen.insert(next) {
                continue;
            }
            queue.extend(self.children_of(next).iter().copied());
        }
        seen
    }

    /// Uplines of `id`, nearest first, up to the root or `max_depth` steps.
    ///
    /// The walk also stops if it meets an agent it has already visited, so
    /// corrupt data cannot loop or pay the same agent twice.
    pub fn upline_chain(&self, id: Uuid, max_depth: usize) -> Vec<ChainLink<'_>> {
        let mut chain = Vec::new();
        let mut visited = HashSet::from([id]);
        let mut current = self.agents.get(&id).and_then(|a| a.upline_agent_id);

        while let Some(upline_id) = current {
            if chain.len() >= max_depth || !visited.insert(upline_id) {
                break;
            }
            let Some(agent) = self.agents.get(&upline_id) else {
                break;
            };
            chain.push(ChainLink {
                depth: chain.len() as u32 + 1,
                agent,
            });
            current = agent.upline_agent_id;
        }
        chain
    }

    /// Plan an upline change without mutating anything
    ///
    /// Returns the agent with its new upline plus every member of its downline
    /// with a recomputed level.
    pub fn plan_reassignment(
        &self,
        agent_id: Uuid,
        new_upline_id: Option<Uuid>,
    ) -> EngineResult<Vec<Agent>> {
        let agent = self
            .agents
            .get(&agent_id)
            .ok_or(EngineError::AgentNotFound(agent_id))?;

        let new_level = match new_upline_id {
            None => 0,
            Some(upline_id) if upline_id == agent_id => {
                return Err(EngineError::SelfReference(agent_id));
            }
            Some(upline_id) => {
                let upline = self
                    .agents
                    .get(&upline_id)
                    .ok_or(EngineError::AgentNotFound(upline_id))?;
                if self.downline_closure(agent_id).contains(&upline_id) {
                    return Err(EngineError::Cycle {
                        agent_id,
                        upline_id,
                    });
                }
                upline.hierarchy_level + 1
            }
        };

        let mut moved = agent.clone();
        moved.upline_agent_id = new_upline_id;
        moved.hierarchy_level = new_level;

        let mut updates = vec![moved];
        updates.extend(self.cascade_levels(agent_id, new_level));
        Ok(updates)
    }

    /// Apply planned records, keeping the children index in step.
    pub fn apply(&mut self, updates: impl IntoIterator<Item = Agent>) {
        for agent in updates {
            self.insert(agent);
        }
    }

    /// First agent found that is its own ancestor.
    pub fn find_cycle(&self) -> Option<Uuid> {
        self.agents.keys().copied().find(|&start| {
            let mut seen = HashSet::from([start]);
            let mut current = self.agents.get(&start).and_then(|a| a.upline_agent_id);
            while let Some(id) = current {
                if id == start {
                    return true;
                }
                if !seen.insert(id) {
                    // Loops above us but not through us; reported from its members
                    return false;
                }
                current = self.agents.get(&id).and_then(|a| a.upline_agent_id);
            }
            false
        })
    }

    /// Level implied by the upline pointers, None if the chain is broken or cyclic.
    pub fn derived_level(&self, id: Uuid) -> Option<u32> {
        let mut level = 0_u32;
        let mut seen = HashSet::from([id]);
        let mut current = self.agents.get(&id)?.upline_agent_id;
        while let Some(upline_id) = current {
            if !seen.insert(upline_id) {
                return None;
            }
            level += 1;
            current = self.agents.get(&upline_id)?.upline_agent_id;
        }
        Some(level)
    }

    fn cascade_levels(&self, root_id: Uuid, root_level: u32) -> Vec<Agent> {
        let mut levels = HashMap::from([(root_id, root_level)]);
        let mut queue = VecDeque::from([root_id]);
        let mut updated = Vec::new();

        while let Some(parent_id) = queue.pop_front() {
            let parent_level = levels.get(&parent_id).copied().unwrap_or(root_level);
            for &child_id in self.children_of(parent_id) {
                if levels.contains_key(&child_id) {
                    continue;
                }
                if let Some(child) = self.agents.get(&child_id) {
                    let mut child = child.clone();
                    child.hierarchy_level = parent_level + 1;
                    levels.insert(child_id, child.hierarchy_level);
                    updated.push(child);
                    queue.push_back(child_id);
                }
            }
        }
        updated
    }

    fn insert(&mut self, agent: Agent) {
        let previous_upline = self.agents.get(&agent.id).and_then(|a| a.upline_agent_id);
        if previous_upline != agent.upline_agent_id {
            if let Some(old) = previous_upline {
                if let Some(siblings) = self.children.get_mut(&old) {
                    siblings.retain(|&c| c != agent.id);
                }
            }
        }
        if let Some(upline) = agent.upline_agent_id {
            let siblings = self.children.entry(upline).or_default();
            if !siblings.contains(&agent.id) {
                siblings.push(agent.id);
            }
        }
        self.agents.insert(agent.id, agent);
    }
}

impl From<HierarchySnapshot> for AgentHierarchy {
    fn from(snapshot: HierarchySnapshot) -> Self {
        Self::from_agents(snapshot.agents)
    }
}

/// Admin request to move an agent and optionally change its override rate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplineChange {
    pub agent_id: Uuid,
    pub new_upline_id: Option<Uuid>,
    pub new_override_rate_cents: Option<i64>,
    /// Audit text only
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAgent {
    pub name: String,
    pub upline_agent_id: Option<Uuid>,
    pub override_rate_cents: i64,
    pub override_eligible: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReassignmentResult {
    pub agent_id: Uuid,
    pub previous_upline_id: Option<Uuid>,
    pub new_upline_id: Option<Uuid>,
    pub new_level: u32,
    /// Downline agents whose level was recomputed
    pub downline_updated: usize,
}

/// Rate bounds enforced on admin edits
#[derive(Debug, Clone, Copy)]
pub struct OverrideRateBounds {
    pub min_cents: i64,
    pub max_cents: i64,
}

impl OverrideRateBounds {
    pub fn check(&self, rate_cents: i64) -> EngineResult<()> {
        if rate_cents < self.min_cents || rate_cents > self.max_cents {
            return Err(EngineError::InvalidOverrideRate {
                rate_cents,
                min_cents: self.min_cents,
                max_cents: self.max_cents,
            });
        }
        Ok(())
    }
}

pub struct HierarchyService<S> {
    store: Arc<S>,
    bounds: OverrideRateBounds,
    retry: RetryPolicy,
}

impl<S> Clone for HierarchyService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            bounds: self.bounds,
            retry: self.retry,
        }
    }
}

impl<S: EngineStore> HierarchyService<S> {
    pub fn new(store: Arc<S>, bounds: OverrideRateBounds, retry: RetryPolicy) -> Self {
        Self {
            store,
            bounds,
            retry,
        }
    }

    /// Read the current hierarchy in one consistent snapshot
    pub async fn load(&self) -> EngineResult<AgentHierarchy> {
        Ok(self.store.hierarchy_snapshot().await?.into())
    }

    pub async fn register_agent(&self, new_agent: NewAgent) -> EngineResult<Agent> {
        self.bounds.check(new_agent.override_rate_cents)?;
        let id = Uuid::new_v4();

        let agent = self
            .retry
            .run("register_agent", || self.try_register(&new_agent, id))
            .await?;

        tracing::info!(
            agent_id = %agent.id,
            upline_agent_id = ?agent.upline_agent_id,
            hierarchy_level = agent.hierarchy_level,
            "Registered agent"
        );
        Ok(agent)
    }

    async fn try_register(&self, new_agent: &NewAgent, id: Uuid) -> EngineResult<Agent> {
        let snapshot = self.store.hierarchy_snapshot().await?;
        let version = snapshot.version;
        let hierarchy = AgentHierarchy::from(snapshot);

        let hierarchy_level = match new_agent.upline_agent_id {
            None => 0,
            Some(upline_id) => {
                hierarchy
                    .get(upline_id)
                    .ok_or(EngineError::AgentNotFound(upline_id))?
                    .hierarchy_level
                    + 1
            }
        };

        let agent = Agent {
            id,
            name: new_agent.name.clone(),
            upline_agent_id: new_agent.upline_agent_id,
            hierarchy_level,
            override_rate_cents: new_agent.override_rate_cents,
            override_eligible: new_agent.override_eligible,
        };

        self.commit(HierarchyEdit {
            expected_version: version,
            upserts: vec![agent.clone()],
            audit: None,
        })
        .await?;
        Ok(agent)
    }

    /// Move an agent under a new upline (or to the top with `None`)
    ///
    /// Rejected with `SelfReference` if the agent would report to itself and
    /// with `Cycle` if the new upline sits in the agent's own downline. On
    /// success the agent's level and its whole downline are recomputed in the
    /// same commit.
    pub async fn reassign_upline(&self, change: UplineChange) -> EngineResult<ReassignmentResult> {
        if let Some(rate) = change.new_override_rate_cents {
            self.bounds.check(rate)?;
        }

        let result = self
            .retry
            .run("reassign_upline", || self.try_reassign(&change))
            .await;

        match &result {
            Ok(done) => tracing::info!(
                agent_id = %done.agent_id,
                previous_upline_id = ?done.previous_upline_id,
                new_upline_id = ?done.new_upline_id,
                new_level = done.new_level,
                downline_updated = done.downline_updated,
                reason = %change.reason,
                "Reassigned agent upline"
            ),
            Err(e) => tracing::warn!(
                agent_id = %change.agent_id,
                new_upline_id = ?change.new_upline_id,
                error = %e,
                "Rejected upline reassignment"
            ),
        }
        result
    }

    async fn try_reassign(&self, change: &UplineChange) -> EngineResult<ReassignmentResult> {
        let snapshot = self.store.hierarchy_snapshot().await?;
        let version = snapshot.version;
        let hierarchy = AgentHierarchy::from(snapshot);

        let current = hierarchy
            .get(change.agent_id)
            .ok_or(EngineError::AgentNotFound(change.agent_id))?
            .clone();

        let mut upserts = hierarchy.plan_reassignment(change.agent_id, change.new_upline_id)?;
        if let (Some(rate), Some(moved)) = (change.new_override_rate_cents, upserts.first_mut()) {
            moved.override_rate_cents = rate;
        }

        let new_level = upserts
            .first()
            .map(|a| a.hierarchy_level)
            .unwrap_or_default();
        let new_rate_cents = upserts
            .first()
            .map(|a| a.override_rate_cents)
            .unwrap_or(current.override_rate_cents);
        let downline_updated = upserts.len().saturating_sub(1);

        let audit = HierarchyAuditEntry {
            id: Uuid::new_v4(),
            agent_id: change.agent_id,
            previous_upline_id: current.upline_agent_id,
            new_upline_id: change.new_upline_id,
            previous_rate_cents: Some(current.override_rate_cents),
            new_rate_cents,
            reason: change.reason.clone(),
            recorded_at: OffsetDateTime::now_utc(),
        };

        self.commit(HierarchyEdit {
            expected_version: version,
            upserts,
            audit: Some(audit),
        })
        .await?;

        Ok(ReassignmentResult {
            agent_id: change.agent_id,
            previous_upline_id: current.upline_agent_id,
            new_upline_id: change.new_upline_id,
            new_level,
            downline_updated,
        })
    }

    async fn commit(&self, edit: HierarchyEdit) -> EngineResult<()> {
        let expected = edit.expected_version;
        if self.store.commit_hierarchy_edit(edit).await? {
            Ok(())
        } else {
            Err(EngineError::Conflict(format!(
                "hierarchy changed since version {}",
                expected
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(name: &str, upline: Option<&Agent>, rate: i64) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            name: name.into(),
            upline_agent_id: upline.map(|u| u.id),
            hierarchy_level: upline.map(|u| u.hierarchy_level + 1).unwrap_or(0),
            override_rate_cents: rate,
            override_eligible: None,
        }
    }

    /// C (root) <- B <- A <- D
    fn chain() -> (AgentHierarchy, Agent, Agent, Agent, Agent) {
        let c = agent("C", None, 300);
        let b = agent("B", Some(&c), 500);
        let a = agent("A", Some(&b), 400);
        let d = agent("D", Some(&a), 200);
        let h = AgentHierarchy::from_agents([c.clone(), b.clone(), a.clone(), d.clone()]);
        (h, a, b, c, d)
    }

    #[test]
    fn test_upline_chain_is_nearest_first() {
        let (h, a, b, c, _) = chain();
        let links = h.upline_chain(a.id, 16);
        let ids: Vec<_> = links.iter().map(|l| (l.depth, l.agent.id)).collect();
        assert_eq!(ids, vec![(1, b.id), (2, c.id)]);
    }

    #[test]
    fn test_upline_chain_respects_max_depth() {
        let (h, _, b, _, d) = chain();
        let links = h.upline_chain(d.id, 2);
        assert_eq!(links.len(), 2);
        assert_eq!(links[1].agent.id, b.id);
        assert!(h.upline_chain(d.id, 0).is_empty());
    }

    #[test]
    fn test_upline_chain_stops_on_corrupt_cycle() {
        let mut x = agent("X", None, 100);
        let mut y = agent("Y", None, 100);
        x.upline_agent_id = Some(y.id);
        y.upline_agent_id = Some(x.id);
        let h = AgentHierarchy::from_agents([x.clone(), y.clone()]);

        let links = h.upline_chain(x.id, 16);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].agent.id, y.id);
        assert!(h.find_cycle().is_some());
        assert_eq!(h.derived_level(x.id), None);
    }

    #[test]
    fn test_downline_closure() {
        let (h, a, b, c, d) = chain();
        let closure = h.downline_closure(b.id);
        assert_eq!(closure, HashSet::from([a.id, d.id]));
        assert!(h.downline_closure(d.id).is_empty());
        assert_eq!(h.downline_closure(c.id).len(), 3);
    }

    #[test]
    fn test_override_eligibility_from_downline_or_flag() {
        let (mut h, a, _, _, d) = chain();
        assert!(h.can_receive_overrides(a.id));
        assert!(!h.can_receive_overrides(d.id));

        let mut enabled = d.clone();
        enabled.override_eligible = Some(true);
        let mut disabled = a.clone();
        disabled.override_eligible = Some(false);
        h.apply([enabled, disabled]);

        assert!(h.can_receive_overrides(d.id));
        assert!(!h.can_receive_overrides(a.id));
        assert!(!h.can_receive_overrides(Uuid::new_v4()));
    }

    #[test]
    fn test_reassign_into_own_downline_is_cycle() {
        let (h, a, b, _, _) = chain();
        // A reports to B; making A the upline of B would loop
        let err = h.plan_reassignment(b.id, Some(a.id)).unwrap_err();
        assert!(matches!(err, EngineError::Cycle { agent_id, upline_id } if agent_id == b.id && upline_id == a.id));
    }

    #[test]
    fn test_reassign_to_self_is_rejected() {
        let (h, a, _, _, _) = chain();
        assert!(matches!(
            h.plan_reassignment(a.id, Some(a.id)),
            Err(EngineError::SelfReference(id)) if id == a.id
        ));
    }

    #[test]
    fn test_reassign_unknown_agents() {
        let (h, a, _, _, _) = chain();
        let ghost = Uuid::new_v4();
        assert!(matches!(
            h.plan_reassignment(ghost, None),
            Err(EngineError::AgentNotFound(id)) if id == ghost
        ));
        assert!(matches!(
            h.plan_reassignment(a.id, Some(ghost)),
            Err(EngineError::AgentNotFound(id)) if id == ghost
        ));
    }

    #[test]
    fn test_reassign_cascades_levels() {
        let (mut h, a, _, c, d) = chain();
        // Move A directly under C: A level 1, D level 2
        let updates = h.plan_reassignment(a.id, Some(c.id)).unwrap();
        assert_eq!(updates.len(), 2);
        h.apply(updates);

        assert_eq!(h.get(a.id).unwrap().hierarchy_level, 1);
        assert_eq!(h.get(d.id).unwrap().hierarchy_level, 2);
        assert_eq!(h.children_of(c.id).len(), 2);

        // Promote A to root
        let updates = h.plan_reassignment(a.id, None).unwrap();
        h.apply(updates);
        assert_eq!(h.get(a.id).unwrap().hierarchy_level, 0);
        assert_eq!(h.get(d.id).unwrap().hierarchy_level, 1);
        assert_eq!(h.children_of(c.id).len(), 1);
    }

    #[test]
    fn test_random_reassignments_stay_acyclic() {
        // Deterministic pseudo-random sequence over a 12-agent forest
        let root = agent("root", None, 100);
        let mut agents = vec![root.clone()];
        for i in 0..11 {
            let parent = agents[i / 2].clone();
            agents.push(agent(&format!("a{}", i), Some(&parent), 100));
        }
        let ids: Vec<Uuid> = agents.iter().map(|a| a.id).collect();
        let mut h = AgentHierarchy::from_agents(agents);

        let mut seed: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        let mut rejected = 0;
        for _ in 0..500 {
            let agent_id = ids[(next() % ids.len() as u64) as usize];
            let target = next() % (ids.len() as u64 + 1);
            let new_upline = ids.get(target as usize).copied();

            match h.plan_reassignment(agent_id, new_upline) {
                Ok(updates) => h.apply(updates),
                Err(EngineError::Cycle { .. }) | Err(EngineError::SelfReference(_)) => {
                    rejected += 1
                }
                Err(other) => panic!("unexpected error: {}", other),
            }

            assert_eq!(h.find_cycle(), None);
            for id in &ids {
                assert_eq!(
                    h.derived_level(*id),
                    Some(h.get(*id).unwrap().hierarchy_level),
                    "stored level drifted from upline pointers"
                );
            }
        }
        assert!(rejected > 0, "sequence should exercise rejections");
    }

    #[test]
    fn test_rate_bounds() {
        let bounds = OverrideRateBounds {
            min_cents: 100,
            max_cents: 1_000,
        };
        assert!(bounds.check(100).is_ok());
        assert!(bounds.check(1_000).is_ok());
        assert!(matches!(
            bounds.check(99),
            Err(EngineError::InvalidOverrideRate { rate_cents: 99, .. })
        ));
        assert!(bounds.check(1_001).is_err());
    }
}

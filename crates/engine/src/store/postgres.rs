//! PostgreSQL store
//!
//! Conditional writes are single statements guarded by a `WHERE` on the
//! expected value, or short transactions where several rows must land
//! together (hierarchy edits, commission batches).

use async_trait::async_trait;
use enrollhub_shared::CoverageTier;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{BatchOutcome, EngineStore};
use crate::commission::{Commission, CommissionRole, CommissionStatus};
use crate::discount::{
    AppliedDiscount, DiscountCode, DiscountDuration, DiscountShape, DiscountTerms,
};
use crate::enrollment::{ConsentRecord, Enrollment, EnrollmentStatus, PendingReason};
use crate::error::{EngineError, EngineResult};
use crate::hierarchy::{Agent, HierarchyEdit, HierarchySnapshot};
use crate::pricing::{AddOn, AddOnPrices, Plan, PriceBreakdown};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn corrupt(what: &str, id: Uuid, value: impl std::fmt::Display) -> EngineError {
    EngineError::Database(format!("{} {} has unreadable value '{}'", what, id, value))
}

fn to_int4(value: u32, what: &str) -> EngineResult<i32> {
    i32::try_from(value)
        .map_err(|_| EngineError::InvalidInput(format!("{} {} out of range", what, value)))
}

// Row types

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    name: String,
    base_price_cents: i64,
    feature_tier: String,
    direct_commission_cents: i64,
}

impl From<PlanRow> for Plan {
    fn from(row: PlanRow) -> Self {
        Plan {
            id: row.id,
            name: row.name,
            base_price_cents: row.base_price_cents,
            feature_tier: row.feature_tier,
            direct_commission_cents: row.direct_commission_cents,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AddOnRow {
    id: Uuid,
    name: String,
    individual_cents: i64,
    spouse_cents: i64,
    child_cents: i64,
    family_cents: i64,
}

impl From<AddOnRow> for AddOn {
    fn from(row: AddOnRow) -> Self {
        AddOn {
            id: row.id,
            name: row.name,
            prices: AddOnPrices {
                individual_cents: row.individual_cents,
                spouse_cents: row.spouse_cents,
                child_cents: row.child_cents,
                family_cents: row.family_cents,
            },
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DiscountCodeRow {
    id: Uuid,
    code: String,
    discount_kind: String,
    discount_value: i64,
    duration_kind: String,
    duration_months: Option<i32>,
    max_uses: Option<i32>,
    current_uses: i32,
    valid_from: Option<OffsetDateTime>,
    valid_until: Option<OffsetDateTime>,
    is_active: bool,
}

impl TryFrom<DiscountCodeRow> for DiscountCode {
    type Error = EngineError;

    fn try_from(row: DiscountCodeRow) -> EngineResult<Self> {
        let shape = DiscountShape::from_parts(&row.discount_kind, row.discount_value)
            .ok_or_else(|| corrupt("discount kind of", row.id, &row.discount_kind))?;
        let duration = DiscountDuration::from_parts(&row.duration_kind, row.duration_months)
            .ok_or_else(|| corrupt("discount duration of", row.id, &row.duration_kind))?;
        Ok(DiscountCode {
            id: row.id,
            code: row.code,
            terms: DiscountTerms { shape, duration },
            max_uses: row.max_uses,
            current_uses: row.current_uses,
            valid_from: row.valid_from,
            valid_until: row.valid_until,
            is_active: row.is_active,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AgentRow {
    id: Uuid,
    name: String,
    upline_agent_id: Option<Uuid>,
    hierarchy_level: i32,
    override_rate_cents: i64,
    override_eligible: Option<bool>,
}

impl From<AgentRow> for Agent {
    fn from(row: AgentRow) -> Self {
        Agent {
            id: row.id,
            name: row.name,
            upline_agent_id: row.upline_agent_id,
            hierarchy_level: u32::try_from(row.hierarchy_level).unwrap_or_default(),
            override_rate_cents: row.override_rate_cents,
            override_eligible: row.override_eligible,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EnrollmentRow {
    id: Uuid,
    plan_id: Uuid,
    coverage_tier: String,
    add_on_ids: Vec<Uuid>,
    applied_discount: Option<Json<AppliedDiscount>>,
    status: String,
    pending_reason: Option<Json<PendingReason>>,
    consent_type: Option<String>,
    consent_notes: Option<String>,
    consent_recorded_at: Option<OffsetDateTime>,
    enrolling_agent_id: Uuid,
    price_snapshot: Option<Json<PriceBreakdown>>,
    first_activated_at: Option<OffsetDateTime>,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<EnrollmentRow> for Enrollment {
    type Error = EngineError;

    fn try_from(row: EnrollmentRow) -> EngineResult<Self> {
        let coverage_tier = CoverageTier::parse(&row.coverage_tier)
            .ok_or_else(|| corrupt("coverage tier of enrollment", row.id, &row.coverage_tier))?;
        let status = EnrollmentStatus::parse(&row.status)
            .ok_or_else(|| corrupt("status of enrollment", row.id, &row.status))?;
        let consent = match (row.consent_type, row.consent_notes, row.consent_recorded_at) {
            (Some(consent_type), Some(notes), Some(recorded_at)) => Some(ConsentRecord {
                consent_type,
                notes,
                recorded_at,
            }),
            _ => None,
        };

        Ok(Enrollment {
            id: row.id,
            plan_id: row.plan_id,
            coverage_tier,
            add_on_ids: row.add_on_ids,
            applied_discount: row.applied_discount.map(|Json(d)| d),
            status,
            pending_reason: row.pending_reason.map(|Json(r)| r),
            consent,
            enrolling_agent_id: row.enrolling_agent_id,
            price_snapshot: row.price_snapshot.map(|Json(p)| p),
            first_activated_at: row.first_activated_at,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CommissionRow {
    id: Uuid,
    enrollment_id: Uuid,
    agent_id: Uuid,
    amount_cents: i64,
    role: String,
    depth: i32,
    status: String,
    created_at: OffsetDateTime,
}

impl TryFrom<CommissionRow> for Commission {
    type Error = EngineError;

    fn try_from(row: CommissionRow) -> EngineResult<Self> {
        Ok(Commission {
            role: CommissionRole::parse(&row.role)
                .ok_or_else(|| corrupt("role of commission", row.id, &row.role))?,
            status: CommissionStatus::parse(&row.status)
                .ok_or_else(|| corrupt("status of commission", row.id, &row.status))?,
            depth: u32::try_from(row.depth)
                .map_err(|_| corrupt("depth of commission", row.id, row.depth))?,
            id: row.id,
            enrollment_id: row.enrollment_id,
            agent_id: row.agent_id,
            amount_cents: row.amount_cents,
            created_at: row.created_at,
        })
    }
}

const DISCOUNT_COLUMNS: &str = "id, code, discount_kind, discount_value, duration_kind, \
     duration_months, max_uses, current_uses, valid_from, valid_until, is_active";

const AGENT_COLUMNS: &str =
    "id, name, upline_agent_id, hierarchy_level, override_rate_cents, override_eligible";

const ENROLLMENT_COLUMNS: &str = "id, plan_id, coverage_tier, add_on_ids, applied_discount, \
     status, pending_reason, consent_type, consent_notes, consent_recorded_at, \
     enrolling_agent_id, price_snapshot, first_activated_at, version, created_at, updated_at";

const COMMISSION_COLUMNS: &str =
    "id, enrollment_id, agent_id, amount_cents, role, depth, status, created_at";

fn commissions_from_rows(rows: Vec<CommissionRow>) -> EngineResult<Vec<Commission>> {
    rows.into_iter().map(Commission::try_from).collect()
}

/// Version-guarded enrollment update on an open connection
async fn write_enrollment(
    conn: &mut PgConnection,
    enrollment: &Enrollment,
    expected_version: i64,
) -> EngineResult<bool> {
    let consent = enrollment.consent.as_ref();
    let result = sqlx::query(
        r#"
        UPDATE enrollments SET
            status = $3,
            pending_reason = $4,
            consent_type = $5,
            consent_notes = $6,
            consent_recorded_at = $7,
            price_snapshot = $8,
            first_activated_at = $9,
            version = $10,
            updated_at = $11
        WHERE id = $1 AND version = $2
        "#,
    )
    .bind(enrollment.id)
    .bind(expected_version)
    .bind(enrollment.status.as_str())
    .bind(enrollment.pending_reason.as_ref().map(Json))
    .bind(consent.map(|c| c.consent_type.as_str()))
    .bind(consent.map(|c| c.notes.as_str()))
    .bind(consent.map(|c| c.recorded_at))
    .bind(enrollment.price_snapshot.map(Json))
    .bind(enrollment.first_activated_at)
    .bind(enrollment.version)
    .bind(enrollment.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Insert commission rows on an open transaction, stopping at the first
/// conflicting row. The caller rolls back on `AlreadyExists`.
async fn insert_commission_rows(
    conn: &mut PgConnection,
    batch: &[Commission],
) -> EngineResult<BatchOutcome> {
    // Direct row first: the partial unique index makes it the claim on
    // the enrollment, and a losing concurrent batch stops here.
    let mut ordered: Vec<&Commission> = batch.iter().collect();
    ordered.sort_by_key(|c| c.role != CommissionRole::Direct);

    for commission in ordered {
        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO commissions (
                id, enrollment_id, agent_id, amount_cents, role, depth, status, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(commission.id)
        .bind(commission.enrollment_id)
        .bind(commission.agent_id)
        .bind(commission.amount_cents)
        .bind(commission.role.as_str())
        .bind(to_int4(commission.depth, "commission depth")?)
        .bind(commission.status.as_str())
        .bind(commission.created_at)
        .fetch_optional(&mut *conn)
        .await?;

        if inserted.is_none() {
            return Ok(BatchOutcome::AlreadyExists);
        }
    }

    Ok(BatchOutcome::Inserted)
}

#[async_trait]
impl EngineStore for PgStore {
    async fn plan(&self, id: Uuid) -> EngineResult<Option<Plan>> {
        let row: Option<PlanRow> = sqlx::query_as(
            r#"
            SELECT id, name, base_price_cents, feature_tier, direct_commission_cents
            FROM plans
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Plan::from))
    }

    async fn add_ons(&self, ids: &[Uuid]) -> EngineResult<Vec<AddOn>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<AddOnRow> = sqlx::query_as(
            r#"
            SELECT id, name, individual_cents, spouse_cents, child_cents, family_cents
            FROM add_ons
            WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AddOn::from).collect())
    }

    async fn agent(&self, id: Uuid) -> EngineResult<Option<Agent>> {
        let row: Option<AgentRow> =
            sqlx::query_as(&format!("SELECT {} FROM agents WHERE id = $1", AGENT_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Agent::from))
    }

    async fn discount_code(&self, code: &str) -> EngineResult<Option<DiscountCode>> {
        let row: Option<DiscountCodeRow> = sqlx::query_as(&format!(
            "SELECT {} FROM discount_codes WHERE code = $1",
            DISCOUNT_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DiscountCode::try_from).transpose()
    }

    async fn compare_and_swap_uses(&self, id: Uuid, expected_uses: i32) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE discount_codes
            SET current_uses = current_uses + 1
            WHERE id = $1
              AND current_uses = $2
              AND (max_uses IS NULL OR current_uses < max_uses)
            "#,
        )
        .bind(id)
        .bind(expected_uses)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_discount_codes(&self) -> EngineResult<Vec<DiscountCode>> {
        let rows: Vec<DiscountCodeRow> = sqlx::query_as(&format!(
            "SELECT {} FROM discount_codes ORDER BY code",
            DISCOUNT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DiscountCode::try_from).collect()
    }

    async fn hierarchy_snapshot(&self) -> EngineResult<HierarchySnapshot> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let version: i64 =
            sqlx::query_scalar("SELECT version FROM hierarchy_state WHERE singleton")
                .fetch_one(&mut *tx)
                .await?;
        let rows: Vec<AgentRow> =
            sqlx::query_as(&format!("SELECT {} FROM agents", AGENT_COLUMNS))
                .fetch_all(&mut *tx)
                .await?;

        tx.commit().await?;

        Ok(HierarchySnapshot {
            version,
            agents: rows.into_iter().map(Agent::from).collect(),
        })
    }

    async fn commit_hierarchy_edit(&self, edit: HierarchyEdit) -> EngineResult<bool> {
        let mut tx = self.pool.begin().await?;

        let bumped = sqlx::query(
            r#"
            UPDATE hierarchy_state
            SET version = version + 1
            WHERE singleton AND version = $1
            "#,
        )
        .bind(edit.expected_version)
        .execute(&mut *tx)
        .await?;

        if bumped.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        for agent in &edit.upserts {
            sqlx::query(
                r#"
                INSERT INTO agents (
                    id, name, upline_agent_id, hierarchy_level,
                    override_rate_cents, override_eligible
                ) VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id) DO UPDATE SET
                    name = EXCLUDED.name,
                    upline_agent_id = EXCLUDED.upline_agent_id,
                    hierarchy_level = EXCLUDED.hierarchy_level,
                    override_rate_cents = EXCLUDED.override_rate_cents,
                    override_eligible = EXCLUDED.override_eligible
                "#,
            )
            .bind(agent.id)
            .bind(&agent.name)
            .bind(agent.upline_agent_id)
            .bind(to_int4(agent.hierarchy_level, "hierarchy level")?)
            .bind(agent.override_rate_cents)
            .bind(agent.override_eligible)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(audit) = &edit.audit {
            sqlx::query(
                r#"
                INSERT INTO hierarchy_audit (
                    id, agent_id, previous_upline_id, new_upline_id,
                    previous_rate_cents, new_rate_cents, reason, recorded_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(audit.id)
            .bind(audit.agent_id)
            .bind(audit.previous_upline_id)
            .bind(audit.new_upline_id)
            .bind(audit.previous_rate_cents)
            .bind(audit.new_rate_cents)
            .bind(&audit.reason)
            .bind(audit.recorded_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn enrollment(&self, id: Uuid) -> EngineResult<Option<Enrollment>> {
        let row: Option<EnrollmentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM enrollments WHERE id = $1",
            ENROLLMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Enrollment::try_from).transpose()
    }

    async fn insert_enrollment(&self, enrollment: &Enrollment) -> EngineResult<()> {
        let consent = enrollment.consent.as_ref();
        sqlx::query(
            r#"
            INSERT INTO enrollments (
                id, plan_id, coverage_tier, add_on_ids, applied_discount,
                status, pending_reason, consent_type, consent_notes, consent_recorded_at,
                enrolling_agent_id, price_snapshot, first_activated_at, version,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(enrollment.id)
        .bind(enrollment.plan_id)
        .bind(enrollment.coverage_tier.as_str())
        .bind(&enrollment.add_on_ids)
        .bind(enrollment.applied_discount.as_ref().map(Json))
        .bind(enrollment.status.as_str())
        .bind(enrollment.pending_reason.as_ref().map(Json))
        .bind(consent.map(|c| c.consent_type.as_str()))
        .bind(consent.map(|c| c.notes.as_str()))
        .bind(consent.map(|c| c.recorded_at))
        .bind(enrollment.enrolling_agent_id)
        .bind(enrollment.price_snapshot.map(Json))
        .bind(enrollment.first_activated_at)
        .bind(enrollment.version)
        .bind(enrollment.created_at)
        .bind(enrollment.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_enrollment(
        &self,
        enrollment: &Enrollment,
        expected_version: i64,
    ) -> EngineResult<bool> {
        let mut conn = self.pool.acquire().await?;
        write_enrollment(&mut conn, enrollment, expected_version).await
    }

    async fn activate_enrollment(
        &self,
        enrollment: &Enrollment,
        expected_version: i64,
        batch: &[Commission],
    ) -> EngineResult<bool> {
        let mut tx = self.pool.begin().await?;

        // The guarded update takes the row lock, so a concurrent cancel
        // either lands before (version moved) or waits for this commit.
        if !write_enrollment(&mut tx, enrollment, expected_version).await? {
            tx.rollback().await?;
            return Ok(false);
        }

        if insert_commission_rows(&mut tx, batch).await? == BatchOutcome::AlreadyExists {
            tx.rollback().await?;
            return Err(EngineError::Conflict(format!(
                "enrollment {} was commissioned concurrently",
                enrollment.id
            )));
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn commissioned_enrollments_without_direct(&self) -> EngineResult<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT e.id
            FROM enrollments e
            WHERE e.first_activated_at IS NOT NULL
              AND NOT EXISTS (
                  SELECT 1 FROM commissions c
                  WHERE c.enrollment_id = e.id AND c.role = 'direct'
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn commissions_without_activation(&self) -> EngineResult<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT c.enrollment_id
            FROM commissions c
            LEFT JOIN enrollments e ON e.id = c.enrollment_id
            WHERE e.first_activated_at IS NULL
            ORDER BY c.enrollment_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn has_direct_commission(&self, enrollment_id: Uuid) -> EngineResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM commissions
                WHERE enrollment_id = $1 AND role = 'direct'
            )
            "#,
        )
        .bind(enrollment_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_commission_batch(&self, batch: &[Commission]) -> EngineResult<BatchOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = insert_commission_rows(&mut tx, batch).await?;
        match outcome {
            BatchOutcome::Inserted => tx.commit().await?,
            BatchOutcome::AlreadyExists => tx.rollback().await?,
        }
        Ok(outcome)
    }

    async fn commissions_for_enrollment(
        &self,
        enrollment_id: Uuid,
    ) -> EngineResult<Vec<Commission>> {
        let rows: Vec<CommissionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM commissions WHERE enrollment_id = $1 ORDER BY depth",
            COMMISSION_COLUMNS
        ))
        .bind(enrollment_id)
        .fetch_all(&self.pool)
        .await?;
        commissions_from_rows(rows)
    }

    async fn commissions_for_agent(
        &self,
        agent_id: Uuid,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> EngineResult<Vec<Commission>> {
        let rows: Vec<CommissionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM commissions \
             WHERE agent_id = $1 AND created_at >= $2 AND created_at < $3 \
             ORDER BY created_at",
            COMMISSION_COLUMNS
        ))
        .bind(agent_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        commissions_from_rows(rows)
    }

    async fn commission(&self, id: Uuid) -> EngineResult<Option<Commission>> {
        let row: Option<CommissionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM commissions WHERE id = $1",
            COMMISSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Commission::try_from).transpose()
    }

    async fn update_commission_status(
        &self,
        id: Uuid,
        expected: CommissionStatus,
        next: CommissionStatus,
    ) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE commissions
            SET status = $3
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(next.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

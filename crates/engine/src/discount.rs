//! Discount codes
//!
//! Validation is a pure read. Consumption re-validates and increments the
//! usage counter with a compare-and-swap on the value that was read, so two
//! concurrent enrollments can never both take the last use.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::retry::RetryPolicy;
use crate::store::EngineStore;

/// How much a code takes off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscountShape {
    /// Flat amount in cents
    Fixed { amount_cents: i64 },
    /// Share of the subtotal in basis points (1000 = 10%)
    Percentage { basis_points: i64 },
}

impl DiscountShape {
    pub fn kind(&self) -> &'static str {
        match self {
            DiscountShape::Fixed { .. } => "fixed",
            DiscountShape::Percentage { .. } => "percentage",
        }
    }

    pub fn value(&self) -> i64 {
        match self {
            DiscountShape::Fixed { amount_cents } => *amount_cents,
            DiscountShape::Percentage { basis_points } => *basis_points,
        }
    }

    pub fn from_parts(kind: &str, value: i64) -> Option<Self> {
        match kind {
            "fixed" => Some(DiscountShape::Fixed {
                amount_cents: value,
            }),
            "percentage" => Some(DiscountShape::Percentage {
                basis_points: value,
            }),
            _ => None,
        }
    }
}

/// How many billing cycles a code keeps applying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscountDuration {
    /// First cycle only
    Once,
    /// The first `months` cycles
    LimitedMonths { months: u32 },
    /// Every cycle
    Indefinite,
}

impl DiscountDuration {
    /// Whether the discount still applies after `cycles_elapsed` billed cycles.
    pub fn applies_at(&self, cycles_elapsed: u32) -> bool {
        match self {
            DiscountDuration::Once => cycles_elapsed == 0,
            DiscountDuration::LimitedMonths { months } => cycles_elapsed < *months,
            DiscountDuration::Indefinite => true,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DiscountDuration::Once => "once",
            DiscountDuration::LimitedMonths { .. } => "limited_months",
            DiscountDuration::Indefinite => "indefinite",
        }
    }

    pub fn months(&self) -> Option<u32> {
        match self {
            DiscountDuration::LimitedMonths { months } => Some(*months),
            _ => None,
        }
    }

    /// `limited_months` without a positive month count is rejected.
    pub fn from_parts(kind: &str, months: Option<i32>) -> Option<Self> {
        match (kind, months) {
            ("once", _) => Some(DiscountDuration::Once),
            ("indefinite", _) => Some(DiscountDuration::Indefinite),
            ("limited_months", Some(m)) if m > 0 => {
                Some(DiscountDuration::LimitedMonths { months: m as u32 })
            }
            _ => None,
        }
    }
}

/// The part of a code that pricing needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountTerms {
    pub shape: DiscountShape,
    pub duration: DiscountDuration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscountCode {
    pub id: Uuid,
    /// Normalized (trimmed, uppercase)
    pub code: String,
    pub terms: DiscountTerms,
    pub max_uses: Option<i32>,
    pub current_uses: i32,
    pub valid_from: Option<OffsetDateTime>,
    pub valid_until: Option<OffsetDateTime>,
    pub is_active: bool,
}

impl DiscountCode {
    /// Check activity, window and cap as of a point in time.
    pub fn check_usable(&self, as_of: OffsetDateTime) -> EngineResult<()> {
        if !self.is_active {
            return Err(EngineError::DiscountInactive(self.code.clone()));
        }
        if let Some(valid_from) = self.valid_from {
            if as_of < valid_from {
                return Err(EngineError::DiscountNotYetValid {
                    code: self.code.clone(),
                    valid_from,
                });
            }
        }
        if let Some(valid_until) = self.valid_until {
            if as_of > valid_until {
                return Err(EngineError::DiscountExpired {
                    code: self.code.clone(),
                    valid_until,
                });
            }
        }
        if let Some(max_uses) = self.max_uses {
            if self.current_uses >= max_uses {
                return Err(EngineError::DiscountExhausted {
                    code: self.code.clone(),
                    max_uses,
                });
            }
        }
        Ok(())
    }

    pub fn remaining_uses(&self) -> Option<i32> {
        self.max_uses
            .map(|max| (max - self.current_uses).max(0))
    }
}

/// Result of a successful validation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscountValidation {
    pub code: String,
    pub terms: DiscountTerms,
    pub remaining_uses: Option<i32>,
}

/// Discount as captured on an enrollment. Never re-validated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedDiscount {
    pub code: String,
    pub terms: DiscountTerms,
}

/// Result of a successful consumption
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscountConsumption {
    pub applied: AppliedDiscount,
    pub uses_after: i32,
}

pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Validates and consumes discount codes
pub struct DiscountService<S> {
    store: Arc<S>,
    retry: RetryPolicy,
}

impl<S> Clone for DiscountService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            retry: self.retry,
        }
    }
}

impl<S: EngineStore> DiscountService<S> {
    pub fn new(store: Arc<S>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Validate a code without using it up
    pub async fn validate(
        &self,
        code: &str,
        as_of: OffsetDateTime,
    ) -> EngineResult<DiscountValidation> {
        let discount = self.load(code).await?;
        discount.check_usable(as_of)?;

        Ok(DiscountValidation {
            remaining_uses: discount.remaining_uses(),
            code: discount.code,
            terms: discount.terms,
        })
    }

    /// Take one use of a code
    ///
    /// The counter is only written if it still holds the value this call read.
    /// A lost race re-reads and re-validates, so a code that filled up in the
    /// meantime fails with `DiscountExhausted` rather than overshooting.
    pub async fn consume(
        &self,
        code: &str,
        as_of: OffsetDateTime,
    ) -> EngineResult<DiscountConsumption> {
        self.retry
            .run("discount_consume", || self.try_consume(code, as_of))
            .await
    }

    async fn try_consume(
        &self,
        code: &str,
        as_of: OffsetDateTime,
    ) -> EngineResult<DiscountConsumption> {
        let discount = self.load(code).await?;
        discount.check_usable(as_of)?;

        let swapped = self
            .store
            .compare_and_swap_uses(discount.id, discount.current_uses)
            .await?;

        if !swapped {
            return Err(EngineError::Conflict(format!(
                "usage counter for {} changed during consumption",
                discount.code
            )));
        }

        let uses_after = discount.current_uses + 1;
        tracing::info!(
            code = %discount.code,
            uses_after,
            max_uses = ?discount.max_uses,
            "Consumed discount code"
        );

        Ok(DiscountConsumption {
            applied: AppliedDiscount {
                code: discount.code,
                terms: discount.terms,
            },
            uses_after,
        })
    }

    async fn load(&self, code: &str) -> EngineResult<DiscountCode> {
        let normalized = normalize_code(code);
        if normalized.is_empty() {
            return Err(EngineError::DiscountNotFound(normalized));
        }
        self.store
            .discount_code(&normalized)
            .await?
            .ok_or(EngineError::DiscountNotFound(normalized))
    }
}

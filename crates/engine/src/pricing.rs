//! Monthly price calculation
//!
//! Pure functions over catalog data. The caller tracks how many billing
//! cycles have elapsed since the discount was first applied and passes that
//! in; nothing here reads a clock or a store.

use enrollhub_shared::{apply_bps_half_up, CoverageTier};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::discount::{DiscountShape, DiscountTerms};

/// Catalog plan. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub base_price_cents: i64,
    pub feature_tier: String,
    /// Paid to the enrolling agent on first activation
    pub direct_commission_cents: i64,
}

/// Per-coverage-tier prices for an add-on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddOnPrices {
    pub individual_cents: i64,
    pub spouse_cents: i64,
    pub child_cents: i64,
    pub family_cents: i64,
}

impl AddOnPrices {
    pub fn for_tier(&self, tier: CoverageTier) -> i64 {
        match tier {
            CoverageTier::Individual => self.individual_cents,
            CoverageTier::Spouse => self.spouse_cents,
            CoverageTier::Child => self.child_cents,
            CoverageTier::Family => self.family_cents,
        }
    }
}

/// Optional rider such as prescription savings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddOn {
    pub id: Uuid,
    pub name: String,
    pub prices: AddOnPrices,
}

/// One cycle's charge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub processing_fee_cents: i64,
    pub total_cents: i64,
    /// False when the discount's duration has run out for this cycle
    pub discount_applied: bool,
}

impl PriceBreakdown {
    pub fn discounted_subtotal_cents(&self) -> i64 {
        self.subtotal_cents - self.discount_cents
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PricingCalculator {
    processing_fee_bps: i64,
}

impl PricingCalculator {
    pub fn new(processing_fee_bps: i64) -> Self {
        Self {
            processing_fee_bps: processing_fee_bps.max(0),
        }
    }

    pub fn processing_fee_bps(&self) -> i64 {
        self.processing_fee_bps
    }

    /// Price one billing cycle
    ///
    /// `cycles_elapsed` is 0 for the first charge. A `once` discount only
    /// applies at 0; `limited_months(n)` applies while fewer than `n` cycles
    /// have elapsed; `indefinite` always applies.
    pub fn compute_monthly(
        &self,
        plan: &Plan,
        add_ons: &[AddOn],
        discount: Option<&DiscountTerms>,
        coverage_tier: CoverageTier,
        cycles_elapsed: u32,
    ) -> PriceBreakdown {
        let subtotal_cents = plan.base_price_cents.max(0)
            + add_ons
                .iter()
                .map(|addon| addon.prices.for_tier(coverage_tier).max(0))
                .sum::<i64>();

        let active_discount = discount.filter(|terms| terms.duration.applies_at(cycles_elapsed));

        let discount_cents = match active_discount.map(|terms| terms.shape) {
            Some(DiscountShape::Fixed { amount_cents }) => amount_cents.clamp(0, subtotal_cents),
            Some(DiscountShape::Percentage { basis_points }) => {
                apply_bps_half_up(subtotal_cents, basis_points).min(subtotal_cents)
            }
            None => 0,
        };

        let discounted = subtotal_cents - discount_cents;
        let processing_fee_cents = apply_bps_half_up(discounted, self.processing_fee_bps);

        PriceBreakdown {
            subtotal_cents,
            discount_cents,
            processing_fee_cents,
            total_cents: (discounted + processing_fee_cents).max(0),
            discount_applied: active_discount.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discount::DiscountDuration;

    fn plan(base_price_cents: i64) -> Plan {
        Plan {
            id: Uuid::new_v4(),
            name: "Essentials".into(),
            base_price_cents,
            feature_tier: "standard".into(),
            direct_commission_cents: 2_500,
        }
    }

    fn rx_rider() -> AddOn {
        AddOn {
            id: Uuid::new_v4(),
            name: "Prescription savings".into(),
            prices: AddOnPrices {
                individual_cents: 1_000,
                spouse_cents: 1_500,
                child_cents: 1_200,
                family_cents: 2_500,
            },
        }
    }

    fn fixed(amount_cents: i64, duration: DiscountDuration) -> DiscountTerms {
        DiscountTerms {
            shape: DiscountShape::Fixed { amount_cents },
            duration,
        }
    }

    fn percent(basis_points: i64, duration: DiscountDuration) -> DiscountTerms {
        DiscountTerms {
            shape: DiscountShape::Percentage { basis_points },
            duration,
        }
    }

    #[test]
    fn test_no_discount_adds_fee() {
        let calc = PricingCalculator::new(400);
        let price = calc.compute_monthly(&plan(10_000), &[], None, CoverageTier::Individual, 0);
        assert_eq!(price.subtotal_cents, 10_000);
        assert_eq!(price.discount_cents, 0);
        assert_eq!(price.processing_fee_cents, 400);
        assert_eq!(price.total_cents, 10_400);
        assert!(!price.discount_applied);
    }

    #[test]
    fn test_add_on_priced_by_coverage_tier() {
        let calc = PricingCalculator::new(0);
        let addons = [rx_rider()];
        let individual =
            calc.compute_monthly(&plan(10_000), &addons, None, CoverageTier::Individual, 0);
        let family = calc.compute_monthly(&plan(10_000), &addons, None, CoverageTier::Family, 0);
        assert_eq!(individual.subtotal_cents, 11_000);
        assert_eq!(family.subtotal_cents, 12_500);
    }

    #[test]
    fn test_fixed_discount_welcome20() {
        let calc = PricingCalculator::new(400);
        let terms = fixed(2_000, DiscountDuration::Once);
        let price =
            calc.compute_monthly(&plan(10_000), &[], Some(&terms), CoverageTier::Individual, 0);
        assert_eq!(price.discount_cents, 2_000);
        assert_eq!(price.discounted_subtotal_cents(), 8_000);
        assert_eq!(price.processing_fee_cents, 320);
        assert_eq!(price.total_cents, 8_320);
    }

    #[test]
    fn test_fixed_discount_larger_than_subtotal_floors_at_zero() {
        let calc = PricingCalculator::new(400);
        let terms = fixed(50_000, DiscountDuration::Indefinite);
        let price =
            calc.compute_monthly(&plan(10_000), &[], Some(&terms), CoverageTier::Individual, 0);
        assert_eq!(price.discount_cents, 10_000);
        assert_eq!(price.processing_fee_cents, 0);
        assert_eq!(price.total_cents, 0);
    }

    #[test]
    fn test_percentage_once_expires_after_first_cycle() {
        // SAVE10PCT on a $150 plan
        let calc = PricingCalculator::new(400);
        let terms = percent(1_000, DiscountDuration::Once);
        let p = plan(15_000);

        let first = calc.compute_monthly(&p, &[], Some(&terms), CoverageTier::Individual, 0);
        assert_eq!(first.discount_cents, 1_500);
        assert_eq!(first.processing_fee_cents, 540);
        assert_eq!(first.total_cents, 13_500 + 540);

        let second = calc.compute_monthly(&p, &[], Some(&terms), CoverageTier::Individual, 1);
        assert!(!second.discount_applied);
        assert_eq!(second.discount_cents, 0);
        assert_eq!(second.total_cents, 15_000 + 600);
    }

    #[test]
    fn test_limited_months_stops_after_count() {
        let calc = PricingCalculator::new(0);
        let terms = percent(2_500, DiscountDuration::LimitedMonths { months: 3 });
        let p = plan(10_000);

        for cycle in 0..3 {
            let price = calc.compute_monthly(&p, &[], Some(&terms), CoverageTier::Individual, cycle);
            assert_eq!(price.discount_cents, 2_500, "cycle {}", cycle);
        }
        let fourth = calc.compute_monthly(&p, &[], Some(&terms), CoverageTier::Individual, 3);
        assert_eq!(fourth.discount_cents, 0);
    }

    #[test]
    fn test_percentage_rounds_half_up() {
        let calc = PricingCalculator::new(0);
        // 15% of $10.10 = 151.5 cents -> 152
        let terms = percent(1_500, DiscountDuration::Indefinite);
        let price =
            calc.compute_monthly(&plan(1_010), &[], Some(&terms), CoverageTier::Individual, 0);
        assert_eq!(price.discount_cents, 152);
        assert_eq!(price.total_cents, 858);
    }

    #[test]
    fn test_percentage_over_100_caps_at_subtotal() {
        let calc = PricingCalculator::new(400);
        let terms = percent(15_000, DiscountDuration::Indefinite);
        let price =
            calc.compute_monthly(&plan(10_000), &[], Some(&terms), CoverageTier::Individual, 0);
        assert_eq!(price.discount_cents, 10_000);
        assert_eq!(price.total_cents, 0);
    }

    #[test]
    fn test_total_never_negative_for_fixed_discounts() {
        let calc = PricingCalculator::new(400);
        for subtotal in [0_i64, 1, 99, 100, 1_999, 10_000, 123_456] {
            for amount in [0_i64, 1, 50, 2_000, 10_000, 1_000_000] {
                let terms = fixed(amount, DiscountDuration::Indefinite);
                let price = calc.compute_monthly(
                    &plan(subtotal),
                    &[],
                    Some(&terms),
                    CoverageTier::Individual,
                    0,
                );
                assert!(
                    price.total_cents >= 0,
                    "subtotal {} discount {} gave {}",
                    subtotal,
                    amount,
                    price.total_cents
                );
                assert!(price.discount_cents <= price.subtotal_cents);
            }
        }
    }
}

//! Integer money helpers
//!
//! Amounts are cents (`i64`). Rates are basis points, where 10_000 bps = 100%.

/// Basis points in a whole.
pub const BPS_DENOMINATOR: i64 = 10_000;

/// Apply a basis-point rate to a cent amount, rounding half-up to the cent.
///
/// Negative amounts or rates are clamped to zero; nothing in pricing charges
/// or discounts a negative quantity.
pub fn apply_bps_half_up(amount_cents: i64, bps: i64) -> i64 {
    if amount_cents <= 0 || bps <= 0 {
        return 0;
    }
    let scaled = amount_cents as i128 * bps as i128;
    let denom = BPS_DENOMINATOR as i128;
    ((scaled + denom / 2) / denom) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_percentage() {
        // 10% of $150.00
        assert_eq!(apply_bps_half_up(15_000, 1_000), 1_500);
    }

    #[test]
    fn test_rounds_half_up() {
        // 4% of $0.125 worth of cents: 1_250 * 400 / 10_000 = 50 exactly
        assert_eq!(apply_bps_half_up(1_250, 400), 50);
        // 4% of 1_237 = 49.48 -> 49
        assert_eq!(apply_bps_half_up(1_237, 400), 49);
        // 4% of 1_238 = 49.52 -> 50
        assert_eq!(apply_bps_half_up(1_238, 400), 50);
        // 15% of 1_010 = 151.5 -> 152
        assert_eq!(apply_bps_half_up(1_010, 1_500), 152);
    }

    #[test]
    fn test_non_positive_inputs_yield_zero() {
        assert_eq!(apply_bps_half_up(0, 400), 0);
        assert_eq!(apply_bps_half_up(-500, 400), 0);
        assert_eq!(apply_bps_half_up(500, 0), 0);
    }

    #[test]
    fn test_large_amounts_do_not_overflow() {
        let big = i64::MAX / 2;
        assert!(apply_bps_half_up(big, BPS_DENOMINATOR) > 0);
    }
}

//! Fixed-point money arithmetic for order totals and rating averages.
//!
//! Every value is rounded to two decimal places, half away from zero, at each
//! step. Rounding is never deferred to the final result.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::entities::order;

/// Sales tax applied to an order's subtotal.
pub const DEFAULT_TAX_RATE: Decimal = dec!(0.13);

/// Flat delivery fee charged on every order.
pub const DEFAULT_DELIVERY_FEE: Decimal = dec!(3.99);

const MONEY_SCALE: u32 = 2;

/// Rounds to cents, half away from zero.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

pub fn line_total(unit_price: Decimal, quantity: i32) -> Decimal {
    round_money(unit_price * Decimal::from(quantity))
}

/// Derived monetary aggregates of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
}

impl OrderTotals {
    /// Computes totals from the line totals currently attached to an order.
    pub fn compute<I>(line_totals: I, delivery_fee: Decimal, tax_rate: Decimal) -> Self
    where
        I: IntoIterator<Item = Decimal>,
    {
        let subtotal = round_money(line_totals.into_iter().sum());
        let tax = round_money(subtotal * tax_rate);
        let total = round_money(subtotal + tax + delivery_fee);
        Self {
            subtotal,
            tax,
            total,
        }
    }

    /// Totals of an order that has no line items yet.
    pub fn empty(delivery_fee: Decimal) -> Self {
        Self::compute(std::iter::empty(), delivery_fee, Decimal::ZERO)
    }

    pub fn of(model: &order::Model) -> Self {
        Self {
            subtotal: model.subtotal,
            tax: model.tax,
            total: model.total,
        }
    }

    /// Numeric comparison against the stored columns; scale differences are ignored.
    pub fn matches(&self, model: &order::Model) -> bool {
        *self == Self::of(model)
    }
}

/// Mean of `ratings` rounded to two places, `None` for an empty slice.
pub fn rating_average(ratings: &[i32]) -> Option<Decimal> {
    if ratings.is_empty() {
        return None;
    }
    let sum: i64 = ratings.iter().map(|r| i64::from(*r)).sum();
    let mean = Decimal::from(sum) / Decimal::from(ratings.len() as u64);
    Some(round_money(mean))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rounds_half_away_from_zero() {
        assert_eq!(round_money(dec!(2.865)), dec!(2.87));
        assert_eq!(round_money(dec!(2.864)), dec!(2.86));
        assert_eq!(round_money(dec!(-1.005)), dec!(-1.01));
    }

    #[test]
    fn placement_example_totals() {
        let lines = [line_total(dec!(8.50), 2), line_total(dec!(5.00), 1)];
        let totals = OrderTotals::compute(lines, DEFAULT_DELIVERY_FEE, DEFAULT_TAX_RATE);
        assert_eq!(totals.subtotal, dec!(22.00));
        assert_eq!(totals.tax, dec!(2.86));
        assert_eq!(totals.total, dec!(28.85));
    }

    #[test]
    fn empty_order_charges_only_delivery() {
        let totals = OrderTotals::compute(Vec::new(), dec!(3.99), DEFAULT_TAX_RATE);
        assert_eq!(totals.subtotal, Decimal::ZERO);
        assert_eq!(totals.tax, Decimal::ZERO);
        assert_eq!(totals.total, dec!(3.99));
        assert_eq!(OrderTotals::empty(dec!(3.99)), totals);
    }

    #[test]
    fn tax_is_rounded_before_total() {
        // 10.05 * 0.13 = 1.3065 -> 1.31, total 10.05 + 1.31 = 11.36
        let totals = OrderTotals::compute([dec!(10.05)], Decimal::ZERO, DEFAULT_TAX_RATE);
        assert_eq!(totals.tax, dec!(1.31));
        assert_eq!(totals.total, dec!(11.36));
    }

    #[test]
    fn line_total_rounds_fractional_prices() {
        assert_eq!(line_total(dec!(0.335), 3), dec!(1.01));
        assert_eq!(line_total(dec!(12.99), 1), dec!(12.99));
    }

    #[test]
    fn rating_average_handles_single_and_repeating() {
        assert_eq!(rating_average(&[]), None);
        assert_eq!(rating_average(&[4]), Some(dec!(4.00)));
        assert_eq!(rating_average(&[5, 4, 4]), Some(dec!(4.33)));
        assert_eq!(rating_average(&[5, 5, 4]), Some(dec!(4.67)));
    }

    fn cents() -> impl Strategy<Value = Decimal> {
        (0i64..1_000_000).prop_map(|c| Decimal::new(c, 2))
    }

    proptest! {
        #[test]
        fn recomputation_is_idempotent(lines in proptest::collection::vec(cents(), 0..20), fee in cents()) {
            let first = OrderTotals::compute(lines.clone(), fee, DEFAULT_TAX_RATE);
            let second = OrderTotals::compute(lines, fee, DEFAULT_TAX_RATE);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn totals_satisfy_the_order_invariant(lines in proptest::collection::vec(cents(), 0..20), fee in cents()) {
            let totals = OrderTotals::compute(lines.clone(), fee, DEFAULT_TAX_RATE);
            let sum: Decimal = lines.iter().copied().sum();
            prop_assert_eq!(totals.subtotal, sum);
            prop_assert_eq!(totals.tax, round_money(totals.subtotal * DEFAULT_TAX_RATE));
            prop_assert_eq!(totals.total, round_money(totals.subtotal + totals.tax + fee));
            prop_assert!(totals.total >= Decimal::ZERO);
        }

        #[test]
        fn rating_average_stays_in_range(ratings in proptest::collection::vec(1i32..=5, 1..50)) {
            let avg = rating_average(&ratings).unwrap();
            prop_assert!(avg >= dec!(1) && avg <= dec!(5));
            prop_assert!(avg.scale() <= 2);
        }
    }
}

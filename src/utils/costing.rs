use rust_decimal::{Decimal, RoundingStrategy};

/// Unit costs are carried at four decimal places.
pub const COST_SCALE: u32 = 4;

pub fn round_cost(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(COST_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Average cost after receiving `incoming` units at `unit_cost` on top of
/// `on_hand` units carried at `average`.
pub fn weighted_average(on_hand: i32, average: Decimal, incoming: i32, unit_cost: Decimal) -> Decimal {
    if incoming <= 0 {
        return average;
    }
    if on_hand <= 0 {
        return round_cost(unit_cost);
    }
    let existing = Decimal::from(on_hand) * average;
    let added = Decimal::from(incoming) * unit_cost;
    let units = Decimal::from(on_hand) + Decimal::from(incoming);
    round_cost((existing + added) / units)
}

/// Splits `total` across `weights` proportionally. Falls back to an even
/// split when no weight is positive. The last share absorbs rounding so the
/// shares always sum to `total` exactly.
pub fn allocate(total: Decimal, weights: &[Decimal]) -> Vec<Decimal> {
    if weights.is_empty() {
        return Vec::new();
    }

    let positive: Decimal = weights.iter().filter(|w| **w > Decimal::ZERO).sum();
    let even = positive <= Decimal::ZERO;
    let denominator = if even { Decimal::from(weights.len()) } else { positive };

    let mut shares = Vec::with_capacity(weights.len());
    let mut assigned = Decimal::ZERO;
    for (idx, weight) in weights.iter().enumerate() {
        if idx + 1 == weights.len() {
            shares.push(total - assigned);
            break;
        }
        let weight = if even { Decimal::ONE } else { (*weight).max(Decimal::ZERO) };
        let share = round_cost(total * weight / denominator);
        assigned += share;
        shares.push(share);
    }
    shares
}

/// Per-unit cost of a line whose combined cost is `line_total`.
pub fn unit_cost(line_total: Decimal, quantity: i32) -> Decimal {
    if quantity <= 0 {
        return Decimal::ZERO;
    }
    round_cost(line_total / Decimal::from(quantity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn receiving_into_empty_stock_takes_incoming_cost() {
        assert_eq!(weighted_average(0, d("99"), 4, d("12.5")), d("12.5"));
    }

    #[test]
    fn receiving_blends_costs_by_quantity() {
        // 10 @ 4.00 + 5 @ 7.00 = 75 / 15
        assert_eq!(weighted_average(10, d("4"), 5, d("7")), d("5"));
        // 3 @ 1.00 + 1 @ 2.00 = 5 / 4
        assert_eq!(weighted_average(3, d("1"), 1, d("2")), d("1.25"));
    }

    #[test]
    fn repeating_averages_are_rounded() {
        assert_eq!(weighted_average(2, d("1"), 1, d("2")), d("1.3333"));
    }

    #[test]
    fn huge_quantities_do_not_overflow_the_average() {
        assert_eq!(weighted_average(i32::MAX, d("2"), i32::MAX, d("4")), d("3"));
    }

    #[test]
    fn zero_incoming_leaves_average_alone() {
        assert_eq!(weighted_average(5, d("3.21"), 0, d("100")), d("3.21"));
    }

    #[test]
    fn allocation_is_proportional_and_exact() {
        let shares = allocate(d("10"), &[d("1"), d("1"), d("1")]);
        assert_eq!(shares, vec![d("3.3333"), d("3.3333"), d("3.3334")]);
        assert_eq!(shares.iter().copied().sum::<Decimal>(), d("10"));

        let shares = allocate(d("30"), &[d("100"), d("200")]);
        assert_eq!(shares, vec![d("10"), d("20")]);
    }

    #[test]
    fn allocation_without_positive_weights_splits_evenly() {
        let shares = allocate(d("9"), &[Decimal::ZERO, Decimal::ZERO, Decimal::ZERO]);
        assert_eq!(shares, vec![d("3"), d("3"), d("3")]);
    }

    #[test]
    fn allocation_of_nothing_is_empty() {
        assert!(allocate(d("5"), &[]).is_empty());
    }

    #[test]
    fn unit_cost_guards_against_zero_quantity() {
        assert_eq!(unit_cost(d("10"), 0), Decimal::ZERO);
        assert_eq!(unit_cost(d("10"), 3), d("3.3333"));
    }
}

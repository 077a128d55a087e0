use rust_decimal::Decimal;

/// Result of blending one fill into an existing position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FillEffect {
    /// Net quantity reached exactly zero; the position row is removed.
    Closed,
    Open {
        quantity: i64,
        average_price: Decimal,
    },
}

/// Blend a signed fill into an existing position.
///
/// Average-price rule:
/// - increasing exposure in the same direction: volume-weighted average of the
///   old position and the fill;
/// - partial close (magnitude shrinks, sign unchanged): average price of the
///   remaining quantity is left as-is;
/// - sign flip: the surviving exposure is entirely new, so the average resets
///   to the fill price;
/// - net zero: position closed.
pub(crate) fn apply_fill(
    existing_quantity: i64,
    existing_average: Decimal,
    delta: i64,
    price: Decimal,
) -> FillEffect {
    let new_quantity = existing_quantity + delta;
    if new_quantity == 0 {
        return FillEffect::Closed;
    }
    if existing_quantity == 0 {
        return FillEffect::Open {
            quantity: new_quantity,
            average_price: price,
        };
    }
    let same_direction = new_quantity.signum() == existing_quantity.signum();
    let average_price = if same_direction && new_quantity.abs() > existing_quantity.abs() {
        let held = existing_average * Decimal::from(existing_quantity.abs());
        let added = price * Decimal::from(delta.abs());
        ((held + added) / Decimal::from(new_quantity.abs())).round_dp(4)
    } else if same_direction {
        existing_average
    } else {
        price
    };
    FillEffect::Open {
        quantity: new_quantity,
        average_price,
    }
}

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::models::{ProductType, Segment};

/// Leverage and brokerage schedule. Loaded from env config; the worker and the
/// placement path only ever go through [`MarginPolicy::calculate`].
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct MarginPolicy {
    pub(crate) equity_intraday_leverage: Decimal,
    pub(crate) equity_delivery_leverage: Decimal,
    pub(crate) derivative_leverage: Decimal,
    /// Fraction of notional charged on equity orders, capped at `brokerage_cap`.
    pub(crate) brokerage_rate: Decimal,
    pub(crate) brokerage_cap: Decimal,
    /// Flat per-order fee for derivative segments.
    pub(crate) derivative_flat_fee: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MarginCharges {
    pub(crate) required_margin: Decimal,
    pub(crate) brokerage: Decimal,
}

impl MarginCharges {
    pub(crate) const ZERO: MarginCharges = MarginCharges {
        required_margin: Decimal::ZERO,
        brokerage: Decimal::ZERO,
    };
}

impl MarginPolicy {
    /// Required margin and brokerage for one order. Pure; degenerate inputs
    /// (non-positive quantity or price) yield zero charges instead of erroring.
    pub(crate) fn calculate(
        &self,
        segment: Segment,
        product: ProductType,
        quantity: i64,
        price: Decimal,
        lot_size: i64,
    ) -> MarginCharges {
        if quantity <= 0 || price <= Decimal::ZERO {
            return MarginCharges::ZERO;
        }
        let lot = if lot_size > 1 {
            Decimal::from(lot_size)
        } else {
            Decimal::ONE
        };
        let notional = Decimal::from(quantity) * price * lot;
        let leverage = match (segment, product) {
            (Segment::Equity, ProductType::Intraday) => self.equity_intraday_leverage,
            (Segment::Equity, ProductType::Delivery) => self.equity_delivery_leverage,
            (Segment::Derivative, _) => self.derivative_leverage,
        };
        let required_margin = if leverage > Decimal::ZERO {
            notional / leverage
        } else {
            notional
        };
        let brokerage = match segment {
            Segment::Equity => (notional * self.brokerage_rate).min(self.brokerage_cap),
            Segment::Derivative => self.derivative_flat_fee,
        };
        MarginCharges {
            required_margin: required_margin.round_dp(2),
            brokerage: brokerage.round_dp(2),
        }
    }
}

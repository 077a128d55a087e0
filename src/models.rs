use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub(crate) enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    /// Fill quantity with sign applied: positive for BUY, negative for SELL.
    pub(crate) fn signed_quantity(&self, quantity: i64) -> i64 {
        match self {
            OrderSide::Buy => quantity,
            OrderSide::Sell => -quantity,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderSide {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(OrderSide::Buy),
            "SELL" => Ok(OrderSide::Sell),
            other => Err(anyhow::anyhow!("unknown order side: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub(crate) enum OrderStatus {
    Pending,
    Executed,
    Cancelled,
}

impl OrderStatus {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Executed => "EXECUTED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OrderStatus::Pending),
            "EXECUTED" => Ok(OrderStatus::Executed),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            other => Err(anyhow::anyhow!("unknown order status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub(crate) enum ProductType {
    Intraday,
    Delivery,
}

impl ProductType {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            ProductType::Intraday => "INTRADAY",
            ProductType::Delivery => "DELIVERY",
        }
    }
}

impl FromStr for ProductType {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INTRADAY" => Ok(ProductType::Intraday),
            "DELIVERY" => Ok(ProductType::Delivery),
            other => Err(anyhow::anyhow!("unknown product type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub(crate) enum Segment {
    Equity,
    Derivative,
}

impl Segment {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Segment::Equity => "EQUITY",
            Segment::Derivative => "DERIVATIVE",
        }
    }
}

impl FromStr for Segment {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EQUITY" => Ok(Segment::Equity),
            "DERIVATIVE" => Ok(Segment::Derivative),
            other => Err(anyhow::anyhow!("unknown segment: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct Order {
    pub(crate) id: Uuid,
    pub(crate) account_id: Uuid,
    pub(crate) instrument_id: Option<Uuid>,
    pub(crate) symbol: String,
    pub(crate) side: OrderSide,
    pub(crate) quantity: i64,
    pub(crate) price: Option<Decimal>,
    pub(crate) product: ProductType,
    pub(crate) status: OrderStatus,
    pub(crate) filled_quantity: i64,
    pub(crate) average_price: Option<Decimal>,
    pub(crate) position_id: Option<Uuid>,
    pub(crate) reason: Option<String>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) executed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct Position {
    pub(crate) id: Uuid,
    pub(crate) account_id: Uuid,
    pub(crate) instrument_id: Uuid,
    pub(crate) symbol: String,
    pub(crate) quantity: i64,
    pub(crate) average_price: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct Instrument {
    pub(crate) id: Uuid,
    pub(crate) symbol: String,
    pub(crate) segment: Segment,
    pub(crate) lot_size: i64,
    pub(crate) quote_token: Option<i64>,
    pub(crate) last_price: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct TradingAccount {
    pub(crate) id: Uuid,
    pub(crate) owner: String,
    pub(crate) balance: Decimal,
    pub(crate) available_margin: Decimal,
    pub(crate) used_margin: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct FundTransaction {
    pub(crate) id: Uuid,
    pub(crate) account_id: Uuid,
    pub(crate) amount: Decimal,
    pub(crate) direction: String,
    pub(crate) kind: String,
    pub(crate) description: String,
    pub(crate) order_id: Option<Uuid>,
    pub(crate) position_id: Option<Uuid>,
    pub(crate) created_at: DateTime<Utc>,
}

/// Operational heartbeat written after each worker batch.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct WorkerHeartbeat {
    pub(crate) host: String,
    pub(crate) pid: i32,
    pub(crate) scanned: i64,
    pub(crate) executed: i64,
    pub(crate) cancelled: i64,
    pub(crate) skipped: i64,
    pub(crate) errors: i64,
    pub(crate) elapsed_ms: i64,
}

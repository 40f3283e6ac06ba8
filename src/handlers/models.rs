//! Wire models carried in message bodies. Field names follow the PascalCase
//! JSON emitted by the order API.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const DEFAULT_ORDER_STATUS: &str = "Pending";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Order {
    pub order_id: String,
    #[serde(default)]
    pub customer_name: String,
    #[serde(default)]
    pub total_amount: Decimal,
    #[serde(default = "Utc::now")]
    pub order_date: DateTime<Utc>,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub items: Vec<OrderItem>,
}

impl Order {
    pub fn new(order_id: impl Into<String>, customer_name: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            customer_name: customer_name.into(),
            total_amount: Decimal::ZERO,
            order_date: Utc::now(),
            status: default_status(),
            items: Vec::new(),
        }
    }

    /// Appends an item and adds its line total to the order amount.
    pub fn with_item(mut self, item: OrderItem) -> Self {
        self.total_amount += item.line_total();
        self.items.push(item);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderItem {
    #[serde(default)]
    pub product_id: String,
    #[serde(default)]
    pub product_name: String,
    #[serde(default)]
    pub quantity: u32,
    #[serde(default)]
    pub price: Decimal,
}

impl OrderItem {
    pub fn line_total(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }
}

/// Status change published to the order topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderStatusUpdate {
    pub order_id: String,
    pub status: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl OrderStatusUpdate {
    pub fn new(order_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            status: status.into(),
            timestamp: Utc::now(),
        }
    }
}

fn default_status() -> String {
    DEFAULT_ORDER_STATUS.to_owned()
}

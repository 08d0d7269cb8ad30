//! Wire types shared by the server handlers, the offline queue, and the sync
//! client. Field names are camelCase on the wire; snake_case aliases are
//! accepted for callers that send them.

use serde::{Deserialize, Serialize};

/// Order status values.
pub const STATUS_PENDING: &str = "PENDIENTE";
pub const STATUS_IN_PROCESS: &str = "EN_PROCESO";
pub const STATUS_PROBLEM: &str = "PROBLEMA";
pub const STATUS_DELIVERED: &str = "delivered";

pub const LOCATION_RECEPTION: &str = "RECEPCION";
pub const LOCATION_PLANT: &str = "PLANTA";

/// Payment status and payment-log types.
pub const PAYMENT_PENDING: &str = "PENDIENTE";
pub const PAYMENT_PARTIAL: &str = "ABONO";
pub const PAYMENT_SETTLED: &str = "CANCELADO";

pub const LOG_INITIAL: &str = "ABONO_INICIAL";
pub const LOG_PARTIAL: &str = "ABONO";
pub const LOG_SETTLEMENT: &str = "CANCELACION";

pub const DEFAULT_PAYMENT_METHOD: &str = "Efectivo";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub cedula: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemInput {
    #[serde(alias = "type", default)]
    pub description: String,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    #[serde(default)]
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

fn default_quantity() -> i64 {
    1
}

impl ItemInput {
    pub fn line_total(&self) -> f64 {
        self.price * self.quantity.max(0) as f64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentInput {
    /// Amount paid so far (initial abono on create).
    #[serde(default, alias = "abono")]
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Explicit order total; item prices are summed when absent or zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
}

/// Body for order creation (`POST /api/orders`, `POST /api/orders/sync`) and
/// update (`PUT /api/orders/sync/{id}`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoicePayload {
    /// Idempotency key; the offline queue sends its local id here.
    #[serde(
        default,
        alias = "client_request_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub client_request_id: Option<String>,
    pub client: ClientInput,
    #[serde(default)]
    pub items: Vec<ItemInput>,
    #[serde(default)]
    pub payment: PaymentInput,
    #[serde(default, alias = "totalValue", skip_serializing_if = "Option::is_none")]
    pub total_value: Option<f64>,
    #[serde(
        default,
        alias = "delivery_date",
        alias = "scheduledDate",
        skip_serializing_if = "Option::is_none"
    )]
    pub delivery_date: Option<String>,
    #[serde(default, alias = "order_status", skip_serializing_if = "Option::is_none")]
    pub order_status: Option<String>,
    /// When the invoice was taken (RFC 3339). Offline invoices keep their
    /// intake time instead of the sync time.
    #[serde(default, alias = "created_at", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl InvoicePayload {
    /// Explicit total when positive, otherwise the sum of the item lines.
    pub fn resolved_total(&self) -> f64 {
        let explicit = self
            .total_value
            .or(self.payment.total)
            .filter(|t| *t > 0.0);
        explicit.unwrap_or_else(|| self.items.iter().map(ItemInput::line_total).sum())
    }

    pub fn payment_method(&self) -> &str {
        self.payment
            .method
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_PAYMENT_METHOD)
    }
}

/// Payment status implied by paid vs total.
pub fn payment_status_for(paid: f64, total: f64) -> &'static str {
    if total > 0.0 && paid >= total {
        PAYMENT_SETTLED
    } else if paid > 0.0 {
        PAYMENT_PARTIAL
    } else {
        PAYMENT_PENDING
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_accepts_aliases() {
        let payload: InvoicePayload = serde_json::from_value(json!({
            "client_request_id": "local-1",
            "client": {"cedula": "1020", "name": "Ana"},
            "items": [{"type": "Saco", "price": 12000.0}],
            "payment": {"abono": 5000.0},
            "deliveryDate": "2025-01-20"
        }))
        .unwrap();
        assert_eq!(payload.client_request_id.as_deref(), Some("local-1"));
        assert_eq!(payload.items[0].description, "Saco");
        assert_eq!(payload.items[0].quantity, 1);
        assert_eq!(payload.payment.amount, 5000.0);
        assert_eq!(payload.resolved_total(), 12000.0);
        assert_eq!(payload.payment_method(), "Efectivo");
    }

    #[test]
    fn test_explicit_total_wins() {
        let payload = InvoicePayload {
            total_value: Some(30000.0),
            items: vec![ItemInput {
                description: "Vestido".into(),
                quantity: 2,
                price: 1000.0,
                notes: None,
            }],
            ..Default::default()
        };
        assert_eq!(payload.resolved_total(), 30000.0);
    }

    #[test]
    fn test_payment_status_rule() {
        assert_eq!(payment_status_for(0.0, 100.0), PAYMENT_PENDING);
        assert_eq!(payment_status_for(40.0, 100.0), PAYMENT_PARTIAL);
        assert_eq!(payment_status_for(100.0, 100.0), PAYMENT_SETTLED);
        assert_eq!(payment_status_for(150.0, 100.0), PAYMENT_SETTLED);
        // Zero-total orders never count as settled.
        assert_eq!(payment_status_for(10.0, 0.0), PAYMENT_PARTIAL);
    }
}

//! # Validation Module
//!
//! Pre-enqueue validation for recorded sales.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Terminal UI                                                  │
//! │  ├── Basic format checks (empty, length)                               │
//! │  └── Immediate user feedback                                           │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Queue enqueue (Rust)                                         │
//! │  ├── Type validation (deserialization)                                 │
//! │  └── THIS MODULE: totals consistency, tender coverage                  │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Server                                                       │
//! │  └── Authoritative validation during sync (4xx → permanent failure)    │
//! │                                                                         │
//! │  Defense in depth: a transaction that cannot possibly be accepted      │
//! │  by the server is rejected BEFORE it is durably queued.                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::ValidationError;
use crate::money::Money;
use crate::types::{PaymentMethod, TransactionDraft};
use crate::{MAX_ITEM_QUANTITY, MAX_LINE_ITEMS};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Identifier Validators
// =============================================================================

/// Validates a required identifier field.
///
/// ## Rules
/// - Must not be empty after trimming
/// - Must be at most 64 characters
pub fn validate_required_id(field: &str, value: &str) -> ValidationResult<()> {
    let value = value.trim();

    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.len() > 64 {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: 64,
        });
    }

    Ok(())
}

/// Validates a UUID string format.
pub fn validate_uuid(field: &str, id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    uuid::Uuid::parse_str(id).map_err(|_| ValidationError::InvalidFormat {
        field: field.to_string(),
        reason: "must be a valid UUID".to_string(),
    })?;

    Ok(())
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates a quantity value.
///
/// ## Rules
/// - Must be positive (> 0)
/// - Must not exceed MAX_ITEM_QUANTITY (999)
pub fn validate_quantity(qty: i64) -> ValidationResult<()> {
    if qty <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }

    if qty > MAX_ITEM_QUANTITY {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 1,
            max: MAX_ITEM_QUANTITY,
        });
    }

    Ok(())
}

/// Validates an amount in cents that must be non-negative.
/// Zero is allowed (free items, zero tax, no discount).
pub fn validate_amount_cents(field: &str, cents: i64) -> ValidationResult<()> {
    if cents < 0 {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            min: 0,
            max: i64::MAX,
        });
    }

    Ok(())
}

// =============================================================================
// Transaction Validation
// =============================================================================

/// Validates a recorded sale before it is durably queued.
///
/// ## Rules
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │  1. store_id / user_id / shift_id present                              │
/// │  2. at least one line item, at most MAX_LINE_ITEMS                     │
/// │  3. per line: quantity in range, prices non-negative,                  │
/// │     line_total == quantity × unit_price                               │
/// │  4. subtotal == Σ line totals                                          │
/// │  5. total == subtotal - discount + tax                                 │
/// │  6. cash sales: tendered covers total; change (when given) is exact   │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
pub fn validate_transaction(draft: &TransactionDraft) -> ValidationResult<()> {
    validate_required_id("store_id", &draft.store_id)?;
    validate_required_id("user_id", &draft.user_id)?;
    validate_required_id("shift_id", &draft.shift_id)?;

    // Line items
    if draft.items.is_empty() {
        return Err(ValidationError::Required {
            field: "items".to_string(),
        });
    }

    if draft.items.len() > MAX_LINE_ITEMS {
        return Err(ValidationError::OutOfRange {
            field: "items".to_string(),
            min: 1,
            max: MAX_LINE_ITEMS as i64,
        });
    }

    let mut items_total = Money::zero();
    for item in &draft.items {
        validate_required_id("product_id", &item.product_id)?;
        validate_quantity(item.quantity)?;
        validate_amount_cents("unit_price", item.unit_price_cents)?;
        validate_amount_cents("line_total", item.line_total_cents)?;

        let expected = item.unit_price().multiply_quantity(item.quantity);
        if expected != item.line_total() {
            return Err(ValidationError::Inconsistent {
                field: "line_total".to_string(),
                reason: format!(
                    "product {}: expected {} (= {} × {}), got {}",
                    item.product_id,
                    expected,
                    item.unit_price(),
                    item.quantity,
                    item.line_total()
                ),
            });
        }

        items_total += item.line_total();
    }

    // Financial totals
    validate_amount_cents("subtotal", draft.subtotal_cents)?;
    validate_amount_cents("tax", draft.tax_cents)?;
    validate_amount_cents("discount", draft.discount_cents)?;
    validate_amount_cents("total", draft.total_cents)?;
    validate_amount_cents("tendered", draft.tendered_cents)?;

    let subtotal = Money::from_cents(draft.subtotal_cents);
    if subtotal != items_total {
        return Err(ValidationError::Inconsistent {
            field: "subtotal".to_string(),
            reason: format!("line items sum to {items_total}, subtotal is {subtotal}"),
        });
    }

    let expected_total =
        subtotal - Money::from_cents(draft.discount_cents) + Money::from_cents(draft.tax_cents);
    let total = Money::from_cents(draft.total_cents);
    if total != expected_total {
        return Err(ValidationError::Inconsistent {
            field: "total".to_string(),
            reason: format!("expected {expected_total} (subtotal - discount + tax), got {total}"),
        });
    }

    // Tender coverage: only cash physically tenders money at the till
    if draft.payment_method == PaymentMethod::Cash {
        let tendered = Money::from_cents(draft.tendered_cents);
        match tendered.checked_change(total) {
            None => {
                return Err(ValidationError::Inconsistent {
                    field: "tendered".to_string(),
                    reason: format!("tendered {tendered} does not cover total {total}"),
                });
            }
            Some(change) => {
                if let Some(recorded) = draft.change_cents {
                    if Money::from_cents(recorded) != change {
                        return Err(ValidationError::Inconsistent {
                            field: "change".to_string(),
                            reason: format!(
                                "recorded {} but tendered - total = {}",
                                Money::from_cents(recorded),
                                change
                            ),
                        });
                    }
                }
            }
        }
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LineItem;

    fn draft() -> TransactionDraft {
        TransactionDraft {
            store_id: "store-1".into(),
            user_id: "user-1".into(),
            shift_id: "shift-1".into(),
            customer_id: None,
            items: vec![LineItem {
                product_id: "prod-1".into(),
                variation_id: None,
                name: "Iced Latte 16oz".into(),
                quantity: 2,
                unit_price_cents: 7500,
                line_total_cents: 15000,
                category: None,
                sku: None,
            }],
            subtotal_cents: 15000,
            tax_cents: 1800,
            discount_cents: 0,
            total_cents: 16800,
            tendered_cents: 20000,
            change_cents: Some(3200),
            payment_method: PaymentMethod::Cash,
            payment_details: None,
            order_type: None,
            delivery_platform: None,
            delivery_order_number: None,
        }
    }

    #[test]
    fn test_valid_transaction() {
        assert!(validate_transaction(&draft()).is_ok());
    }

    #[test]
    fn test_missing_identifiers() {
        let mut d = draft();
        d.store_id = "".into();
        assert!(validate_transaction(&d).is_err());

        let mut d = draft();
        d.shift_id = "   ".into();
        assert!(validate_transaction(&d).is_err());
    }

    #[test]
    fn test_empty_items_rejected() {
        let mut d = draft();
        d.items.clear();
        assert!(matches!(
            validate_transaction(&d),
            Err(ValidationError::Required { .. })
        ));
    }

    #[test]
    fn test_line_total_mismatch() {
        let mut d = draft();
        d.items[0].line_total_cents = 14000;
        assert!(matches!(
            validate_transaction(&d),
            Err(ValidationError::Inconsistent { .. })
        ));
    }

    #[test]
    fn test_subtotal_mismatch() {
        let mut d = draft();
        d.subtotal_cents = 14000;
        assert!(validate_transaction(&d).is_err());
    }

    #[test]
    fn test_total_formula() {
        let mut d = draft();
        // discount of 1000 must lower the total
        d.discount_cents = 1000;
        assert!(validate_transaction(&d).is_err());

        d.total_cents = 15800;
        d.change_cents = Some(4200);
        assert!(validate_transaction(&d).is_ok());
    }

    #[test]
    fn test_cash_tender_must_cover_total() {
        let mut d = draft();
        d.tendered_cents = 10000;
        assert!(validate_transaction(&d).is_err());
    }

    #[test]
    fn test_wrong_change_rejected() {
        let mut d = draft();
        d.change_cents = Some(1);
        assert!(validate_transaction(&d).is_err());
    }

    #[test]
    fn test_card_sale_ignores_tender_coverage() {
        let mut d = draft();
        d.payment_method = PaymentMethod::Card;
        d.tendered_cents = 0;
        d.change_cents = None;
        assert!(validate_transaction(&d).is_ok());
    }

    #[test]
    fn test_validate_quantity() {
        assert!(validate_quantity(1).is_ok());
        assert!(validate_quantity(999).is_ok());
        assert!(validate_quantity(0).is_err());
        assert!(validate_quantity(-1).is_err());
        assert!(validate_quantity(1000).is_err());
    }

    #[test]
    fn test_validate_uuid() {
        assert!(validate_uuid("id", "550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(validate_uuid("id", "").is_err());
        assert!(validate_uuid("id", "not-a-uuid").is_err());
    }
}

//! Receipt schema validation: JSON span → typed [`ReceiptOutcome`].
//!
//! Pure transform, no I/O. The model's JSON is decoded, routed on the
//! `is_receipt` flag, and then normalised:
//!
//! * `category` must be one of the six [`ExpenseCategory`] labels
//! * negative line-item amounts become positive magnitudes
//! * totals are recomputed from the items (see [`ReceiptRecord::reconcile_totals`])
//!
//! Two-step mode's first call only needs the flag, so [`parse_verdict`] is a
//! separate, lighter decode that never looks at items or totals.

use crate::categories::{ExpenseCategory, UnknownCategory};
use crate::error::SchemaError;
use crate::receipt::{
    LineItem, Merchant, NotAReceipt, ReceiptOutcome, ReceiptRecord, Totals, Transaction,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

/// Wire shape of a receipt answer before category validation.
#[derive(Deserialize)]
struct RawReceipt {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    merchant: Option<Merchant>,
    #[serde(default)]
    transaction: Option<Transaction>,
    #[serde(default)]
    items: Option<Vec<LineItem>>,
    #[serde(default)]
    totals: Option<Totals>,
    #[serde(default)]
    notes: Option<String>,
}

/// Decode and validate a full extraction answer.
///
/// # Errors
/// * [`SchemaError::MalformedJson`] — `span` is not JSON
/// * [`SchemaError::InvalidCategory`] — category outside the enumeration
/// * [`SchemaError::Invalid`] — wrong shape, missing `reason` or `description`
pub fn parse_receipt(span: &str, tolerance: f64) -> Result<ReceiptOutcome, SchemaError> {
    let value: Value =
        serde_json::from_str(span).map_err(|e| SchemaError::MalformedJson(e.to_string()))?;
    let object = expect_object(&value)?;

    if object.get("is_receipt") != Some(&Value::Bool(true)) {
        let verdict: NotAReceipt = serde_json::from_value(value)
            .map_err(|e| SchemaError::Invalid(format!("not-a-receipt answer: {e}")))?;
        debug!("Model says not a receipt: {}", verdict.reason);
        return Ok(ReceiptOutcome::NotAReceipt(verdict));
    }

    let raw: RawReceipt = serde_json::from_value(value)
        .map_err(|e| SchemaError::Invalid(format!("receipt answer: {e}")))?;

    let category = raw
        .category
        .map(|c| c.parse::<ExpenseCategory>())
        .transpose()
        .map_err(|UnknownCategory(value)| SchemaError::InvalidCategory {
            value,
            valid: ExpenseCategory::valid_names(),
        })?;

    let mut items = raw.items.unwrap_or_default();
    items.iter_mut().for_each(LineItem::normalise);

    let mut record = ReceiptRecord {
        category,
        merchant: raw.merchant,
        transaction: raw.transaction,
        items,
        totals: raw.totals,
        notes: raw.notes,
    };
    record.reconcile_totals(tolerance);

    debug!(
        "Parsed receipt: {} items, total {:?}",
        record.items.len(),
        record.totals.as_ref().and_then(|t| t.total)
    );
    Ok(ReceiptOutcome::Receipt(record))
}

/// The answer to the two-step validation call.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationVerdict {
    pub is_receipt: bool,
    pub reason: Option<String>,
}

/// Read only `is_receipt` (and `reason`, if any) from a validation answer.
///
/// A missing or `null` flag counts as "not a receipt".
pub fn parse_verdict(span: &str) -> Result<ValidationVerdict, SchemaError> {
    let value: Value =
        serde_json::from_str(span).map_err(|e| SchemaError::MalformedJson(e.to_string()))?;
    let object = expect_object(&value)?;

    let is_receipt = match object.get("is_receipt") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(other) => {
            return Err(SchemaError::Invalid(format!(
                "is_receipt must be a boolean, got {other}"
            )))
        }
    };
    let reason = object
        .get("reason")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(ValidationVerdict { is_receipt, reason })
}

fn expect_object(value: &Value) -> Result<&Map<String, Value>, SchemaError> {
    value.as_object().ok_or_else(|| {
        let kind = match value {
            Value::Array(_) => "an array",
            Value::String(_) => "a string",
            Value::Number(_) => "a number",
            Value::Bool(_) => "a boolean",
            Value::Null => "null",
            Value::Object(_) => "an object",
        };
        SchemaError::Invalid(format!("expected a JSON object, got {kind}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receipt::DEFAULT_TOTAL_TOLERANCE;

    fn receipt(json: &str) -> ReceiptRecord {
        match parse_receipt(json, DEFAULT_TOTAL_TOLERANCE).expect("should parse") {
            ReceiptOutcome::Receipt(r) => r,
            other => panic!("expected receipt, got {other:?}"),
        }
    }

    #[test]
    fn full_receipt() {
        let r = receipt(
            r#"{
                "is_receipt": true,
                "category": "Food & Drinks",
                "merchant": {"name": "Boulangerie Paul", "address": "1 rue {A}", "phone": null},
                "transaction": {"date": "2024-05-01", "currency": "EUR"},
                "items": [
                    {"description": "Baguette", "quantity": 2, "unit_price": 1.2, "total_price": 2.4},
                    {"description": "Croissant", "total_price": 1.1}
                ],
                "totals": {"total": 3.5, "total_calculated": 99, "total_matches": false},
                "notes": null
            }"#,
        );
        assert_eq!(r.category, Some(ExpenseCategory::FoodAndDrinks));
        assert_eq!(r.merchant.as_ref().unwrap().name.as_deref(), Some("Boulangerie Paul"));
        assert_eq!(r.items.len(), 2);
        assert_eq!(r.items[1].quantity, 1.0);
        let t = r.totals.unwrap();
        assert!((t.total_calculated.unwrap() - 3.5).abs() < 1e-9);
        assert_eq!(t.total_matches, Some(true));
    }

    #[test]
    fn negative_amounts_become_positive() {
        let r = receipt(
            r#"{"is_receipt": true, "items": [
                {"description": "Refund", "quantity": -1, "unit_price": -4.5, "total_price": -4.5}
            ]}"#,
        );
        let i = &r.items[0];
        assert_eq!(i.quantity, 1.0);
        assert_eq!(i.unit_price, Some(4.5));
        assert_eq!(i.total_price, Some(4.5));
        assert_eq!(r.totals, None);
    }

    #[test]
    fn items_without_totals_block_keep_totals_absent() {
        let r = receipt(
            r#"{"is_receipt": true, "items": [{"description": "A", "total_price": 5.0}]}"#,
        );
        assert_eq!(r.items.len(), 1);
        assert!(r.totals.is_none());
    }

    #[test]
    fn string_total_matches_is_tolerated_and_recomputed() {
        let r = receipt(
            r#"{"is_receipt": true,
                "items": [{"description": "A", "total_price": 5.0}],
                "totals": {"total": 5.0, "total_matches": "false"}}"#,
        );
        let t = r.totals.unwrap();
        assert_eq!(t.total_calculated, Some(5.0));
        assert_eq!(t.total_matches, Some(true));
    }

    #[test]
    fn stated_total_mismatch() {
        let r = receipt(
            r#"{"is_receipt": true, "items": [
                {"description": "A", "total_price": 5.00},
                {"description": "B", "total_price": 3.50}
            ], "totals": {"total": 9.00}}"#,
        );
        let t = r.totals.unwrap();
        assert_eq!(t.total_calculated, Some(8.5));
        assert_eq!(t.total_matches, Some(false));
    }

    #[test]
    fn missing_total_is_computed() {
        let r = receipt(
            r#"{"is_receipt": true, "items": [
                {"description": "A", "total_price": 5.0},
                {"description": "B", "total_price": 3.0}
            ], "totals": {"total": null}}"#,
        );
        let t = r.totals.unwrap();
        assert_eq!(t.total, Some(8.0));
        assert_eq!(t.total_matches, Some(true));
    }

    #[test]
    fn unknown_category_lists_valid_ones() {
        let err = parse_receipt(
            r#"{"is_receipt": true, "category": "Misc"}"#,
            DEFAULT_TOTAL_TOLERANCE,
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, SchemaError::InvalidCategory { .. }));
        assert!(msg.contains("Misc"), "got: {msg}");
        for c in ExpenseCategory::ALL {
            assert!(msg.contains(c.as_str()), "missing {c} in: {msg}");
        }
    }

    #[test]
    fn not_a_receipt() {
        let out = parse_receipt(
            r#"{"is_receipt": false, "reason": "blank page"}"#,
            DEFAULT_TOTAL_TOLERANCE,
        )
        .unwrap();
        assert_eq!(
            out,
            ReceiptOutcome::NotAReceipt(NotAReceipt {
                reason: "blank page".into()
            })
        );
    }

    #[test]
    fn flag_must_be_exactly_true() {
        let out = parse_receipt(
            r#"{"is_receipt": "true", "reason": "string flag"}"#,
            DEFAULT_TOTAL_TOLERANCE,
        )
        .unwrap();
        assert!(!out.is_receipt());
    }

    #[test]
    fn not_a_receipt_requires_reason() {
        let err = parse_receipt(r#"{"is_receipt": false}"#, DEFAULT_TOTAL_TOLERANCE).unwrap_err();
        assert!(matches!(err, SchemaError::Invalid(_)));
        assert!(err.to_string().contains("reason"), "got: {err}");
    }

    #[test]
    fn item_without_description_is_rejected() {
        let err = parse_receipt(
            r#"{"is_receipt": true, "items": [{"total_price": 1.0}]}"#,
            DEFAULT_TOTAL_TOLERANCE,
        )
        .unwrap_err();
        assert!(err.to_string().contains("description"), "got: {err}");
    }

    #[test]
    fn malformed_json() {
        let err = parse_receipt("{not json", DEFAULT_TOTAL_TOLERANCE).unwrap_err();
        assert!(matches!(err, SchemaError::MalformedJson(_)));
    }

    #[test]
    fn top_level_array_is_rejected() {
        let err = parse_receipt("[1, 2]", DEFAULT_TOTAL_TOLERANCE).unwrap_err();
        assert!(err.to_string().contains("an array"), "got: {err}");
    }

    #[test]
    fn null_items_mean_no_items() {
        let r = receipt(r#"{"is_receipt": true, "items": null, "totals": {"total": 4.0}}"#);
        assert!(r.items.is_empty());
        assert_eq!(r.totals.unwrap().total_matches, None);
    }

    #[test]
    fn verdict_true_false_missing() {
        assert!(parse_verdict(r#"{"is_receipt": true}"#).unwrap().is_receipt);
        let v = parse_verdict(r#"{"is_receipt": false, "reason": "a cat"}"#).unwrap();
        assert!(!v.is_receipt);
        assert_eq!(v.reason.as_deref(), Some("a cat"));
        assert!(!parse_verdict("{}").unwrap().is_receipt);
    }

    #[test]
    fn verdict_rejects_non_boolean_flag() {
        assert!(parse_verdict(r#"{"is_receipt": "yes"}"#).is_err());
        assert!(parse_verdict("[true]").is_err());
    }
}

//! Typed receipt records produced by the schema validator.
//!
//! A model answer is either a receipt or an explicit "not a receipt" verdict.
//! [`ReceiptOutcome`] makes that a sum type: a [`ReceiptRecord`] has no
//! `reason`, a [`NotAReceipt`] has no items, and neither carries an
//! `is_receipt` flag that could disagree with the variant. The flag is added
//! back only when serialising, so the JSON shape stays
//! `{"is_receipt": true, ...}` / `{"is_receipt": false, "reason": ...}`.

use crate::categories::ExpenseCategory;
use serde::{Deserialize, Serialize, Serializer};

/// Default tolerance, in currency units, when comparing a stated total with
/// the sum of line items.
pub const DEFAULT_TOTAL_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Merchant {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub address: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub phone: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub vat_number: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub date: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub time: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub receipt_number: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub country: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub currency: Option<String>,
}

/// One purchased line.
///
/// Amounts are magnitudes: a discount printed as `-2.00` is stored as `2.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    #[serde(default = "default_quantity", deserialize_with = "lenient::quantity")]
    pub quantity: f64,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub unit_price: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub total_price: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub tax_rate: Option<f64>,
}

fn default_quantity() -> f64 {
    1.0
}

impl LineItem {
    /// Flip negative quantity/unit_price/total_price to positive.
    pub fn normalise(&mut self) {
        self.quantity = self.quantity.abs();
        self.unit_price = self.unit_price.map(f64::abs);
        self.total_price = self.total_price.map(f64::abs);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub subtotal: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub tax: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub total: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub total_calculated: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_bool")]
    pub total_matches: Option<bool>,
}

impl Totals {
    /// Recompute `total_calculated` from `items` and reconcile it with `total`.
    ///
    /// Whatever the model put in `total_calculated`/`total_matches` is
    /// overwritten. A missing `total` is filled with the computed sum.
    pub fn reconcile(&mut self, items: &[LineItem], tolerance: f64) {
        let calculated: f64 = items.iter().filter_map(|i| i.total_price).sum();
        self.total_calculated = Some(calculated);
        match self.total {
            Some(total) => self.total_matches = Some((total - calculated).abs() <= tolerance),
            None => {
                self.total = Some(calculated);
                self.total_matches = Some(true);
            }
        }
    }
}

/// A successfully extracted receipt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiptRecord {
    pub category: Option<ExpenseCategory>,
    pub merchant: Option<Merchant>,
    pub transaction: Option<Transaction>,
    #[serde(default)]
    pub items: Vec<LineItem>,
    pub totals: Option<Totals>,
    pub notes: Option<String>,
}

impl ReceiptRecord {
    /// Reconcile totals against the line items.
    ///
    /// Runs only when the receipt has both items and a totals block; a
    /// missing block stays missing.
    pub fn reconcile_totals(&mut self, tolerance: f64) {
        if self.items.is_empty() {
            return;
        }
        if let Some(totals) = self.totals.as_mut() {
            totals.reconcile(&self.items, tolerance);
        }
    }
}

/// The model's explicit verdict that the image is not a receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotAReceipt {
    pub reason: String,
}

/// What the model saw: a receipt, or something else.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiptOutcome {
    Receipt(ReceiptRecord),
    NotAReceipt(NotAReceipt),
}

impl ReceiptOutcome {
    pub fn is_receipt(&self) -> bool {
        matches!(self, ReceiptOutcome::Receipt(_))
    }

    pub fn as_receipt(&self) -> Option<&ReceiptRecord> {
        match self {
            ReceiptOutcome::Receipt(r) => Some(r),
            ReceiptOutcome::NotAReceipt(_) => None,
        }
    }
}

/// Deserializers tolerant of how models format scalars: `"12.50"` for a
/// price, `4711` for a receipt number.
mod lenient {
    use serde::de::{Deserializer, Error};
    use serde::Deserialize;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Number(f64),
        Text(String),
        Bool(bool),
    }

    pub fn opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        match Option::<Scalar>::deserialize(d)? {
            None => Ok(None),
            Some(Scalar::Number(n)) => Ok(Some(n)),
            Some(Scalar::Text(s)) if s.trim().is_empty() => Ok(None),
            Some(Scalar::Text(s)) => s
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| D::Error::custom(format!("expected a number, got \"{s}\""))),
            Some(Scalar::Bool(b)) => Err(D::Error::custom(format!("expected a number, got {b}"))),
        }
    }

    pub fn quantity<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(opt_f64(d)?.unwrap_or(1.0))
    }

    pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        match Option::<Scalar>::deserialize(d)? {
            None => Ok(None),
            Some(Scalar::Text(s)) => Ok(Some(s)),
            Some(Scalar::Number(n)) if n.fract() == 0.0 && n.abs() < 1e15 => {
                Ok(Some(format!("{}", n as i64)))
            }
            Some(Scalar::Number(n)) => Ok(Some(n.to_string())),
            Some(Scalar::Bool(b)) => Err(D::Error::custom(format!("expected a string, got {b}"))),
        }
    }

    pub fn opt_bool<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
        match Option::<Scalar>::deserialize(d)? {
            None => Ok(None),
            Some(Scalar::Bool(b)) => Ok(Some(b)),
            Some(Scalar::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "" => Ok(None),
                "true" => Ok(Some(true)),
                "false" => Ok(Some(false)),
                _ => Err(D::Error::custom(format!("expected a boolean, got \"{s}\""))),
            },
            Some(Scalar::Number(n)) => Err(D::Error::custom(format!("expected a boolean, got {n}"))),
        }
    }
}

#[derive(Serialize)]
struct Tagged<'a, T> {
    is_receipt: bool,
    #[serde(flatten)]
    record: &'a T,
}

impl Serialize for ReceiptOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ReceiptOutcome::Receipt(record) => Tagged {
                is_receipt: true,
                record,
            }
            .serialize(serializer),
            ReceiptOutcome::NotAReceipt(record) => Tagged {
                is_receipt: false,
                record,
            }
            .serialize(serializer),
        }
    }
}

//! Prompts for VLM-based receipt extraction.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth** — changing the expected JSON shape or adding
//!    a rule requires editing exactly one place.
//!
//! 2. **Testability** — unit tests can inspect prompts directly without
//!    spinning up a real VLM, making prompt regressions easy to catch.
//!
//! The orchestrator only sees the [`PromptBuilder`] trait, so callers can
//! inject their own wording (another language, a stricter schema) without
//! touching retry or parsing logic.

use crate::categories::ExpenseCategory;

/// Produces the prompt text for each call the pipeline makes.
pub trait PromptBuilder: Send + Sync {
    /// Prompt for the cheap two-step validation call: "is this a receipt?".
    fn validation_prompt(&self) -> String;

    /// Prompt for full extraction. With `include_validation` the model is
    /// also told how to answer when the image is not a receipt (one-shot mode).
    fn extraction_prompt(&self, include_validation: bool) -> String;
}

/// The built-in English prompts.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPrompts;

const PREAMBLE: &str = r#"You are an expert in receipt and bill data extraction.
Your mission is to analyze the provided image and extract all information in raw JSON format.
Return ONLY the JSON, without Markdown tags, without formatting, and without any text before or after.

"#;

const VALIDATION_STEP: &str = r#"**STEP 1 - VALIDATION**
First verify that the image contains a receipt or bill with expense information.
If it is NOT a receipt/bill, return only:
{"is_receipt": false, "reason": "brief explanation"}

"#;

const EXPECTED_FORMAT: &str = r#"**DATA EXTRACTION**
If it is indeed a receipt/bill, extract the following information in raw JSON:

**Expected format:**
{
  "is_receipt": true,
  "category": "expense category from the list below",
  "merchant": {
    "name": "store/restaurant name",
    "address": "complete address",
    "phone": "phone number",
    "vat_number": "VAT number if present"
  },
  "transaction": {
    "date": "YYYY-MM-DD",
    "time": "HH:MM:SS",
    "receipt_number": "receipt number",
    "country": "country",
    "currency": "currency code (EUR, USD, GBP, etc.)"
  },
  "items": [
    {
      "description": "item name",
      "quantity": 1,
      "unit_price": 0.00,
      "total_price": 0.00,
      "tax_rate": 0.00
    }
  ],
  "totals": {
    "subtotal": 0.00,
    "tax": 0.00,
    "total": 0.00,
    "total_calculated": 0.00,
    "total_matches": true
  },
  "notes": "any observations"
}

**EXPENSE CATEGORIES**
Choose ONE category from:
"#;

const RULES: &str = r#"

**IMPORTANT RULES**
1. Extract ALL visible information from the receipt
2. If total is present, calculate sum of items and compare (field "total_matches")
3. If total is missing, calculate it and put it in "total_calculated"
4. Automatically detect country and currency
5. For missing fields, use null
6. Return ONLY the JSON, without text before or after
7. Handle negative amounts properly (discounts, refunds) - use absolute values

**QUALITY ATTENTION**
- If some amounts are unreadable, indicate it in "notes"
- Verify that the sum of items matches the total
- Negative amounts (discounts/refunds) should be converted to positive values"#;

/// Validation-only prompt used by the first call of two-step mode.
pub const VALIDATION_ONLY_PROMPT: &str = r#"Analyze this image and respond only with raw JSON:

If it's a receipt or bill with an expense:
{"is_receipt": true}

Otherwise:
{"is_receipt": false, "reason": "brief explanation"}

Return ONLY the JSON, without Markdown tags, without formatting, and without any text before or after."#;

impl PromptBuilder for DefaultPrompts {
    fn validation_prompt(&self) -> String {
        VALIDATION_ONLY_PROMPT.to_string()
    }

    fn extraction_prompt(&self, include_validation: bool) -> String {
        let mut prompt = String::from(PREAMBLE);
        if include_validation {
            prompt.push_str(VALIDATION_STEP);
        }
        prompt.push_str(EXPECTED_FORMAT);
        prompt.push_str(&ExpenseCategory::prompt_listing());
        prompt.push_str(RULES);
        prompt
    }
}

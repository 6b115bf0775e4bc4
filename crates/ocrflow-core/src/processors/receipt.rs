//! Receipt processor.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::fields::{amount_pattern, keyword_score, parse_cents};
use super::processor::{DocumentProcessor, ProcessorError, ProcessorMetadata};

const SIGNATURES: &[(&str, f32)] = &[
    ("receipt", 0.3),
    ("subtotal", 0.3),
    ("total", 0.2),
    ("tax", 0.1),
    ("cash", 0.1),
    ("change", 0.1),
    ("visa", 0.1),
    ("mastercard", 0.1),
    ("thank you", 0.2),
];

const PAYMENT_WORDS: &[&str] = &["cash", "change", "visa", "mastercard", "card", "tendered"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiptData {
    pub merchant: Option<String>,
    pub date: Option<String>,
    pub items: Vec<LineItem>,
    pub subtotal_cents: Option<i64>,
    pub tax_cents: Option<i64>,
    pub total_cents: Option<i64>,
}

pub struct ReceiptProcessor {
    priced_line: Regex,
    date: Regex,
    amount: Regex,
}

impl ReceiptProcessor {
    pub fn new() -> Result<Self, ProcessorError> {
        Ok(Self {
            priced_line: Regex::new(
                r"^\s*(.*?[A-Za-z].*?)\s+\$?(\d{1,3}(?:,\d{3})+\.\d{2}|\d+\.\d{2})\s*$",
            )?,
            date: Regex::new(r"\b(\d{4}-\d{2}-\d{2}|\d{1,2}[/-]\d{1,2}[/-]\d{2,4})\b")?,
            amount: amount_pattern()?,
        })
    }
}

#[async_trait]
impl DocumentProcessor for ReceiptProcessor {
    const DOCUMENT_TYPE: &'static str = "receipt";
    type Output = ReceiptData;

    fn metadata(&self) -> ProcessorMetadata {
        ProcessorMetadata::new("Receipt", "1.0.0", 10)
            .with_capabilities(&["line_items", "totals", "merchant"])
            .with_extensions(&["jpg", "jpeg", "png", "heic"])
    }

    fn detect(&self, raw: &str) -> f32 {
        let amounts = self.amount.find_iter(raw).filter(|m| m.as_str().contains('.')).count();
        let bonus = match amounts {
            0 => 0.0,
            1 | 2 => 0.1,
            _ => 0.2,
        };
        (keyword_score(raw, SIGNATURES) + bonus).min(1.0)
    }

    async fn process(&self, raw: &str) -> Result<ReceiptData, ProcessorError> {
        let mut data = ReceiptData {
            merchant: raw
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string),
            date: self.date.captures(raw).map(|c| c[1].to_string()),
            ..ReceiptData::default()
        };

        for line in raw.lines() {
            let Some(caps) = self.priced_line.captures(line) else {
                continue;
            };
            let description = caps[1].trim().to_string();
            let cents = parse_cents(&caps[2]).ok_or_else(|| ProcessorError::InvalidField {
                field: "amount",
                value: caps[2].to_string(),
            })?;
            let lower = description.to_ascii_lowercase();

            if lower.contains("subtotal") {
                data.subtotal_cents = Some(cents);
            } else if lower.contains("total") {
                data.total_cents = Some(cents);
            } else if lower.contains("tax") {
                data.tax_cents = Some(cents);
            } else if PAYMENT_WORDS.iter().any(|w| lower.contains(w)) {
                continue;
            } else {
                data.items.push(LineItem {
                    description,
                    amount_cents: cents,
                });
            }
        }

        if data.total_cents.is_none() && data.items.is_empty() {
            return Err(ProcessorError::MissingField("total"));
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "CORNER MARKET\n\
        2024-03-14 12:31\n\
        Milk 2L            3.49\n\
        Bread              2.99\n\
        Coffee beans      12.50\n\
        SUBTOTAL          18.98\n\
        TAX                1.52\n\
        TOTAL             20.50\n\
        CASH              25.00\n\
        CHANGE             4.50\n\
        Thank you for shopping!";

    #[test]
    fn detects_a_receipt() {
        let p = ReceiptProcessor::new().unwrap();
        assert!(p.detect(SAMPLE) >= 0.9);
        assert!(p.detect("Dear Sir, please find attached") < 0.2);
    }

    #[tokio::test]
    async fn extracts_items_and_totals() {
        let p = ReceiptProcessor::new().unwrap();
        let data = p.process(SAMPLE).await.unwrap();

        assert_eq!(data.merchant.as_deref(), Some("CORNER MARKET"));
        assert_eq!(data.date.as_deref(), Some("2024-03-14"));
        assert_eq!(data.items.len(), 3);
        assert_eq!(data.items[2].description, "Coffee beans");
        assert_eq!(data.subtotal_cents, Some(1898));
        assert_eq!(data.tax_cents, Some(152));
        assert_eq!(data.total_cents, Some(2050));
    }

    #[tokio::test]
    async fn text_without_prices_is_rejected() {
        let p = ReceiptProcessor::new().unwrap();
        assert!(matches!(
            p.process("just words").await,
            Err(ProcessorError::MissingField("total"))
        ));
    }
}

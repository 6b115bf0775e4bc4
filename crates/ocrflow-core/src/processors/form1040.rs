//! Form 1040 (U.S. Individual Income Tax Return) processor.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::fields::{FilingStatus, amount_pattern, checked_filing_status, keyword_score, line_amount};
use super::processor::{DocumentProcessor, ProcessorError, ProcessorMetadata};

const SIGNATURES: &[(&str, f32)] = &[
    ("form 1040", 0.5),
    ("individual income tax return", 0.3),
    ("adjusted gross income", 0.2),
    ("taxable income", 0.1),
    ("filing status", 0.1),
    ("amount you owe", 0.1),
    ("refund", 0.1),
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Form1040Data {
    pub tax_year: Option<u16>,
    pub filing_status: Option<FilingStatus>,
    pub wages_cents: Option<i64>,
    pub adjusted_gross_income_cents: Option<i64>,
    pub taxable_income_cents: Option<i64>,
    pub total_tax_cents: Option<i64>,
    pub refund_cents: Option<i64>,
    pub amount_owed_cents: Option<i64>,
}

pub struct Form1040Processor {
    year: Regex,
    amount: Regex,
}

impl Form1040Processor {
    pub fn new() -> Result<Self, ProcessorError> {
        Ok(Self {
            year: Regex::new(r"(?i)(?:form\s+1040\D{0,40}?|tax\s+year\s+)(20\d{2})")?,
            amount: amount_pattern()?,
        })
    }
}

#[async_trait]
impl DocumentProcessor for Form1040Processor {
    const DOCUMENT_TYPE: &'static str = "form1040";
    type Output = Form1040Data;

    fn metadata(&self) -> ProcessorMetadata {
        ProcessorMetadata::new("Form 1040 Individual Return", "1.0.0", 20)
            .with_capabilities(&["tax_form", "filing_status", "income_summary"])
            .with_extensions(&["pdf"])
    }

    fn detect(&self, raw: &str) -> f32 {
        keyword_score(raw, SIGNATURES)
    }

    async fn process(&self, raw: &str) -> Result<Form1040Data, ProcessorError> {
        let amount = &self.amount;
        let data = Form1040Data {
            tax_year: self
                .year
                .captures(raw)
                .and_then(|c| c[1].parse().ok()),
            filing_status: checked_filing_status(raw),
            wages_cents: line_amount(amount, raw, &["wages, salaries", "wages"]),
            adjusted_gross_income_cents: line_amount(amount, raw, &["adjusted gross income"]),
            taxable_income_cents: line_amount(amount, raw, &["taxable income"]),
            total_tax_cents: line_amount(amount, raw, &["total tax"]),
            refund_cents: line_amount(amount, raw, &["refunded to you", "refund"]),
            amount_owed_cents: line_amount(amount, raw, &["amount you owe"]),
        };

        if data.adjusted_gross_income_cents.is_none() && data.wages_cents.is_none() {
            return Err(ProcessorError::MissingField("adjusted_gross_income"));
        }
        Ok(data)
    }
}

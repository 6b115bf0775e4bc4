//! W-4 (Employee's Withholding Certificate) processor.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::fields::{FilingStatus, amount_pattern, checked_filing_status, is_checked, keyword_score, line_amount};
use super::processor::{DocumentProcessor, ProcessorError, ProcessorMetadata};

const SIGNATURES: &[(&str, f32)] = &[
    ("form w-4", 0.5),
    ("withholding certificate", 0.3),
    ("employee's withholding", 0.2),
    ("filing status", 0.1),
    ("multiple jobs", 0.1),
    ("dependents", 0.1),
    ("extra withholding", 0.1),
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct W4Data {
    pub tax_year: Option<u16>,
    pub employee_name: Option<String>,
    /// Only the last four digits are kept.
    pub ssn_last4: Option<String>,
    pub filing_status: Option<FilingStatus>,
    pub multiple_jobs: bool,
    pub dependents_cents: Option<i64>,
    pub other_income_cents: Option<i64>,
    pub deductions_cents: Option<i64>,
    pub extra_withholding_cents: Option<i64>,
}

pub struct W4Processor {
    year: Regex,
    name: Regex,
    ssn: Regex,
    amount: Regex,
}

impl W4Processor {
    pub fn new() -> Result<Self, ProcessorError> {
        Ok(Self {
            year: Regex::new(r"(?i)form\s+w-4\D{0,12}?(20\d{2})")?,
            name: Regex::new(r"(?im)^\s*(?:employee\s+)?name\s*:\s*(.+?)\s*$")?,
            ssn: Regex::new(r"\b\d{3}-\d{2}-(\d{4})\b")?,
            amount: amount_pattern()?,
        })
    }
}

#[async_trait]
impl DocumentProcessor for W4Processor {
    const DOCUMENT_TYPE: &'static str = "w4";
    type Output = W4Data;

    fn metadata(&self) -> ProcessorMetadata {
        ProcessorMetadata::new("W-4 Withholding Certificate", "1.0.0", 20)
            .with_capabilities(&["tax_form", "pii_masking", "filing_status"])
            .with_extensions(&["pdf", "jpg", "png"])
    }

    fn detect(&self, raw: &str) -> f32 {
        keyword_score(raw, SIGNATURES)
    }

    async fn process(&self, raw: &str) -> Result<W4Data, ProcessorError> {
        let data = W4Data {
            tax_year: self
                .year
                .captures(raw)
                .and_then(|c| c[1].parse().ok()),
            employee_name: self.name.captures(raw).map(|c| c[1].to_string()),
            ssn_last4: self.ssn.captures(raw).map(|c| c[1].to_string()),
            filing_status: checked_filing_status(raw),
            multiple_jobs: raw.lines().any(|l| {
                let lower = l.to_ascii_lowercase();
                is_checked(l) && (lower.contains("multiple jobs") || lower.contains("spouse also works"))
            }),
            dependents_cents: line_amount(&self.amount, raw, &["dependents"]),
            other_income_cents: line_amount(&self.amount, raw, &["other income"]),
            deductions_cents: line_amount(&self.amount, raw, &["deductions"]),
            extra_withholding_cents: line_amount(&self.amount, raw, &["extra withholding"]),
        };

        if data.filing_status.is_none() {
            return Err(ProcessorError::MissingField("filing_status"));
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Form W-4 (2024)\n\
        Employee's Withholding Certificate\n\
        Name: Jordan A. Rivera\n\
        SSN 123-45-6789\n\
        [ ] Single or Married filing separately\n\
        [x] Married filing jointly\n\
        [x] Step 2(c) Multiple jobs or spouse also works\n\
        Step 3: Claim dependents  $4,000\n\
        Step 4(a) Other income  1,200\n\
        Step 4(b) Deductions  0\n\
        Step 4(c) Extra withholding  50.00";

    #[test]
    fn detects_w4_not_receipt_words() {
        let p = W4Processor::new().unwrap();
        assert!(p.detect(SAMPLE) >= 0.9);
        assert!(p.detect("TOTAL 12.00 thank you") < 0.1);
    }

    #[tokio::test]
    async fn extracts_status_and_amounts() {
        let p = W4Processor::new().unwrap();
        let data = p.process(SAMPLE).await.unwrap();

        assert_eq!(data.tax_year, Some(2024));
        assert_eq!(data.employee_name.as_deref(), Some("Jordan A. Rivera"));
        assert_eq!(data.ssn_last4.as_deref(), Some("6789"));
        assert_eq!(data.filing_status, Some(FilingStatus::MarriedFilingJointly));
        assert!(data.multiple_jobs);
        assert_eq!(data.dependents_cents, Some(400_000));
        assert_eq!(data.other_income_cents, Some(120_000));
        assert_eq!(data.deductions_cents, Some(0));
        assert_eq!(data.extra_withholding_cents, Some(5_000));
    }

    #[tokio::test]
    async fn ssn_is_never_serialized_in_full() {
        let p = W4Processor::new().unwrap();
        let data = p.process(SAMPLE).await.unwrap();
        let json = serde_json::to_string(&data).unwrap();
        assert!(!json.contains("123-45"));
    }

    #[tokio::test]
    async fn unchecked_form_is_rejected() {
        let p = W4Processor::new().unwrap();
        assert!(matches!(
            p.process("Form W-4\n[ ] Single").await,
            Err(ProcessorError::MissingField("filing_status"))
        ));
    }
}

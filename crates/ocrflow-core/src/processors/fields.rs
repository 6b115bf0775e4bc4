//! OCR テキストから値を拾うための小さなヘルパー
//!
//! - キーワードシグネチャによる確信度
//! - 金額（セント単位）の解析
//! - チェックされた申告区分（filing status）の検出

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::processor::ProcessorError;

/// Sum of the weights of every signature found in `text` (case-insensitive),
/// capped at 1.0.
pub fn keyword_score(text: &str, signatures: &[(&str, f32)]) -> f32 {
    let lower = text.to_ascii_lowercase();
    let score: f32 = signatures
        .iter()
        .filter(|(needle, _)| lower.contains(needle))
        .map(|(_, weight)| weight)
        .sum();
    score.clamp(0.0, 1.0)
}

/// "1,234.56" / "$12" / "12.5" -> cents.
pub fn parse_cents(raw: &str) -> Option<i64> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches('$')
        .chars()
        .filter(|c| *c != ',')
        .collect();
    let (whole, frac) = match cleaned.split_once('.') {
        Some((w, f)) => (w, f),
        None => (cleaned.as_str(), ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let frac: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().ok()? * 10,
        2 => frac.parse().ok()?,
        _ => return None,
    };
    whole.checked_mul(100)?.checked_add(frac)
}

/// Matches amount tokens that stand alone as words.
pub fn amount_pattern() -> Result<Regex, ProcessorError> {
    Ok(Regex::new(
        r"\$?\b(?:\d{1,3}(?:,\d{3})+|\d+)(?:\.\d{1,2})?\b",
    )?)
}

/// Last amount after the first `label` found on any line.
pub fn line_amount(amount: &Regex, text: &str, labels: &[&str]) -> Option<i64> {
    text.lines().find_map(|line| {
        let lower = line.to_ascii_lowercase();
        let end = labels
            .iter()
            .find_map(|label| lower.find(label).map(|at| at + label.len()))?;
        let tail = &line[end..];
        amount
            .find_iter(tail)
            .last()
            .and_then(|m| parse_cents(m.as_str()))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilingStatus {
    Single,
    MarriedFilingJointly,
    MarriedFilingSeparately,
    HeadOfHousehold,
    QualifyingSurvivingSpouse,
}

impl FilingStatus {
    // longest labels first: "married filing jointly" before "single"
    const LABELS: [(&'static str, FilingStatus); 5] = [
        ("married filing separately", FilingStatus::MarriedFilingSeparately),
        ("married filing jointly", FilingStatus::MarriedFilingJointly),
        ("qualifying surviving spouse", FilingStatus::QualifyingSurvivingSpouse),
        ("head of household", FilingStatus::HeadOfHousehold),
        ("single", FilingStatus::Single),
    ];
}

/// Whether a line starts with a check mark such as `[x]`, `(x)` or `☒`.
pub fn is_checked(line: &str) -> bool {
    let t = line.trim_start().to_ascii_lowercase();
    t.starts_with("[x]") || t.starts_with("(x)") || t.starts_with('☒') || t.starts_with('☑')
}

/// Filing status from the first checked line that names one.
pub fn checked_filing_status(text: &str) -> Option<FilingStatus> {
    text.lines().filter(|l| is_checked(l)).find_map(|line| {
        let lower = line.to_ascii_lowercase();
        FilingStatus::LABELS
            .iter()
            .find(|(label, _)| lower.contains(label))
            .map(|(_, status)| *status)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("12.34", Some(1234))]
    #[case("$1,250.00", Some(125_000))]
    #[case("2,000", Some(200_000))]
    #[case("7", Some(700))]
    #[case("3.5", Some(350))]
    #[case("", None)]
    #[case("1.234", None)]
    #[case("abc", None)]
    fn cents(#[case] raw: &str, #[case] expected: Option<i64>) {
        assert_eq!(parse_cents(raw), expected);
    }

    #[test]
    fn keyword_score_is_capped() {
        let sig = [("total", 0.7), ("tax", 0.7)];
        assert_eq!(keyword_score("TOTAL incl. TAX", &sig), 1.0);
        assert_eq!(keyword_score("nothing here", &sig), 0.0);
    }

    #[test]
    fn line_amount_reads_after_the_label() {
        let amount = amount_pattern().unwrap();
        let text = "1a Wages 52,000\n11 Adjusted gross income 48,500.25\n15 Taxable income";
        assert_eq!(line_amount(&amount, text, &["wages"]), Some(5_200_000));
        assert_eq!(
            line_amount(&amount, text, &["adjusted gross income"]),
            Some(4_850_025)
        );
        // label present but no amount after it
        assert_eq!(line_amount(&amount, text, &["taxable income"]), None);
    }

    #[test]
    fn checked_status_wins_over_unchecked() {
        let text = "[ ] Single\n[x] Married filing jointly\n[ ] Head of household";
        assert_eq!(
            checked_filing_status(text),
            Some(FilingStatus::MarriedFilingJointly)
        );
        assert_eq!(checked_filing_status("[ ] Single"), None);
    }
}

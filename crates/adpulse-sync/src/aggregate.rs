//! Per-channel folding of located records and summary rendering.

use adpulse_core::{Currency, NormalizedRecord};
use serde::Serialize;
use thiserror::Error;

/// Text sent in place of a summary that could not be rendered.
pub const SUMMARY_FALLBACK_PREFIX: &str = "Erro ao enviar resumo do canal";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateTotals {
    pub investment: f64,
    pub revenue_local: f64,
    pub revenue_foreign: f64,
    pub margin_sum: f64,
    pub roas_samples: Vec<f64>,
}

impl AggregateTotals {
    pub fn merge(mut self, other: AggregateTotals) -> Self {
        self.investment += other.investment;
        self.revenue_local += other.revenue_local;
        self.revenue_foreign += other.revenue_foreign;
        self.margin_sum += other.margin_sum;
        self.roas_samples.extend(other.roas_samples);
        self
    }
}

/// Adds one record. Absent fields count as zero; ROAS is always sampled.
pub fn fold(mut totals: AggregateTotals, record: &NormalizedRecord) -> AggregateTotals {
    totals.investment += record.investment_value();
    match record.revenue_value() {
        (amount, currency) if currency.is_foreign() => totals.revenue_foreign += amount,
        (amount, _) => totals.revenue_local += amount,
    }
    totals.margin_sum += record.margin_value();
    totals.roas_samples.push(record.roas_value());
    totals
}

pub fn finalize(totals: &AggregateTotals) -> Summary {
    let roas_mean = if totals.roas_samples.is_empty() {
        0.0
    } else {
        totals.roas_samples.iter().sum::<f64>() / totals.roas_samples.len() as f64
    };
    Summary {
        investment: totals.investment,
        revenue_local: totals.revenue_local,
        revenue_foreign: totals.revenue_foreign,
        roas_mean,
        margin: totals.margin_sum,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub investment: f64,
    pub revenue_local: f64,
    pub revenue_foreign: f64,
    pub roas_mean: f64,
    pub margin: f64,
}

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("{field} is not a finite number")]
    NonFinite { field: &'static str },
}

impl Summary {
    pub fn render(&self) -> Result<String, SummaryError> {
        for (field, value) in [
            ("investment", self.investment),
            ("revenue_local", self.revenue_local),
            ("revenue_foreign", self.revenue_foreign),
            ("roas_mean", self.roas_mean),
            ("margin", self.margin),
        ] {
            if !value.is_finite() {
                return Err(SummaryError::NonFinite { field });
            }
        }

        let mut lines = vec![
            format!("Investimento: {}", format_money(Currency::Brl, self.investment)),
            format!("Receita: {}", format_money(Currency::Brl, self.revenue_local)),
        ];
        if self.revenue_foreign != 0.0 {
            lines.push(format!(
                "Receita ($): {}",
                format_money(Currency::Usd, self.revenue_foreign)
            ));
        }
        lines.push(format!("ROAS: {}", format_decimal(self.roas_mean)));
        lines.push(format!("MC: {}", format_money(Currency::Brl, self.margin)));
        Ok(lines.join("\n"))
    }

    pub fn render_or_fallback(&self) -> String {
        self.render()
            .unwrap_or_else(|err| format!("{SUMMARY_FALLBACK_PREFIX}: {err}"))
    }
}

/// Two decimals, `.` thousands and `,` decimal separator.
pub fn format_decimal(value: f64) -> String {
    let fixed = format!("{:.2}", value.abs());
    let (int_part, dec_part) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));

    let mut grouped = String::new();
    for (i, c) in int_part.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(c);
    }
    let grouped: String = grouped.chars().rev().collect();

    let negative = value < 0.0 && fixed != "0.00";
    if negative {
        format!("-{grouped},{dec_part}")
    } else {
        format!("{grouped},{dec_part}")
    }
}

pub fn format_money(currency: Currency, value: f64) -> String {
    format!("{} {}", currency.symbol(), format_decimal(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use adpulse_core::ColumnMapping;

    fn record(investment: &str, revenue: &str, roas: &str, margin: &str) -> NormalizedRecord {
        let mapping = ColumnMapping {
            investment: 1,
            revenue: 2,
            roas: 3,
            margin: 4,
        };
        let row: Vec<String> = ["01/10", investment, revenue, roas, margin]
            .iter()
            .map(|c| c.to_string())
            .collect();
        NormalizedRecord::from_row("Outubro 2025", 1, &row, &mapping)
    }

    #[test]
    fn mixed_currencies_fold_separately_and_roas_is_averaged() {
        let totals = [
            record("R$ 100,00", "R$ 200,00", "2,00", "R$ 50,00"),
            record("R$ 40,00", "$ 30,00", "1,00", "-R$ 10,00"),
        ]
        .iter()
        .fold(AggregateTotals::default(), fold);

        assert_eq!(totals.investment, 140.0);
        assert_eq!(totals.revenue_local, 200.0);
        assert_eq!(totals.revenue_foreign, 30.0);
        assert_eq!(totals.margin_sum, 40.0);

        let summary = finalize(&totals);
        assert_eq!(summary.roas_mean, 1.5);
        assert_eq!(
            summary.render().unwrap(),
            "Investimento: R$ 140,00\nReceita: R$ 200,00\nReceita ($): $ 30,00\nROAS: 1,50\nMC: R$ 40,00"
        );
    }

    #[test]
    fn fold_is_pure_and_merge_matches_sequential_fold() {
        let a = record("R$ 1,00", "R$ 2,00", "2,00", "R$ 1,00");
        let b = record("R$ 3,00", "R$ 4,00", "1,00", "R$ 1,00");
        let start = AggregateTotals::default();
        let once = fold(start.clone(), &a);
        assert_eq!(start, AggregateTotals::default());

        let sequential = fold(once.clone(), &b);
        let merged = once.merge(fold(AggregateTotals::default(), &b));
        assert_eq!(sequential, merged);
    }

    #[test]
    fn no_samples_finalize_to_zero_roas() {
        let summary = finalize(&AggregateTotals::default());
        assert_eq!(summary.roas_mean, 0.0);
        assert_eq!(
            summary.render().unwrap(),
            "Investimento: R$ 0,00\nReceita: R$ 0,00\nROAS: 0,00\nMC: R$ 0,00"
        );
    }

    #[test]
    fn non_finite_totals_render_the_fallback() {
        let totals = AggregateTotals {
            investment: f64::NAN,
            ..AggregateTotals::default()
        };
        let text = finalize(&totals).render_or_fallback();
        assert_eq!(
            text,
            "Erro ao enviar resumo do canal: investment is not a finite number"
        );
    }

    #[test]
    fn decimal_formatting_groups_thousands() {
        assert_eq!(format_decimal(1234567.891), "1.234.567,89");
        assert_eq!(format_decimal(-1500.0), "-1.500,00");
        assert_eq!(format_decimal(999.999), "1.000,00");
        assert_eq!(format_decimal(-0.001), "0,00");
        assert_eq!(format_money(Currency::Brl, -200.0), "R$ -200,00");
    }
}

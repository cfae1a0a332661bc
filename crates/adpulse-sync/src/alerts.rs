//! Threshold tiers and the messages built from them.

use adpulse_core::{Currency, NormalizedRecord};
use serde::Serialize;

use crate::aggregate::{format_decimal, format_money};

/// Margin tier of a site or channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Critical,
    Warning,
    Neutral,
    Positive,
    StronglyPositive,
}

impl AlertLevel {
    pub fn evaluate(margin: f64) -> Self {
        if margin < -100.0 {
            Self::Critical
        } else if margin < 0.0 {
            Self::Warning
        } else if margin <= 100.0 {
            Self::Neutral
        } else if margin <= 1000.0 {
            Self::Positive
        } else {
            Self::StronglyPositive
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Critical => ":rotating_light:",
            Self::Warning => ":warning:",
            Self::Neutral => ":moneybag:",
            Self::Positive => ":star-struck:",
            Self::StronglyPositive => ":money_with_wings:",
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Critical)
    }
}

/// ROAS tier; decoration only, never triggers a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoasLevel {
    Warning,
    Caution,
    Positive,
}

impl RoasLevel {
    pub fn evaluate(roas: f64) -> Self {
        if roas < 1.0 {
            Self::Warning
        } else if roas < 1.5 {
            Self::Caution
        } else {
            Self::Positive
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Warning => ":warning:",
            Self::Caution => ":moneybag:",
            Self::Positive => ":money_with_wings:",
        }
    }
}

pub fn critical_alert_message(site: &str, margin: f64) -> String {
    format!(
        ":rotating_light: *{site}* :rotating_light:\nMC: *{}*",
        format_money(Currency::Brl, margin)
    )
}

pub fn missing_data_message(site: &str, date: &str) -> String {
    format!(":warning: Site {site} não teve dados para o dia {date}.")
}

/// Per-row update used when replaying a sheet.
pub fn update_message(site: &str, tab: &str, date: &str, record: &NormalizedRecord) -> String {
    let (revenue, currency) = record.revenue_value();
    let roas = record.roas_value();
    let margin = record.margin_value();
    [
        format!("Atualização *{site}* - {tab} ({date})"),
        format!(
            "Investimento: *{}*",
            format_money(Currency::Brl, record.investment_value())
        ),
        format!("Receita: *{}*", format_money(currency, revenue)),
        format!(
            "ROAS: *{}* {}",
            format_decimal(roas),
            RoasLevel::evaluate(roas).emoji()
        ),
        format!(
            "MC: *{}* {}",
            format_money(Currency::Brl, margin),
            AlertLevel::evaluate(margin).emoji()
        ),
    ]
    .join("\n")
}

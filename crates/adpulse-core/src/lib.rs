//! Core domain model for spreadsheet-sourced performance pulses.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

mod locate;
mod normalize;

pub use locate::{
    locate, parse_day_month, split_day_month, ComponentMatch, DateMatcher, DatedRow, DayMonth,
    ExactMatch, PatternMatch, RowLocator, TargetDate, DATE_PATTERNS,
};
pub use normalize::{
    classify_currency, clean_cell, normalize, normalize_currency, parse_locale_number,
    ERROR_TOKENS, ZERO_TEXT,
};

pub const CRATE_NAME: &str = "adpulse-core";

/// Header label that overrides the configured ROAS column.
pub const ROAS_HEADER: &str = "ROAS";
/// Header label that overrides the configured margin column.
pub const MARGIN_HEADER: &str = "MC";

/// Worksheet month names, January first, as they appear in tab titles.
pub const MONTH_NAMES: [&str; 12] = [
    "Janeiro",
    "Fevereiro",
    "Março",
    "Abril",
    "Maio",
    "Junho",
    "Julho",
    "Agosto",
    "Setembro",
    "Outubro",
    "Novembro",
    "Dezembro",
];

/// One worksheet row exactly as the source returned it.
pub type RawRow = Vec<String>;

/// Provenance pointer attached to values read from a worksheet cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRef {
    pub tab: String,
    pub row_index: usize,
    pub column_index: usize,
    pub raw: String,
}

/// Typed field wrapper: `value == None` is the explicit Absent marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field<T> {
    pub value: Option<T>,
    pub evidence: Option<CellRef>,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Field<T> {
    pub fn empty() -> Self {
        Self {
            value: None,
            evidence: None,
        }
    }

    pub fn with_value_and_evidence(value: T, evidence: CellRef) -> Self {
        Self {
            value: Some(value),
            evidence: Some(evidence),
        }
    }

    pub fn is_absent(&self) -> bool {
        self.value.is_none()
    }
}

/// Column positions of the semantic fields inside a data row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMapping {
    pub investment: usize,
    pub revenue: usize,
    pub roas: usize,
    pub margin: usize,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            investment: 7,
            revenue: 8,
            roas: 12,
            margin: 16,
        }
    }
}

impl ColumnMapping {
    /// Exact `ROAS` / `MC` header labels win over the configured positions.
    pub fn with_header_overrides(mut self, header: &[String]) -> Self {
        if let Some(idx) = header.iter().position(|cell| cell == ROAS_HEADER) {
            self.roas = idx;
        }
        if let Some(idx) = header.iter().position(|cell| cell == MARGIN_HEADER) {
            self.margin = idx;
        }
        self
    }
}

/// A parsed locale number together with the string it was parsed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalNumber {
    pub value: f64,
    pub source: String,
}

impl Default for CanonicalNumber {
    fn default() -> Self {
        Self::zero()
    }
}

impl CanonicalNumber {
    pub fn zero() -> Self {
        Self {
            value: 0.0,
            source: ZERO_TEXT.to_string(),
        }
    }

    pub fn is_negative(&self) -> bool {
        self.value < 0.0
    }

    pub fn magnitude(&self) -> f64 {
        self.value.abs()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Brl,
    Usd,
}

impl Currency {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Brl => "BRL",
            Self::Usd => "USD",
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Brl => "R$",
            Self::Usd => "$",
        }
    }

    pub fn is_foreign(&self) -> bool {
        matches!(self, Self::Usd)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrencyTaggedValue {
    pub number: CanonicalNumber,
    pub currency: Currency,
}

/// Fixed-shape view of one data row after column mapping and normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub row_index: usize,
    pub date: Field<String>,
    pub investment: Field<CanonicalNumber>,
    pub revenue: Field<CurrencyTaggedValue>,
    pub roas: Field<CanonicalNumber>,
    pub margin: Field<CanonicalNumber>,
}

impl NormalizedRecord {
    /// Builds a record from a raw row; an index past the end of the row yields Absent.
    pub fn from_row(tab: &str, row_index: usize, row: &[String], mapping: &ColumnMapping) -> Self {
        let evidence = |column_index: usize| -> Option<CellRef> {
            row.get(column_index).map(|raw| CellRef {
                tab: tab.to_string(),
                row_index,
                column_index,
                raw: raw.clone(),
            })
        };
        let number_field = |column_index: usize| -> Field<CanonicalNumber> {
            match evidence(column_index) {
                Some(cell) => Field::with_value_and_evidence(normalize(&cell.raw), cell),
                None => Field::empty(),
            }
        };

        let date = match evidence(0) {
            Some(cell) if !cell.raw.trim().is_empty() => {
                Field::with_value_and_evidence(cell.raw.trim().to_string(), cell)
            }
            _ => Field::empty(),
        };
        let revenue = match evidence(mapping.revenue) {
            Some(cell) => Field::with_value_and_evidence(normalize_currency(&cell.raw), cell),
            None => Field::empty(),
        };

        Self {
            row_index,
            date,
            investment: number_field(mapping.investment),
            revenue,
            roas: number_field(mapping.roas),
            margin: number_field(mapping.margin),
        }
    }

    pub fn investment_value(&self) -> f64 {
        self.investment.value.as_ref().map_or(0.0, |n| n.value)
    }

    pub fn margin_value(&self) -> f64 {
        self.margin.value.as_ref().map_or(0.0, |n| n.value)
    }

    pub fn roas_value(&self) -> f64 {
        self.roas.value.as_ref().map_or(0.0, |n| n.value)
    }

    /// Revenue amount and its currency; Absent revenue counts as local zero.
    pub fn revenue_value(&self) -> (f64, Currency) {
        self.revenue
            .value
            .as_ref()
            .map_or((0.0, Currency::Brl), |r| (r.number.value, r.currency))
    }
}

/// What a ledger entry records for a delivery group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    Update,
    CriticalAlert,
    MissingData,
}

/// The unit of work delivered at most once: an owning entity on a reporting date.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryGroupKey {
    pub entity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab: Option<String>,
    pub date: String,
}

impl DeliveryGroupKey {
    pub fn new(entity: impl Into<String>, date: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            tab: None,
            date: date.into(),
        }
    }

    /// A day of one worksheet tab, still owned by `entity`.
    pub fn in_tab(
        entity: impl Into<String>,
        tab: impl Into<String>,
        date: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.into(),
            tab: Some(tab.into()),
            date: date.into(),
        }
    }

    pub fn group_title(&self) -> &str {
        &self.entity
    }

    pub fn record_id(&self, kind: DeliveryKind) -> String {
        let base = match &self.tab {
            Some(tab) => format!("{}/{}_{}", self.entity, tab, self.date),
            None => format!("{}_{}", self.entity, self.date),
        };
        match kind {
            DeliveryKind::Update => base,
            DeliveryKind::CriticalAlert => format!("{base}#critical"),
            DeliveryKind::MissingData => format!("{base}#missing"),
        }
    }
}

/// Month + year window a worksheet tab represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportingPeriod {
    pub month: u32,
    pub year: i32,
}

impl ReportingPeriod {
    pub fn new(month: u32, year: i32) -> Self {
        Self { month, year }
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            month: date.month(),
            year: date.year(),
        }
    }

    pub fn month_name(&self) -> &'static str {
        MONTH_NAMES[(self.month.clamp(1, 12) - 1) as usize]
    }

    /// The first month name found in the title decides; the year must also appear.
    pub fn matches_title(&self, title: &str) -> bool {
        let Some(found) = MONTH_NAMES.iter().position(|name| title.contains(name)) else {
            return false;
        };
        found as u32 + 1 == self.month && title.contains(&self.year.to_string())
    }
}

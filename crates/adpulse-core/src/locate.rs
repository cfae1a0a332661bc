//! Finding the row for a target date among heterogeneous date spellings.

use chrono::{Datelike, NaiveDate};

use crate::NormalizedRecord;

/// Structured patterns tried in order. The year never takes part in equality.
pub const DATE_PATTERNS: [&str; 6] = ["%d/%m", "%d/%m/%Y", "%d/%m/%y", "%d-%m", "%d-%m-%Y", "%d-%m-%y"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayMonth {
    pub day: u32,
    pub month: u32,
}

/// The date being looked for, kept both as typed text and as day/month when parseable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDate {
    raw: String,
    day_month: Option<DayMonth>,
}

impl TargetDate {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim().to_string();
        let day_month = parse_day_month(&raw).or_else(|| split_day_month(&raw));
        Self { raw, day_month }
    }

    /// `DD/MM` rendering of a calendar date.
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            raw: format!("{:02}/{:02}", date.day(), date.month()),
            day_month: Some(DayMonth {
                day: date.day(),
                month: date.month(),
            }),
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn day_month(&self) -> Option<DayMonth> {
        self.day_month
    }

    /// Zero-padded `DD/MM` when parseable, the typed text otherwise.
    pub fn label(&self) -> String {
        match self.day_month {
            Some(dm) => format!("{:02}/{:02}", dm.day, dm.month),
            None => self.raw.clone(),
        }
    }
}

/// Anything that carries a date cell the locator can inspect.
pub trait DatedRow {
    fn date_cell(&self) -> Option<&str>;
}

impl DatedRow for Vec<String> {
    fn date_cell(&self) -> Option<&str> {
        self.first().map(String::as_str)
    }
}

impl DatedRow for NormalizedRecord {
    fn date_cell(&self) -> Option<&str> {
        self.date.value.as_deref()
    }
}

pub trait DateMatcher: Send + Sync {
    fn name(&self) -> &'static str;
    fn try_match(&self, raw: &str, target: &TargetDate) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatch;

impl DateMatcher for ExactMatch {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn try_match(&self, raw: &str, target: &TargetDate) -> bool {
        raw == target.raw
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PatternMatch {
    patterns: &'static [&'static str],
}

impl Default for PatternMatch {
    fn default() -> Self {
        Self {
            patterns: &DATE_PATTERNS,
        }
    }
}

impl DateMatcher for PatternMatch {
    fn name(&self) -> &'static str {
        "pattern"
    }

    fn try_match(&self, raw: &str, target: &TargetDate) -> bool {
        let Some(wanted) = target.day_month else {
            return false;
        };
        let compact = strip_whitespace(raw);
        self.patterns
            .iter()
            .any(|pattern| parse_with_pattern(&compact, pattern) == Some(wanted))
    }
}

/// Tolerates spellings the structured patterns reject (`1-10-2025 08:00`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ComponentMatch;

impl DateMatcher for ComponentMatch {
    fn name(&self) -> &'static str {
        "component"
    }

    fn try_match(&self, raw: &str, target: &TargetDate) -> bool {
        match (split_day_month(raw), target.day_month) {
            (Some(found), Some(wanted)) => found == wanted,
            _ => false,
        }
    }
}

pub struct RowLocator {
    matchers: Vec<Box<dyn DateMatcher>>,
}

impl Default for RowLocator {
    fn default() -> Self {
        Self::new(vec![
            Box::new(ExactMatch),
            Box::new(PatternMatch::default()),
            Box::new(ComponentMatch),
        ])
    }
}

impl RowLocator {
    pub fn new(matchers: Vec<Box<dyn DateMatcher>>) -> Self {
        Self { matchers }
    }

    /// Name of the first matcher accepting `raw`, if any.
    pub fn matching_strategy(&self, raw: &str, target: &TargetDate) -> Option<&'static str> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        self.matchers
            .iter()
            .find(|m| m.try_match(raw, target))
            .map(|m| m.name())
    }

    /// Scans from the last row backwards; the latest matching row wins.
    pub fn locate<'a, R: DatedRow>(&self, rows: &'a [R], target: &TargetDate) -> Option<&'a R> {
        rows.iter().rev().find(|row| {
            row.date_cell()
                .and_then(|cell| self.matching_strategy(cell, target))
                .is_some()
        })
    }
}

pub fn locate<'a, R: DatedRow>(rows: &'a [R], target_date: &str) -> Option<&'a R> {
    RowLocator::default().locate(rows, &TargetDate::parse(target_date))
}

/// Day and month through the structured patterns, first pattern wins.
pub fn parse_day_month(raw: &str) -> Option<DayMonth> {
    let compact = strip_whitespace(raw);
    DATE_PATTERNS
        .iter()
        .find_map(|pattern| parse_with_pattern(&compact, pattern))
}

/// First two `/`- or `-`-separated tokens read as day and month.
pub fn split_day_month(raw: &str) -> Option<DayMonth> {
    let mut parts = raw.trim().split(['/', '-']);
    let day = parts.next()?.trim().parse::<u32>().ok()?;
    let month = parts.next()?.trim().parse::<u32>().ok()?;
    Some(DayMonth { day, month })
}

fn strip_whitespace(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace()).collect()
}

fn parse_with_pattern(compact: &str, pattern: &str) -> Option<DayMonth> {
    let date = if pattern.contains("%Y") || pattern.contains("%y") {
        NaiveDate::parse_from_str(compact, pattern).ok()?
    } else {
        // chrono needs a year; 2000 keeps 29/02 valid
        let sep = if pattern.contains('-') { '-' } else { '/' };
        NaiveDate::parse_from_str(&format!("{compact}{sep}2000"), &format!("{pattern}{sep}%Y"))
            .ok()?
    };
    Some(DayMonth {
        day: date.day(),
        month: date.month(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(dates: &[(&str, &str)]) -> Vec<Vec<String>> {
        dates
            .iter()
            .map(|(date, tag)| vec![date.to_string(), tag.to_string()])
            .collect()
    }

    #[test]
    fn duplicate_dates_prefer_the_later_row() {
        let grid = rows(&[("30/09", "a"), ("01/10", "first"), ("02/10", "b"), ("01/10", "second")]);
        let found = locate(&grid, "01/10").unwrap();
        assert_eq!(found[1], "second");
    }

    #[test]
    fn unpadded_target_matches_padded_cell() {
        let grid = rows(&[("01/10", "hit"), ("02/10", "miss")]);
        assert_eq!(locate(&grid, "1/10").unwrap()[1], "hit");
    }

    #[test]
    fn year_and_separator_are_ignored() {
        let grid = rows(&[("05-10-2025", "dash"), ("06/10/25", "short")]);
        assert_eq!(locate(&grid, "05/10").unwrap()[1], "dash");
        assert_eq!(locate(&grid, "6/10").unwrap()[1], "short");
        assert_eq!(locate(&grid, " 06 / 10 ").unwrap()[1], "short");
    }

    #[test]
    fn component_fallback_accepts_what_patterns_reject() {
        let target = TargetDate::parse("1/10");
        assert!(!PatternMatch::default().try_match("1-10-2025 08:00", &target));
        assert!(ComponentMatch.try_match("1-10-2025 08:00", &target));

        let locator = RowLocator::default();
        assert_eq!(locator.matching_strategy("1-10-2025 08:00", &target), Some("component"));
        assert_eq!(locator.matching_strategy("01/10", &target), Some("pattern"));
        assert_eq!(locator.matching_strategy("1/10", &target), Some("exact"));
    }

    #[test]
    fn empty_date_cells_are_skipped() {
        let grid = vec![
            vec!["01/10".to_string(), "real".to_string()],
            vec!["".to_string(), "blank".to_string()],
            vec![],
        ];
        assert_eq!(locate(&grid, "01/10").unwrap()[1], "real");
    }

    #[test]
    fn no_match_is_none() {
        let grid = rows(&[("Total", "x"), ("30/09", "y")]);
        assert!(locate(&grid, "01/10").is_none());
        assert!(locate(&Vec::<Vec<String>>::new(), "01/10").is_none());
    }

    #[test]
    fn unparseable_target_only_matches_exactly() {
        let grid = rows(&[("hoje", "text"), ("01/10", "date")]);
        assert_eq!(locate(&grid, "hoje").unwrap()[1], "text");
        assert!(TargetDate::parse("hoje").day_month().is_none());
    }

    #[test]
    fn target_from_calendar_date_is_zero_padded() {
        let date = NaiveDate::from_ymd_opt(2025, 10, 1).unwrap();
        let target = TargetDate::from_date(date);
        assert_eq!(target.raw(), "01/10");
        assert_eq!(target.day_month(), Some(DayMonth { day: 1, month: 10 }));
        assert_eq!(TargetDate::parse("1/10").label(), "01/10");
        assert_eq!(TargetDate::parse("hoje").label(), "hoje");
    }
}

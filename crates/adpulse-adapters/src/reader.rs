//! Turns worksheet grids into normalized records for a reporting period.

use adpulse_core::{ColumnMapping, NormalizedRecord, RawRow, ReportingPeriod};
use adpulse_storage::{retry_with_backoff, BackoffPolicy};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{SheetError, SheetLocation, SheetSource, SourceContext, TabRef};

/// First-column label of the header row.
pub const HEADER_MARKER: &str = "Data";

/// One worksheet after header detection and column mapping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SheetGrid {
    pub tab: TabRef,
    pub header: RawRow,
    /// Effective mapping after `ROAS` / `MC` header overrides.
    pub mapping: ColumnMapping,
    pub records: Vec<NormalizedRecord>,
}

impl SheetGrid {
    /// Header cells paired with their column index, blanks omitted.
    pub fn header_indices(&self) -> Vec<(usize, &str)> {
        self.header
            .iter()
            .enumerate()
            .filter(|(_, cell)| !cell.trim().is_empty())
            .map(|(idx, cell)| (idx, cell.trim()))
            .collect()
    }
}

pub fn is_blank_row(row: &[String]) -> bool {
    row.iter().all(|cell| cell.trim().is_empty())
}

/// Index of the first row carrying the header marker; the first row otherwise.
pub fn find_header_index(rows: &[RawRow]) -> usize {
    rows.iter()
        .position(|row| row.iter().any(|cell| cell == HEADER_MARKER))
        .unwrap_or(0)
}

pub fn read_grid(tab: TabRef, rows: Vec<RawRow>, configured: &ColumnMapping) -> SheetGrid {
    let header_idx = find_header_index(&rows);
    let header = rows.get(header_idx).cloned().unwrap_or_default();
    let mapping = configured.with_header_overrides(&header);

    let records = rows
        .iter()
        .enumerate()
        .skip(header_idx + 1)
        .filter(|(_, row)| !is_blank_row(row))
        .map(|(row_index, row)| NormalizedRecord::from_row(&tab.name, row_index, row, &mapping))
        .collect();

    SheetGrid {
        tab,
        header,
        mapping,
        records,
    }
}

/// Tabs titled with the period's month name and year. Falls back to the first
/// tab when none match.
pub fn select_period_tabs(tabs: &[TabRef], period: ReportingPeriod) -> Vec<TabRef> {
    let matching: Vec<TabRef> = tabs
        .iter()
        .filter(|tab| period.matches_title(&tab.name))
        .cloned()
        .collect();
    if !matching.is_empty() {
        return matching;
    }
    match tabs.first() {
        Some(first) => {
            warn!(
                month = period.month_name(),
                year = period.year,
                fallback = %first.name,
                "no tab for the current period, using the first tab"
            );
            vec![first.clone()]
        }
        None => Vec::new(),
    }
}

/// Sheet source wrapper that retries rate-limited calls.
pub struct SourceReader<'a> {
    source: &'a dyn SheetSource,
    policy: BackoffPolicy,
}

impl<'a> SourceReader<'a> {
    pub fn new(source: &'a dyn SheetSource, policy: BackoffPolicy) -> Self {
        Self { source, policy }
    }

    pub async fn list_tabs(
        &self,
        ctx: &SourceContext,
        location: &SheetLocation,
    ) -> Result<Vec<TabRef>, SheetError> {
        retry_with_backoff(
            &self.policy,
            "list_tabs",
            SheetError::is_rate_limited,
            |_| self.source.list_tabs(ctx, location),
        )
        .await
    }

    pub async fn read_tab(
        &self,
        ctx: &SourceContext,
        location: &SheetLocation,
        tab: &TabRef,
        configured: &ColumnMapping,
    ) -> Result<SheetGrid, SheetError> {
        let rows = retry_with_backoff(
            &self.policy,
            "read_tab",
            SheetError::is_rate_limited,
            |_| self.source.read_tab(ctx, location, tab),
        )
        .await?;
        let grid = read_grid(tab.clone(), rows, configured);
        debug!(tab = %tab.name, records = grid.records.len(), "read tab");
        Ok(grid)
    }

    /// Grids for every tab of `period`, in listing order.
    pub async fn read_period(
        &self,
        ctx: &SourceContext,
        location: &SheetLocation,
        configured: &ColumnMapping,
        period: ReportingPeriod,
    ) -> Result<Vec<SheetGrid>, SheetError> {
        let tabs = self.list_tabs(ctx, location).await?;
        let mut grids = Vec::new();
        for tab in select_period_tabs(&tabs, period) {
            grids.push(self.read_tab(ctx, location, &tab, configured).await?);
        }
        Ok(grids)
    }

    /// Grids for every tab, used when replaying a whole sheet.
    pub async fn read_all(
        &self,
        ctx: &SourceContext,
        location: &SheetLocation,
        configured: &ColumnMapping,
    ) -> Result<Vec<SheetGrid>, SheetError> {
        let tabs = self.list_tabs(ctx, location).await?;
        let mut grids = Vec::with_capacity(tabs.len());
        for tab in &tabs {
            grids.push(self.read_tab(ctx, location, tab, configured).await?);
        }
        Ok(grids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> RawRow {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn tab(name: &str, id: i64) -> TabRef {
        TabRef {
            name: name.to_string(),
            id,
        }
    }

    #[test]
    fn header_marker_row_is_found_below_title_rows() {
        let rows = vec![
            row(&["Relatório diário"]),
            row(&[""]),
            row(&["Data", "Investimento", "Receita", "ROAS", "MC"]),
            row(&["01/10", "R$ 10,00", "R$ 30,00", "3,00", "R$ 20,00"]),
        ];
        assert_eq!(find_header_index(&rows), 2);
        assert_eq!(find_header_index(&[row(&["a", "b"])]), 0);
        assert_eq!(find_header_index(&[]), 0);
    }

    #[test]
    fn header_marker_must_match_exactly() {
        let rows = vec![
            row(&[" Data ", "Investimento"]),
            row(&["Datas", "Investimento"]),
            row(&["Data", "Investimento"]),
        ];
        assert_eq!(find_header_index(&rows), 2);
    }

    #[test]
    fn grid_applies_header_overrides_and_drops_blank_rows() {
        let rows = vec![
            row(&["Data", "Investimento", "Receita", "ROAS", "MC"]),
            row(&["01/10", "R$ 10,00", "R$ 30,00", "3,00", "R$ 20,00"]),
            row(&["", " ", ""]),
            row(&["02/10", "R$ 5,00"]),
        ];
        let configured = ColumnMapping {
            investment: 1,
            revenue: 2,
            roas: 12,
            margin: 16,
        };
        let grid = read_grid(tab("Outubro 2025", 3), rows, &configured);
        assert_eq!(grid.mapping.roas, 3);
        assert_eq!(grid.mapping.margin, 4);
        assert_eq!(grid.records.len(), 2);

        let first = &grid.records[0];
        assert_eq!(first.row_index, 1);
        assert_eq!(first.margin_value(), 20.0);

        let short = &grid.records[1];
        assert_eq!(short.row_index, 3);
        assert_eq!(short.investment_value(), 5.0);
        assert!(short.revenue.is_absent());
        assert!(short.margin.is_absent());

        assert_eq!(grid.header_indices()[0], (0, "Data"));
    }

    #[test]
    fn period_tabs_match_month_and_year() {
        let tabs = vec![tab("Setembro 2025", 1), tab("Outubro 2025", 2), tab("Outubro 2024", 3)];
        let picked = select_period_tabs(&tabs, ReportingPeriod::new(10, 2025));
        assert_eq!(picked, vec![tab("Outubro 2025", 2)]);
    }

    #[test]
    fn no_period_match_falls_back_to_first_tab() {
        let tabs = vec![tab("Resumo", 9), tab("Setembro 2025", 1)];
        let picked = select_period_tabs(&tabs, ReportingPeriod::new(11, 2025));
        assert_eq!(picked, vec![tab("Resumo", 9)]);
        assert!(select_period_tabs(&[], ReportingPeriod::new(11, 2025)).is_empty());
    }
}

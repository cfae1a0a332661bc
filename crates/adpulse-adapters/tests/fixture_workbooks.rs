use std::path::PathBuf;
use std::time::Duration;

use adpulse_adapters::{
    FixtureSheetSource, SheetError, SheetLocation, SheetSource, SiteRegistry, SourceContext,
    SourceReader,
};
use adpulse_core::{locate, ColumnMapping, Currency, ReportingPeriod};
use adpulse_storage::BackoffPolicy;
use uuid::Uuid;

fn fixtures() -> FixtureSheetSource {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sheets");
    FixtureSheetSource::new(root)
}

fn location(id: &str) -> SheetLocation {
    SheetLocation::parse(&format!("https://docs.google.com/spreadsheets/d/{id}/edit")).unwrap()
}

fn quick_policy() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 1,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(1),
        jitter_ratio: 0.0,
    }
}

#[tokio::test]
async fn october_run_reads_only_the_october_tab() {
    let source = fixtures();
    let reader = SourceReader::new(&source, quick_policy());
    let ctx = SourceContext::new(Uuid::new_v4());

    let grids = reader
        .read_period(
            &ctx,
            &location("demo-tech-pra-todos"),
            &ColumnMapping::default(),
            ReportingPeriod::new(10, 2025),
        )
        .await
        .expect("read october");

    assert_eq!(grids.len(), 1);
    let grid = &grids[0];
    assert_eq!(grid.tab.name, "Outubro 2025");
    assert_eq!(grid.mapping, ColumnMapping::default());
    assert_eq!(grid.records.len(), 4);

    let first = locate(&grid.records, "1/10").expect("01/10 row");
    assert_eq!(first.investment_value(), 1000.0);
    assert_eq!(first.revenue_value(), (2500.0, Currency::Brl));
    assert_eq!(first.roas_value(), 2.5);
    assert_eq!(first.margin_value(), 1500.0);

    let corrected = locate(&grid.records, "02/10").expect("02/10 row");
    assert_eq!(corrected.margin_value(), -240.0);

    let errors = locate(&grid.records, "03/10").expect("03/10 row");
    assert_eq!(errors.roas_value(), 0.0);
    assert_eq!(errors.margin.value.as_ref().unwrap().source, "0,00");
}

#[tokio::test]
async fn september_run_reads_the_september_tab() {
    let source = fixtures();
    let reader = SourceReader::new(&source, quick_policy());
    let ctx = SourceContext::new(Uuid::new_v4());

    let grids = reader
        .read_period(
            &ctx,
            &location("demo-tech-pra-todos"),
            &ColumnMapping::default(),
            ReportingPeriod::new(9, 2025),
        )
        .await
        .expect("read september");
    assert_eq!(grids.len(), 1);
    assert_eq!(grids[0].tab.name, "Setembro 2025");
    assert!(locate(&grids[0].records, "30/09").is_some());
}

#[tokio::test]
async fn foreign_revenue_and_mixed_date_spellings() {
    let source = fixtures();
    let reader = SourceReader::new(&source, quick_policy());
    let ctx = SourceContext::new(Uuid::new_v4());

    let grids = reader
        .read_period(
            &ctx,
            &location("demo-receitas-da-vo"),
            &ColumnMapping::default(),
            ReportingPeriod::new(10, 2025),
        )
        .await
        .expect("read");
    let records = &grids[0].records;
    assert_eq!(
        locate(records, "01/10").unwrap().revenue_value(),
        (300.0, Currency::Usd)
    );
    assert_eq!(locate(records, "2/10").unwrap().margin_value(), -60.0);
    assert!(locate(records, "03/10").is_none());
}

#[tokio::test]
async fn permission_failures_surface_to_the_caller() {
    let source = fixtures();
    let reader = SourceReader::new(&source, quick_policy());
    let ctx = SourceContext::new(Uuid::new_v4());

    let err = reader
        .list_tabs(&ctx, &location("demo-locked"))
        .await
        .unwrap_err();
    assert!(matches!(err, SheetError::PermissionDenied(_)));
    assert_eq!(source.source_kind(), "fixture");
}

#[tokio::test]
async fn bundled_registry_points_at_the_fixture_sheets() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../sites.yaml");
    let registry = SiteRegistry::load(&path).await.expect("load sites.yaml");
    assert_eq!(
        registry.list_site_names(),
        vec!["Tech Pra Todos", "Receitas da Vó", "Travado"]
    );

    let source = fixtures();
    let ctx = SourceContext::new(Uuid::new_v4());
    let site = registry.get_site_config("Tech Pra Todos");
    let tabs = source
        .list_tabs(&ctx, &site.location().unwrap())
        .await
        .unwrap();
    assert_eq!(tabs.len(), 2);
    assert_eq!(
        registry.get_site_by_id(2).unwrap().columns,
        ColumnMapping::default()
    );
}

#[tokio::test]
async fn rate_limited_sheet_gives_up_after_bounded_retries() {
    let source = fixtures();
    let reader = SourceReader::new(&source, quick_policy());
    let ctx = SourceContext::new(Uuid::new_v4());

    let err = reader
        .read_all(&ctx, &location("demo-throttled"), &ColumnMapping::default())
        .await
        .unwrap_err();
    assert!(err.is_rate_limited());
}

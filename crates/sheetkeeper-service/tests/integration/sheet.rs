use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio::time;

use sheetkeeper_service::{CellValue, Error, KeyCase, NewRow, RowObject, Sheet, SheetOptions};
use sheetkeeper_test::{MockSource, grid};

const RANGE: &str = "Contacts!A1:B";
const HEADER: &str = "Contacts!A1:B1";

fn contacts() -> MockSource {
    MockSource::new(grid(&[
        &["Name", "Email"],
        &["Ada", "ada@x.com"],
        &["", "b@x.com"],
    ]))
    .with_range(HEADER, grid(&[&["Name", "Email"]]))
}

fn object(pairs: &[(&str, &str)]) -> RowObject {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn text(cells: &[&str]) -> Vec<CellValue> {
    cells.iter().map(|&cell| CellValue::from(cell)).collect()
}

#[tokio::test]
async fn test_object_mapping() {
    sheetkeeper_test::setup();
    let source = Arc::new(contacts());
    let sheet = Sheet::new(source.clone(), SheetOptions::new(RANGE));

    let data = sheet.data().await.unwrap();

    assert_eq!(
        data,
        vec![
            object(&[("Name", "Ada"), ("Email", "ada@x.com")]),
            object(&[("Name", ""), ("Email", "b@x.com")]),
        ]
    );
}

#[tokio::test]
async fn test_columns_reuse_settled_grid() {
    sheetkeeper_test::setup();
    let source = Arc::new(contacts());
    let sheet = Sheet::new(source.clone(), SheetOptions::new(RANGE));

    assert_eq!(sheet.rows().await.unwrap().len(), 2);
    assert_eq!(sheet.columns().await.unwrap(), ["Name", "Email"]);

    assert_eq!(source.fetches(RANGE), 1);
    assert_eq!(source.fetches(HEADER), 0);
}

#[tokio::test]
async fn test_columns_fetch_header_only() {
    sheetkeeper_test::setup();
    let source = Arc::new(contacts());
    let sheet = Sheet::new(source.clone(), SheetOptions::new(RANGE));

    assert_eq!(sheet.columns().await.unwrap(), ["Name", "Email"]);
    assert_eq!(sheet.columns().await.unwrap(), ["Name", "Email"]);

    assert_eq!(source.fetches(HEADER), 1);
    assert_eq!(source.fetches(RANGE), 0);
    assert_eq!(sheet.grid_age(), None);
}

#[tokio::test]
async fn test_data_fetches_grid_once() {
    sheetkeeper_test::setup();
    let source = Arc::new(contacts());
    let sheet = Sheet::new(source.clone(), SheetOptions::new(RANGE));

    sheet.data().await.unwrap();
    sheet.data().await.unwrap();

    assert_eq!(source.fetches(RANGE), 1);
    assert_eq!(source.fetches(HEADER), 0);
}

#[tokio::test]
async fn test_concurrent_reads_share_fetch() {
    sheetkeeper_test::setup();
    let source = Arc::new(contacts().with_gate());
    let sheet = Sheet::new(source.clone(), SheetOptions::new(RANGE));

    source.open_gate(1);
    let (rows, other_rows, data) = tokio::join!(sheet.rows(), sheet.rows(), sheet.data());

    assert_eq!(rows.unwrap(), other_rows.unwrap());
    assert_eq!(data.unwrap().len(), 2);
    assert_eq!(source.total_fetches(), 1);
}

#[tokio::test]
async fn test_sanitize_and_filters() {
    sheetkeeper_test::setup();
    let source = Arc::new(MockSource::new(grid(&[
        &[" First   Name ", "E-Mail"],
        &["  multi   space \n text ", "m@x.com"],
        &["skip", "s@x.com"],
        &["No Mail"],
    ])));
    let options = SheetOptions::new("People")
        .with_key_case(KeyCase::SnakeCase)
        .with_row_filter(|row| row.first().is_none_or(|cell| cell != "skip"))
        .with_object_filter(|object| object.contains_key("e_mail"));
    let sheet = Sheet::new(source.clone(), options);

    assert_eq!(
        sheet.rows().await.unwrap(),
        vec![
            vec!["multi space text".to_owned(), "m@x.com".to_owned()],
            vec!["No Mail".to_owned()],
        ]
    );
    assert_eq!(sheet.columns().await.unwrap(), ["first_name", "e_mail"]);
    assert_eq!(
        sheet.data().await.unwrap(),
        vec![object(&[("first_name", "multi space text"), ("e_mail", "m@x.com")])]
    );
    assert_eq!(source.total_fetches(), 1);
}

#[tokio::test]
async fn test_unnamed_columns_are_dropped() {
    sheetkeeper_test::setup();
    let source = Arc::new(MockSource::new(grid(&[
        &["Name", "", "Email"],
        &["Ada", "note", "ada@x.com"],
    ])));
    let sheet = Sheet::new(source, SheetOptions::new("Sheet1"));

    assert_eq!(
        sheet.data().await.unwrap(),
        vec![object(&[("Name", "Ada"), ("Email", "ada@x.com")])]
    );
}

#[tokio::test]
async fn test_header_rows_below_first_row() {
    sheetkeeper_test::setup();
    let source = Arc::new(MockSource::new(grid(&[
        &["Contact list"],
        &["Name", "Email"],
        &["Ada", "ada@x.com"],
    ])));
    let sheet = Sheet::new(source, SheetOptions::new("Sheet1").with_header_rows(2));

    assert_eq!(
        sheet.data().await.unwrap(),
        vec![object(&[("Name", "Ada"), ("Email", "ada@x.com")])]
    );
}

#[tokio::test]
async fn test_without_header_row() {
    sheetkeeper_test::setup();
    let source = Arc::new(contacts());
    let sheet = Sheet::new(source.clone(), SheetOptions::new(RANGE).with_header_rows(0));

    assert_eq!(sheet.rows().await.unwrap().len(), 3);
    assert_eq!(sheet.columns().await, Err(Error::NoHeaderRow));
    assert_eq!(sheet.data().await, Err(Error::NoHeaderRow));
    assert_eq!(source.total_fetches(), 1);
}

#[tokio::test]
async fn test_empty_header_is_not_cached() {
    sheetkeeper_test::setup();
    let source = Arc::new(MockSource::new(grid(&[&["", "  "], &["Ada", "ada@x.com"]])));
    let sheet = Sheet::new(source.clone(), SheetOptions::new("Sheet1"));

    assert_eq!(sheet.data().await, Err(Error::HeaderEmpty));

    source.set_grid(grid(&[&["Name", "Email"], &["Ada", "ada@x.com"]]));
    sheet.refresh();

    assert_eq!(sheet.data().await.unwrap().len(), 1);
    assert_eq!(source.total_fetches(), 2);
}

#[tokio::test]
async fn test_no_data_is_retried() {
    sheetkeeper_test::setup();
    let source = Arc::new(MockSource::new(Vec::new()));
    let sheet = Sheet::new(source.clone(), SheetOptions::new("Sheet1"));

    assert_eq!(sheet.rows().await, Err(Error::NoData));
    assert_eq!(sheet.rows().await, Err(Error::NoData));
    assert_eq!(source.total_fetches(), 2);

    source.set_grid(grid(&[&["Name"], &["Ada"]]));
    assert_eq!(sheet.rows().await.unwrap(), vec![vec!["Ada".to_owned()]]);
}

#[tokio::test]
async fn test_refresh_refetches() {
    sheetkeeper_test::setup();
    let source = Arc::new(contacts());
    let sheet = Sheet::new(source.clone(), SheetOptions::new(RANGE));

    sheet.rows().await.unwrap();
    sheet.refresh();
    assert_eq!(source.fetches(RANGE), 1);

    sheet.rows().await.unwrap();
    assert_eq!(source.fetches(RANGE), 2);
}

#[tokio::test]
async fn test_max_age_refetches() {
    sheetkeeper_test::setup();
    time::pause();
    let source = Arc::new(contacts());
    let options = SheetOptions::new(RANGE).with_max_age(Some(Duration::from_secs(60)));
    let sheet = Sheet::new(source.clone(), options);

    sheet.rows().await.unwrap();
    time::advance(Duration::from_secs(30)).await;
    sheet.rows().await.unwrap();
    assert_eq!(source.fetches(RANGE), 1);

    time::advance(Duration::from_secs(31)).await;
    sheet.rows().await.unwrap();
    assert_eq!(source.fetches(RANGE), 2);
}

#[tokio::test]
async fn test_preload() {
    sheetkeeper_test::setup();
    time::pause();
    let source = Arc::new(contacts());
    let sheet = Sheet::new(source.clone(), SheetOptions::new(RANGE).with_preload(true));

    // lets the preload run to completion
    time::sleep(Duration::from_millis(1)).await;
    assert_eq!(source.fetches(RANGE), 1);
    assert!(sheet.grid_age().is_some());

    sheet.data().await.unwrap();
    assert_eq!(source.total_fetches(), 1);
}

#[tokio::test]
async fn test_keep_fresh() {
    sheetkeeper_test::setup();
    time::pause();
    let source = Arc::new(contacts());
    let sheet = Sheet::new(source.clone(), SheetOptions::new(RANGE));

    assert_eq!(sheet.rows().await.unwrap().len(), 2);
    sheet.keep_fresh(Duration::from_secs(30));

    source.set_grid(grid(&[&["Name", "Email"], &["Cy", "cy@x.com"]]));
    time::sleep(Duration::from_secs(31)).await;
    assert_eq!(source.fetches(RANGE), 2);

    assert_eq!(
        sheet.rows().await.unwrap(),
        vec![vec!["Cy".to_owned(), "cy@x.com".to_owned()]]
    );
    assert_eq!(source.fetches(RANGE), 2);

    sheet.stop_refreshing();
    time::sleep(Duration::from_secs(120)).await;
    assert_eq!(source.fetches(RANGE), 2);
}

#[tokio::test]
async fn test_refresh_interval_option() {
    sheetkeeper_test::setup();
    time::pause();
    let source = Arc::new(contacts());
    let options = SheetOptions::new(RANGE).with_refresh_interval(Some(Duration::from_secs(10)));
    let _sheet = Sheet::new(source.clone(), options);

    time::sleep(Duration::from_secs(25)).await;
    assert_eq!(source.fetches(RANGE), 2);
}

#[tokio::test]
async fn test_background_refresh_failure_keeps_rows() {
    sheetkeeper_test::setup();
    time::pause();
    let source = Arc::new(contacts());
    let sheet = Sheet::new(source.clone(), SheetOptions::new(RANGE));

    sheet.rows().await.unwrap();
    sheet.keep_fresh(Duration::from_secs(30));
    source.fail_fetches(Some(Error::Remote("unavailable".into())));

    time::sleep(Duration::from_secs(31)).await;
    assert_eq!(source.fetches(RANGE), 2);
    assert_eq!(sheet.rows().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_append_invalidates_grid() {
    sheetkeeper_test::setup();
    let source = Arc::new(contacts());
    let sheet = Sheet::new(source.clone(), SheetOptions::new(RANGE));

    assert_eq!(sheet.rows().await.unwrap().len(), 2);

    let confirmation = sheet
        .append(NewRow::positional(["Cy", "cy@x.com"]))
        .await
        .unwrap();
    assert_eq!(confirmation.updated_rows, 1);
    assert_eq!(source.appends(), [(RANGE.to_owned(), text(&["Cy", "cy@x.com"]))]);

    let data = sheet.data().await.unwrap();
    assert_eq!(data.len(), 3);
    assert_eq!(data[2], object(&[("Name", "Cy"), ("Email", "cy@x.com")]));
    assert_eq!(source.fetches(RANGE), 2);
}

#[tokio::test]
async fn test_append_by_object() {
    sheetkeeper_test::setup();
    let source = Arc::new(contacts());
    let sheet = Sheet::new(source.clone(), SheetOptions::new(RANGE));

    sheet
        .append(NewRow::keyed([("email", "x@y.com")]))
        .await
        .unwrap();

    assert_eq!(source.appends(), [(RANGE.to_owned(), text(&["", "x@y.com"]))]);
    assert_eq!(source.fetches(HEADER), 1);
    assert_eq!(source.fetches(RANGE), 0);
}

#[tokio::test]
async fn test_append_prepares_cells() {
    sheetkeeper_test::setup();
    let source = Arc::new(MockSource::new(grid(&[&["Name", "Joined", "Score", "Active"]])));
    let sheet = Sheet::new(source.clone(), SheetOptions::new("Sheet1"));

    let joined = NaiveDate::from_ymd_opt(2024, 3, 1)
        .unwrap()
        .and_hms_opt(12, 30, 0)
        .unwrap();
    let row = NewRow::Keyed(BTreeMap::from([
        ("NAME".to_owned(), CellValue::from("  Dee \t Doe ")),
        ("joined".to_owned(), CellValue::from(joined)),
        ("score".to_owned(), CellValue::from(42_i64)),
        ("active".to_owned(), CellValue::Null),
    ]));
    sheet.append(row).await.unwrap();

    let (_, cells) = source.appends().remove(0);
    assert_eq!(
        cells,
        vec![
            CellValue::from("Dee Doe"),
            CellValue::from("2024-03-01 12:30:00"),
            CellValue::Number(42.0),
            CellValue::Null,
        ]
    );
}

#[tokio::test]
async fn test_append_with_invalid_date_format() {
    sheetkeeper_test::setup();
    let source = Arc::new(contacts());
    let mut options = SheetOptions::new(RANGE);
    options.date_format = "%Q".into();
    let sheet = Sheet::new(source.clone(), options);

    let date = NaiveDate::from_ymd_opt(2024, 3, 1)
        .unwrap()
        .and_hms_opt(12, 30, 0)
        .unwrap();
    let result = sheet
        .append(NewRow::positional([CellValue::from("Cy"), CellValue::from(date)]))
        .await;
    assert!(matches!(result, Err(Error::AppendRejected(_))));
    assert!(source.appends().is_empty());

    sheet.append(NewRow::positional(["Cy"])).await.unwrap();
    assert_eq!(source.appends().len(), 1);
}

#[tokio::test]
async fn test_append_rejected_keeps_cache() {
    sheetkeeper_test::setup();
    let source = Arc::new(contacts());
    let sheet = Sheet::new(source.clone(), SheetOptions::new(RANGE));

    sheet.rows().await.unwrap();

    source.set_updated_rows(0);
    let result = sheet.append(NewRow::positional(["Cy"])).await;
    assert!(matches!(result, Err(Error::AppendRejected(_))));

    source.set_updated_rows(1);
    source.fail_appends(Some(Error::PermissionDenied("read only".into())));
    let result = sheet.append(NewRow::positional(["Cy"])).await;
    assert_eq!(result, Err(Error::PermissionDenied("read only".into())));

    assert_eq!(sheet.rows().await.unwrap().len(), 2);
    assert_eq!(source.fetches(RANGE), 1);
}

#[tokio::test]
async fn test_append_without_matching_keys() {
    sheetkeeper_test::setup();
    let source = Arc::new(contacts());
    let sheet = Sheet::new(source.clone(), SheetOptions::new(RANGE));

    let result = sheet.append(NewRow::keyed([("phone", "555")])).await;
    assert!(matches!(result, Err(Error::AppendRejected(_))));

    let result = sheet.append(NewRow::Positional(Vec::new())).await;
    assert!(matches!(result, Err(Error::AppendRejected(_))));

    assert!(source.appends().is_empty());
}

#[tokio::test]
async fn test_append_by_object_without_header_row() {
    sheetkeeper_test::setup();
    let source = Arc::new(contacts());
    let sheet = Sheet::new(source.clone(), SheetOptions::new(RANGE).with_header_rows(0));

    let result = sheet.append(NewRow::keyed([("email", "x@y.com")])).await;
    assert_eq!(result, Err(Error::NoHeaderRow));

    sheet.append(NewRow::positional(["Cy"])).await.unwrap();
    assert_eq!(source.appends().len(), 1);
}

use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::json;

use sheetkeeper_service::config::ApiConfig;
use sheetkeeper_service::{CellValue, Error, NewRow, RemoteSource, Sheet, SheetOptions, SheetsClient};
use sheetkeeper_test::SheetsServer;

const RANGE: &str = "Team Sheet!A1:C";

fn client(server: &SheetsServer, token: Option<&str>) -> SheetsClient {
    let config = ApiConfig {
        base_url: server.base_url(),
        auth_token: token.map(ToOwned::to_owned),
        ..Default::default()
    };
    SheetsClient::new(&config, "doc-1").unwrap()
}

#[tokio::test]
async fn test_fetch_grid() {
    sheetkeeper_test::setup();
    let server = SheetsServer::new();
    server.set_values(
        RANGE,
        json!([["Name", "Age", "Member"], ["Ada", 36, true], ["Bob"]]),
    );
    let client = client(&server, Some("secret"));

    let grid = client.fetch_grid(RANGE).await.unwrap();

    assert_eq!(
        grid,
        vec![
            vec!["Name", "Age", "Member"],
            vec!["Ada", "36", "true"],
            vec!["Bob"],
        ]
    );
    assert_eq!(server.authorization().as_deref(), Some("Bearer secret"));
    assert_eq!(server.hits().get(RANGE), Some(&1));
}

#[tokio::test]
async fn test_fetch_without_values() {
    sheetkeeper_test::setup();
    let server = SheetsServer::new();
    server.set_values("Empty!A1:C", json!([]));
    let client = client(&server, None);

    assert_eq!(client.fetch_grid(RANGE).await, Err(Error::NoData));
    assert_eq!(client.fetch_grid("Empty!A1:C").await, Err(Error::NoData));
    assert_eq!(server.authorization(), None);
}

#[tokio::test]
async fn test_fetch_errors() {
    sheetkeeper_test::setup();
    let server = SheetsServer::new();
    server.set_status("Private", StatusCode::FORBIDDEN);
    server.set_status("Missing", StatusCode::NOT_FOUND);
    server.set_status("Broken", StatusCode::INTERNAL_SERVER_ERROR);
    let client = client(&server, None);

    let result = client.fetch_grid("Private").await;
    assert!(matches!(result, Err(Error::PermissionDenied(_))));

    let result = client.fetch_grid("Missing").await;
    assert_eq!(result, Err(Error::NotFound));

    let result = client.fetch_grid("Broken").await;
    assert!(matches!(result, Err(Error::Remote(_))));
}

#[tokio::test]
async fn test_append_row() {
    sheetkeeper_test::setup();
    let server = SheetsServer::new();
    let client = client(&server, Some("secret"));

    let confirmation = client
        .append_row(RANGE, vec![CellValue::from("Cy"), CellValue::Number(2.5)])
        .await
        .unwrap();

    assert_eq!(confirmation.updated_rows, 1);
    assert_eq!(confirmation.updated_range.as_deref(), Some(RANGE));
    assert_eq!(
        server.appended(),
        [(
            RANGE.to_owned(),
            json!({"majorDimension": "ROWS", "values": [["Cy", 2.5]]})
        )]
    );
    assert_eq!(server.authorization().as_deref(), Some("Bearer secret"));
}

#[tokio::test]
async fn test_append_refused() {
    sheetkeeper_test::setup();
    let server = SheetsServer::new();
    server.set_status(RANGE, StatusCode::UNAUTHORIZED);
    let client = client(&server, None);

    let result = client.append_row(RANGE, vec![CellValue::from("Cy")]).await;
    assert!(matches!(result, Err(Error::PermissionDenied(_))));
    assert!(server.appended().is_empty());
}

#[tokio::test]
async fn test_sheet_over_http() {
    sheetkeeper_test::setup();
    let server = SheetsServer::new();
    server.set_values(RANGE, json!([["Name", "Email"], ["Ada", "ada@x.com"]]));
    server.set_values("Team Sheet!A1:C1", json!([["Name", "Email"]]));
    let sheet = Sheet::new(Arc::new(client(&server, None)), SheetOptions::new(RANGE));

    assert_eq!(sheet.columns().await.unwrap(), ["Name", "Email"]);
    sheet
        .append(NewRow::keyed([("EMAIL", "x@y.com")]))
        .await
        .unwrap();
    assert_eq!(sheet.data().await.unwrap().len(), 1);

    let hits = server.hits();
    assert_eq!(hits.get("Team Sheet!A1:C1"), Some(&1));
    assert_eq!(hits.get(RANGE), Some(&2));
    assert_eq!(
        server.appended(),
        [(
            RANGE.to_owned(),
            json!({"majorDimension": "ROWS", "values": [["", "x@y.com"]]})
        )]
    );
}

#[tokio::test]
async fn test_sheet_append_rejected_over_http() {
    sheetkeeper_test::setup();
    let server = SheetsServer::new();
    server.set_updated_rows(0);
    let sheet = Sheet::new(Arc::new(client(&server, None)), SheetOptions::new(RANGE));

    let result = sheet.append(NewRow::positional(["Cy"])).await;
    assert!(matches!(result, Err(Error::AppendRejected(_))));
}

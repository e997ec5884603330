//! Helpers for testing sheets and the services behind them.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Prefer [`MockSource`] to test caching behavior. It counts every fetch per range and can
//!    hold fetches back until the test opens its gate, which makes races deterministic.
//!
//!  - When using [`SheetsServer`], make sure that the server is held until all requests to
//!    it have been made. If the server is dropped, all connections to it will fail. To avoid
//!    this, assign it to a variable: `let server = SheetsServer::new();`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

use sheetkeeper_service::{AppendConfirmation, CellValue, Error, Grid, RemoteSource, Result};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `sheetkeeper` crates and mutes
///    all other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("sheetkeeper_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Builds a grid from string literals.
pub fn grid(rows: &[&[&str]]) -> Grid {
    rows.iter()
        .map(|row| row.iter().map(|cell| cell.to_string()).collect())
        .collect()
}

/// Renders a cell the way a spreadsheet would show it after a user-entered append.
fn display_cell(cell: &CellValue) -> String {
    match serde_json::to_value(cell) {
        Ok(Value::String(s)) => s,
        Ok(Value::Null) | Err(_) => String::new(),
        Ok(other) => other.to_string(),
    }
}

#[derive(Debug, Default)]
struct MockState {
    grid: Grid,
    ranges: BTreeMap<String, Grid>,
    fetches: BTreeMap<String, usize>,
    appends: Vec<(String, Vec<CellValue>)>,
    updated_rows: u64,
    fetch_error: Option<Error>,
    append_error: Option<Error>,
}

/// An in-memory [`RemoteSource`].
///
/// Every range serves the same grid unless a different one was registered for that exact
/// range with [`with_range`](Self::with_range). Successful appends add the row to the grid.
#[derive(Debug)]
pub struct MockSource {
    state: Mutex<MockState>,
    gate: Option<Semaphore>,
}

impl MockSource {
    /// Creates a source serving `grid` for every range.
    pub fn new(grid: Grid) -> Self {
        Self {
            state: Mutex::new(MockState {
                grid,
                updated_rows: 1,
                ..Default::default()
            }),
            gate: None,
        }
    }

    /// Serves `grid` for requests to exactly `range`.
    pub fn with_range(self, range: &str, grid: Grid) -> Self {
        self.state.lock().ranges.insert(range.to_owned(), grid);
        self
    }

    /// Holds every fetch back until a permit is released with [`open_gate`](Self::open_gate).
    ///
    /// Fetches are counted before they wait for the gate.
    pub fn with_gate(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    /// Lets `fetches` waiting or future fetches pass the gate.
    pub fn open_gate(&self, fetches: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(fetches);
        }
    }

    /// Replaces the grid served for ranges without an explicit grid.
    pub fn set_grid(&self, grid: Grid) {
        self.state.lock().grid = grid;
    }

    /// Makes all following fetches fail with `error`, or succeed again with `None`.
    pub fn fail_fetches(&self, error: Option<Error>) {
        self.state.lock().fetch_error = error;
    }

    /// Makes all following appends fail with `error`, or succeed again with `None`.
    pub fn fail_appends(&self, error: Option<Error>) {
        self.state.lock().append_error = error;
    }

    /// Sets the number of updated rows reported for appends. Defaults to `1`.
    pub fn set_updated_rows(&self, rows: u64) {
        self.state.lock().updated_rows = rows;
    }

    /// Returns how often `range` was fetched.
    pub fn fetches(&self, range: &str) -> usize {
        self.state.lock().fetches.get(range).copied().unwrap_or(0)
    }

    /// Returns the number of fetches across all ranges.
    pub fn total_fetches(&self) -> usize {
        self.state.lock().fetches.values().sum()
    }

    /// Returns every row sent to the source, along with its range, including failed ones.
    pub fn appends(&self) -> Vec<(String, Vec<CellValue>)> {
        self.state.lock().appends.clone()
    }
}

impl RemoteSource for MockSource {
    fn fetch_grid<'a>(&'a self, range: &'a str) -> BoxFuture<'a, Result<Grid>> {
        async move {
            *self
                .state
                .lock()
                .fetches
                .entry(range.to_owned())
                .or_default() += 1;

            if let Some(gate) = &self.gate {
                gate.acquire().await.map_err(|_| Error::Interrupted)?.forget();
            }

            let state = self.state.lock();
            if let Some(error) = &state.fetch_error {
                return Err(error.clone());
            }
            let grid = state.ranges.get(range).unwrap_or(&state.grid);
            if grid.is_empty() {
                return Err(Error::NoData);
            }
            Ok(grid.clone())
        }
        .boxed()
    }

    fn append_row<'a>(
        &'a self,
        range: &'a str,
        row: Vec<CellValue>,
    ) -> BoxFuture<'a, Result<AppendConfirmation>> {
        async move {
            let mut state = self.state.lock();
            state.appends.push((range.to_owned(), row.clone()));
            if let Some(error) = &state.append_error {
                return Err(error.clone());
            }

            let updated_rows = state.updated_rows;
            if updated_rows > 0 {
                state.grid.push(row.iter().map(display_cell).collect());
            }
            Ok(AppendConfirmation {
                updated_rows,
                updated_range: Some(range.to_owned()),
            })
        }
        .boxed()
    }
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
}

impl Server {
    /// Serves `router` on a random local port.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.socket.port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug)]
struct SheetsState {
    values: BTreeMap<String, Value>,
    statuses: BTreeMap<String, StatusCode>,
    updated_rows: u64,
    appended: Vec<(String, Value)>,
    hits: BTreeMap<String, usize>,
    authorization: Option<String>,
}

type SharedState = Arc<Mutex<SheetsState>>;

/// A fake of the Sheets `values` API.
///
/// `GET /v4/spreadsheets/{id}/values/{range}` answers with the rows registered for `range`,
/// or with a value range without `values` if there are none. `POST .../{range}:append`
/// records the request body and reports one updated row.
#[derive(Debug)]
pub struct SheetsServer {
    server: Server,
    state: SharedState,
}

impl SheetsServer {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(SheetsState {
            values: BTreeMap::new(),
            statuses: BTreeMap::new(),
            updated_rows: 1,
            appended: Vec::new(),
            hits: BTreeMap::new(),
            authorization: None,
        }));

        let router = Router::new()
            .route(
                "/v4/spreadsheets/:id/values/*range",
                get(get_values).post(append_values),
            )
            .with_state(state.clone());

        let server = Server::with_router(router);
        Self { server, state }
    }

    /// Serves the JSON `rows` for `range`.
    pub fn set_values(&self, range: &str, rows: Value) {
        self.state.lock().values.insert(range.to_owned(), rows);
    }

    /// Answers every request for `range` with an empty body and `status`.
    pub fn set_status(&self, range: &str, status: StatusCode) {
        self.state.lock().statuses.insert(range.to_owned(), status);
    }

    /// Sets the number of updated rows reported for appends.
    pub fn set_updated_rows(&self, rows: u64) {
        self.state.lock().updated_rows = rows;
    }

    /// The API root to configure the client with.
    pub fn base_url(&self) -> Url {
        self.server.url("/")
    }

    /// Returns and resets the number of requests per range.
    pub fn hits(&self) -> BTreeMap<String, usize> {
        std::mem::take(&mut self.state.lock().hits)
    }

    /// Returns the bodies of all append requests, along with their range.
    pub fn appended(&self) -> Vec<(String, Value)> {
        self.state.lock().appended.clone()
    }

    /// Returns the `Authorization` header of the most recent request.
    pub fn authorization(&self) -> Option<String> {
        self.state.lock().authorization.clone()
    }
}

impl Default for SheetsServer {
    fn default() -> Self {
        Self::new()
    }
}

fn record_hit(state: &mut SheetsState, range: &str, headers: &HeaderMap) {
    *state.hits.entry(range.to_owned()).or_default() += 1;
    state.authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned);
}

async fn get_values(
    State(state): State<SharedState>,
    Path((_id, range)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let mut state = state.lock();
    record_hit(&mut state, &range, &headers);

    if let Some(status) = state.statuses.get(&range) {
        return (*status, "request refused").into_response();
    }

    let body = match state.values.get(&range) {
        Some(rows) => json!({"range": range, "majorDimension": "ROWS", "values": rows}),
        None => json!({"range": range, "majorDimension": "ROWS"}),
    };
    Json(body).into_response()
}

async fn append_values(
    State(state): State<SharedState>,
    Path((id, range)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let Some(range) = range.strip_suffix(":append") else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let mut state = state.lock();
    record_hit(&mut state, range, &headers);

    if let Some(status) = state.statuses.get(range) {
        return (*status, "request refused").into_response();
    }

    state.appended.push((range.to_owned(), body));
    Json(json!({
        "spreadsheetId": id,
        "updates": {
            "spreadsheetId": id,
            "updatedRange": range,
            "updatedRows": state.updated_rows,
        },
    }))
    .into_response()
}

//! The remote side of a [`Sheet`](crate::Sheet).
//!
//! A [`RemoteSource`] knows exactly two operations: fetching the cells of a range and appending
//! one row after a range. [`SheetsClient`] implements them on top of the Google Sheets REST API.

use std::fmt;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::mapping::{CellValue, Grid};

mod sheets;

pub use sheets::SheetsClient;

/// The outcome of a successful remote append.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AppendConfirmation {
    /// The number of rows the remote reports as written.
    pub updated_rows: u64,
    /// The range that was written, in A1 notation.
    pub updated_range: Option<String>,
}

/// A tabular data source that can be read from and appended to.
pub trait RemoteSource: fmt::Debug + Send + Sync + 'static {
    /// Fetches all cells of `range`.
    ///
    /// Fails with [`Error::NoData`](crate::Error::NoData) if the response carries no values.
    fn fetch_grid<'a>(&'a self, range: &'a str) -> BoxFuture<'a, Result<Grid>>;

    /// Appends `row` as a new row after `range`.
    ///
    /// Values are interpreted as if typed by a user, and new rows are inserted instead of
    /// overwriting the cells below the range.
    fn append_row<'a>(
        &'a self,
        range: &'a str,
        row: Vec<CellValue>,
    ) -> BoxFuture<'a, Result<AppendConfirmation>>;
}

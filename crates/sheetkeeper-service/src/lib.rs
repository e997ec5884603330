//! A cached, typed view over rows of a remote spreadsheet.
//!
//! A [`Sheet`] reads the cells of one range through a [`RemoteSource`], keeps them in memory,
//! and turns them into rows or objects keyed by the header row. Appending a row through the
//! sheet invalidates its cache. The caching itself is done by [`Keeper`], which deduplicates
//! concurrent fetches and can refresh its value in the background.

#[macro_use]
pub mod metrics;

pub mod config;
pub mod error;
pub mod keeper;
pub mod logging;
pub mod mapping;
pub mod range;
mod sheet;
pub mod source;

pub use error::{Error, Result};
pub use keeper::Keeper;
pub use mapping::{CellValue, Grid, KeyCase, NewRow, RowObject};
pub use sheet::{KeyTransform, ObjectFilter, RowFilter, Sanitizer, Sheet, SheetOptions};
pub use source::{AppendConfirmation, RemoteSource, SheetsClient};

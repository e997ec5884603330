//! The cached, typed view of one spreadsheet range.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SheetConfig;
use crate::error::{Error, Result};
use crate::keeper::Keeper;
use crate::mapping::{self, Grid, KeyCase, NewRow, RowObject};
use crate::range::header_range;
use crate::source::{AppendConfirmation, RemoteSource};

/// Normalizes a single cell, on read and before append.
pub type Sanitizer = Arc<dyn Fn(&str) -> String + Send + Sync>;
/// Turns a sanitized header cell into a field name.
pub type KeyTransform = Arc<dyn Fn(&str) -> String + Send + Sync>;
/// Decides whether a sanitized data row is returned by [`Sheet::rows`].
pub type RowFilter = Arc<dyn Fn(&[String]) -> bool + Send + Sync>;
/// Decides whether a row object is returned by [`Sheet::data`].
pub type ObjectFilter = Arc<dyn Fn(&RowObject) -> bool + Send + Sync>;

/// Everything a [`Sheet`] needs to know besides its [`RemoteSource`].
#[derive(Clone)]
pub struct SheetOptions {
    /// The range holding the header and data rows.
    pub range: String,
    /// The 1-based header row, `0` for no header.
    pub header_rows: usize,
    /// Turns header cells into column names.
    pub key_transform: KeyTransform,
    /// Normalizes cells on read and text cells before append.
    pub sanitize: Sanitizer,
    /// Keeps only matching rows in [`Sheet::rows`] and [`Sheet::data`].
    pub row_filter: RowFilter,
    /// Keeps only matching objects in [`Sheet::data`].
    pub object_filter: ObjectFilter,
    /// Start fetching the sheet on construction.
    pub preload: bool,
    /// Refresh the cached grid in the background on this interval.
    pub refresh_interval: Option<Duration>,
    /// Refetch the cached grid on access once it is older than this.
    pub max_age: Option<Duration>,
    /// The `strftime` format used for date cells on append.
    pub date_format: String,
}

impl SheetOptions {
    /// Creates options for `range` with every other setting at its default.
    pub fn new(range: impl Into<String>) -> Self {
        let defaults = SheetConfig::default();
        SheetOptions {
            range: range.into(),
            header_rows: defaults.header_rows,
            key_transform: Arc::new(|key: &str| key.to_owned()),
            sanitize: Arc::new(mapping::sanitize),
            row_filter: Arc::new(|_: &[String]| true),
            object_filter: Arc::new(|_: &RowObject| true),
            preload: defaults.preload,
            refresh_interval: defaults.refresh_interval,
            max_age: defaults.max_age,
            date_format: defaults.date_format,
        }
    }

    /// Creates options from the configuration file section.
    pub fn from_config(config: &SheetConfig) -> Self {
        let key_case = config.key_transform;
        SheetOptions {
            header_rows: config.header_rows,
            preload: config.preload,
            refresh_interval: config.refresh_interval,
            max_age: config.max_age,
            date_format: config.date_format.clone(),
            ..Self::new(config.range.clone())
        }
        .with_key_case(key_case)
    }

    pub fn with_header_rows(mut self, header_rows: usize) -> Self {
        self.header_rows = header_rows;
        self
    }

    pub fn with_key_case(self, key_case: KeyCase) -> Self {
        self.with_key_transform(move |key| key_case.apply(key))
    }

    pub fn with_key_transform<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.key_transform = Arc::new(f);
        self
    }

    pub fn with_sanitize<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.sanitize = Arc::new(f);
        self
    }

    pub fn with_row_filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&[String]) -> bool + Send + Sync + 'static,
    {
        self.row_filter = Arc::new(f);
        self
    }

    pub fn with_object_filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&RowObject) -> bool + Send + Sync + 'static,
    {
        self.object_filter = Arc::new(f);
        self
    }

    pub fn with_preload(mut self, preload: bool) -> Self {
        self.preload = preload;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Option<Duration>) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }
}

impl fmt::Debug for SheetOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SheetOptions")
            .field("range", &self.range)
            .field("header_rows", &self.header_rows)
            .field("preload", &self.preload)
            .field("refresh_interval", &self.refresh_interval)
            .field("max_age", &self.max_age)
            .field("date_format", &self.date_format)
            .finish_non_exhaustive()
    }
}

/// A cached, typed accessor for one range of a spreadsheet.
///
/// The sheet keeps two [`Keeper`]s: one for the full grid of the range, and one for the column
/// names. Column names are sliced out of the grid when one is already cached, and otherwise
/// fetched on their own with a narrow request covering only the header rows.
///
/// Reads never refetch a cached grid unless it was invalidated by [`refresh`](Self::refresh),
/// by a successful [`append`](Self::append), or it exceeded the configured maximum age.
#[derive(Debug)]
pub struct Sheet {
    source: Arc<dyn RemoteSource>,
    options: Arc<SheetOptions>,
    grid: Keeper<Grid>,
    columns: Keeper<Vec<String>>,
}

impl Sheet {
    /// Creates a sheet that reads from and appends to `source`.
    ///
    /// # Panics
    ///
    /// Panics outside of a tokio runtime if `preload` or `refresh_interval` is set.
    pub fn new(source: Arc<dyn RemoteSource>, options: SheetOptions) -> Self {
        let options = Arc::new(options);

        let grid = {
            let source = Arc::clone(&source);
            let options = Arc::clone(&options);
            Keeper::new("grid", options.max_age, move || {
                let source = Arc::clone(&source);
                let options = Arc::clone(&options);
                async move { source.fetch_grid(&options.range).await }
            })
        };

        let columns = {
            let source = Arc::clone(&source);
            let options = Arc::clone(&options);
            let grid = grid.clone();
            Keeper::new("columns", None, move || {
                let source = Arc::clone(&source);
                let options = Arc::clone(&options);
                let grid = grid.clone();
                async move { resolve_columns(&*source, &options, &grid).await }
            })
        };

        let sheet = Sheet {
            source,
            options,
            grid,
            columns,
        };

        if sheet.options.preload {
            sheet.preload();
        }
        if let Some(interval) = sheet.options.refresh_interval {
            sheet.keep_fresh(interval);
        }
        sheet
    }

    /// Returns the options this sheet was created with.
    pub fn options(&self) -> &SheetOptions {
        &self.options
    }

    fn preload(&self) {
        self.refresh();
        let grid = self.grid.clone();
        tokio::spawn(async move {
            if let Err(err) = grid.get().await {
                tracing::error!(error = %err, "failed to preload sheet");
            }
        });
    }

    /// Returns the sanitized data rows below the header that pass the row filter.
    pub async fn rows(&self) -> Result<Vec<Vec<String>>> {
        let grid = self.grid.get().await?;
        Ok(mapping::data_rows(
            &grid,
            self.options.header_rows,
            &*self.options.sanitize,
            &*self.options.row_filter,
        ))
    }

    /// Returns the column names taken from the header row.
    pub async fn columns(&self) -> Result<Vec<String>> {
        if self.options.header_rows == 0 {
            return Err(Error::NoHeaderRow);
        }
        Ok(self.columns.get().await?.as_ref().clone())
    }

    /// Returns the data rows as objects keyed by column name.
    pub async fn data(&self) -> Result<Vec<RowObject>> {
        if self.options.header_rows == 0 {
            return Err(Error::NoHeaderRow);
        }

        // Rows first: this settles the grid, so the columns lookup can reuse it instead of
        // fetching the header on its own.
        let rows = self.rows().await?;
        let columns = self.columns.get().await?;

        Ok(rows
            .iter()
            .map(|row| mapping::zip_object(row, &columns))
            .filter(|object| (self.options.object_filter)(object))
            .collect())
    }

    /// Appends a row after the configured range.
    ///
    /// A [`NewRow::Keyed`] row is ordered like the sheet's columns first. Text cells are
    /// sanitized and dates formatted before sending. On success the cached grid is invalidated,
    /// so the next read sees the new row. On failure the cache is left untouched.
    pub async fn append(&self, row: NewRow) -> Result<AppendConfirmation> {
        let cells = match row {
            NewRow::Positional(cells) => cells,
            NewRow::Keyed(values) => {
                let columns = self.columns().await?;
                mapping::keyed_to_positional(&columns, values)?
            }
        };
        if cells.is_empty() {
            return Err(Error::AppendRejected("row has no cells".into()));
        }

        let cells = cells
            .into_iter()
            .map(|cell| {
                mapping::prepare_cell(cell, &*self.options.sanitize, &self.options.date_format)
            })
            .collect::<Result<Vec<_>>>()?;

        let result = self.source.append_row(&self.options.range, cells).await;
        let status = match &result {
            Ok(confirmation) if confirmation.updated_rows > 0 => "ok",
            Ok(_) => "rejected",
            Err(_) => "error",
        };
        metric!(counter("sheet.append") += 1, "status" => status);

        let confirmation = result?;
        if confirmation.updated_rows == 0 {
            return Err(Error::AppendRejected("no rows were updated".into()));
        }

        tracing::debug!(updated_range = ?confirmation.updated_range, "appended row");
        self.grid.fresh();
        Ok(confirmation)
    }

    /// Invalidates the cached grid. The next read fetches it again.
    pub fn refresh(&self) {
        self.grid.fresh();
    }

    /// Refreshes the cached grid in the background every `interval`.
    ///
    /// Replaces any previous schedule.
    pub fn keep_fresh(&self, interval: Duration) {
        self.grid.start(interval);
    }

    /// Stops the background refresh.
    pub fn stop_refreshing(&self) {
        self.grid.stop();
    }

    /// Returns how long ago the cached grid was fetched, if there is one.
    pub fn grid_age(&self) -> Option<Duration> {
        self.grid.age()
    }
}

/// Resolves the column names, preferring an already settled grid over a header-only fetch.
async fn resolve_columns(
    source: &dyn RemoteSource,
    options: &SheetOptions,
    grid: &Keeper<Grid>,
) -> Result<Vec<String>> {
    let header = match grid.stale() {
        Ok(grid) => grid,
        Err(_) => {
            let range = header_range(&options.range, options.header_rows);
            tracing::debug!(range = %range, "fetching header rows");
            Arc::new(source.fetch_grid(&range).await?)
        }
    };

    mapping::header_names(
        &header,
        options.header_rows,
        &*options.sanitize,
        &*options.key_transform,
    )
}

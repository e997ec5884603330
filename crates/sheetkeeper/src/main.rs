//! Sheetkeeper.
//!
//! Sheetkeeper reads the rows of a spreadsheet range, maps them to objects keyed by the header
//! row, and appends new rows. Reads are cached in memory and can be kept fresh in the
//! background, which the `watch` command uses to follow a sheet over time.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}

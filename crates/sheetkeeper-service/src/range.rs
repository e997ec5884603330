//! Just enough A1 notation to narrow a range down to its header rows.

/// One side of an A1 range like `B3`, `F` or `12`, absolute references like `$B$3` included.
#[derive(Debug, Default, PartialEq)]
struct Corner<'a> {
    column: Option<&'a str>,
    row: Option<usize>,
}

fn parse_corner(corner: &str) -> Option<Corner<'_>> {
    let digits = corner
        .find(|c: char| c.is_ascii_digit())
        .unwrap_or(corner.len());
    let (column, row) = corner.split_at(digits);
    let column = column.strip_prefix('$').unwrap_or(column);
    let column = column.strip_suffix('$').unwrap_or(column);

    if !column.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let row = match row {
        "" => None,
        row => Some(row.parse().ok()?),
    };
    let column = (!column.is_empty()).then_some(column);

    Some(Corner { column, row })
}

/// Returns the range covering only the first `header_rows` rows of `range`.
///
/// `Sheet1!B3:F` with two header rows becomes `Sheet1!B3:F4`. Ranges that do not look like plain
/// A1 notation, such as named ranges or a bare sheet name, fall back to whole rows counted from
/// the top of the sheet: `Sheet1!1:2`.
pub fn header_range(range: &str, header_rows: usize) -> String {
    let header_rows = header_rows.max(1);

    let (sheet, cells) = match range.rsplit_once('!') {
        Some((sheet, cells)) => (Some(sheet), cells),
        // no cell reference at all, this is a sheet name
        None if !range.contains(':') => (Some(range), ""),
        None => (None, range),
    };
    let prefix = match sheet {
        Some(sheet) if !sheet.is_empty() => format!("{sheet}!"),
        _ => String::new(),
    };

    let (start, end) = match cells.split_once(':') {
        Some((start, end)) => (parse_corner(start), parse_corner(end)),
        None => (parse_corner(cells), None),
    };

    let Some(start) = start.filter(|_| !cells.is_empty()) else {
        return format!("{prefix}1:{header_rows}");
    };
    let first_row = start.row.unwrap_or(1);
    let last_row = first_row + header_rows - 1;

    match (start.column, end.and_then(|end| end.column)) {
        (Some(first_column), Some(last_column)) => {
            format!("{prefix}{first_column}{first_row}:{last_column}{last_row}")
        }
        _ => format!("{prefix}{first_row}:{last_row}"),
    }
}

//! Plain-text table rendering for `stratusctl`.

/// Render a padded table. Column widths follow the widest cell; a separator
/// line sits between the header and the rows.
pub fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (index, cell) in row.iter().enumerate() {
            if index < widths.len() && cell.len() > widths[index] {
                widths[index] = cell.len();
            }
        }
    }

    let mut out = String::new();
    render_row(&mut out, headers.iter().map(|h| h.to_string()), &widths);
    let separator: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    render_row(&mut out, separator.into_iter(), &widths);
    for row in rows {
        render_row(&mut out, row.iter().cloned(), &widths);
    }
    out
}

fn render_row(out: &mut String, cells: impl Iterator<Item = String>, widths: &[usize]) {
    let cells: Vec<String> = cells.collect();
    for (index, cell) in cells.iter().enumerate() {
        if index > 0 {
            out.push_str("  ");
        }
        out.push_str(cell);
        if index + 1 < cells.len() {
            let width = widths.get(index).copied().unwrap_or(cell.len());
            for _ in cell.len()..width {
                out.push(' ');
            }
        }
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_columns_are_padded_to_the_widest_cell() {
        let table = render_table(
            &["ID", "STATE"],
            &[
                vec!["rec-1".to_string(), "ok".to_string()],
                vec!["rec-123456".to_string(), "err".to_string()],
            ],
        );
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "ID          STATE");
        assert_eq!(lines[1], "----------  -----");
        assert_eq!(lines[2], "rec-1       ok");
        assert_eq!(lines[3], "rec-123456  err");
    }

    #[test]
    fn test_empty_rows_render_header_only() {
        let table = render_table(&["A"], &[]);
        assert_eq!(table.lines().count(), 2);
    }
}

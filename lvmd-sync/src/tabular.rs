//! Parsing of lvm's report output.
//!
//! Reports are requested with a reserved field separator so that values
//! containing spaces or commas survive intact.

use std::collections::HashMap;

/// Field separator passed to every report command.
pub const SEP: &str = "{|}";

/// One parsed line: separator-delimited fields, or a bare trimmed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Fields(Vec<String>),
    Text(String),
}

/// Split report output into lines. Lines carrying the separator become
/// trimmed field vectors; other non-empty lines are kept as plain text.
pub fn parse(out: &str) -> Vec<Line> {
    out.lines()
        .filter_map(|line| {
            if line.contains(SEP) {
                let fields: Vec<String> = line.split(SEP).map(|f| f.trim().to_string()).collect();
                (fields.len() > 1).then_some(Line::Fields(fields))
            } else {
                let text = line.trim();
                (!text.is_empty()).then(|| Line::Text(text.to_string()))
            }
        })
        .collect()
}

/// Zip `columns` against each separator-delimited row.
pub fn parse_column_names(out: &str, columns: &[&str]) -> Vec<HashMap<String, String>> {
    parse(out)
        .into_iter()
        .filter_map(|line| match line {
            Line::Fields(fields) => Some(
                columns
                    .iter()
                    .map(|c| c.to_string())
                    .zip(fields)
                    .collect(),
            ),
            // A single-column report has no separator on the line.
            Line::Text(text) if columns.len() == 1 => {
                Some(HashMap::from([(columns[0].to_string(), text)]))
            }
            Line::Text(_) => None,
        })
        .collect()
}

/// Render the separator-delimited line lvm would print for `values`.
pub fn format_row(values: &[&str]) -> String {
    format!("  {}", values.join(SEP))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_and_trims_fields() {
        let out = "  vg0{|}uuid-1{|} 1024 \n\n  a plain line  \n";
        assert_eq!(
            parse(out),
            vec![
                Line::Fields(vec!["vg0".into(), "uuid-1".into(), "1024".into()]),
                Line::Text("a plain line".into()),
            ]
        );
    }

    #[test]
    fn columns_are_zipped_by_position() {
        let out = format!("{}\n{}\n", format_row(&["vg0", "u0"]), format_row(&["vg1", "u1"]));
        let rows = parse_column_names(&out, &["vg_name", "vg_uuid"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["vg_name"], "vg1");
        assert_eq!(rows[1]["vg_uuid"], "u1");
    }

    #[test]
    fn empty_trailing_fields_are_kept() {
        let rows = parse_column_names("a{|}{|}", &["x", "y", "z"]);
        assert_eq!(rows[0]["y"], "");
        assert_eq!(rows[0]["z"], "");
    }

    #[test]
    fn single_column_reports_use_text_lines() {
        let rows = parse_column_names("  /dev/sda\n  /dev/sdb\n", &["pv_name"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["pv_name"], "/dev/sda");
    }
}

//! Parser for the tab-separated master mapping table.
//!
//! The first column lists the universal classes, one per row; the row order
//! defines universal ids. Every further column belongs to one dataset and names
//! the dataset class (or `{a, b}` set of classes) that corresponds to the
//! row's universal class. Empty cells mean no correspondence.

use crate::error::EvalError;
use crate::taxonomy::UNIVERSAL_TAXONOMY;

/// Parsed contents of a master mapping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterTable {
    universal_classes: Vec<String>,
    columns: Vec<DatasetColumn>,
}

/// The cells of one dataset column, aligned with the universal rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetColumn {
    pub dataset: String,
    pub cells: Vec<Vec<String>>,
}

impl MasterTable {
    pub fn parse(text: &str) -> Result<Self, EvalError> {
        let mut lines = text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty());

        let (_, header) = lines
            .next()
            .ok_or_else(|| EvalError::invalid_taxonomy("master table is empty"))?;
        let headers: Vec<&str> = header.split('\t').map(str::trim).collect();
        if headers.first() != Some(&UNIVERSAL_TAXONOMY) {
            return Err(EvalError::invalid_taxonomy(format!(
                "master table must start with a '{UNIVERSAL_TAXONOMY}' column, found '{}'",
                headers.first().copied().unwrap_or_default()
            )));
        }

        let mut columns: Vec<DatasetColumn> = headers[1..]
            .iter()
            .map(|dataset| DatasetColumn {
                dataset: dataset.to_string(),
                cells: Vec::new(),
            })
            .collect();
        let mut universal_classes = Vec::new();

        for (line_no, line) in lines {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() > headers.len() {
                return Err(EvalError::invalid_taxonomy(format!(
                    "line {}: {} fields but only {} columns",
                    line_no + 1,
                    fields.len(),
                    headers.len()
                )));
            }
            let universal = fields[0].trim();
            if universal.is_empty() {
                return Err(EvalError::invalid_taxonomy(format!(
                    "line {}: missing universal class name",
                    line_no + 1
                )));
            }
            universal_classes.push(universal.to_string());

            for (col, column) in columns.iter_mut().enumerate() {
                // Trailing empty cells are often trimmed by spreadsheet exports.
                let cell = fields.get(col + 1).copied().unwrap_or_default();
                column.cells.push(parse_cell(cell));
            }
        }

        Ok(Self {
            universal_classes,
            columns,
        })
    }

    pub fn universal_classes(&self) -> &[String] {
        &self.universal_classes
    }

    pub fn datasets(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.dataset.as_str())
    }

    pub fn column(&self, dataset: &str) -> Option<&DatasetColumn> {
        self.columns.iter().find(|c| c.dataset == dataset)
    }
}

/// Split a cell into class names: `""` → none, `name` → one, `{a, b}` → many.
fn parse_cell(cell: &str) -> Vec<String> {
    let cell = cell.trim();
    let inner = cell
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .unwrap_or(cell);
    inner
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

use anyhow::Result;
use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::{ExtractionResult, Strategy};
use crate::browser::BrowserSession;

pub const DEFAULT_SELECTORS: &[&str] = &[
    "#reporting_ag_grid",
    ".ag-root",
    "table.vessels-table",
    "[role=grid]",
    "table",
];

const ROW_SELECTOR: &str = "tr, [role=row]";
const CELL_SELECTOR: &str = "th, td, [role=gridcell], [role=columnheader]";
const HEADER_CELL_SELECTOR: &str = "th, [role=columnheader]";

/// Reads the first non-empty table-like container out of the rendered DOM.
pub struct TableExtractor {
    selectors: Vec<String>,
}

impl Default for TableExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_SELECTORS.iter().map(|s| s.to_string()).collect())
    }
}

impl TableExtractor {
    pub fn new(selectors: Vec<String>) -> Self {
        Self { selectors }
    }

    pub fn extract_html(&self, html: &str) -> ExtractionResult {
        let doc = Html::parse_document(html);
        let (Ok(row_sel), Ok(cell_sel), Ok(head_sel)) = (
            Selector::parse(ROW_SELECTOR),
            Selector::parse(CELL_SELECTOR),
            Selector::parse(HEADER_CELL_SELECTOR),
        ) else {
            return ExtractionResult::NotFound;
        };

        for raw in &self.selectors {
            let container_sel = match Selector::parse(raw) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Skipping invalid table selector {}: {:?}", raw, e);
                    continue;
                }
            };
            let Some(container) = doc.select(&container_sel).next() else {
                continue;
            };
            let records = read_rows(container, &row_sel, &cell_sel, &head_sel);
            if records.is_empty() {
                debug!(selector = raw.as_str(), "Table container has no data rows");
                continue;
            }
            let count = records.len();
            return ExtractionResult::checked(
                json!({ "data": records }),
                format!("DOM table {} ({} rows)", raw, count),
            );
        }
        ExtractionResult::NotFound
    }
}

impl Strategy for TableExtractor {
    fn name(&self) -> &'static str {
        "dom-table"
    }

    fn attempt(&self, page: &dyn BrowserSession) -> Result<ExtractionResult> {
        let html = page.content()?;
        Ok(self.extract_html(&html))
    }
}

fn read_rows(
    container: ElementRef<'_>,
    row_sel: &Selector,
    cell_sel: &Selector,
    head_sel: &Selector,
) -> Vec<Value> {
    let rows: Vec<ElementRef<'_>> = container.select(row_sel).collect();
    let Some(first) = rows.first() else {
        return Vec::new();
    };

    // The first row is always the header row. Without header markup its text
    // is not trusted as names and columns are positional.
    let has_header = first.select(head_sel).next().is_some();
    let mut headers: Vec<String> = cells(*first, cell_sel)
        .into_iter()
        .enumerate()
        .map(|(i, h)| if has_header && !h.is_empty() { h } else { positional(i) })
        .collect();

    let mut records = Vec::new();
    for row in &rows[1..] {
        let values = cells(*row, cell_sel);
        if values.is_empty() {
            continue;
        }
        while headers.len() < values.len() {
            headers.push(positional(headers.len()));
        }
        let mut record = Map::new();
        for (i, header) in headers.iter().enumerate() {
            let value = values.get(i).cloned().map(Value::String).unwrap_or(Value::Null);
            record.insert(header.clone(), value);
        }
        records.push(Value::Object(record));
    }
    records
}

fn cells(row: ElementRef<'_>, cell_sel: &Selector) -> Vec<String> {
    row.select(cell_sel)
        .map(|c| c.text().collect::<Vec<_>>().join(" "))
        .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect()
}

fn positional(i: usize) -> String {
    format!("Column{}", i)
}

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

use crate::crawler::task::CrawlTask;

/// Load one task per row from a CSV file with a header row.
///
/// `site` is required; `rank` defaults to the 1-based row number; any other
/// column is carried along in `extra`.
pub fn load_tasks(path: &Path) -> Result<Vec<CrawlTask>> {
    let file = std::fs::File::open(path)
        .context(format!("Failed to open site list: {}", path.display()))?;

    read_tasks(file).context(format!("Failed to read site list: {}", path.display()))
}

pub fn read_tasks<R: Read>(input: R) -> Result<Vec<CrawlTask>> {
    let mut reader = csv::Reader::from_reader(input);
    let headers = reader.headers()?.clone();

    let site_column = headers
        .iter()
        .position(|h| h.trim() == "site")
        .context("Site list has no 'site' column")?;
    let rank_column = headers.iter().position(|h| h.trim() == "rank");

    let mut tasks = Vec::new();

    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let line = row as u64 + 1;

        let site = record.get(site_column).unwrap_or_default().trim();
        if site.is_empty() {
            warn!("Skipping row {} without a site", line);
            continue;
        }

        let rank = match rank_column.and_then(|i| record.get(i)).map(str::trim) {
            Some(value) if !value.is_empty() => value
                .parse()
                .context(format!("Invalid rank '{}' on row {}", value, line))?,
            _ => line,
        };

        let extra: BTreeMap<String, String> = headers
            .iter()
            .zip(record.iter())
            .enumerate()
            .filter(|(i, _)| *i != site_column && Some(*i) != rank_column)
            .map(|(_, (name, value))| (name.trim().to_string(), value.to_string()))
            .collect();

        tasks.push(CrawlTask {
            rank,
            site: site.to_string(),
            extra,
        });
    }

    debug!("Parsed {} site(s)", tasks.len());
    Ok(tasks)
}

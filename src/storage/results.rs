use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::crawler::task::CrawlResult;

/// Newline-delimited JSON sink for crawl results
pub struct ResultWriter {
    path: PathBuf,
    file: File,
    written: usize,
}

impl ResultWriter {
    /// Open the output file, truncating it unless `append` is set
    pub async fn open(path: &Path, append: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .await
            .context(format!("Failed to open results file: {}", path.display()))?;

        debug!("Writing results to {} (append: {})", path.display(), append);

        Ok(Self {
            path: path.to_path_buf(),
            file,
            written: 0,
        })
    }

    /// Write one result as a single line and flush it
    pub async fn append(&mut self, result: &CrawlResult) -> Result<()> {
        let mut line = serde_json::to_vec(result).context("Failed to serialize result")?;
        line.push(b'\n');

        self.file
            .write_all(&line)
            .await
            .context(format!("Failed to write to {}", self.path.display()))?;
        self.file.flush().await?;

        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::CrawlTask;

    fn result(rank: u64, site: &str) -> CrawlResult {
        CrawlResult::from_task(CrawlTask::new(rank, site), vec![format!("https://{}/", site)])
    }

    #[tokio::test]
    async fn test_one_line_per_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results").join("links.jsonl");

        let mut writer = ResultWriter::open(&path, false).await.unwrap();
        writer.append(&result(1, "a.com")).await.unwrap();
        writer.append(&result(2, "b.com")).await.unwrap();
        assert_eq!(writer.written(), 2);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<CrawlResult> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines, vec![result(1, "a.com"), result(2, "b.com")]);
    }

    #[tokio::test]
    async fn test_resume_appends_and_fresh_run_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("links.jsonl");

        let mut first = ResultWriter::open(&path, false).await.unwrap();
        first.append(&result(1, "a.com")).await.unwrap();
        drop(first);

        let mut resumed = ResultWriter::open(&path, true).await.unwrap();
        resumed.append(&result(2, "b.com")).await.unwrap();
        drop(resumed);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);

        let fresh = ResultWriter::open(&path, false).await.unwrap();
        drop(fresh);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }
}

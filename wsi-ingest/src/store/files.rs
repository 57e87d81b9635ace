//! File storage seam for uploaded CSV sheets.
//!
//! Imports may reference a previously uploaded file by name instead of
//! carrying rows inline. The [`FileStore`] trait abstracts where those
//! bytes live; the crate ships a directory-backed store and an
//! in-memory one for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

use wsi_common::models::{CsvSheet, RawRecord};
use wsi_common::{Error, Result};

#[async_trait]
pub trait FileStore: Send + Sync {
    /// Store raw file bytes under a name, replacing any previous file.
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<()>;

    /// Parse the named file as a CSV sheet.
    async fn read_sheet(&self, name: &str) -> Result<CsvSheet>;

    /// Names of stored files starting with the prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Parse CSV bytes into headers plus one string map per row.
///
/// Rows shorter or longer than the header line are tolerated; missing
/// cells are simply absent from the row map.
pub fn parse_csv(bytes: &[u8]) -> Result<CsvSheet> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| Error::InvalidInput(format!("unreadable csv header: {e}")))?
        .iter()
        .map(str::to_owned)
        .collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| Error::InvalidInput(format!("unreadable csv row: {e}")))?;
        let mut row = RawRecord::new();
        for (header, cell) in headers.iter().zip(record.iter()) {
            if !cell.is_empty() {
                row.insert(header.clone(), cell.to_owned());
            }
        }
        rows.push(row);
    }
    Ok(CsvSheet { headers, rows })
}

/// File store rooted at a directory on disk.
pub struct DirFileStore {
    root: PathBuf,
}

impl DirFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirFileStore { root: root.into() }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.contains("..") || name.contains('/') || name.contains('\\') {
            return Err(Error::InvalidInput(format!("bad file name: {name}")));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl FileStore for DirFileStore {
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.path_for(name)?;
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    async fn read_sheet(&self, name: &str) -> Result<CsvSheet> {
        let path = self.path_for(name)?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|_| Error::NotFound(format!("no uploaded file named {name}")))?;
        parse_csv(&bytes)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(_) => return Ok(names),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(prefix) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

/// In-memory file store for tests.
#[derive(Default)]
pub struct MemoryFileStore {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        MemoryFileStore::default()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
        self.files.write().await.insert(name.to_owned(), bytes);
        Ok(())
    }

    async fn read_sheet(&self, name: &str) -> Result<CsvSheet> {
        let files = self.files.read().await;
        let bytes = files
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("no uploaded file named {name}")))?;
        parse_csv(bytes)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let files = self.files.read().await;
        let mut names: Vec<String> = files
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_headers_and_rows() {
        let sheet = parse_csv(b"Company Name,EIN\nAcme Steel,12-3456\nBravo,\n").unwrap();
        assert_eq!(sheet.headers, vec!["Company Name", "EIN"]);
        assert_eq!(sheet.rows.len(), 2);
        assert_eq!(sheet.rows[0].get("Company Name").unwrap(), "Acme Steel");
        assert!(sheet.rows[1].get("EIN").is_none());
    }

    #[test]
    fn tolerates_ragged_rows() {
        let sheet = parse_csv(b"a,b,c\n1,2\n1,2,3,4\n").unwrap();
        assert_eq!(sheet.rows.len(), 2);
        assert!(sheet.rows[0].get("c").is_none());
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryFileStore::new();
        store
            .put("import-a.csv", b"x\n1\n".to_vec())
            .await
            .unwrap();
        let sheet = store.read_sheet("import-a.csv").await.unwrap();
        assert_eq!(sheet.rows.len(), 1);
        assert!(store.read_sheet("missing.csv").await.is_err());
        assert_eq!(store.list("import-").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dir_store_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirFileStore::new(dir.path());
        assert!(store.put("../escape.csv", Vec::new()).await.is_err());
        store.put("ok.csv", b"a\n1\n".to_vec()).await.unwrap();
        assert_eq!(store.list("ok").await.unwrap(), vec!["ok.csv"]);
    }
}

// Local filesystem cache provider
// Entry layout: <root>/<task>/<hash>/{lock, template.json, metadata.json,
// artifacts | artifacts.tar.gz | artifacts.tar.bz2}

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use super::key::CacheKey;
use super::lock::CacheLock;
use super::CacheProvider;
use crate::defs::{Compression, DataItem};
use crate::error::CacheError;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize)]
struct CacheMetadata {
    task: String,
    hash: String,
    compression: Compression,
    created_at: u64,
}

pub struct LocalCache {
    root: PathBuf,
    writable: bool,
    lock_timeout: Duration,
}

impl LocalCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writable: true,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Default cache root under the user's home directory
    pub fn default_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("flow-engine")
    }

    fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(&key.task).join(&key.hash)
    }
}

#[async_trait]
impl CacheProvider for LocalCache {
    fn name(&self) -> &str {
        "local"
    }

    fn writable(&self) -> bool {
        self.writable
    }

    async fn exists(&self, key: &CacheKey) -> bool {
        self.entry_dir(key).join("metadata.json").exists()
    }

    async fn get(
        &self,
        key: &CacheKey,
        run_dir: &Path,
    ) -> Result<Option<Vec<DataItem>>, CacheError> {
        let entry = self.entry_dir(key);
        if !entry.join("metadata.json").exists() {
            return Ok(None);
        }

        let _lock = CacheLock::acquire(&entry.join("lock"), self.lock_timeout).await?;

        let metadata: CacheMetadata =
            serde_json::from_slice(&fs::read(entry.join("metadata.json"))?).map_err(|e| {
                CacheError::Corrupt {
                    path: entry.clone(),
                    message: e.to_string(),
                }
            })?;
        let template: Vec<DataItem> =
            serde_json::from_slice(&fs::read(entry.join("template.json"))?).map_err(|e| {
                CacheError::Corrupt {
                    path: entry.clone(),
                    message: e.to_string(),
                }
            })?;

        fs::create_dir_all(run_dir)?;
        match metadata.compression {
            Compression::Gzip => {
                let file = fs::File::open(entry.join("artifacts.tar.gz"))?;
                let mut archive = tar::Archive::new(GzDecoder::new(file));
                archive.unpack(run_dir)?;
            }
            Compression::Bzip2 => {
                let file = fs::File::open(entry.join("artifacts.tar.bz2"))?;
                let mut archive = tar::Archive::new(BzDecoder::new(file));
                archive.unpack(run_dir)?;
            }
            Compression::None => {
                let artifacts = entry.join("artifacts");
                if artifacts.exists() {
                    copy_tree(&artifacts, run_dir)?;
                }
            }
        }

        // Expand rundir-relative templates against the current run directory
        let outputs = template
            .into_iter()
            .map(|mut item| {
                if let Some(rel) = item.basedir.take() {
                    item.basedir = Some(run_dir.join(rel));
                }
                item
            })
            .collect();

        Ok(Some(outputs))
    }

    async fn put(
        &self,
        key: &CacheKey,
        run_dir: &Path,
        outputs: &[DataItem],
        compression: Compression,
    ) -> Result<bool, CacheError> {
        if !self.writable {
            return Ok(false);
        }

        // Validate and rewrite before touching the store: every output path
        // must lie inside the run directory
        let template = make_template(run_dir, outputs)?;
        let files = collect_files(run_dir, outputs)?;

        let entry = self.entry_dir(key);
        fs::create_dir_all(&entry)?;
        let _lock = CacheLock::acquire(&entry.join("lock"), self.lock_timeout).await?;

        if entry.join("metadata.json").exists() {
            return Ok(false);
        }

        match compression {
            Compression::Gzip => {
                let file = fs::File::create(entry.join("artifacts.tar.gz"))?;
                let encoder = GzEncoder::new(file, flate2::Compression::default());
                let mut builder = tar::Builder::new(encoder);
                for rel in &files {
                    builder.append_path_with_name(run_dir.join(rel), rel)?;
                }
                builder.into_inner()?.finish()?;
            }
            Compression::Bzip2 => {
                let file = fs::File::create(entry.join("artifacts.tar.bz2"))?;
                let encoder = BzEncoder::new(file, bzip2::Compression::default());
                let mut builder = tar::Builder::new(encoder);
                for rel in &files {
                    builder.append_path_with_name(run_dir.join(rel), rel)?;
                }
                builder.into_inner()?.finish()?;
            }
            Compression::None => {
                let artifacts = entry.join("artifacts");
                for rel in &files {
                    let dest = artifacts.join(rel);
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::copy(run_dir.join(rel), dest)?;
                }
            }
        }

        fs::write(entry.join("template.json"), serde_json::to_vec_pretty(&template)?)?;

        // Metadata written last marks the entry complete
        let metadata = CacheMetadata {
            task: key.task.clone(),
            hash: key.hash.clone(),
            compression,
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        };
        fs::write(entry.join("metadata.json"), serde_json::to_vec_pretty(&metadata)?)?;

        Ok(true)
    }
}

/// Rewrite output items to rundir-relative templates
fn make_template(run_dir: &Path, outputs: &[DataItem]) -> Result<Vec<DataItem>, CacheError> {
    outputs
        .iter()
        .map(|item| {
            let mut template = item.clone();
            if let Some(basedir) = &item.basedir {
                let rel = relative_to(run_dir, basedir)?;
                for file in &item.files {
                    reject_escape(file)?;
                }
                template.basedir = Some(rel);
            }
            Ok(template)
        })
        .collect()
}

/// All member files as run-directory-relative paths
fn collect_files(run_dir: &Path, outputs: &[DataItem]) -> Result<Vec<PathBuf>, CacheError> {
    let mut files = Vec::new();
    for item in outputs {
        if let Some(basedir) = &item.basedir {
            let rel = relative_to(run_dir, basedir)?;
            for file in &item.files {
                reject_escape(file)?;
                files.push(rel.join(file));
            }
        }
    }
    Ok(files)
}

fn relative_to(run_dir: &Path, path: &Path) -> Result<PathBuf, CacheError> {
    if path.is_relative() {
        reject_escape(&path.to_string_lossy())?;
        return Ok(path.to_path_buf());
    }
    path.strip_prefix(run_dir)
        .map(|p| p.to_path_buf())
        .map_err(|_| CacheError::PathEscape(path.to_path_buf()))
}

fn reject_escape(rel: &str) -> Result<(), CacheError> {
    let path = Path::new(rel);
    if path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(CacheError::PathEscape(path.to_path_buf()));
    }
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&dest)?;
            copy_tree(&entry.path(), &dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), dest)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output_in(run_dir: &Path, rel_dir: &str, file: &str, contents: &[u8]) -> DataItem {
        let dir = run_dir.join(rel_dir);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(file), contents).unwrap();

        let mut item = DataItem::new("fileset");
        item.basedir = Some(dir);
        item.files.push(file.to_string());
        item
    }

    fn key() -> CacheKey {
        CacheKey {
            task: "hdl.compile".to_string(),
            hash: "abc123".to_string(),
        }
    }

    #[tokio::test]
    async fn test_round_trip_into_fresh_run_dir() {
        let cache_dir = tempfile::tempdir().unwrap();
        let run1 = tempfile::tempdir().unwrap();
        let run2 = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(cache_dir.path());

        let item = output_in(run1.path(), "out", "netlist.v", b"module top;");
        let stored = cache
            .put(&key(), run1.path(), &[item], Compression::None)
            .await
            .unwrap();
        assert!(stored);

        // Restore into a different run directory
        let outputs = cache.get(&key(), run2.path()).await.unwrap().unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].basedir, Some(run2.path().join("out")));

        let restored = fs::read(run2.path().join("out/netlist.v")).unwrap();
        assert_eq!(restored, b"module top;");
    }

    #[tokio::test]
    async fn test_gzip_round_trip() {
        let cache_dir = tempfile::tempdir().unwrap();
        let run1 = tempfile::tempdir().unwrap();
        let run2 = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(cache_dir.path());

        let item = output_in(run1.path(), "out", "a.bin", &[1, 2, 3]);
        cache
            .put(&key(), run1.path(), &[item], Compression::Gzip)
            .await
            .unwrap();

        assert!(cache_dir
            .path()
            .join("hdl.compile/abc123/artifacts.tar.gz")
            .exists());

        let outputs = cache.get(&key(), run2.path()).await.unwrap().unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(fs::read(run2.path().join("out/a.bin")).unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_bzip2_round_trip() {
        let cache_dir = tempfile::tempdir().unwrap();
        let run1 = tempfile::tempdir().unwrap();
        let run2 = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(cache_dir.path());

        let item = output_in(run1.path(), "out", "b.bin", &[4, 5, 6]);
        cache
            .put(&key(), run1.path(), &[item], Compression::Bzip2)
            .await
            .unwrap();

        assert!(cache_dir
            .path()
            .join("hdl.compile/abc123/artifacts.tar.bz2")
            .exists());

        let outputs = cache.get(&key(), run2.path()).await.unwrap().unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(fs::read(run2.path().join("out/b.bin")).unwrap(), vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn test_path_escape_aborts_put() {
        let cache_dir = tempfile::tempdir().unwrap();
        let run_dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(cache_dir.path());

        let mut item = DataItem::new("fileset");
        item.basedir = Some(outside.path().to_path_buf());
        item.files.push("leak.txt".to_string());

        let err = cache
            .put(&key(), run_dir.path(), &[item], Compression::None)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::PathEscape(_)));

        // Nothing was committed
        assert!(!cache.exists(&key()).await);
    }

    #[tokio::test]
    async fn test_missing_entry_is_none() {
        let cache_dir = tempfile::tempdir().unwrap();
        let run_dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(cache_dir.path());

        assert!(cache.get(&key(), run_dir.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_only_provider_never_writes() {
        let cache_dir = tempfile::tempdir().unwrap();
        let run_dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(cache_dir.path()).read_only();

        let item = output_in(run_dir.path(), "out", "x", b"x");
        let stored = cache
            .put(&key(), run_dir.path(), &[item], Compression::None)
            .await
            .unwrap();
        assert!(!stored);
    }
}

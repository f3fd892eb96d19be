//! Parallel download and fingerprinting
//!
//! The only concurrent stage of a refresh. Pure I/O and hashing: nothing
//! here touches the store, and every job is joined before mutation begins.

use crate::config::UpdaterConfig;
use crate::error::{Result, UpdateError};
use crate::plugin::SourcePlugin;
use crate::registry::SourceOptions;
use futures::stream::{self, StreamExt};
use loki_common::checksum::{digest_bytes, fingerprint_file};
use loki_common::{ChecksumAlgorithm, FileFingerprint};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// One source's work for the fetch stage
pub struct FetchJob {
    pub plugin: Arc<dyn SourcePlugin>,
    pub options: SourceOptions,
    pub dir: PathBuf,
}

/// Local files of one source and the content hash derived from them
#[derive(Debug, Clone)]
pub struct Fetched {
    pub dir: PathBuf,
    pub files: Vec<FileFingerprint>,
    pub hash: String,
}

/// Download (unless `download` is false) and fingerprint every job,
/// at most `download_concurrency` at a time. Keyed by source name.
pub async fn fetch_all(
    jobs: Vec<FetchJob>,
    config: &UpdaterConfig,
    download: bool,
) -> HashMap<String, Result<Fetched>> {
    let concurrency = config.download_concurrency.max(1);
    let attempts = config.download_max_attempts.max(1);
    let delay = config.retry_delay();
    let total = jobs.len();

    let results: Vec<(String, Result<Fetched>)> = stream::iter(jobs)
        .map(|job| async move {
            let name = job.plugin.name().to_string();
            let result = fetch_one(&job, download, attempts, delay).await;
            if let Err(e) = &result {
                warn!(source = %name, error = %e, "source dropped from run");
            }
            (name, result)
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let ok = results.iter().filter(|(_, r)| r.is_ok()).count();
    info!("Fetch complete: {} / {} sources ready", ok, total);
    results.into_iter().collect()
}

async fn fetch_one(job: &FetchJob, download: bool, attempts: u32, delay: Duration) -> Result<Fetched> {
    if download {
        tokio::fs::create_dir_all(&job.dir).await?;
        download_with_retry(job, attempts, delay).await?;
    }
    let files = fingerprint_dir(job.dir.clone()).await?;
    let hash = content_hash(&job.plugin.version_string(), &job.options, &files);
    debug!(source = job.plugin.name(), files = files.len(), %hash, "source fingerprinted");
    Ok(Fetched {
        dir: job.dir.clone(),
        files,
        hash,
    })
}

async fn download_with_retry(job: &FetchJob, attempts: u32, delay: Duration) -> Result<Vec<PathBuf>> {
    let name = job.plugin.name();
    for attempt in 1..=attempts {
        debug!("Download attempt {}/{} for: {}", attempt, attempts, name);
        match job.plugin.download(&job.options, &job.dir).await {
            Ok(files) => {
                info!("Downloaded {} ({} files)", name, files.len());
                return Ok(files);
            },
            Err(e) if attempt < attempts => {
                warn!(
                    "Download attempt {}/{} failed for {}: {:#}. Retrying in {}s...",
                    attempt,
                    attempts,
                    name,
                    e,
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;
            },
            Err(e) => {
                return Err(UpdateError::TransientIo {
                    source_name: name.to_string(),
                    attempts,
                    message: format!("{e:#}"),
                });
            },
        }
    }
    Err(UpdateError::TransientIo {
        source_name: name.to_string(),
        attempts,
        message: "no download attempt was made".to_string(),
    })
}

/// Fingerprint every regular file under `dir`, sorted by relative name.
/// A missing directory has no files.
pub async fn fingerprint_dir(dir: PathBuf) -> Result<Vec<FileFingerprint>> {
    tokio::task::spawn_blocking(move || fingerprint_dir_sync(&dir))
        .await
        .map_err(|e| UpdateError::Io(std::io::Error::other(e)))?
}

fn fingerprint_dir_sync(dir: &Path) -> Result<Vec<FileFingerprint>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| UpdateError::Io(std::io::Error::other(e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .unwrap_or(entry.path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push(fingerprint_file(entry.path(), &relative)?);
    }
    files.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(files)
}

/// Extract hash: loader version, effective options and each file's
/// (name, size, md5). Modification times are not part of it.
pub fn content_hash(version: &str, options: &SourceOptions, files: &[FileFingerprint]) -> String {
    let mut material = format!("version\t{version}\n");
    for (option, value) in options {
        material.push_str(&format!("option\t{option}\t{value}\n"));
    }
    let mut sorted: Vec<&FileFingerprint> = files.iter().collect();
    sorted.sort_by(|a, b| a.filename.cmp(&b.filename));
    for file in sorted {
        material.push_str(&format!("file\t{}\t{}\t{}\n", file.filename, file.size, file.md5));
    }
    digest_bytes(material.as_bytes(), ChecksumAlgorithm::Md5)
}

/// Remove a source's working directory after processing
pub async fn discard(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(dir = %dir.display(), "download directory removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => warn!(dir = %dir.display(), error = %e, "could not remove download directory"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl SourcePlugin for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn version_string(&self) -> String {
            "1.0".into()
        }

        async fn download(&self, _options: &SourceOptions, dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                anyhow::bail!("connection reset (call {call})");
            }
            let path = dir.join("data.txt");
            tokio::fs::write(&path, b"abc").await?;
            Ok(vec![path])
        }

        async fn update(
            &self,
            _ctx: &mut crate::plugin::LoadContext<'_>,
            _options: &SourceOptions,
            _dir: &Path,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn job(plugin: Arc<dyn SourcePlugin>, dir: &Path) -> FetchJob {
        FetchJob {
            plugin,
            options: SourceOptions::new(),
            dir: dir.join("flaky"),
        }
    }

    #[tokio::test]
    async fn test_download_retries_then_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let config = UpdaterConfig::in_memory(tmp.path());
        let plugin = Arc::new(Flaky {
            fail_first: 2,
            calls: AtomicU32::new(0),
        });

        let mut results = fetch_all(vec![job(plugin.clone(), tmp.path())], &config, true).await;
        let fetched = results.remove("flaky").unwrap().unwrap();
        assert_eq!(plugin.calls.load(Ordering::SeqCst), 3);
        assert_eq!(fetched.files.len(), 1);
        assert_eq!(fetched.files[0].filename, "data.txt");
        assert_eq!(fetched.files[0].md5, "900150983cd24fb0d6963f7d28e17f72");
    }

    #[tokio::test]
    async fn test_download_gives_up_after_max_attempts() {
        let tmp = tempfile::tempdir().unwrap();
        let config = UpdaterConfig::in_memory(tmp.path());
        let plugin = Arc::new(Flaky {
            fail_first: 10,
            calls: AtomicU32::new(0),
        });

        let mut results = fetch_all(vec![job(plugin.clone(), tmp.path())], &config, true).await;
        let err = results.remove("flaky").unwrap().unwrap_err();
        assert!(matches!(err, UpdateError::TransientIo { attempts: 3, .. }));
        assert_eq!(plugin.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_content_hash_ignores_mtime_and_order() {
        let a = FileFingerprint {
            filename: "a.txt".into(),
            size: 1,
            modified: 10,
            md5: "x".into(),
        };
        let b = FileFingerprint {
            filename: "b.txt".into(),
            size: 2,
            modified: 20,
            md5: "y".into(),
        };
        let mut a_later = a.clone();
        a_later.modified = 99;

        let options = SourceOptions::new();
        let h1 = content_hash("1.0", &options, &[a.clone(), b.clone()]);
        let h2 = content_hash("1.0", &options, &[b.clone(), a_later]);
        assert_eq!(h1, h2);

        assert_ne!(h1, content_hash("1.1", &options, &[a.clone(), b.clone()]));
        let mut changed = options.clone();
        changed.insert("species".into(), "9606".into());
        assert_ne!(h1, content_hash("1.0", &changed, &[a, b]));
    }

    #[tokio::test]
    async fn test_missing_directory_has_no_files() {
        let tmp = tempfile::tempdir().unwrap();
        let files = fingerprint_dir(tmp.path().join("absent")).await.unwrap();
        assert!(files.is_empty());
    }
}

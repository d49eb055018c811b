//! Destinations for fetched payloads

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

use crate::error::Result;

/// Where successful bodies are written
///
/// `store` returns the payload reference reported back to the caller.
#[async_trait]
pub trait PayloadSink: Send + Sync {
    /// Reference and size of a payload already present for this item
    async fn existing(&self, index: usize, url: &str) -> Option<(String, u64)>;

    async fn store(&self, index: usize, url: &str, body: Bytes) -> Result<String>;
}

/// Writes each payload to `<root>/<index>-<url digest>-<file name>`
///
/// The digest covers the full URL, so a file left by another batch in the
/// same directory is never mistaken for this item's payload.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
    overwrite: bool,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            overwrite: false,
        }
    }

    /// Re-download even when a file is already present
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, index: usize, url: &str) -> PathBuf {
        self.root.join(file_name_for(index, url))
    }
}

#[async_trait]
impl PayloadSink for DirectorySink {
    async fn existing(&self, index: usize, url: &str) -> Option<(String, u64)> {
        if self.overwrite {
            return None;
        }
        let path = self.path_for(index, url);
        let meta = tokio::fs::metadata(&path).await.ok()?;
        if meta.is_file() && meta.len() > 0 {
            Some((path.display().to_string(), meta.len()))
        } else {
            None
        }
    }

    async fn store(&self, index: usize, url: &str, body: Bytes) -> Result<String> {
        tokio::fs::create_dir_all(&self.root).await?;

        let path = self.path_for(index, url);
        let partial = path.with_extension("part");
        tokio::fs::write(&partial, &body).await?;
        tokio::fs::rename(&partial, &path).await?;

        debug!(index, bytes = body.len(), path = %path.display(), "Stored payload");
        Ok(path.display().to_string())
    }
}

/// Keeps payloads in memory, keyed by index
#[derive(Debug, Default)]
pub struct MemorySink {
    payloads: DashMap<usize, Bytes>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index: usize) -> Option<Bytes> {
        self.payloads.get(&index).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// Pre-populate an entry, as if an earlier run had fetched it
    pub fn insert(&self, index: usize, body: impl Into<Bytes>) {
        self.payloads.insert(index, body.into());
    }
}

#[async_trait]
impl PayloadSink for MemorySink {
    async fn existing(&self, index: usize, _url: &str) -> Option<(String, u64)> {
        self.payloads
            .get(&index)
            .map(|entry| (memory_ref(index), entry.value().len() as u64))
    }

    async fn store(&self, index: usize, _url: &str, body: Bytes) -> Result<String> {
        self.payloads.insert(index, body);
        Ok(memory_ref(index))
    }
}

fn memory_ref(index: usize) -> String {
    format!("memory://{}", index)
}

/// `0007-<digest>-page.jpg` for `https://host/a/page.jpg?x=1`; the last part
/// is `page` when the URL has no usable last segment
pub fn file_name_for(index: usize, url: &str) -> String {
    let segment = Url::parse(url).ok().and_then(|parsed| {
        parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
    });

    let name = segment
        .map(|s| sanitize(&s))
        .filter(|s| !s.is_empty() && s != "." && s != "..")
        .unwrap_or_else(|| "page".to_string());

    format!("{:04}-{}-{}", index, url_digest(url), name)
}

/// First 8 bytes of the URL's SHA-256, hex encoded
fn url_digest(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    hex::encode(&digest[..8])
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_parts(name: &str) -> (&str, &str, &str) {
        let mut parts = name.splitn(3, '-');
        (
            parts.next().unwrap(),
            parts.next().unwrap(),
            parts.next().unwrap(),
        )
    }

    #[test]
    fn test_file_name_for() {
        let file_name = file_name_for(7, "https://img.example/a/b/page.jpg?x=1");
        let (index, digest, name) = name_parts(&file_name);
        assert_eq!(index, "0007");
        assert_eq!(digest.len(), 16);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(name, "page.jpg");

        assert_eq!(name_parts(&file_name_for(12, "https://img.example/")).2, "page");
        assert_eq!(name_parts(&file_name_for(3, "not a url")).2, "page");
        assert_eq!(
            name_parts(&file_name_for(1, "https://img.example/a/my%20page.png")).2,
            "my_20page.png"
        );
    }

    #[test]
    fn test_file_name_is_stable_and_url_specific() {
        let a = "https://img.example/manga/a/ch1/01.jpg";
        let b = "https://img.example/manga/b/ch9/01.jpg";
        assert_eq!(file_name_for(1, a), file_name_for(1, a));
        assert_ne!(file_name_for(1, a), file_name_for(1, b));
        assert_ne!(
            file_name_for(1, a),
            file_name_for(1, "https://img.example/manga/a/ch1/01.jpg?v=2")
        );
    }

    #[tokio::test]
    async fn test_other_url_with_same_file_name_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path());
        let chapter_a = "https://img.example/manga/a/ch1/01.jpg";
        let chapter_b = "https://img.example/manga/b/ch9/01.jpg";

        sink.store(1, chapter_a, Bytes::from_static(b"chapter one"))
            .await
            .unwrap();

        assert!(sink.existing(1, chapter_a).await.is_some());
        assert!(sink.existing(1, chapter_b).await.is_none());
    }

    #[tokio::test]
    async fn test_directory_sink_store_and_existing() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path().join("out"));
        let url = "https://img.example/ch1/01.jpg";

        assert!(sink.existing(1, url).await.is_none());

        let payload_ref = sink
            .store(1, url, Bytes::from_static(b"jpegdata"))
            .await
            .unwrap();
        assert!(payload_ref.ends_with("-01.jpg"));
        assert!(payload_ref.contains("0001-"));

        let (existing_ref, size) = sink.existing(1, url).await.unwrap();
        assert_eq!(existing_ref, payload_ref);
        assert_eq!(size, 8);

        let fresh = sink.clone().overwrite(true);
        assert!(fresh.existing(1, url).await.is_none());
    }

    #[tokio::test]
    async fn test_memory_sink() {
        let sink = MemorySink::new();
        assert!(sink.existing(2, "u").await.is_none());

        let payload_ref = sink.store(2, "u", Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(payload_ref, "memory://2");
        assert_eq!(sink.existing(2, "u").await, Some(("memory://2".to_string(), 3)));
        assert_eq!(sink.get(2).unwrap().as_ref(), b"abc");
    }
}

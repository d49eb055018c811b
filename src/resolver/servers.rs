//! Image mirror set
//!
//! The same asset path is served by several hosts. A URL is split into its
//! mirror prefix and the path behind it, and the path is re-joined onto every
//! other mirror to produce alternates.

use serde_json::Value;
use tracing::{debug, info};

use crate::error::{CourierError, Result};
use crate::fetch::HttpClient;
use crate::models::ProxyEndpoint;

/// Source of alternate URLs for the same asset
pub trait MirrorSource: Send + Sync {
    /// Every known mirror URL for `url` except `url` itself, in preference order
    fn alternates(&self, url: &str) -> Vec<String>;
}

/// Ordered, de-duplicated list of mirror base URLs (each ending in `/`)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageServers {
    servers: Vec<String>,
}

impl ImageServers {
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = Vec::new();
        for server in servers {
            let server = server.as_ref().trim();
            if server.is_empty() {
                continue;
            }
            let server = ensure_trailing_slash(server);
            if !normalized.contains(&server) {
                normalized.push(server);
            }
        }
        Self {
            servers: normalized,
        }
    }

    pub fn primary(&self) -> Option<&str> {
        self.servers.first().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.servers
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Split `url` into `(mirror, path)` when it lives on a known mirror
    pub fn split_slide_link<'a>(&'a self, url: &str) -> Option<(&'a str, String)> {
        self.servers
            .iter()
            .filter(|server| url.starts_with(server.as_str()))
            .max_by_key(|server| server.len())
            .map(|server| (server.as_str(), url[server.len()..].to_string()))
    }

    /// Ask the API which mirrors serve `site_id`, preferred id first
    pub async fn discover(
        client: &dyn HttpClient,
        proxy: Option<&ProxyEndpoint>,
        api_base: &str,
        site_id: Option<&str>,
        preferred: &str,
    ) -> Result<Self> {
        let url = format!(
            "{}/constants?fields[]=imageServers",
            api_base.trim_end_matches('/')
        );
        let response = client.get(&url, proxy).await?;
        if !response.is_success() {
            return Err(CourierError::ResolutionFailed(format!(
                "image server lookup returned HTTP {}",
                response.status.as_u16()
            )));
        }

        let servers = Self::from_constants(&response.body, site_id, preferred)?;
        info!(
            count = servers.len(),
            primary = servers.primary().unwrap_or_default(),
            "Discovered image servers"
        );
        Ok(servers)
    }

    /// Parse a `{"data": {"imageServers": [{id, url, site_ids}]}}` document
    pub fn from_constants(body: &[u8], site_id: Option<&str>, preferred: &str) -> Result<Self> {
        let root: Value = serde_json::from_slice(body)?;
        let entries = root
            .pointer("/data/imageServers")
            .and_then(Value::as_array)
            .filter(|entries| !entries.is_empty())
            .ok_or_else(|| CourierError::ResolutionFailed("image server list is empty".into()))?;

        let mut preferred_urls = Vec::new();
        let mut other_urls = Vec::new();
        for entry in entries {
            let url = entry.get("url").and_then(Value::as_str).unwrap_or_default();
            if url.trim().is_empty() {
                continue;
            }
            if let Some(site_id) = site_id {
                if !serves_site(entry, site_id) {
                    debug!(url, "Skipping image server for another site");
                    continue;
                }
            }
            let id = entry.get("id").and_then(Value::as_str).unwrap_or_default();
            if id == preferred {
                preferred_urls.push(url.to_string());
            } else {
                other_urls.push(url.to_string());
            }
        }

        let servers = Self::new(preferred_urls.into_iter().chain(other_urls));
        if servers.is_empty() {
            return Err(CourierError::ResolutionFailed(
                "no image server serves this site".into(),
            ));
        }
        Ok(servers)
    }
}

impl MirrorSource for ImageServers {
    fn alternates(&self, url: &str) -> Vec<String> {
        let Some((origin, path)) = self.split_slide_link(url) else {
            return Vec::new();
        };
        self.servers
            .iter()
            .filter(|server| server.as_str() != origin)
            .map(|server| format!("{}{}", server, path))
            .collect()
    }
}

fn serves_site(entry: &Value, site_id: &str) -> bool {
    entry
        .get("site_ids")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter().any(|id| match id {
                Value::Number(n) => n.to_string() == site_id,
                Value::String(s) => s == site_id,
                _ => false,
            })
        })
        .unwrap_or(false)
}

fn ensure_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{}/", url)
    }
}

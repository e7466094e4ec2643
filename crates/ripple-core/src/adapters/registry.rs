//! Version resolution against an npm-compatible registry.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{CascadeError, CascadeResult};

/// "Given a package name, return its latest published version or nothing."
///
/// Implementations swallow transport and parse failures: an unreachable
/// registry means "unknown", never an error.
#[async_trait]
pub trait VersionResolver: Send + Sync {
    async fn latest_version(&self, package: &str) -> Option<String>;
}

#[derive(Debug, Deserialize)]
struct LatestManifest {
    version: String,
}

/// HTTP client for `<registry>/<name>/latest`.
#[derive(Debug, Clone)]
pub struct NpmRegistry {
    base_url: String,
    http_client: reqwest::Client,
}

impl NpmRegistry {
    pub const DEFAULT_URL: &'static str = "https://registry.npmjs.org";

    pub fn new(base_url: impl Into<String>) -> CascadeResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("ripple/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CascadeError::Config(format!("http client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    /// URL of the `latest` dist-tag document; scoped names keep the `@` and
    /// encode the slash.
    pub fn latest_url(&self, package: &str) -> String {
        format!("{}/{}/latest", self.base_url, package.replace('/', "%2f"))
    }
}

#[async_trait]
impl VersionResolver for NpmRegistry {
    async fn latest_version(&self, package: &str) -> Option<String> {
        let url = self.latest_url(package);
        let response = match self.http_client.get(&url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(package, status = %r.status(), "registry has no published version");
                return None;
            }
            Err(e) => {
                debug!(package, error = %e, "registry unreachable");
                return None;
            }
        };
        match response.json::<LatestManifest>().await {
            Ok(manifest) if !manifest.version.is_empty() => Some(manifest.version),
            Ok(_) => None,
            Err(e) => {
                debug!(package, error = %e, "unparseable registry response");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_url_plain_and_scoped() {
        let reg = NpmRegistry::new("https://registry.example.com/").unwrap();
        assert_eq!(
            reg.latest_url("left-pad"),
            "https://registry.example.com/left-pad/latest"
        );
        assert_eq!(
            reg.latest_url("@acme/lib-a"),
            "https://registry.example.com/@acme%2flib-a/latest"
        );
    }

    #[tokio::test]
    async fn test_unreachable_registry_yields_none() {
        let reg = NpmRegistry::new("http://127.0.0.1:9").unwrap();
        assert_eq!(reg.latest_version("anything").await, None);
    }
}

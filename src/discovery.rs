//! Platform discovery.
//!
//! A "world" document lists the platforms that host engines. Each platform
//! publishes per-user SSH coordinates at `<base>/users/<user>.ssh.json`,
//! where `<base>` is the platform's HTTP endpoint or, failing that, its
//! object-storage bucket.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::KataTunnelError;
use crate::transport::ConnectionParameters;
use crate::Result;

/// Bound on each discovery request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Top-level world document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct World {
    /// Known platforms.
    #[serde(default)]
    pub platforms: Vec<Platform>,
}

impl World {
    /// Find a platform by exact name.
    pub fn platform(&self, name: &str) -> Result<&Platform> {
        self.platforms
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| KataTunnelError::PlatformNotFound(name.to_string()))
    }
}

/// One hosting platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// Platform name, e.g. `aistudio`.
    pub name: String,
    /// Object storage location.
    #[serde(default)]
    pub oss: Oss,
    /// Plain HTTP location; preferred over `oss` when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpLocation>,
}

/// Object storage bucket coordinates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Oss {
    #[serde(default, alias = "Bucket")]
    pub bucket: String,
    #[serde(default, rename = "bucketEndpoint")]
    pub bucket_endpoint: String,
}

/// HTTP endpoint serving user documents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpLocation {
    #[serde(default, rename = "getUrl", skip_serializing_if = "Option::is_none")]
    pub get_url: Option<String>,
}

impl Platform {
    /// Base URL for user documents.
    pub fn base_url(&self) -> String {
        match self.http.as_ref().and_then(|h| h.get_url.as_deref()) {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}.{}", self.oss.bucket, self.oss.bucket_endpoint),
        }
    }

    /// Location of the SSH document for `user`.
    pub fn ssh_json_url(&self, user: &str) -> String {
        format!("{}/users/{}.ssh.json", self.base_url(), user)
    }
}

/// Per-user SSH document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SshInfo {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl SshInfo {
    /// Attach the caller's secret.
    pub fn into_parameters(self, secret: impl Into<String>) -> ConnectionParameters {
        ConnectionParameters::new(self.host, self.port, self.user, secret)
    }
}

/// Fetches world and user documents over HTTPS.
#[derive(Debug, Clone)]
pub struct Discovery {
    http: reqwest::Client,
    world_url: String,
}

impl Discovery {
    /// Create a discovery client for the world at `world_url`.
    pub fn new(world_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(world_url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Like [`Discovery::new`] with a custom per-request timeout.
    pub fn with_timeout(world_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let world_url = world_url.into();
        if world_url.trim().is_empty() {
            return Err(KataTunnelError::Config("world URL is not set".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KataTunnelError::Discovery(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { http, world_url })
    }

    /// World URL in use.
    pub fn world_url(&self) -> &str {
        &self.world_url
    }

    /// Download the world document.
    pub async fn world(&self) -> Result<World> {
        debug!("fetching world from {}", self.world_url);
        self.get_json(&self.world_url).await
    }

    /// Download the SSH document for `user` on `platform`.
    pub async fn ssh_info(&self, platform: &Platform, user: &str) -> Result<SshInfo> {
        let url = platform.ssh_json_url(user);
        debug!("fetching ssh info from {}", url);
        self.get_json(&url).await
    }

    /// Resolve connection parameters for `user` on the named platform.
    pub async fn discover(
        &self,
        platform: &str,
        user: &str,
        secret: &str,
    ) -> Result<ConnectionParameters> {
        let world = self.world().await?;
        let platform = world.platform(platform).map_err(|e| {
            error!("platform {:?} is not listed in the world", platform);
            e
        })?;
        let info = self.ssh_info(platform, user).await?;
        info!(
            "platform {} serves {} at {}:{}",
            platform.name, user, info.host, info.port
        );
        Ok(info.into_parameters(secret))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.http.get(url).send().await.map_err(|e| {
            error!("request to {} failed: {}", url, e);
            KataTunnelError::Discovery(format!("request to {} failed: {}", url, e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("{} answered {}: {}", url, status, body);
            return Err(KataTunnelError::Discovery(format!(
                "{} answered {}",
                url, status
            )));
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            error!("cannot parse response from {}: {}", url, body);
            KataTunnelError::Discovery(format!("invalid JSON from {}: {}", url, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const WORLD: &str = r#"{
        "platforms": [
            {"name": "aistudio", "oss": {"Bucket": "kata", "bucketEndpoint": "oss.example.com"}},
            {"name": "colab", "oss": {"bucket": "b", "bucketEndpoint": "e"},
             "http": {"getUrl": "http://colab.example.com/"}}
        ]
    }"#;

    #[test]
    fn test_parse_world() {
        let world: World = serde_json::from_str(WORLD).unwrap();
        assert_eq!(world.platforms.len(), 2);
        assert_eq!(world.platforms[0].oss.bucket, "kata");
        assert!(world.platform("colab").is_ok());
        assert!(matches!(
            world.platform("kaggle"),
            Err(KataTunnelError::PlatformNotFound(name)) if name == "kaggle"
        ));
    }

    #[test]
    fn test_ssh_json_url() {
        let world: World = serde_json::from_str(WORLD).unwrap();
        assert_eq!(
            world.platforms[0].ssh_json_url("alice"),
            "https://kata.oss.example.com/users/alice.ssh.json"
        );
        assert_eq!(
            world.platforms[1].ssh_json_url("bob"),
            "http://colab.example.com/users/bob.ssh.json"
        );
    }

    #[test]
    fn test_empty_world_url() {
        assert!(matches!(
            Discovery::new("  "),
            Err(KataTunnelError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_discover() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/world.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "platforms": [
                    {"name": "colab", "oss": {}, "http": {"getUrl": server.uri()}}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/alice.ssh.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "host": "10.0.0.8",
                "port": 2222,
                "user": "kata"
            })))
            .mount(&server)
            .await;

        let discovery = Discovery::new(format!("{}/world.json", server.uri())).unwrap();
        let params = discovery.discover("colab", "alice", "pw").await.unwrap();
        assert_eq!(params.host, "10.0.0.8");
        assert_eq!(params.port, 2222);
        assert_eq!(params.user, "kata");
        assert_eq!(params.secret, "pw");

        let missing = discovery.discover("kaggle", "alice", "pw").await;
        assert!(matches!(missing, Err(KataTunnelError::PlatformNotFound(_))));

        // Unmatched paths get a 404 from the mock server.
        let unknown_user = discovery.discover("colab", "mallory", "pw").await;
        assert!(matches!(unknown_user, Err(KataTunnelError::Discovery(_))));
    }

    #[tokio::test]
    async fn test_world_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/world.json"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let discovery = Discovery::new(format!("{}/world.json", server.uri())).unwrap();
        let result = discovery.world().await;
        assert!(matches!(result, Err(KataTunnelError::Discovery(_))));
    }
}

//! Cloudinary-compatible HTTP backend for both ends of a transfer.
//!
//! Listing uses the Admin API with basic auth; uploads use the signed
//! upload endpoint and let the provider fetch the content from the source
//! URL, so asset bytes never pass through this process.

use super::{DestinationStore, ListPage, SourceStore, UploadOptions, UploadReceipt};
use crate::config::NetworkConfig;
use crate::error::{RelayError, Result};
use crate::models::{AssetDescriptor, AssetKind};
use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Account credentials for one provider account.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CloudCredentials {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
}

impl CloudCredentials {
    pub fn new(
        cloud_name: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Self {
        Self {
            cloud_name: cloud_name.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Names of the missing parts, empty when complete.
    pub fn missing_parts(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.cloud_name.trim().is_empty() {
            missing.push("cloud_name");
        }
        if self.api_key.trim().is_empty() {
            missing.push("api_key");
        }
        if self.api_secret.trim().is_empty() {
            missing.push("api_secret");
        }
        missing
    }
}

// Keep secrets out of logs.
impl fmt::Debug for CloudCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudCredentials")
            .field("cloud_name", &self.cloud_name)
            .field("api_key", &self.api_key)
            .field("api_secret", &"***")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ResourceListResponse {
    #[serde(default)]
    resources: Vec<ResourceEntry>,
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResourceEntry {
    public_id: String,
    secure_url: String,
    #[serde(default)]
    folder: Option<String>,
    #[serde(default)]
    asset_folder: Option<String>,
    #[serde(default)]
    resource_type: Option<String>,
}

impl ResourceEntry {
    /// Entries without a resource type take the kind that was listed.
    fn into_descriptor(self, listed: AssetKind) -> AssetDescriptor {
        let folder = self.folder.or(self.asset_folder).unwrap_or_default();
        let kind = self
            .resource_type
            .as_deref()
            .map_or(listed, AssetKind::from_provider);
        AssetDescriptor {
            id: self.public_id,
            source_locator: self.secure_url,
            folder,
            kind,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    public_id: String,
    secure_url: String,
    #[serde(default)]
    existing: bool,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Client for one provider account.
pub struct CloudinaryStore {
    client: Client,
    credentials: CloudCredentials,
    api_base: String,
    list_kind: AssetKind,
}

impl CloudinaryStore {
    /// Create a client with the default request timeout.
    pub fn new(credentials: CloudCredentials) -> Result<Self> {
        Self::with_timeout(credentials, NetworkConfig::REQUEST_TIMEOUT)
    }

    /// Create a client with a custom request timeout.
    pub fn with_timeout(credentials: CloudCredentials, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| RelayError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                cause: None,
            })?;

        Ok(Self {
            client,
            credentials,
            api_base: NetworkConfig::CLOUDINARY_API_BASE.to_string(),
            list_kind: AssetKind::Image,
        })
    }

    /// Point the client at another API host (tests, proxies).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Resource kind enumerated by `list`.
    pub fn with_list_kind(mut self, kind: AssetKind) -> Self {
        self.list_kind = kind;
        self
    }

    pub fn cloud_name(&self) -> &str {
        &self.credentials.cloud_name
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/v1_1/{}/{}",
            self.api_base, self.credentials.cloud_name, path
        )
    }

    /// Map non-success statuses to relay errors.
    async fn check_response_status(&self, response: Response, what: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 420 {
            let retry_after_secs = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(RelayError::RateLimited {
                service: self.credentials.cloud_name.clone(),
                retry_after_secs,
            });
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorEnvelope>(&body)
            .map(|e| e.error.message)
            .unwrap_or(body);

        if status.is_server_error() {
            Err(RelayError::Network {
                message: format!("{} returned {}: {}", what, status, message),
                cause: None,
            })
        } else {
            Err(RelayError::Upload {
                id: what.to_string(),
                message: format!("{}: {}", status, message),
            })
        }
    }

    /// Parameters covered by the upload signature.
    fn signed_params(options: &UploadOptions, timestamp: i64) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("overwrite", options.overwrite.to_string()),
            ("public_id", options.id.clone()),
            ("timestamp", timestamp.to_string()),
            ("unique_filename", "false".to_string()),
            ("use_filename", "false".to_string()),
        ];
        if let Some(folder) = effective_folder(options) {
            params.push(("folder", folder.to_string()));
        }
        params.sort_by(|a, b| a.0.cmp(b.0));
        params
    }

    fn sign(&self, params: &[(&'static str, String)]) -> String {
        let payload = string_to_sign(params);
        let mut hasher = Sha256::new();
        hasher.update(payload.as_bytes());
        hasher.update(self.credentials.api_secret.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Folder sent with an upload; omitted when the id already carries it.
///
/// The provider prefixes the id with the folder, so sending both would
/// produce `folder/folder/name` and break id preservation.
pub fn effective_folder(options: &UploadOptions) -> Option<&str> {
    let folder = options.folder.trim_matches('/');
    if folder.is_empty() || options.id.starts_with(&format!("{}/", folder)) {
        None
    } else {
        Some(folder)
    }
}

/// `key=value` pairs joined by `&`, in the given (sorted) order.
pub fn string_to_sign(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

#[async_trait]
impl SourceStore for CloudinaryStore {
    async fn list(&self, cursor: Option<&str>, page_size: usize) -> Result<ListPage> {
        let url = self.endpoint(&format!("resources/{}/upload", self.list_kind));
        let mut query = vec![("max_results", page_size.to_string())];
        if let Some(cursor) = cursor {
            query.push(("next_cursor", cursor.to_string()));
        }

        debug!("Listing {} (cursor: {:?})", url, cursor);

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.credentials.api_key, Some(&self.credentials.api_secret))
            .query(&query)
            .send()
            .await?;
        let response = self.check_response_status(response, "resource listing").await?;

        let page: ResourceListResponse = response.json().await.map_err(|e| RelayError::Network {
            message: format!("Invalid listing response: {}", e),
            cause: None,
        })?;

        Ok(ListPage {
            assets: page
                .resources
                .into_iter()
                .map(|entry| entry.into_descriptor(self.list_kind))
                .collect(),
            next_cursor: page.next_cursor.filter(|c| !c.is_empty()),
        })
    }
}

#[async_trait]
impl DestinationStore for CloudinaryStore {
    async fn upload(
        &self,
        content_locator: &str,
        options: &UploadOptions,
    ) -> Result<UploadReceipt> {
        let url = self.endpoint(&format!("{}/upload", options.kind));
        let timestamp = chrono::Utc::now().timestamp();
        let params = Self::signed_params(options, timestamp);
        let signature = self.sign(&params);

        let mut form: Vec<(&str, String)> = params;
        form.push(("file", content_locator.to_string()));
        form.push(("api_key", self.credentials.api_key.clone()));
        form.push(("signature", signature));
        form.push(("signature_algorithm", "sha256".to_string()));

        let response = self.client.post(&url).form(&form).send().await?;
        let response = self.check_response_status(response, &options.id).await?;

        let uploaded: UploadResponse = response.json().await.map_err(|e| RelayError::Upload {
            id: options.id.clone(),
            message: format!("Invalid upload response: {}", e),
        })?;

        // With overwrite disabled the provider answers 200 and flags the
        // existing asset instead of failing.
        if uploaded.existing && !options.overwrite {
            return Err(RelayError::AssetExists {
                id: uploaded.public_id,
            });
        }

        Ok(UploadReceipt {
            id: uploaded.public_id,
            locator: uploaded.secure_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn creds() -> CloudCredentials {
        CloudCredentials::new("demo", "key", "secret")
    }

    fn options(id: &str, folder: &str) -> UploadOptions {
        UploadOptions {
            id: id.to_string(),
            folder: folder.to_string(),
            kind: AssetKind::Image,
            overwrite: false,
        }
    }

    #[test]
    fn test_missing_parts() {
        assert!(creds().missing_parts().is_empty());
        let partial = CloudCredentials::new("demo", "", " ");
        assert_eq!(partial.missing_parts(), vec!["api_key", "api_secret"]);
    }

    #[test]
    fn test_debug_hides_secret() {
        let rendered = format!("{:?}", creds());
        assert!(!rendered.contains("secret\""));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn test_effective_folder_avoids_duplication() {
        assert_eq!(effective_folder(&options("jmn/abc", "jmn")), None);
        assert_eq!(effective_folder(&options("abc", "jmn")), Some("jmn"));
        assert_eq!(effective_folder(&options("abc", "")), None);
    }

    #[test]
    fn test_string_to_sign_is_sorted() {
        let params = CloudinaryStore::signed_params(&options("abc", "jmn"), 1_700_000_000);
        assert_eq!(
            string_to_sign(&params),
            "folder=jmn&overwrite=false&public_id=abc&timestamp=1700000000&unique_filename=false&use_filename=false"
        );
    }

    #[tokio::test]
    async fn test_list_parses_page_and_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1_1/demo/resources/image/upload"))
            .and(query_param("max_results", "500"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resources": [
                    {"public_id": "jmn/abc", "secure_url": "https://old/jmn/abc.jpg", "folder": "jmn", "resource_type": "image"},
                    {"public_id": "clip", "secure_url": "https://old/clip.mp4", "resource_type": "video"}
                ],
                "next_cursor": "c2"
            })))
            .mount(&server)
            .await;

        let store = CloudinaryStore::new(creds()).unwrap().with_api_base(server.uri());
        let page = store.list(None, 500).await.unwrap();

        assert_eq!(page.assets.len(), 2);
        assert_eq!(page.assets[0].id, "jmn/abc");
        assert_eq!(page.assets[0].folder, "jmn");
        assert_eq!(page.assets[1].kind, AssetKind::Video);
        assert_eq!(page.next_cursor.as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn test_list_kind_selects_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1_1/demo/resources/video/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resources": [
                    {"public_id": "clips/intro", "secure_url": "https://old/clips/intro.mp4"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = CloudinaryStore::new(creds())
            .unwrap()
            .with_api_base(server.uri())
            .with_list_kind(AssetKind::Video);
        let page = store.list(None, 10).await.unwrap();

        assert_eq!(page.assets.len(), 1);
        assert_eq!(page.assets[0].kind, AssetKind::Video);
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_list_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(420).insert_header("Retry-After", "30"))
            .mount(&server)
            .await;

        let store = CloudinaryStore::new(creds()).unwrap().with_api_base(server.uri());
        let err = store.list(None, 10).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::RateLimited {
                retry_after_secs: Some(30),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_upload_returns_locator() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1_1/demo/image/upload"))
            .and(body_string_contains("signature_algorithm=sha256"))
            .and(body_string_contains("public_id=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "public_id": "abc",
                "secure_url": "https://new/abc.jpg"
            })))
            .mount(&server)
            .await;

        let store = CloudinaryStore::new(creds()).unwrap().with_api_base(server.uri());
        let receipt = store
            .upload("https://old/abc.jpg", &options("abc", ""))
            .await
            .unwrap();
        assert_eq!(receipt.id, "abc");
        assert_eq!(receipt.locator, "https://new/abc.jpg");
    }

    #[tokio::test]
    async fn test_upload_existing_is_collision() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "public_id": "abc",
                "secure_url": "https://new/abc.jpg",
                "existing": true
            })))
            .mount(&server)
            .await;

        let store = CloudinaryStore::new(creds()).unwrap().with_api_base(server.uri());
        let err = store
            .upload("https://old/abc.jpg", &options("abc", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::AssetExists { .. }));
    }

    #[tokio::test]
    async fn test_upload_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_json(json!({
                "error": {"message": "bad gateway"}
            })))
            .mount(&server)
            .await;

        let store = CloudinaryStore::new(creds()).unwrap().with_api_base(server.uri());
        let err = store
            .upload("https://old/abc.jpg", &options("abc", ""))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("bad gateway"));
    }
}

//! Google Drive v3 client.
//!
//! Implements `RemoteProvider` over the Drive REST API with a bearer token.
//! Tags and metadata travel in the file's `appProperties`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use sync_core::Content;
use sync_core::remote::{
    ChangePage, FOLDER_MIME, MetadataUpdate, Properties, Query, RemoteChange, RemoteEntry,
    RemoteError, RemoteProvider, Result,
};
use sync_core::shadow::mime_for_name;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/drive/v3";
pub const DEFAULT_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const FILE_FIELDS: &str =
    "id,name,mimeType,parents,modifiedTime,trashed,appProperties,capabilities/canAddChildren";
const LIST_FIELDS: &str = "nextPageToken,files(id,name,mimeType,parents,modifiedTime,trashed,appProperties,capabilities/canAddChildren)";
const CHANGE_FIELDS: &str = "nextPageToken,newStartPageToken,changes(fileId,removed,file(id,name,mimeType,parents,modifiedTime,trashed,appProperties,capabilities/canAddChildren))";

#[derive(Debug, Clone)]
pub struct DriveConfig {
    pub access_token: String,
    pub api_base: String,
    pub upload_base: String,
    pub timeout: Duration,
}

impl DriveConfig {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            upload_base: DEFAULT_UPLOAD_BASE.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

pub struct DriveClient {
    http: Client,
    api_base: String,
    upload_base: String,
    timeout: Duration,
    access_token: RwLock<String>,
}

// --- Wire types ---

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Capabilities {
    #[serde(default)]
    can_add_children: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileResource {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    parents: Vec<String>,
    modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    trashed: bool,
    #[serde(default)]
    app_properties: Properties,
    #[serde(default)]
    capabilities: Capabilities,
}

impl From<FileResource> for RemoteEntry {
    fn from(file: FileResource) -> Self {
        RemoteEntry {
            id: file.id,
            name: file.name,
            mime_type: file.mime_type,
            parent_ids: file.parents,
            modified_time: file.modified_time,
            properties: file.app_properties,
            trashed: file.trashed,
            can_add_children: file.capabilities.can_add_children,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<FileResource>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeResource {
    file_id: Option<String>,
    #[serde(default)]
    removed: bool,
    file: Option<FileResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeList {
    #[serde(default)]
    changes: Vec<ChangeResource>,
    next_page_token: Option<String>,
    new_start_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPageToken {
    start_page_token: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: ErrorDetail,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorReason>,
}

#[derive(Debug, Deserialize)]
struct ErrorReason {
    #[serde(default)]
    reason: String,
}

/// Quote a value for a Drive search query.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn search_query(query: &Query) -> String {
    match query {
        Query::Children { parent_id } => {
            format!("{} in parents and trashed = false", quote(parent_id))
        }
        Query::FolderNamed { name, parent_id } => {
            let mut q = format!(
                "mimeType = {} and name = {} and trashed = false",
                quote(FOLDER_MIME),
                quote(name)
            );
            if let Some(parent) = parent_id {
                q.push_str(&format!(" and {} in parents", quote(parent)));
            }
            q
        }
    }
}

/// Map a non-success response to the error kind the engine acts on.
async fn status_error(response: Response) -> RemoteError {
    let status = response.status();
    let body: ErrorBody = response.json().await.unwrap_or_default();
    let message = if body.error.message.is_empty() {
        status.canonical_reason().unwrap_or("unknown error").to_string()
    } else {
        body.error.message
    };
    let rate_limited = body
        .error
        .errors
        .iter()
        .any(|e| e.reason.ends_with("ateLimitExceeded"));

    match status {
        StatusCode::UNAUTHORIZED => RemoteError::Unauthorized(message),
        StatusCode::FORBIDDEN if !rate_limited => RemoteError::PermissionDenied(message),
        StatusCode::NOT_FOUND => RemoteError::NotFound(message),
        _ => RemoteError::Server {
            status: status.as_u16(),
            message,
        },
    }
}

fn mime_for_content(content: &Content) -> &'static str {
    match content {
        Content::Text(_) => "text/plain; charset=UTF-8",
        Content::Binary(_) => "application/octet-stream",
    }
}

impl DriveClient {
    pub fn new(config: DriveConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RemoteError::Other(format!("building HTTP client: {e}")))?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            upload_base: config.upload_base.trim_end_matches('/').to_string(),
            timeout: config.timeout,
            access_token: RwLock::new(config.access_token),
        })
    }

    /// Swap in a refreshed access token.
    pub async fn set_access_token(&self, token: impl Into<String>) {
        *self.access_token.write().await = token.into();
    }

    fn transport_error(&self, e: reqwest::Error) -> RemoteError {
        if e.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else {
            RemoteError::Network(e.to_string())
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let token = self.access_token.read().await.clone();
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if response.status().is_success() {
            return Ok(response);
        }
        let error = status_error(response).await;
        debug!("Drive request failed: {}", error);
        Err(error)
    }

    async fn body(&self, response: Response) -> Result<Vec<u8>> {
        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(e))?;
        Ok(bytes.to_vec())
    }

    async fn json<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        let bytes = self.body(response).await?;
        serde_json::from_slice(&bytes).map_err(|e| RemoteError::Malformed(e.to_string()))
    }

    fn files_url(&self) -> String {
        format!("{}/files", self.api_base)
    }

    fn file_url(&self, id: &str) -> String {
        format!("{}/files/{}", self.api_base, id)
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>> {
        let request = self.http.get(self.file_url(id)).query(&[("alt", "media")]);
        let response = self.send(request).await?;
        self.body(response).await
    }
}

#[async_trait]
impl RemoteProvider for DriveClient {
    async fn list_files(&self, query: &Query) -> Result<Vec<RemoteEntry>> {
        let q = search_query(query);
        debug!("Listing files: {}", q);

        let mut entries = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![("q", q.as_str()), ("fields", LIST_FIELDS), ("pageSize", "1000")];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.as_str()));
            }
            let response = self.send(self.http.get(self.files_url()).query(&params)).await?;
            let page: FileList = self.json(response).await?;
            entries.extend(page.files.into_iter().map(RemoteEntry::from));

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(entries)
    }

    async fn start_page_token(&self) -> Result<String> {
        let url = format!("{}/changes/startPageToken", self.api_base);
        let response = self.send(self.http.get(url)).await?;
        let token: StartPageToken = self.json(response).await?;
        Ok(token.start_page_token)
    }

    async fn list_changes(&self, page_token: &str) -> Result<ChangePage> {
        let url = format!("{}/changes", self.api_base);
        let params = [
            ("pageToken", page_token),
            ("fields", CHANGE_FIELDS),
            ("pageSize", "1000"),
        ];
        let response = self.send(self.http.get(url).query(&params)).await?;
        let list: ChangeList = self.json(response).await?;

        let changes = list
            .changes
            .into_iter()
            .filter_map(|change| match (change.removed, change.file, change.file_id) {
                (false, Some(file), _) => Some(RemoteChange::Changed(file.into())),
                (_, _, Some(id)) => Some(RemoteChange::Removed { id }),
                (_, Some(file), None) => Some(RemoteChange::Removed { id: file.id }),
                (_, None, None) => {
                    warn!("Ignoring change without a file id");
                    None
                }
            })
            .collect();

        Ok(ChangePage {
            changes,
            next_page_token: list.next_page_token,
            new_start_page_token: list.new_start_page_token,
        })
    }

    async fn download_text(&self, id: &str) -> Result<String> {
        let bytes = self.download(id).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn download_binary(&self, id: &str) -> Result<Vec<u8>> {
        self.download(id).await
    }

    async fn get_metadata(&self, id: &str) -> Result<RemoteEntry> {
        let request = self.http.get(self.file_url(id)).query(&[("fields", FILE_FIELDS)]);
        let response = self.send(request).await?;
        let file: FileResource = self.json(response).await?;
        Ok(file.into())
    }

    async fn update_metadata(&self, id: &str, update: &MetadataUpdate) -> Result<()> {
        let mut params = vec![("fields", "id".to_string())];
        if !update.add_parents.is_empty() {
            params.push(("addParents", update.add_parents.join(",")));
        }
        if !update.remove_parents.is_empty() {
            params.push(("removeParents", update.remove_parents.join(",")));
        }

        let mut body = serde_json::Map::new();
        if let Some(name) = &update.name {
            body.insert("name".into(), json!(name));
        }
        if let Some(properties) = &update.properties {
            body.insert("appProperties".into(), json!(properties));
        }

        let request = self.http.patch(self.file_url(id)).query(&params).json(&body);
        self.send(request).await?;
        Ok(())
    }

    async fn update_content(&self, id: &str, content: &Content) -> Result<()> {
        let url = format!("{}/files/{}", self.upload_base, id);
        let request = self
            .http
            .patch(url)
            .query(&[("uploadType", "media"), ("fields", "id")])
            .header(reqwest::header::CONTENT_TYPE, mime_for_content(content))
            .body(content.as_bytes().to_vec());
        self.send(request).await?;
        Ok(())
    }

    async fn create_file(
        &self,
        name: &str,
        parent_id: &str,
        content: &Content,
        properties: &Properties,
    ) -> Result<RemoteEntry> {
        let mime = mime_for_name(name);
        let mut metadata = json!({
            "name": name,
            "mimeType": mime,
            "parents": [parent_id],
        });
        if !properties.is_empty() {
            metadata["appProperties"] = json!(properties);
        }

        let boundary = format!("sync-{}", uuid::Uuid::new_v4().simple());
        let mut body = Vec::with_capacity(content.len() + 512);
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n--{boundary}\r\nContent-Type: {mime}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(content.as_bytes());
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        let request = self
            .http
            .post(format!("{}/files", self.upload_base))
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body);
        let response = self.send(request).await?;
        let file: FileResource = self.json(response).await?;
        debug!("Created {} ({}) under {}", name, file.id, parent_id);
        Ok(file.into())
    }

    async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<RemoteEntry> {
        let parents: Vec<&str> = parent_id.into_iter().collect();
        let body = json!({
            "name": name,
            "mimeType": FOLDER_MIME,
            "parents": parents,
        });
        let request = self
            .http
            .post(self.files_url())
            .query(&[("fields", FILE_FIELDS)])
            .json(&body);
        let response = self.send(request).await?;
        let file: FileResource = self.json(response).await?;
        Ok(file.into())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.send(self.http.delete(self.file_url(id))).await?;
        Ok(())
    }
}

//! Backend surface consumed by the synchronization core.
//!
//! [`Backend`] is the seam the session resolver, view selector, synchronizer and
//! mutation gateway talk through. [`HttpBackend`] speaks the platform's REST API
//! with `reqwest` and its push channel with `tokio-tungstenite`.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode, multipart};
use serde::Deserialize;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{
  Category, ProcessingStatus, Role, StatusEvent, UploadFile, UploadMetadata, UserId, UserRecord, VideoRecord,
};

/// Stream of push-channel status events. Ends when the connection drops.
pub type StatusStream = BoxStream<'static, StatusEvent>;

/// Public feed filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedQuery {
  pub text: Option<String>,
  pub category: Category,
  pub skip: usize,
  pub limit: usize,
}

impl Default for FeedQuery {
  fn default() -> Self {
    Self { text: None, category: Category::all(), skip: 0, limit: crate::constants::constants().feed_page_size }
  }
}

#[async_trait]
pub trait Backend: Send + Sync {
  /// Exchange email/password for a bearer token.
  async fn authenticate(&self, email: &str, password: &str) -> Result<String>;
  async fn register(&self, email: &str, password: &str) -> Result<()>;

  /// Every video on the platform. Admin only; the privilege probe.
  async fn fetch_private_library(&self, token: &str) -> Result<Vec<VideoRecord>>;
  /// The caller's own videos.
  async fn fetch_own_library(&self, token: &str) -> Result<Vec<VideoRecord>>;
  /// Shared videos. Works without a credential.
  async fn fetch_public_feed(&self, query: &FeedQuery) -> Result<Vec<VideoRecord>>;
  async fn fetch_job_status(&self, id: &str) -> Result<VideoRecord>;
  async fn fetch_admin_user_list(&self, token: &str) -> Result<Vec<UserRecord>>;

  async fn create_video(&self, token: &str, metadata: &UploadMetadata, file: &UploadFile) -> Result<VideoRecord>;
  async fn delete_video(&self, token: &str, id: &str) -> Result<()>;
  async fn set_user_role(&self, token: &str, id: UserId, role: Role) -> Result<()>;
  async fn delete_user(&self, token: &str, id: UserId) -> Result<()>;

  /// Open the push channel for a subject. Delivery is best-effort.
  async fn subscribe_status_events(&self, subject: &str) -> Result<StatusStream>;
}

#[derive(Deserialize)]
struct TokenResponse {
  access_token: String,
}

/// Pull a human-readable message out of an error body.
/// FastAPI sends `{"detail": "..."}` or, for validation errors, `{"detail": [{"msg": ...}]}`.
fn error_detail(body: &str) -> String {
  let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
    return body.trim().to_string();
  };
  match value.get("detail") {
    Some(serde_json::Value::String(s)) => s.clone(),
    Some(serde_json::Value::Array(items)) => items
      .iter()
      .filter_map(|item| item.get("msg").and_then(|m| m.as_str()))
      .collect::<Vec<_>>()
      .join("; "),
    Some(other) => other.to_string(),
    None => body.trim().to_string(),
  }
}

/// Map a non-success status plus body onto the error taxonomy.
/// `forbidden` decides what a 403 means for this call site.
fn classify(status: StatusCode, body: &str, forbidden: fn(String) -> Error) -> Error {
  let detail = error_detail(body);
  match status {
    StatusCode::UNAUTHORIZED => Error::Unauthenticated,
    StatusCode::FORBIDDEN => forbidden(detail),
    StatusCode::NOT_FOUND => Error::NotFound(detail),
    StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE if detail.to_lowercase().contains("quota") => {
      Error::Quota(detail)
    }
    StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::PAYLOAD_TOO_LARGE => {
      Error::Validation(detail)
    }
    s => Error::Server(format!("{}: {}", s, detail)),
  }
}

async fn expect_success(response: Response, forbidden: fn(String) -> Error) -> Result<Response> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }
  let body = response.text().await.unwrap_or_default();
  Err(classify(status, &body, forbidden))
}

/// Decode one push-channel frame. Frames for unknown statuses are dropped.
pub fn parse_status_event(text: &str) -> Option<StatusEvent> {
  let value = serde_json::from_str::<serde_json::Value>(text).ok()?;
  let video_id = value.get("video_id")?.as_str()?.to_string();
  let status = ProcessingStatus::parse(value.get("status")?.as_str()?)?;
  Some(StatusEvent { video_id, status })
}

pub struct HttpBackend {
  client: Client,
  api_url: String,
  push_url: String,
}

impl HttpBackend {
  pub fn new(config: &Config) -> Result<Self> {
    let client = Client::builder()
      .timeout(Duration::from_secs(config.request_timeout_secs()))
      .build()
      .map_err(|e| Error::Transport(format!("failed to build HTTP client: {}", e)))?;
    Ok(Self { client, api_url: config.api_url().trim_end_matches('/').to_string(), push_url: config.push_url() })
  }

  fn url(&self, path: &str) -> String {
    format!("{}{}", self.api_url, path)
  }

  fn authed(&self, builder: RequestBuilder, token: &str) -> RequestBuilder {
    builder.bearer_auth(token)
  }

  async fn get_list<T: for<'de> Deserialize<'de>>(&self, path: &str, token: &str) -> Result<Vec<T>> {
    let response = self.authed(self.client.get(self.url(path)), token).send().await?;
    let response = expect_success(response, Error::Authorization).await?;
    Ok(response.json().await?)
  }
}

#[async_trait]
impl Backend for HttpBackend {
  async fn authenticate(&self, email: &str, password: &str) -> Result<String> {
    let response =
      self.client.post(self.url("/users/token")).form(&[("username", email), ("password", password)]).send().await?;
    let status = response.status();
    if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
      let body = response.text().await.unwrap_or_default();
      return Err(Error::Authorization(error_detail(&body)));
    }
    let token: TokenResponse = expect_success(response, Error::Authorization).await?.json().await?;
    info!("backend: authenticated");
    Ok(token.access_token)
  }

  async fn register(&self, email: &str, password: &str) -> Result<()> {
    let body = serde_json::json!({ "email": email, "password": password });
    let response = self.client.post(self.url("/users/register")).json(&body).send().await?;
    expect_success(response, Error::Authorization).await?;
    Ok(())
  }

  async fn fetch_private_library(&self, token: &str) -> Result<Vec<VideoRecord>> {
    self.get_list("/videos/admin/all", token).await
  }

  async fn fetch_own_library(&self, token: &str) -> Result<Vec<VideoRecord>> {
    self.get_list("/videos/my-videos", token).await
  }

  async fn fetch_public_feed(&self, query: &FeedQuery) -> Result<Vec<VideoRecord>> {
    let mut params: Vec<(&str, String)> = vec![("skip", query.skip.to_string()), ("limit", query.limit.to_string())];
    if let Some(text) = query.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
      params.push(("q", text.to_string()));
    }
    if !query.category.is_all() {
      params.push(("category", query.category.as_str().to_string()));
    }
    let response = self.client.get(self.url("/videos/feed")).query(&params).send().await?;
    let response = expect_success(response, Error::Authorization).await?;
    Ok(response.json().await?)
  }

  async fn fetch_job_status(&self, id: &str) -> Result<VideoRecord> {
    let response = self.client.get(self.url(&format!("/videos/status/{}", id))).send().await?;
    let response = expect_success(response, Error::Authorization).await?;
    Ok(response.json().await?)
  }

  async fn fetch_admin_user_list(&self, token: &str) -> Result<Vec<UserRecord>> {
    self.get_list("/users/admin/users", token).await
  }

  async fn create_video(&self, token: &str, metadata: &UploadMetadata, file: &UploadFile) -> Result<VideoRecord> {
    let mut form = multipart::Form::new()
      .part("file", multipart::Part::bytes(file.bytes.clone()).file_name(file.file_name.clone()))
      .text("title", metadata.title.clone())
      .text("category", metadata.category.as_str().to_string())
      .text("is_shared", metadata.shared.to_string())
      .text("resolution", metadata.resolution.clone());
    if let Some(description) = metadata.description.as_ref().filter(|d| !d.trim().is_empty()) {
      form = form.text("description", description.clone());
    }

    info!(file = %file.file_name, size = file.bytes.len(), "backend: uploading video");
    let response = self.authed(self.client.post(self.url("/videos/upload")), token).multipart(form).send().await?;
    let response = expect_success(response, Error::Permission).await?;
    Ok(response.json().await?)
  }

  async fn delete_video(&self, token: &str, id: &str) -> Result<()> {
    let response = self.authed(self.client.delete(self.url(&format!("/videos/{}", id))), token).send().await?;
    expect_success(response, Error::Permission).await?;
    Ok(())
  }

  async fn set_user_role(&self, token: &str, id: UserId, role: Role) -> Result<()> {
    let action = match role {
      Role::Admin => "make-admin",
      Role::Banned => "ban",
      Role::User => return Err(Error::Validation("demoting users is not supported by the backend".to_string())),
    };
    let url = self.url(&format!("/users/admin/users/{}/{}", id, action));
    let response = self.authed(self.client.patch(url), token).send().await?;
    expect_success(response, Error::Authorization).await?;
    Ok(())
  }

  async fn delete_user(&self, token: &str, id: UserId) -> Result<()> {
    let url = self.url(&format!("/users/admin/users/{}", id));
    let response = self.authed(self.client.delete(url), token).send().await?;
    expect_success(response, Error::Authorization).await?;
    Ok(())
  }

  async fn subscribe_status_events(&self, subject: &str) -> Result<StatusStream> {
    let url = format!("{}/{}", self.push_url.trim_end_matches('/'), subject);
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.map_err(|e| Error::Transport(e.to_string()))?;
    info!(url = %url, "push: connected");

    let events = ws
      .take_while(|msg| {
        if let Err(e) = msg {
          warn!(err = %e, "push: connection lost");
        }
        futures::future::ready(msg.is_ok())
      })
      .filter_map(|msg| async move {
        match msg {
          Ok(Message::Text(text)) => {
            let event = parse_status_event(text.as_str());
            if event.is_none() {
              debug!(frame = %text.as_str(), "push: ignoring unrecognised frame");
            }
            event
          }
          _ => None,
        }
      });
    Ok(events.boxed())
  }
}

//! HTTP implementation of [`SessionApi`] against the session REST service.

use std::collections::HashSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rave_manager::api::fallback_name;
use rave_manager::{
    Account, ApiError, FailureKind, MediaFile, SessionApi, SessionInfo, SessionMode,
    SessionSummary, UserProfile, concise,
};
use rave_protocol::{MediaAttachment, UserId};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::ApiConfig;

/// `{"data": ...}` wrapper used by every endpoint.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    data: T,
}

#[derive(Debug, Default, Deserialize)]
struct MeshEntry {
    #[serde(default)]
    mesh: Value,
    #[serde(default)]
    users: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct MeshDetails {
    #[serde(default)]
    server: Option<String>,
    #[serde(default)]
    users: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSlot {
    index: usize,
    mime: String,
    posting_url: String,
    upload_url: String,
}

/// Which flag set to send to `/meshes/self`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Listing {
    Public,
    Friends,
    Invited,
}

impl Listing {
    fn query(self, device_id: &str, limit: usize, lang: &str) -> Vec<(&'static str, String)> {
        let flag = |on: bool| on.to_string();
        vec![
            ("deviceId", device_id.to_string()),
            ("public", flag(self == Listing::Public)),
            ("friends", flag(self == Listing::Friends)),
            ("local", flag(false)),
            ("invited", flag(self == Listing::Invited)),
            ("limit", limit.to_string()),
            ("lang", lang.to_string()),
        ]
    }
}

pub struct RestApi {
    client: reqwest::Client,
    base_url: String,
    device_id: String,
    auth_token: String,
}

impl RestApi {
    pub fn new(config: &ApiConfig, account: &Account) -> Result<Self> {
        let client = reqwest::Client::builder()
            .default_headers(client_headers(config)?)
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            device_id: account.device_id.clone(),
            auth_token: account.auth_token.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.auth_token)
            .header("Request-Ts", chrono::Utc::now().timestamp_millis().to_string())
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: concise(&body),
            });
        }
        Ok(response)
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let response = self.send(request).await?;
        let bytes = response.bytes().await.map_err(transport_error)?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn list(
        &self,
        listing: Listing,
        limit: usize,
        lang: &str,
    ) -> Result<Vec<SessionSummary>, ApiError> {
        let request = self
            .request(Method::GET, "/meshes/self")
            .query(&listing.query(&self.device_id, limit, lang));
        let envelope: Envelope<Vec<MeshEntry>> = self.fetch(request).await?;
        Ok(envelope.data.into_iter().filter_map(summary_from_entry).collect())
    }

    async fn put_upload(&self, slot: &UploadSlot, bytes: Vec<u8>) -> Result<(), ApiError> {
        // Upload URLs are pre-signed; no API headers.
        let response = reqwest::Client::new()
            .put(&slot.upload_url)
            .header(CONTENT_TYPE, &slot.mime)
            .body(bytes)
            .send()
            .await
            .map_err(transport_error)?;
        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            status => Err(ApiError::Status {
                status: status.as_u16(),
                body: concise(&response.text().await.unwrap_or_default()),
            }),
        }
    }
}

fn client_headers(config: &ApiConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in [
        ("client-version", &config.client_version),
        ("wemesh-api-version", &config.api_version),
        ("wemesh-platform", &config.platform),
        ("ssaid", &config.ssaid),
    ] {
        let value = HeaderValue::from_str(value)
            .with_context(|| format!("Invalid value for header {name}: {value:?}"))?;
        headers.insert(HeaderName::from_static(name), value);
    }
    Ok(headers)
}

/// Classify a reqwest failure the same way socket faults are classified.
pub fn transport_error(err: reqwest::Error) -> ApiError {
    if err.is_decode() {
        return ApiError::Decode(err.to_string());
    }
    let message = error_chain(&err);
    let kind = if err.is_timeout() {
        FailureKind::Timeout
    } else if let Some(io) = find_io_error(&err) {
        FailureKind::from_io(io)
    } else {
        FailureKind::from_io(&std::io::Error::other(message.clone()))
    };
    ApiError::Transport {
        kind,
        message: concise(&message),
    }
}

fn find_io_error<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a std::io::Error> {
    let mut current = err.source();
    while let Some(source) = current {
        if let Some(io) = source.downcast_ref::<std::io::Error>() {
            return Some(io);
        }
        current = source.source();
    }
    None
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut current = err.source();
    while let Some(source) = current {
        parts.push(source.to_string());
        current = source.source();
    }
    parts.join(": ")
}

/// Ids come as strings or numbers depending on the endpoint.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A member entry is either a user record with `id` or a bare id.
fn user_id_of(value: &Value) -> Option<UserId> {
    let raw = match value {
        Value::Object(map) => map.get("id")?,
        other => other,
    };
    match raw {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn user_ids(values: &[Value]) -> Vec<UserId> {
    values.iter().filter_map(user_id_of).collect()
}

fn summary_from_entry(entry: MeshEntry) -> Option<SessionSummary> {
    let session_id = id_string(entry.mesh.get("id")?)?;
    Some(SessionSummary {
        session_id,
        members: user_ids(&entry.users),
        metadata: entry.mesh,
    })
}

fn profile_from_record(record: Value) -> Option<UserProfile> {
    let id = user_id_of(&record)?;
    let name = ["displayName", "name", "handle"]
        .iter()
        .filter_map(|key| record.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| fallback_name(id));
    Some(UserProfile {
        id,
        display_name: name,
        raw: record,
    })
}

/// Keep first occurrences by session id, then cut to `limit`.
fn merge_listings(listings: Vec<Vec<SessionSummary>>, limit: usize) -> Vec<SessionSummary> {
    let mut seen = HashSet::new();
    listings
        .into_iter()
        .flatten()
        .filter(|s| seen.insert(s.session_id.clone()))
        .take(limit)
        .collect()
}

#[async_trait]
impl SessionApi for RestApi {
    async fn list_sessions(
        &self,
        mode: SessionMode,
        limit: usize,
        lang: &str,
    ) -> Result<Vec<SessionSummary>, ApiError> {
        match mode {
            SessionMode::Invited => self.list(Listing::Invited, limit, lang).await,
            SessionMode::All => {
                let mut listings = Vec::new();
                let mut last_error = None;
                for listing in [Listing::Public, Listing::Friends, Listing::Invited] {
                    match self.list(listing, limit, lang).await {
                        Ok(sessions) => listings.push(sessions),
                        Err(e) => {
                            warn!(?listing, error = %e, "session listing failed, skipping");
                            last_error = Some(e);
                        }
                    }
                }
                match (listings.is_empty(), last_error) {
                    (true, Some(e)) => Err(e),
                    _ => Ok(merge_listings(listings, limit)),
                }
            }
        }
    }

    async fn get_session(&self, session_id: &str) -> Result<SessionInfo, ApiError> {
        let request = self.request(Method::GET, &format!("/meshes/{session_id}"));
        let envelope: Envelope<MeshDetails> = self.fetch(request).await?;
        let details = envelope.data;
        Ok(SessionInfo {
            endpoint: details.server.filter(|s| !s.trim().is_empty()),
            members: user_ids(&details.users),
        })
    }

    async fn resolve_users(&self, ids: &[UserId]) -> Result<Vec<UserProfile>, ApiError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({
            "deviceId": self.device_id,
            "ids": ids,
            "includeOnline": true,
        });
        let request = self.request(Method::POST, "/users/list").json(&body);
        let envelope: Envelope<Vec<Value>> = self.fetch(request).await?;
        Ok(envelope
            .data
            .into_iter()
            .filter_map(profile_from_record)
            .collect())
    }

    async fn leave_session(&self, session_id: &str, device_id: &str) -> Result<bool, ApiError> {
        let path = format!("/meshes/{session_id}/devices/{device_id}/leave");
        match self.send(self.request(Method::DELETE, &path)).await {
            Ok(_) => Ok(true),
            Err(ApiError::Status { status, .. }) => {
                warn!(session = %session_id, status, "leave refused");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn upload_media(
        &self,
        session_id: &str,
        files: Vec<MediaFile>,
    ) -> Result<Vec<MediaAttachment>, ApiError> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let items: Vec<Value> = files
            .iter()
            .enumerate()
            .map(|(index, file)| {
                json!({
                    "index": index,
                    "isExplicit": file.is_explicit,
                    "mime": mime_for(&file.file_name),
                })
            })
            .collect();
        let request = self
            .request(Method::POST, &format!("/meshes/{session_id}/images/upload"))
            .json(&json!({ "media": items }));
        let envelope: Envelope<Vec<UploadSlot>> = self.fetch(request).await?;

        let mut files: Vec<Option<MediaFile>> = files.into_iter().map(Some).collect();
        let mut attachments = Vec::with_capacity(envelope.data.len());
        for slot in envelope.data {
            let file = files
                .get_mut(slot.index)
                .and_then(Option::take)
                .ok_or_else(|| ApiError::Decode(format!("upload slot for unknown index {}", slot.index)))?;
            debug!(session = %session_id, index = slot.index, mime = %slot.mime, "uploading media");
            self.put_upload(&slot, file.bytes).await?;
            attachments.push(MediaAttachment {
                url: slot.posting_url,
                mime: slot.mime,
                is_explicit: file.is_explicit,
                aspect_ratio: String::new(),
                thumbnail_url: String::new(),
            });
        }
        Ok(attachments)
    }
}

pub fn mime_for(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiFileConfig;
    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap as AxumHeaders, StatusCode as AxumStatus};
    use axum::routing::{delete, get, post, put};
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Seen {
        headers: Vec<AxumHeaders>,
        queries: Vec<HashMap<String, String>>,
        bodies: Vec<Value>,
        uploads: Vec<(String, Option<String>, Vec<u8>)>,
    }

    type Shared = Arc<Mutex<Seen>>;

    fn mesh(id: &str, users: Value) -> Value {
        json!({"mesh": {"id": id, "isPublic": false}, "users": users})
    }

    async fn meshes_self(
        State((seen, _)): State<(Shared, String)>,
        headers: AxumHeaders,
        Query(query): Query<HashMap<String, String>>,
    ) -> (AxumStatus, Json<Value>) {
        let mut guard = seen.lock().unwrap();
        guard.headers.push(headers);
        guard.queries.push(query.clone());
        let flag = |k: &str| query.get(k).map(String::as_str) == Some("true");
        if flag("friends") {
            return (AxumStatus::INTERNAL_SERVER_ERROR, Json(json!({"error": "down"})));
        }
        let data = if flag("public") {
            json!([mesh("pub-1", json!([{"id": 1}])), mesh("shared", json!([]))])
        } else {
            json!([
                mesh("shared", json!([])),
                mesh("inv-1", json!([{"id": "2"}, 3, {"name": "no id"}])),
                {"mesh": {}, "users": []},
            ])
        };
        (AxumStatus::OK, Json(json!({"data": data, "paging": {}})))
    }

    async fn mesh_details(Path(id): Path<String>) -> (AxumStatus, Json<Value>) {
        match id.as_str() {
            "room" => (
                AxumStatus::OK,
                Json(json!({"data": {"server": "wss-1.example", "users": [{"id": 10}, "11"]}})),
            ),
            "empty" => (AxumStatus::OK, Json(json!({"data": {"server": "", "users": []}}))),
            _ => (AxumStatus::NOT_FOUND, Json(json!({"error": "no such mesh"}))),
        }
    }

    async fn users_list(
        State((seen, _)): State<(Shared, String)>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        seen.lock().unwrap().bodies.push(body);
        Json(json!({"data": [
            {"id": 1, "displayName": "Ada"},
            {"id": "2", "displayName": "", "handle": "bob"},
            {"id": 3},
        ]}))
    }

    async fn leave(Path((id, _device)): Path<(String, String)>) -> AxumStatus {
        if id == "room" { AxumStatus::OK } else { AxumStatus::FORBIDDEN }
    }

    async fn upload_slots(
        State((seen, base)): State<(Shared, String)>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        seen.lock().unwrap().bodies.push(body.clone());
        let slots: Vec<Value> = body["media"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .rev()
            .map(|item| {
                let index = item["index"].as_u64().unwrap();
                json!({
                    "index": index,
                    "mime": item["mime"],
                    "fileName": format!("f{index}"),
                    "expiresAt": "later",
                    "postingUrl": format!("https://cdn.example/f{index}"),
                    "uploadUrl": format!("{base}/put/f{index}"),
                })
            })
            .collect();
        Json(json!({"data": slots}))
    }

    async fn put_file(
        State((seen, _)): State<(Shared, String)>,
        Path(name): Path<String>,
        headers: AxumHeaders,
        body: axum::body::Bytes,
    ) -> AxumStatus {
        let mime = headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        seen.lock().unwrap().uploads.push((name, mime, body.to_vec()));
        AxumStatus::NO_CONTENT
    }

    async fn mock() -> (RestApi, Shared) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let seen: Shared = Arc::default();
        let app = Router::new()
            .route("/meshes/self", get(meshes_self))
            .route("/meshes/{id}", get(mesh_details))
            .route("/users/list", post(users_list))
            .route("/meshes/{id}/devices/{device}/leave", delete(leave))
            .route("/meshes/{id}/images/upload", post(upload_slots))
            .route("/put/{name}", put(put_file))
            .with_state((seen.clone(), base.clone()));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (api_at(&base), seen)
    }

    fn api_at(base: &str) -> RestApi {
        let config = ApiConfig::from_file(&ApiFileConfig {
            base_url: base.to_string(),
            timeout_secs: 5,
            ..Default::default()
        });
        let account = Account {
            user_id: 99,
            device_id: "dev-1".into(),
            auth_token: "tok".into(),
        };
        RestApi::new(&config, &account).unwrap()
    }

    #[tokio::test]
    async fn test_invited_listing_sends_flags_and_client_headers() {
        let (api, seen) = mock().await;
        let sessions = api
            .list_sessions(SessionMode::Invited, 20, "en")
            .await
            .unwrap();

        let ids: Vec<&str> = sessions.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["shared", "inv-1"]);
        assert_eq!(sessions[1].members, vec![2, 3]);
        assert_eq!(sessions[1].metadata["isPublic"], false);

        let seen = seen.lock().unwrap();
        let query = &seen.queries[0];
        assert_eq!(query["deviceId"], "dev-1");
        assert_eq!(query["invited"], "true");
        assert_eq!(query["public"], "false");
        assert_eq!(query["local"], "false");
        assert_eq!(query["limit"], "20");

        let headers = &seen.headers[0];
        let header = |name: &str| headers.get(name).unwrap().to_str().unwrap().to_string();
        assert_eq!(header("authorization"), "Bearer tok");
        assert_eq!(header("client-version"), "8.2.9");
        assert_eq!(header("wemesh-api-version"), "4.0");
        assert_eq!(header("wemesh-platform"), "android");
        assert_eq!(header("ssaid"), "b32a05e5c198bdc0");
        assert!(header("user-agent").starts_with("Rave/"));
        assert!(header("request-ts").parse::<i64>().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_all_mode_merges_dedups_and_skips_failed_listing() {
        let (api, seen) = mock().await;
        let sessions = api.list_sessions(SessionMode::All, 20, "en").await.unwrap();
        let ids: Vec<&str> = sessions.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["pub-1", "shared", "inv-1"]);
        assert_eq!(seen.lock().unwrap().queries.len(), 3);

        let limited = api.list_sessions(SessionMode::All, 2, "en").await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_get_session_reads_server_and_members() {
        let (api, _) = mock().await;
        let info = api.get_session("room").await.unwrap();
        assert_eq!(info.endpoint.as_deref(), Some("wss-1.example"));
        assert_eq!(info.members, vec![10, 11]);

        let empty = api.get_session("empty").await.unwrap();
        assert_eq!(empty.endpoint, None);

        match api.get_session("missing").await {
            Err(ApiError::Status { status, .. }) => assert_eq!(status, 404),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resolve_users_picks_best_name() {
        let (api, seen) = mock().await;
        let profiles = api.resolve_users(&[1, 2, 3]).await.unwrap();
        let names: Vec<&str> = profiles.iter().map(|p| p.display_name.as_str()).collect();
        assert_eq!(names, vec!["Ada", "bob", "User 3"]);

        let body = &seen.lock().unwrap().bodies[0];
        assert_eq!(body["deviceId"], "dev-1");
        assert_eq!(body["ids"], json!([1, 2, 3]));
        assert_eq!(body["includeOnline"], true);

        assert!(api.resolve_users(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_leave_reports_refusal_as_false() {
        let (api, _) = mock().await;
        assert!(api.leave_session("room", "dev-1").await.unwrap());
        assert!(!api.leave_session("other", "dev-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_upload_media_puts_each_file_and_returns_posting_urls() {
        let (api, seen) = mock().await;
        let files = vec![
            MediaFile {
                file_name: "clip.mp4".into(),
                bytes: b"video".to_vec(),
                is_explicit: false,
            },
            MediaFile {
                file_name: "cat.png".into(),
                bytes: b"image".to_vec(),
                is_explicit: true,
            },
        ];
        let media = api.upload_media("room", files).await.unwrap();

        // slots come back reversed; attachments follow slot order
        assert_eq!(media.len(), 2);
        assert_eq!(media[0].url, "https://cdn.example/f1");
        assert_eq!(media[0].mime, "image/png");
        assert!(media[0].is_explicit);
        assert_eq!(media[1].mime, "video/mp4");
        assert_eq!(media[1].aspect_ratio, "");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.bodies[0]["media"][0]["mime"], "video/mp4");
        assert_eq!(seen.bodies[0]["media"][1]["isExplicit"], true);
        let uploads: Vec<_> = seen
            .uploads
            .iter()
            .map(|(name, mime, body)| (name.as_str(), mime.as_deref(), body.as_slice()))
            .collect();
        assert_eq!(
            uploads,
            vec![
                ("f1", Some("image/png"), b"image".as_slice()),
                ("f0", Some("video/mp4"), b"video".as_slice()),
            ]
        );
    }

    #[tokio::test]
    async fn test_refused_connection_is_classified() {
        let api = api_at("http://127.0.0.1:1");
        let err = api.get_session("room").await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Connection);
        assert!(matches!(err, ApiError::Transport { .. }));
    }

    #[test]
    fn test_user_id_shapes() {
        assert_eq!(user_id_of(&json!({"id": 5})), Some(5));
        assert_eq!(user_id_of(&json!({"id": " 6 "})), Some(6));
        assert_eq!(user_id_of(&json!(7)), Some(7));
        assert_eq!(user_id_of(&json!("8")), Some(8));
        assert_eq!(user_id_of(&json!({"name": "x"})), None);
        assert_eq!(user_id_of(&json!("abc")), None);
    }

    #[test]
    fn test_merge_keeps_first_occurrence() {
        let a = vec![SessionSummary::new("x"), SessionSummary::new("y")];
        let b = vec![SessionSummary::new("y"), SessionSummary::new("z")];
        let merged = merge_listings(vec![a, b], 10);
        let ids: Vec<&str> = merged.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["x", "y", "z"]);
    }

    #[test]
    fn test_mime_fallback() {
        assert_eq!(mime_for("a.jpg"), "image/jpeg");
        assert_eq!(mime_for("a.webm"), "video/webm");
        assert_eq!(mime_for("blob"), "application/octet-stream");
    }
}

//! Data-fetch API.
//!
//! [`ChatApi`] is the seam the client fetches through; [`HttpChatApi`] is the
//! HTTP implementation. Every response is decoded into the record types from
//! `murmur_shared::records` and mapped into domain types before it leaves
//! this module, except chat sessions, whose mapping depends on who the
//! current user is.

use std::time::Duration;

use async_trait::async_trait;
use murmur_shared::constants::{DEFAULT_API_URL, DEFAULT_REQUEST_TIMEOUT_SECS};
use murmur_shared::records::{
    ChannelRecord, ChatSessionRecord, LoginRequest, LoginResponse, MessageRecord, Payload,
    UserRecord,
};
use murmur_shared::{Channel, ChatSessionId, Message, MessageTarget, User, UserId};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::NetError;

/// API paths as segments appended to the base URL. Ids are single segments
/// and get percent-encoded.
pub mod endpoints {
    pub const LOGIN: &[&str] = &["auth", "login"];
    pub const CHANNELS: &[&str] = &["channels"];
    pub const USERS: &[&str] = &["users", "all"];
    pub const CHATS: &[&str] = &["chats"];

    pub fn user(id: &str) -> [&str; 2] {
        ["users", id]
    }

    pub fn chat_messages(chat_id: &str) -> [&str; 3] {
        ["chats", chat_id, "messages"]
    }
}

#[async_trait]
pub trait ChatApi: Send + Sync + 'static {
    async fn list_channels(&self) -> Result<Vec<Channel>, NetError>;

    async fn list_users(&self) -> Result<Vec<User>, NetError>;

    /// Profile of a single user. The endpoint returns one object, never a
    /// list.
    async fn get_user(&self, id: &UserId) -> Result<User, NetError>;

    async fn list_chat_sessions(&self) -> Result<Vec<ChatSessionRecord>, NetError>;

    /// History of one chat session, in server order, stamped with `target`.
    async fn get_chat_messages(
        &self,
        session: &ChatSessionId,
        target: &MessageTarget,
    ) -> Result<Vec<Message>, NetError>;

    /// Exchange credentials for a session token.
    async fn login(&self, credentials: &LoginRequest) -> Result<String, NetError>;
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub user_id: Option<String>,
    pub api_key: Option<String>,
    pub role: Option<String>,
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            user_id: None,
            api_key: None,
            role: None,
            timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

pub struct HttpChatApi {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpChatApi {
    pub fn new(config: ApiConfig) -> Result<Self, NetError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let identity = [
            ("x-user-id", &config.user_id),
            ("x-api-key", &config.api_key),
            ("x-role", &config.role),
        ];
        for (name, value) in identity {
            if let Some(value) = value {
                let value = HeaderValue::from_str(value)
                    .map_err(|_| NetError::Config(format!("invalid value for header {name}")))?;
                headers.insert(HeaderName::from_static(name), value);
            }
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;

        let base_url = Url::parse(config.base_url.trim_end_matches('/'))
            .map_err(|e| NetError::Config(format!("invalid base URL {:?}: {e}", config.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(NetError::Config(format!(
                "base URL {:?} cannot take a path",
                config.base_url
            )));
        }

        Ok(Self { http, base_url })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // Checked in `new`: the base URL always accepts path segments.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, NetError> {
        let url = self.url(segments);
        debug!(url = %url, "GET");
        let resp = self.http.get(url.clone()).send().await?;
        decode(url.to_string(), resp).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        segments: &[&str],
        body: &B,
    ) -> Result<T, NetError> {
        let url = self.url(segments);
        debug!(url = %url, "POST");
        let resp = self.http.post(url.clone()).json(body).send().await?;
        decode(url.to_string(), resp).await
    }
}

/// Read the body, turn non-success statuses into [`NetError::Status`], and
/// unwrap the optional response envelope.
async fn decode<T: DeserializeOwned>(url: String, resp: reqwest::Response) -> Result<T, NetError> {
    let status = resp.status();
    let body = resp.text().await?;

    if !status.is_success() {
        warn!(url = %url, status = status.as_u16(), "Request rejected");
        return Err(NetError::Status {
            status: status.as_u16(),
            url,
            body,
        });
    }

    let payload: Payload<T> = serde_json::from_str(&body)?;
    Ok(payload.into_inner())
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_channels(&self) -> Result<Vec<Channel>, NetError> {
        let records: Vec<ChannelRecord> = self.get(endpoints::CHANNELS).await?;
        let channels = records
            .into_iter()
            .map(ChannelRecord::into_channel)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(count = channels.len(), "Fetched channels");
        Ok(channels)
    }

    async fn list_users(&self) -> Result<Vec<User>, NetError> {
        let records: Vec<UserRecord> = self.get(endpoints::USERS).await?;
        let users = records
            .into_iter()
            .map(UserRecord::into_user)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(count = users.len(), "Fetched users");
        Ok(users)
    }

    async fn get_user(&self, id: &UserId) -> Result<User, NetError> {
        let record: UserRecord = self.get(&endpoints::user(id.as_str())).await?;
        Ok(record.into_user()?)
    }

    async fn list_chat_sessions(&self) -> Result<Vec<ChatSessionRecord>, NetError> {
        let sessions: Vec<ChatSessionRecord> = self.get(endpoints::CHATS).await?;
        debug!(count = sessions.len(), "Fetched chat sessions");
        Ok(sessions)
    }

    async fn get_chat_messages(
        &self,
        session: &ChatSessionId,
        target: &MessageTarget,
    ) -> Result<Vec<Message>, NetError> {
        let records: Vec<MessageRecord> = self
            .get(&endpoints::chat_messages(session.as_str()))
            .await?;
        let messages = records
            .into_iter()
            .map(|r| r.into_message(target))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(session = %session, count = messages.len(), "Fetched chat messages");
        Ok(messages)
    }

    async fn login(&self, credentials: &LoginRequest) -> Result<String, NetError> {
        let resp: LoginResponse = self.post(endpoints::LOGIN, credentials).await?;
        Ok(resp.token)
    }
}

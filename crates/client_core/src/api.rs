use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{
    domain::{Message, PeerUser, Username},
    protocol::{Credentials, LoginResponse, SearchMessagesQuery, UnreadCounts},
};

use tracing::warn;

use crate::error::{ClientError, ClientResult};

/// Messages from a list endpoint. Entries that fail to parse are skipped and
/// counted instead of failing the whole response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageBatch {
    pub messages: Vec<Message>,
    pub rejected: u64,
}

impl MessageBatch {
    pub fn from_values(operation: &str, values: Vec<Value>) -> Self {
        let mut batch = Self::default();
        for value in values {
            match serde_json::from_value(value) {
                Ok(message) => batch.messages.push(message),
                Err(err) => {
                    batch.rejected += 1;
                    warn!(operation, "api: skipping unreadable message: {err}");
                }
            }
        }
        batch
    }
}

/// Request/response half of the service.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    server_url: String,
}

impl ApiClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn login(&self, username: &str, password: &str) -> ClientResult<String> {
        let body: LoginResponse = self
            .execute(
                "login",
                self.http
                    .post(format!("{}/login", self.server_url))
                    .json(&credentials(username, password)),
            )
            .await?
            .json()
            .await
            .map_err(|err| ClientError::transient("login", err.to_string()))?;
        Ok(body.token)
    }

    pub async fn signup(&self, username: &str, password: &str) -> ClientResult<()> {
        self.execute(
            "signup",
            self.http
                .post(format!("{}/signup", self.server_url))
                .json(&credentials(username, password)),
        )
        .await?;
        Ok(())
    }

    pub async fn users(&self, token: &str) -> ClientResult<Vec<PeerUser>> {
        self.get_json(
            "list users",
            token,
            self.http.get(format!("{}/users", self.server_url)),
        )
        .await
    }

    pub async fn chat_snapshot(&self, token: &str, peer: &Username) -> ClientResult<MessageBatch> {
        let operation = "fetch conversation";
        let values: Vec<Value> = self
            .get_json(
                operation,
                token,
                self.http
                    .get(format!("{}/chats/{}", self.server_url, peer.as_str())),
            )
            .await?;
        Ok(MessageBatch::from_values(operation, values))
    }

    pub async fn unread_counts(&self, token: &str) -> ClientResult<UnreadCounts> {
        self.get_json(
            "fetch unread counts",
            token,
            self.http.get(format!("{}/unread-counts", self.server_url)),
        )
        .await
    }

    pub async fn search_messages(
        &self,
        token: &str,
        query: &str,
        with_user: Option<&Username>,
    ) -> ClientResult<MessageBatch> {
        let operation = "search messages";
        let values: Vec<Value> = self
            .get_json(
                operation,
                token,
                self.http
                    .get(format!("{}/search-messages", self.server_url))
                    .query(&SearchMessagesQuery {
                        query: query.to_string(),
                        with_user: with_user.cloned(),
                    }),
            )
            .await?;
        Ok(MessageBatch::from_values(operation, values))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        token: &str,
        request: RequestBuilder,
    ) -> ClientResult<T> {
        self.execute(operation, request.bearer_auth(token))
            .await?
            .json()
            .await
            .map_err(|err| ClientError::transient(operation, format!("invalid response body: {err}")))
    }

    async fn execute(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> ClientResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|err| ClientError::transient(operation, err.to_string()))?;
        check_status(operation, response).await
    }
}

fn credentials(username: &str, password: &str) -> Credentials {
    Credentials {
        username: username.to_string(),
        password: password.to_string(),
    }
}

async fn check_status(operation: &'static str, response: Response) -> ClientResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(ClientError::Auth { operation });
    }
    let body = response.text().await.unwrap_or_default();
    let message = if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{status}: {}", body.trim())
    };
    Err(ClientError::transient(operation, message))
}

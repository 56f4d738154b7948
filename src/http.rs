//! HTTP transport for tasks and tokens.
//!
//! [`HttpTask`] turns one HTTP call into a [`RequestResult`] and
//! [`HttpTokenProvider`] implements the resource-owner password grant against
//! an OpenID Connect style token endpoint. Both share a caller-provided
//! [`reqwest::Client`]; never build a client per call.
//!
//! Status classification:
//!
//! | status                                   | outcome             |
//! |------------------------------------------|---------------------|
//! | 2xx                                      | `Success`           |
//! | 401                                      | `AuthExpired`       |
//! | 400, on tasks that accept rejections     | `BusinessRejection` |
//! | anything else, or no response at all     | `TransportFailure`  |
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    auth::{AuthError, Credentials, Grant, Token, TokenProvider},
    error::Result,
    metric::{Outcome, RequestResult},
    task::{Task, TaskDefinition, TaskRegistry},
};

pub fn classify(status: StatusCode, accepts_business_rejection: bool) -> Outcome {
    match status {
        s if s.is_success() => Outcome::Success,
        StatusCode::UNAUTHORIZED => Outcome::AuthExpired,
        StatusCode::BAD_REQUEST if accepts_business_rejection => Outcome::BusinessRejection,
        _ => Outcome::TransportFailure,
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// One authenticated HTTP call.
#[derive(Clone, Debug)]
pub struct HttpTask {
    client: Client,
    method: Method,
    url: String,
    body: Option<serde_json::Value>,
    accepts_business_rejection: bool,
}

impl HttpTask {
    pub fn new(client: Client, method: Method, url: impl Into<String>) -> Self {
        Self {
            client,
            method,
            url: url.into(),
            body: None,
            accepts_business_rejection: false,
        }
    }

    pub fn get(client: Client, url: impl Into<String>) -> Self {
        Self::new(client, Method::GET, url)
    }

    pub fn post_json(client: Client, url: impl Into<String>, body: &impl Serialize) -> Result<Self> {
        let mut task = Self::new(client, Method::POST, url);
        task.body = Some(serde_json::to_value(body)?);
        Ok(task)
    }

    /// Count `400 Bad Request` as an expected business rejection.
    pub fn accepting_business_rejection(mut self) -> Self {
        self.accepts_business_rejection = true;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Task for HttpTask {
    async fn execute(&self, token: &Token) -> RequestResult {
        let start = Instant::now();
        let mut request = self
            .client
            .request(self.method.clone(), &self.url)
            .bearer_auth(token.as_str());
        if let Some(body) = &self.body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("{} {} failed: {e}", self.method, self.url);
                return RequestResult::transport_failure(
                    e.status().map(|s| s.as_u16()),
                    start.elapsed(),
                );
            }
        };
        let status = response.status();
        // latency covers the whole body
        if let Err(e) = response.bytes().await {
            tracing::debug!("{} {}: body read failed: {e}", self.method, self.url);
            return RequestResult::transport_failure(Some(status.as_u16()), start.elapsed());
        }
        RequestResult::new(
            classify(status, self.accepts_business_rejection),
            Some(status.as_u16()),
            start.elapsed(),
        )
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Password-grant token provider.
#[derive(Clone, Debug)]
pub struct HttpTokenProvider {
    client: Client,
    token_url: String,
}

impl HttpTokenProvider {
    pub fn new(client: Client, token_url: impl Into<String>) -> Self {
        Self {
            client,
            token_url: token_url.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn acquire(&self, credentials: &Credentials) -> std::result::Result<Grant, AuthError> {
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("username", credentials.username.as_str()),
                ("password", credentials.password.as_str()),
                ("grant_type", "password"),
                ("client_id", credentials.client_id.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Rejected {
                status: status.as_u16(),
            });
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        if body.access_token.is_empty() {
            return Err(AuthError::Malformed("empty access_token".into()));
        }
        tracing::debug!("Token obtained for {}.", credentials.username);
        Ok(Grant::new(
            Token::new(body.access_token),
            body.expires_in.map(Duration::from_secs),
        ))
    }
}

/// Body of the create-timesheet call.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimesheetEntry {
    pub employee_id: String,
    pub employee_name: String,
    pub pay_period_start: String,
    pub pay_period_end: String,
    pub regular_hours: u32,
    pub overtime_hours: u32,
    pub department: String,
    pub location: String,
    pub comments: String,
}

impl TimesheetEntry {
    pub fn for_user(username: &str) -> Self {
        Self {
            employee_id: username.to_string(),
            employee_name: "Load Test User".into(),
            pay_period_start: "2025-10-01".into(),
            pay_period_end: "2025-10-15".into(),
            regular_hours: 40,
            overtime_hours: 5,
            department: "IT".into(),
            location: "Remote".into(),
            comments: format!("Load test by user {username}"),
        }
    }
}

/// The timesheet workload: list (5), create (2), list own (3), list actions (1).
pub fn default_tasks(client: &Client, base_url: &str, username: &str) -> Result<TaskRegistry> {
    let url = |path: &str| join_url(base_url, path);
    let create = HttpTask::post_json(
        client.clone(),
        url("/api/timesheets"),
        &TimesheetEntry::for_user(username),
    )?
    .accepting_business_rejection();

    Ok(TaskRegistry::new()
        .register(TaskDefinition::new(
            "GET /api/timesheets",
            5,
            HttpTask::get(client.clone(), url("/api/timesheets")),
        )?)
        .register(TaskDefinition::new("POST /api/timesheets", 2, create)?)
        .register(TaskDefinition::new(
            "GET /api/timesheets/my",
            3,
            HttpTask::get(client.clone(), url("/api/timesheets/my")),
        )?)
        .register(TaskDefinition::new(
            "GET /api/timesheets/actions",
            1,
            HttpTask::get(client.clone(), url("/api/timesheets/actions")),
        )?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn classification_table() {
        assert_eq!(classify(StatusCode::OK, false), Outcome::Success);
        assert_eq!(classify(StatusCode::CREATED, false), Outcome::Success);
        assert_eq!(classify(StatusCode::UNAUTHORIZED, true), Outcome::AuthExpired);
        assert_eq!(classify(StatusCode::BAD_REQUEST, true), Outcome::BusinessRejection);
        assert_eq!(classify(StatusCode::BAD_REQUEST, false), Outcome::TransportFailure);
        assert_eq!(classify(StatusCode::FORBIDDEN, true), Outcome::TransportFailure);
        assert_eq!(
            classify(StatusCode::INTERNAL_SERVER_ERROR, true),
            Outcome::TransportFailure
        );
    }

    #[test]
    fn urls_join_with_one_slash() {
        assert_eq!(join_url("http://h:1/", "/api/x"), "http://h:1/api/x");
        assert_eq!(join_url("http://h:1", "api/x"), "http://h:1/api/x");
    }

    mod tasks {
        use super::*;

        #[tokio::test]
        async fn get_sends_bearer_token() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/timesheets"))
                .and(header("authorization", "Bearer abc"))
                .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
                .expect(1)
                .mount(&server)
                .await;

            let task = HttpTask::get(Client::new(), join_url(&server.uri(), "/api/timesheets"));
            let result = task.execute(&Token::new("abc")).await;

            assert_eq!(result.outcome, Outcome::Success);
            assert_eq!(result.status, Some(200));
        }

        #[tokio::test]
        async fn create_posts_json_and_accepts_400() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/api/timesheets"))
                .and(body_json(serde_json::json!({
                    "employeeId": "provider1",
                    "employeeName": "Load Test User",
                    "payPeriodStart": "2025-10-01",
                    "payPeriodEnd": "2025-10-15",
                    "regularHours": 40,
                    "overtimeHours": 5,
                    "department": "IT",
                    "location": "Remote",
                    "comments": "Load test by user provider1"
                })))
                .respond_with(ResponseTemplate::new(400).set_body_string("duplicate"))
                .mount(&server)
                .await;

            let task = HttpTask::post_json(
                Client::new(),
                join_url(&server.uri(), "/api/timesheets"),
                &TimesheetEntry::for_user("provider1"),
            )
            .unwrap()
            .accepting_business_rejection();
            let result = task.execute(&Token::new("abc")).await;

            assert_eq!(result.outcome, Outcome::BusinessRejection);
            assert_eq!(result.status, Some(400));
        }

        #[tokio::test]
        async fn unauthorized_and_server_errors() {
            let server = MockServer::start().await;
            Mock::given(path("/expired"))
                .respond_with(ResponseTemplate::new(401))
                .mount(&server)
                .await;
            Mock::given(path("/broken"))
                .respond_with(ResponseTemplate::new(503))
                .mount(&server)
                .await;
            let client = Client::new();
            let token = Token::new("abc");

            let expired = HttpTask::get(client.clone(), join_url(&server.uri(), "/expired"))
                .execute(&token)
                .await;
            let broken = HttpTask::get(client, join_url(&server.uri(), "/broken"))
                .execute(&token)
                .await;

            assert_eq!(expired.outcome, Outcome::AuthExpired);
            assert_eq!(broken.outcome, Outcome::TransportFailure);
            assert_eq!(broken.status, Some(503));
        }

        #[tokio::test]
        async fn connection_errors_are_transport_failures() {
            let task = HttpTask::get(Client::new(), "http://127.0.0.1:1/api/timesheets");
            let result = task.execute(&Token::new("abc")).await;
            assert_eq!(result.outcome, Outcome::TransportFailure);
            assert_eq!(result.status, None);
        }

        #[test]
        fn default_workload_weights() {
            let tasks = default_tasks(&Client::new(), "http://localhost:8081", "provider1")
                .unwrap()
                .build()
                .unwrap();
            let weights: Vec<_> = tasks
                .tasks()
                .iter()
                .map(|t| (t.name().to_string(), t.weight()))
                .collect();
            assert_eq!(
                weights,
                vec![
                    ("GET /api/timesheets".to_string(), 5),
                    ("POST /api/timesheets".to_string(), 2),
                    ("GET /api/timesheets/my".to_string(), 3),
                    ("GET /api/timesheets/actions".to_string(), 1),
                ]
            );
            assert_eq!(tasks.total_weight(), 11);
        }
    }

    mod token_provider {
        use super::*;

        const TOKEN_PATH: &str = "/realms/cmips/protocol/openid-connect/token";

        fn credentials() -> Credentials {
            Credentials::new("provider1", "password123", "cmips-frontend-new")
        }

        #[tokio::test]
        async fn password_grant_returns_token_and_expiry() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path(TOKEN_PATH))
                .and(body_string_contains("grant_type=password"))
                .and(body_string_contains("client_id=cmips-frontend-new"))
                .and(body_string_contains("username=provider1"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "access_token": "jwt-1",
                    "expires_in": 300,
                    "token_type": "Bearer"
                })))
                .expect(1)
                .mount(&server)
                .await;

            let provider =
                HttpTokenProvider::new(Client::new(), join_url(&server.uri(), TOKEN_PATH));
            let grant = provider.acquire(&credentials()).await.unwrap();

            assert_eq!(grant.token.as_str(), "jwt-1");
            assert_eq!(grant.expires_in, Some(Duration::from_secs(300)));
        }

        #[tokio::test]
        async fn rejected_credentials() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(401))
                .mount(&server)
                .await;

            let provider =
                HttpTokenProvider::new(Client::new(), join_url(&server.uri(), TOKEN_PATH));
            let err = provider.acquire(&credentials()).await.unwrap_err();

            assert!(matches!(err, AuthError::Rejected { status: 401 }));
        }

        #[tokio::test]
        async fn malformed_body() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
                .mount(&server)
                .await;

            let provider =
                HttpTokenProvider::new(Client::new(), join_url(&server.uri(), TOKEN_PATH));
            let err = provider.acquire(&credentials()).await.unwrap_err();

            assert!(matches!(err, AuthError::Malformed(_)));
        }

        #[tokio::test]
        async fn unreachable_endpoint() {
            let provider = HttpTokenProvider::new(Client::new(), "http://127.0.0.1:1/token");
            let err = provider.acquire(&credentials()).await.unwrap_err();
            assert!(matches!(err, AuthError::Unreachable(_)));
        }
    }
}

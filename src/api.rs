//! The target API boundary.
//!
//! [`IdentityApi`] is everything the engine needs from the system under test:
//! a reachability probe, the token endpoint, and a generic bearer-authenticated
//! request. [`HttpIdentityApi`] implements it over HTTP with reqwest.

use std::{future::Future, time::Duration};

use reqwest::{Client, Method, header::LOCATION};
use serde::Deserialize;
use serde_json::Value;

use crate::{catalog::HttpMethod, error::ApiError};

/// Admin credentials used for the password grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Realm that owns the admin account, normally `master`.
    pub admin_realm: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            admin_realm: "master".into(),
            client_id: "admin-cli".into(),
            username: "admin".into(),
            password: "admin".into(),
        }
    }
}

fn default_expires_in() -> u64 {
    300
}

/// Token endpoint response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// Seconds until the access token expires.
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl TokenGrant {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.expires_in)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: HttpMethod,
    /// Path below the base URL, starting with `/`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Decode a JSON body from a successful response.
    pub want_body: bool,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            want_body: false,
        }
    }

    pub fn with_query(mut self, query: &[(&str, &str)]) -> Self {
        self.query = query
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        self
    }

    pub fn with_body(mut self, body: Option<Value>) -> Self {
        self.body = body;
        self
    }

    pub fn expecting_body(mut self) -> Self {
        self.want_body = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub location: Option<String>,
    pub body: Option<Value>,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Last path segment of the `Location` header, if any.
    pub fn created_identifier(&self) -> Option<String> {
        self.location
            .as_deref()?
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .map(str::to_owned)
    }
}

/// The system under test.
///
/// Non-2xx answers to [`IdentityApi::execute`] are returned as `Ok` responses;
/// only transport-level problems are errors there. The token operations turn
/// non-2xx answers into [`ApiError::Status`].
pub trait IdentityApi: Send + Sync + 'static {
    /// Succeeds if the target answers the admin realm's discovery endpoint.
    fn probe(&self, credentials: &Credentials) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<TokenGrant, ApiError>> + Send;

    fn refresh(
        &self,
        credentials: &Credentials,
        current: &TokenGrant,
    ) -> impl Future<Output = Result<TokenGrant, ApiError>> + Send;

    fn execute(
        &self,
        token: &str,
        request: &ApiRequest,
    ) -> impl Future<Output = Result<ApiResponse, ApiError>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpIdentityApi {
    client: Client,
    base_url: String,
}

impl HttpIdentityApi {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn token_url(&self, credentials: &Credentials) -> String {
        self.url(&format!(
            "/realms/{}/protocol/openid-connect/token",
            credentials.admin_realm
        ))
    }

    async fn token_request(
        &self,
        credentials: &Credentials,
        form: &[(&str, &str)],
    ) -> Result<TokenGrant, ApiError> {
        let response = self
            .client
            .post(self.token_url(credentials))
            .form(form)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<TokenGrant>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

fn method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Delete => Method::DELETE,
    }
}

impl IdentityApi for HttpIdentityApi {
    async fn probe(&self, credentials: &Credentials) -> Result<(), ApiError> {
        let response = self
            .client
            .get(self.url(&format!("/realms/{}", credentials.admin_realm)))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ApiError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<TokenGrant, ApiError> {
        self.token_request(
            credentials,
            &[
                ("grant_type", "password"),
                ("client_id", &credentials.client_id),
                ("username", &credentials.username),
                ("password", &credentials.password),
            ],
        )
        .await
    }

    async fn refresh(
        &self,
        credentials: &Credentials,
        current: &TokenGrant,
    ) -> Result<TokenGrant, ApiError> {
        match &current.refresh_token {
            Some(refresh_token) => {
                self.token_request(
                    credentials,
                    &[
                        ("grant_type", "refresh_token"),
                        ("client_id", &credentials.client_id),
                        ("refresh_token", refresh_token),
                    ],
                )
                .await
            }
            None => self.authenticate(credentials).await,
        }
    }

    async fn execute(&self, token: &str, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut builder = self
            .client
            .request(method(request.method), self.url(&request.path))
            .bearer_auth(token);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let body = if request.want_body && status.is_success() {
            Some(
                response
                    .json::<Value>()
                    .await
                    .map_err(|e| ApiError::Decode(e.to_string()))?,
            )
        } else {
            // read the body so the measured latency covers the full response
            response.bytes().await?;
            None
        };

        Ok(ApiResponse {
            status: status.as_u16(),
            location,
            body,
        })
    }
}

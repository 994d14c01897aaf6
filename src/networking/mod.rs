use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;

use crate::error::ClientError;
use crate::job::JobParams;
use crate::manifest::Manifest;
use crate::session::{Credentials, Session};

const TOKEN_PATH: &str = "/account/api/oauth/token";
const VERIFY_PATH: &str = "/account/api/oauth/verify";
const MANIFEST_PATH: &str = "/launcher/api/manifests";

/// The store protocol the core drives. Errors are raw; callers translate them.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Check that a stored record is still accepted and return it (possibly updated).
    async fn resume_session(&self, credentials: &Credentials) -> Result<Credentials, ClientError>;

    /// Exchange a refresh token for a new credential record.
    async fn start_session(&self, refresh_token: &str) -> Result<Credentials, ClientError>;

    /// Exchange a one-time authorization code from the web login.
    async fn exchange_code(&self, code: &str) -> Result<Credentials, ClientError>;

    /// Fetch the manifest describing the build `params` targets.
    async fn fetch_manifest(
        &self,
        session: &Session,
        params: &JobParams,
    ) -> Result<Manifest, ClientError>;
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default, rename = "errorCode")]
    error_code: Option<String>,
    #[serde(default, rename = "errorMessage")]
    error_message: Option<String>,
}

/// `StoreClient` speaking JSON over HTTPS.
#[derive(Clone, Debug)]
pub struct HttpStoreClient {
    client: Client,
    base_url: String,
}

impl HttpStoreClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("launchkit/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|err| {
                warn!("network client: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ClientError> {
        Ok(request.send().await?)
    }

    async fn token_grant(&self, form: &[(&str, &str)]) -> Result<Credentials, ClientError> {
        let response = self
            .send(self.client.post(self.url(TOKEN_PATH)).form(form))
            .await?;
        let status = response.status();
        if status == StatusCode::BAD_REQUEST || auth_rejected(status) {
            return Err(ClientError::Rejected(api_error_text(response).await));
        }
        let response = check_status(response).await?;
        response
            .json::<Credentials>()
            .await
            .map_err(|err| ClientError::Decode(err.to_string()))
    }
}

#[async_trait]
impl StoreClient for HttpStoreClient {
    async fn resume_session(&self, credentials: &Credentials) -> Result<Credentials, ClientError> {
        let token = credentials
            .access_token
            .as_deref()
            .ok_or_else(|| ClientError::Rejected("no access token to resume".into()))?;
        let response = self
            .send(self.client.get(self.url(VERIFY_PATH)).bearer_auth(token))
            .await?;
        if auth_rejected(response.status()) {
            return Err(ClientError::Rejected(api_error_text(response).await));
        }
        check_status(response).await?;
        debug!("store: existing session verified");
        Ok(credentials.clone())
    }

    async fn start_session(&self, refresh_token: &str) -> Result<Credentials, ClientError> {
        self.token_grant(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("token_type", "eg1"),
        ])
        .await
    }

    async fn exchange_code(&self, code: &str) -> Result<Credentials, ClientError> {
        self.token_grant(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("token_type", "eg1"),
        ])
        .await
    }

    async fn fetch_manifest(
        &self,
        session: &Session,
        params: &JobParams,
    ) -> Result<Manifest, ClientError> {
        let url = self.url(&format!(
            "{MANIFEST_PATH}/{}/{}",
            params.app_name, params.platform
        ));
        let mut query = vec![
            ("disable_delta", params.disable_delta.to_string()),
            ("disable_patching", params.disable_patching.to_string()),
        ];
        if !params.install_tags.is_empty() {
            query.push(("install_tags", params.install_tags.join(",")));
        }
        if let Some(cdn) = &params.preferred_cdn {
            query.push(("cdn", cdn.clone()));
        }

        let response = self
            .send(
                self.client
                    .get(&url)
                    .bearer_auth(session.access_token())
                    .timeout(params.timeout)
                    .query(&query),
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(format!(
                "no manifest for {} on {}",
                params.app_name, params.platform
            )));
        }
        let response = check_status(response).await?;
        response
            .json::<Manifest>()
            .await
            .map_err(|err| ClientError::Decode(format!("manifest parse error: {err}")))
    }
}

fn auth_rejected(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

/// Turn a non-success response into `ClientError::Http`.
pub(crate) async fn check_status(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = api_error_text(response).await;
    Err(ClientError::Http {
        status: status.as_u16(),
        message,
    })
}

async fn api_error_text(response: Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    describe_api_error(status, &body)
}

fn describe_api_error(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<ApiError>(body) {
        Ok(ApiError {
            error_code: Some(code),
            error_message,
        }) => match error_message {
            Some(message) => format!("{status}: {code}: {message}"),
            None => format!("{status}: {code}"),
        },
        _ => status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn trims_trailing_slash_from_base_url() {
        let client = HttpStoreClient::new("https://store.example/", Duration::from_secs(5));
        assert_eq!(
            client.url(TOKEN_PATH),
            "https://store.example/account/api/oauth/token"
        );
    }

    #[test]
    fn describes_structured_api_errors() {
        let body = r#"{"errorCode":"errors.auth.invalid_refresh_token","errorMessage":"Sorry"}"#;
        assert_eq!(
            describe_api_error(StatusCode::BAD_REQUEST, body),
            "400 Bad Request: errors.auth.invalid_refresh_token: Sorry"
        );
        assert_eq!(
            describe_api_error(StatusCode::BAD_GATEWAY, "<html>"),
            "502 Bad Gateway"
        );
    }

    fn token_body() -> serde_json::Value {
        serde_json::json!({
            "access_token": "at-1",
            "refresh_token": "rt-1",
            "expires_at": "2031-05-04T10:20:30.000Z",
            "displayName": "tester",
            "token_type": "bearer"
        })
    }

    #[tokio::test]
    async fn exchanges_authorization_code_for_a_record() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body()))
            .mount(&server)
            .await;

        let client = HttpStoreClient::new(server.uri(), Duration::from_secs(5));
        let record = client.exchange_code("abc123").await.unwrap();
        assert_eq!(record.access_token.as_deref(), Some("at-1"));
        assert_eq!(record.display_name.as_deref(), Some("tester"));
        assert!(record.extra.contains_key("token_type"));
    }

    #[tokio::test]
    async fn bad_grant_is_a_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "errorCode": "errors.auth.invalid_refresh_token"
            })))
            .mount(&server)
            .await;

        let client = HttpStoreClient::new(server.uri(), Duration::from_secs(5));
        let err = client.start_session("expired").await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected(msg) if msg.contains("invalid_refresh_token")));
    }

    #[tokio::test]
    async fn missing_manifest_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{MANIFEST_PATH}/Sugar/Windows")))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = HttpStoreClient::new(server.uri(), Duration::from_secs(5));
        let mut record = Credentials::from_refresh_token("rt");
        record.access_token = Some("at".into());
        record.expires_at = Some("2031-05-04T10:20:30Z".into());
        let session = Session::from_credentials(&record).unwrap();
        let params = JobParams::new("Sugar", "/tmp/sugar");

        let err = client.fetch_manifest(&session, &params).await.unwrap_err();
        assert!(matches!(err, ClientError::NotFound(_)));
    }
}

//! HTTP registry client.
//!
//! Speaks the registry v2 API. Dialing pings `/v2/` to learn how the
//! registry wants to be authenticated; requests then carry either Basic
//! credentials or a Bearer token obtained from the advertised realm.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use strata_common::{StrataError, StrataResult};
use tokio::sync::Mutex;

use super::manifest::{ImageConfig, MEDIA_TYPES, RawManifest};
use super::{BlobStream, Conn, Dialer, InsecureRegistryList, Manifest};
use crate::credentials::Credentials;
use crate::digest::Digest;

/// Manifest lists may point at further lists; stop following after this.
const MAX_MANIFEST_HOPS: usize = 3;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    // Some registries use access_token
    access_token: Option<String>,
}

/// How a registry asked to be authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

impl Challenge {
    /// Parse a `WWW-Authenticate` header value.
    fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));
        if scheme.eq_ignore_ascii_case("basic") {
            return Some(Self::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut params = parse_params(rest);
        Some(Self::Bearer {
            realm: params.remove("realm")?,
            service: params.remove("service"),
            scope: params.remove("scope"),
        })
    }

    fn from_response(response: &Response) -> Option<Self> {
        response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::parse)
    }
}

/// Split `key="value",key=value` pairs, honouring commas inside quotes.
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();
        let after = after.trim_start();

        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };

        params.insert(key, value.to_string());
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }

    params
}

/// Dials registries over HTTPS, falling back to HTTP for insecure hosts.
pub struct HttpDialer {
    insecure: InsecureRegistryList,
    secure_client: Client,
    insecure_client: Client,
}

impl HttpDialer {
    /// Create a dialer.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP clients cannot be built.
    pub fn new(insecure: InsecureRegistryList) -> StrataResult<Self> {
        let build = |accept_invalid: bool| {
            Client::builder()
                .user_agent(concat!("strata/", env!("CARGO_PKG_VERSION")))
                .danger_accept_invalid_certs(accept_invalid)
                .build()
                .map_err(|e| StrataError::Config {
                    message: format!("failed to build HTTP client: {e}"),
                })
        };

        Ok(Self {
            insecure,
            secure_client: build(false)?,
            insecure_client: build(true)?,
        })
    }

    /// Probe `/v2/` on `base`, returning the authentication challenge, if
    /// any.
    async fn ping(client: &Client, base: &str) -> Result<Option<Challenge>, String> {
        let url = format!("{base}/v2/");
        tracing::debug!(url = %url, "Pinging registry");

        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("ping failed: {e}"))?;

        match response.status() {
            StatusCode::UNAUTHORIZED => Ok(Challenge::from_response(&response)),
            status if status.is_success() => Ok(None),
            status => Err(format!("ping returned {status}")),
        }
    }
}

#[async_trait]
impl Dialer for HttpDialer {
    async fn dial(
        &self,
        host: &str,
        repository: &str,
        credentials: &Credentials,
    ) -> StrataResult<Box<dyn Conn>> {
        let insecure = self.insecure.allows(host);
        let client = if insecure {
            &self.insecure_client
        } else {
            &self.secure_client
        };
        let schemes: &[&str] = if insecure { &["https", "http"] } else { &["https"] };

        let upstream = |message: String| StrataError::Upstream {
            registry: host.to_string(),
            repository: repository.to_string(),
            message,
        };

        let mut last_error = None;
        for scheme in schemes {
            let base = format!("{scheme}://{host}");
            match Self::ping(client, &base).await {
                Ok(challenge) => {
                    tracing::debug!(host, scheme, ?challenge, "Registry reachable");
                    return Ok(Box::new(HttpConn {
                        client: client.clone(),
                        base,
                        registry: host.to_string(),
                        repository: repository.to_string(),
                        credentials: credentials.clone(),
                        challenge: Mutex::new(challenge),
                        token: Mutex::new(None),
                    }));
                }
                Err(message) => {
                    tracing::debug!(host, scheme, error = %message, "Registry ping failed");
                    last_error = Some(message);
                }
            }
        }

        Err(upstream(
            last_error.unwrap_or_else(|| "registry unreachable".to_string()),
        ))
    }
}

/// Connection to one repository on one registry.
pub struct HttpConn {
    client: Client,
    base: String,
    registry: String,
    repository: String,
    credentials: Credentials,
    challenge: Mutex<Option<Challenge>>,
    token: Mutex<Option<String>>,
}

impl HttpConn {
    fn upstream(&self, message: impl Into<String>) -> StrataError {
        StrataError::Upstream {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            message: message.into(),
        }
    }

    async fn authorize(&self, request: RequestBuilder) -> StrataResult<RequestBuilder> {
        let challenge = self.challenge.lock().await.clone();
        match challenge {
            None => Ok(request),
            Some(Challenge::Basic) => {
                if self.credentials.is_anonymous() {
                    Ok(request)
                } else {
                    Ok(request.header(AUTHORIZATION, self.credentials.basic_auth()))
                }
            }
            Some(Challenge::Bearer {
                realm,
                service,
                scope,
            }) => {
                let mut token = self.token.lock().await;
                if token.is_none() {
                    *token = Some(self.request_token(&realm, service.as_deref(), scope.as_deref()).await?);
                }
                Ok(request.bearer_auth(token.as_deref().unwrap_or_default()))
            }
        }
    }

    async fn request_token(
        &self,
        realm: &str,
        service: Option<&str>,
        scope: Option<&str>,
    ) -> StrataResult<String> {
        let scope = scope.map_or_else(|| format!("repository:{}:pull", self.repository), str::to_string);
        let mut query = vec![("scope", scope.as_str())];
        if let Some(service) = service {
            query.push(("service", service));
        }

        tracing::debug!(realm, scope = %scope, "Requesting token");

        let mut request = self.client.get(realm).query(&query);
        if !self.credentials.is_anonymous() {
            request = request.header(AUTHORIZATION, self.credentials.basic_auth());
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.upstream(format!("failed to request token: {e}")))?;
        if !response.status().is_success() {
            return Err(self.upstream(format!("token endpoint returned {}", response.status())));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| self.upstream(format!("failed to parse token response: {e}")))?;

        body.token
            .or(body.access_token)
            .ok_or_else(|| self.upstream("no token in response"))
    }

    /// GET `path` under the repository, re-authenticating once if the
    /// registry rejects the current credentials.
    async fn get(&self, path: &str, accept: Option<&str>) -> StrataResult<Response> {
        let url = format!("{}/v2/{}/{}", self.base, self.repository, path);

        for attempt in 0..2 {
            let mut request = self.client.get(&url);
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }
            let request = self.authorize(request).await?;

            tracing::debug!(url = %url, "Registry request");
            let response = request
                .send()
                .await
                .map_err(|e| self.upstream(format!("request to {url} failed: {e}")))?;

            if response.status() == StatusCode::UNAUTHORIZED && attempt == 0 {
                if let Some(challenge) = Challenge::from_response(&response) {
                    *self.challenge.lock().await = Some(challenge);
                    *self.token.lock().await = None;
                    continue;
                }
            }

            if !response.status().is_success() {
                return Err(self.upstream(format!("{url} returned {}", response.status())));
            }
            return Ok(response);
        }

        Err(self.upstream(format!("{url}: authentication failed")))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        accept: Option<&str>,
    ) -> StrataResult<T> {
        let body = self
            .get(path, accept)
            .await?
            .bytes()
            .await
            .map_err(|e| self.upstream(format!("failed to read {path}: {e}")))?;
        serde_json::from_slice(&body).map_err(|e| self.upstream(format!("invalid {path}: {e}")))
    }
}

#[async_trait]
impl Conn for HttpConn {
    async fn get_manifest(&self, tag: &str) -> StrataResult<Manifest> {
        let accept = MEDIA_TYPES.join(", ");
        let mut reference = tag.to_string();

        for _ in 0..MAX_MANIFEST_HOPS {
            let raw: RawManifest = self
                .get_json(&format!("manifests/{reference}"), Some(&accept))
                .await?;

            if raw.schema_version == 1 {
                return Err(self.upstream("schema 1 manifests are not supported"));
            }

            if !raw.manifests.is_empty() {
                reference = raw
                    .platform_digest()
                    .ok_or_else(|| self.upstream("no manifest for this platform"))?
                    .to_string();
                continue;
            }

            let config = match &raw.config {
                Some(descriptor) => {
                    self.get_json::<ImageConfig>(&format!("blobs/{}", descriptor.digest), None)
                        .await?
                }
                None => ImageConfig::default(),
            };

            return Ok(Manifest::new(
                raw.layer_blobs()?,
                config.env(),
                config.volumes(),
            ));
        }

        Err(self.upstream("too many nested manifest lists"))
    }

    async fn get_blob(&self, digest: &Digest) -> StrataResult<BlobStream> {
        let response = self.get(&format!("blobs/{digest}"), None).await?;
        let registry = self.registry.clone();
        let repository = self.repository.clone();

        Ok(response
            .bytes_stream()
            .map(move |chunk| {
                chunk.map_err(|e| StrataError::Upstream {
                    registry: registry.clone(),
                    repository: repository.clone(),
                    message: format!("blob download failed: {e}"),
                })
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_challenge() {
        let challenge = Challenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/busybox:pull,push""#,
        );
        assert_eq!(
            challenge,
            Some(Challenge::Bearer {
                realm: "https://auth.docker.io/token".to_string(),
                service: Some("registry.docker.io".to_string()),
                scope: Some("repository:library/busybox:pull,push".to_string()),
            })
        );
    }

    #[test]
    fn parses_basic_challenge() {
        assert_eq!(
            Challenge::parse(r#"Basic realm="Registry Realm""#),
            Some(Challenge::Basic)
        );
    }

    #[test]
    fn bearer_without_realm_is_unusable() {
        assert_eq!(Challenge::parse(r#"Bearer service="x""#), None);
        assert_eq!(Challenge::parse("Negotiate abc"), None);
    }

    #[test]
    fn unquoted_params() {
        let params = parse_params("realm=https://auth.example/token, service=example");
        assert_eq!(params["realm"], "https://auth.example/token");
        assert_eq!(params["service"], "example");
    }
}

use crate::challenge::BearerChallenge;
use crate::config::RegistrySettings;
use crate::credentials::CredentialSet;
use crate::error::{Error, Result};
use crate::image_reference::ImageReference;
use crate::planner::{DigestResolver, DigestSource};
use crate::secret_string::SecretString;
use anyhow::Context;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderValue, WWW_AUTHENTICATE};
use reqwest::{Certificate, Client, Response, StatusCode};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

static MANIFEST_MEDIA_TYPES: [&str; 3] = [
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.docker.distribution.manifest.v1+json",
    "application/vnd.docker.distribution.manifest.v1+prettyjws",
];
static DIGEST_HEADER: &str = "Docker-Content-Digest";

pub fn create_client(settings: &RegistrySettings) -> anyhow::Result<Client> {
    info!("Initializing OCI Registry HTTP client");
    // System certificates are loaded automatically with rustls-tls-native-roots
    let mut client_builder =
        Client::builder().timeout(Duration::from_secs(settings.timeout_seconds));

    for file_path in &settings.ca_certificate_paths {
        let file_content = fs::read(file_path)
            .with_context(|| format!("Failed to read file {}", file_path.display()))?;
        let cert = Certificate::from_pem(&file_content).context("Failed to parse certificate")?;
        client_builder = client_builder.add_root_certificate(cert);
    }

    client_builder.build().context("Failed to build HTTP client")
}

/// Progress of the registry token handshake for one manifest lookup.
enum AuthState {
    /// Request carries the Basic token, if any is known for the registry.
    Unauthenticated,
    /// The registry answered 401 with a Bearer challenge.
    Challenged(BearerChallenge),
    /// Request carries the Bearer token from the challenge's realm.
    Authenticated(SecretString),
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Resolves tags to manifest digests. Results are memoized per image string
/// for the lifetime of the client.
pub struct RegistryClient {
    http: Client,
    insecure_registries: HashSet<String>,
    cache: RwLock<HashMap<String, String>>,
}

impl RegistryClient {
    pub fn new(http: Client, insecure_registries: impl IntoIterator<Item = String>) -> Self {
        Self {
            http,
            insecure_registries: insecure_registries.into_iter().collect(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_digest(&self, image: &str, credentials: &CredentialSet) -> Result<String> {
        if let Some(digest) = self.cache.read().await.get(image) {
            debug!("Digest cache hit for {}", image);
            return Ok(digest.clone());
        }

        let digest = self.fetch_digest(image, credentials).await?;
        Ok(self
            .cache
            .write()
            .await
            .entry(image.to_string())
            .or_insert(digest)
            .clone())
    }

    fn manifest_url(&self, reference: &ImageReference) -> String {
        let scheme = if self.insecure_registries.contains(&reference.domain) {
            "http"
        } else {
            "https"
        };
        format!(
            "{}://{}/v2/{}/manifests/{}",
            scheme, reference.domain, reference.repository, reference.tag
        )
    }

    async fn fetch_digest(&self, image: &str, credentials: &CredentialSet) -> Result<String> {
        let reference = ImageReference::parse(image);
        let url = self.manifest_url(&reference);
        let basic = credentials.token_for(&reference.domain);
        debug!("Resolving {} via {}", reference, url);

        let mut state = AuthState::Unauthenticated;
        loop {
            state = match state {
                AuthState::Challenged(challenge) => {
                    AuthState::Authenticated(self.fetch_bearer_token(&challenge, basic).await?)
                }
                state => {
                    let response = self.head_manifest(&url, basic, &state).await?;
                    match (state, response.status()) {
                        (_, StatusCode::OK) => return digest_from_response(&url, &response),
                        (AuthState::Unauthenticated, StatusCode::UNAUTHORIZED) => {
                            match bearer_challenge(&response)? {
                                Some(challenge) => {
                                    debug!("Registry {} requested a Bearer token", reference.domain);
                                    AuthState::Challenged(challenge)
                                }
                                None => return Err(unexpected_status(&url, response.status())),
                            }
                        }
                        (_, status) => return Err(unexpected_status(&url, status)),
                    }
                }
            };
        }
    }

    async fn head_manifest(
        &self,
        url: &str,
        basic: Option<&SecretString>,
        state: &AuthState,
    ) -> Result<Response> {
        debug!("Fetching manifest digest from URL {}", url);
        let mut request = self.http.head(url);
        for media_type in MANIFEST_MEDIA_TYPES {
            request = request.header(ACCEPT, media_type);
        }
        let authorization = match state {
            AuthState::Authenticated(token) => Some(authorization(token, "Bearer", url)?),
            _ => basic.map(|token| authorization(token, "Basic", url)).transpose()?,
        };
        if let Some(authorization) = authorization {
            request = request.header(AUTHORIZATION, authorization);
        }
        Ok(request.send().await?)
    }

    async fn fetch_bearer_token(
        &self,
        challenge: &BearerChallenge,
        basic: Option<&SecretString>,
    ) -> Result<SecretString> {
        let mut request = self.http.get(&challenge.realm).query(&[
            ("service", challenge.service.as_str()),
            ("scope", challenge.scope.as_str()),
        ]);
        if let Some(token) = basic {
            request = request.header(AUTHORIZATION, authorization(token, "Basic", &challenge.realm)?);
        }

        let response = request.send().await?;
        if response.status() != StatusCode::OK {
            return Err(Error::AuthChallenge(format!(
                "error while requesting auth token on {}: {}",
                response.url(),
                response.status()
            )));
        }
        let body: TokenResponse = response.json().await?;
        body.token
            .or(body.access_token)
            .filter(|token| !token.is_empty())
            .map(SecretString::new)
            .ok_or_else(|| {
                Error::AuthChallenge(format!("no token returned by {}", challenge.realm))
            })
    }
}

impl DigestSource for RegistryClient {
    fn with_credentials<'a>(
        &'a self,
        credentials: &'a CredentialSet,
    ) -> impl DigestResolver + 'a {
        RegistrySession {
            client: self,
            credentials,
        }
    }
}

/// A `RegistryClient` bound to the credentials of one workload.
struct RegistrySession<'a> {
    client: &'a RegistryClient,
    credentials: &'a CredentialSet,
}

impl DigestResolver for RegistrySession<'_> {
    async fn resolve_digest(&self, image: &str) -> Result<String> {
        self.client.get_digest(image, self.credentials).await
    }
}

fn authorization(token: &SecretString, scheme: &str, url: &str) -> Result<HeaderValue> {
    token
        .authorization(scheme)
        .map_err(|_| Error::DigestFetch {
            url: url.to_string(),
            reason: format!("{} credentials are not a valid header value", scheme),
        })
}

fn bearer_challenge(response: &Response) -> Result<Option<BearerChallenge>> {
    match response
        .headers()
        .get(WWW_AUTHENTICATE)
        .and_then(|value| value.to_str().ok())
    {
        Some(header) => BearerChallenge::parse(header),
        None => Ok(None),
    }
}

fn unexpected_status(url: &str, status: StatusCode) -> Error {
    Error::DigestFetch {
        url: url.to_string(),
        reason: format!("unexpected response {}", status),
    }
}

fn digest_from_response(url: &str, response: &Response) -> Result<String> {
    response
        .headers()
        .get(DIGEST_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|digest| !digest.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| Error::DigestFetch {
            url: url.to_string(),
            reason: format!("no {} in response headers", DIGEST_HEADER),
        })
}

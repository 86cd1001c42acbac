//! Credential-aware registry tag listing
//!
//! Talks the registry HTTP API: resolves an image's current tag without
//! touching the network, and lists a repository's tags with the merged
//! keychain, following pagination and the token-auth challenge dance.
//! Failures map onto the caller's error taxonomy and are never retried
//! here; the source adapter's periodic recheck is the retry.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde::Deserialize;
use thiserror::Error;

use crate::image::{ImageRefError, ImageReference};
use crate::keychain::{Credential, Keychain};

/// Upper bound on any single registry call, so cancellation is never
/// blocked behind a hung connection for long.
pub const TAG_LIST_TIMEOUT: Duration = Duration::from_secs(5);

const PAGE_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidReference(#[from] ImageRefError),
    #[error("registry {host} unavailable")]
    Unavailable {
        host: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unauthorized to list tags for {repository} on {host}")]
    Unauthorized { host: String, repository: String },
    #[error("unexpected status {status} from {url}")]
    UnexpectedStatus { status: StatusCode, url: String },
}

/// Capability: resolve an image's running tag and list the tags its
/// registry serves.
#[async_trait]
pub trait TagLister: Send + Sync {
    /// Tag or digest component of the raw reference. No network access.
    fn current_tag(&self, image: &str) -> Result<String, ImageRefError>;

    /// Full tag list of the image's repository, authenticated with the
    /// base keychain merged with `keychain` (per-call entries win).
    async fn list_tags(&self, image: &str, keychain: &Keychain)
        -> Result<Vec<String>, RegistryError>;
}

/// Registry HTTP API client holding the base keychain loaded at startup
pub struct RegistryClient {
    http: reqwest::Client,
    base: Keychain,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl RegistryClient {
    pub fn new(base: Keychain) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(TAG_LIST_TIMEOUT)
            .build()
            .context("failed to build registry HTTP client")?;
        Ok(Self { http, base })
    }

    async fn get(
        &self,
        url: &str,
        credential: &Credential,
        bearer: Option<&str>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut request = self.http.get(url);
        request = match bearer {
            Some(token) => request.bearer_auth(token),
            None => match credential {
                Credential::Anonymous => request,
                Credential::Basic { username, password } => {
                    request.basic_auth(username, Some(password))
                }
                Credential::Token(token) => request.bearer_auth(token),
            },
        };
        request.send().await
    }

    /// Exchange a `Www-Authenticate: Bearer` challenge for a token,
    /// presenting basic credentials to the token endpoint when the
    /// keychain has them.
    async fn fetch_token(
        &self,
        challenge: &BearerChallenge,
        credential: &Credential,
        repository: &str,
    ) -> Result<String, RegistryError> {
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{repository}:pull"));
        let mut request = self
            .http
            .get(&challenge.realm)
            .query(&[("scope", scope.as_str())]);
        if let Some(service) = &challenge.service {
            request = request.query(&[("service", service.as_str())]);
        }
        if let Credential::Basic { username, password } = credential {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await.map_err(|source| RegistryError::Unavailable {
            host: challenge.realm.clone(),
            source,
        })?;
        if !response.status().is_success() {
            return Err(RegistryError::Unauthorized {
                host: challenge.realm.clone(),
                repository: repository.to_string(),
            });
        }

        let token: TokenResponse =
            response
                .json()
                .await
                .map_err(|source| RegistryError::Unavailable {
                    host: challenge.realm.clone(),
                    source,
                })?;
        token
            .token
            .or(token.access_token)
            .ok_or_else(|| RegistryError::Unauthorized {
                host: challenge.realm.clone(),
                repository: repository.to_string(),
            })
    }
}

#[async_trait]
impl TagLister for RegistryClient {
    fn current_tag(&self, image: &str) -> Result<String, ImageRefError> {
        ImageReference::parse(image).map(|reference| reference.identifier().to_string())
    }

    async fn list_tags(
        &self,
        image: &str,
        keychain: &Keychain,
    ) -> Result<Vec<String>, RegistryError> {
        let reference = ImageReference::parse(image)?;
        let credential = self
            .base
            .clone()
            .merge(keychain.clone())
            .resolve(reference.registry());

        let host = reference.api_host();
        let origin = format!("{}://{}", scheme_for(host), host);
        let mut url = format!("{origin}/v2/{}/tags/list?n={PAGE_SIZE}", reference.repository());
        let mut bearer: Option<String> = None;
        let mut tags = Vec::new();

        loop {
            let response = self
                .get(&url, &credential, bearer.as_deref())
                .await
                .map_err(|source| RegistryError::Unavailable {
                    host: host.to_string(),
                    source,
                })?;

            if response.status() == StatusCode::UNAUTHORIZED && bearer.is_none() {
                let challenge = response
                    .headers()
                    .get(header::WWW_AUTHENTICATE)
                    .and_then(|value| value.to_str().ok())
                    .and_then(parse_bearer_challenge);
                match challenge {
                    Some(challenge) => {
                        bearer = Some(
                            self.fetch_token(&challenge, &credential, reference.repository())
                                .await?,
                        );
                        continue;
                    }
                    None => {
                        return Err(RegistryError::Unauthorized {
                            host: host.to_string(),
                            repository: reference.repository().to_string(),
                        })
                    }
                }
            }
            if matches!(
                response.status(),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            ) {
                return Err(RegistryError::Unauthorized {
                    host: host.to_string(),
                    repository: reference.repository().to_string(),
                });
            }
            if !response.status().is_success() {
                return Err(RegistryError::UnexpectedStatus {
                    status: response.status(),
                    url,
                });
            }

            let next = response
                .headers()
                .get(header::LINK)
                .and_then(|value| value.to_str().ok())
                .and_then(next_link);
            let page: TagList =
                response
                    .json()
                    .await
                    .map_err(|source| RegistryError::Unavailable {
                        host: host.to_string(),
                        source,
                    })?;
            tags.extend(page.tags);

            match next {
                Some(link) if link.starts_with('/') => url = format!("{origin}{link}"),
                Some(link) => url = link,
                None => break,
            }
        }

        Ok(tags)
    }
}

/// Local registries are plain HTTP in practice; everything else is TLS.
fn scheme_for(host: &str) -> &'static str {
    let name = host.split(':').next().unwrap_or(host);
    if name == "localhost" || name == "127.0.0.1" {
        "http"
    } else {
        "https"
    }
}

fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let params = header.strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for part in params.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        let value = value.trim_matches('"').to_string();
        match key {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => scope = Some(value),
            _ => {}
        }
    }
    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}

/// Extract the `rel="next"` target from a pagination Link header.
fn next_link(header: &str) -> Option<String> {
    for part in header.split(',') {
        let part = part.trim();
        let Some((target, params)) = part.split_once('>') else {
            continue;
        };
        let Some(target) = target.strip_prefix('<') else {
            continue;
        };
        if params.contains("rel=\"next\"") || params.contains("rel=next") {
            return Some(target.to_string());
        }
    }
    None
}

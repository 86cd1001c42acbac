//! Registry credential resolution
//!
//! A keychain is an immutable mapping from registry host to credential,
//! built by merging entries from the standard docker credential file and
//! from workload pull-secret payloads. Later sources override earlier
//! ones per host; unknown hosts resolve to anonymous access.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use base64::Engine;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

/// Secret type carrying a legacy single-level host map
pub const SECRET_TYPE_DOCKERCFG: &str = "kubernetes.io/dockercfg";
/// Secret type carrying an `{"auths": ...}` document
pub const SECRET_TYPE_DOCKER_CONFIG_JSON: &str = "kubernetes.io/dockerconfigjson";

#[derive(Debug, Error)]
pub enum KeychainError {
    #[error("credentials file {path:?} not found")]
    NotFound {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed credentials file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A single registry credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Anonymous,
    Basic { username: String, password: String },
    Token(String),
}

/// Immutable mapping from registry host to credential
#[derive(Debug, Clone, Default)]
pub struct Keychain {
    entries: HashMap<String, Credential>,
}

/// Raw pull-secret material as handed over by a source adapter
#[derive(Debug, Clone)]
pub struct RawSecret {
    pub name: String,
    pub secret_type: String,
    pub payload: Vec<u8>,
}

/// The standard registry credential file schema
#[derive(Debug, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

#[derive(Debug, Deserialize)]
struct AuthEntry {
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
    identitytoken: Option<String>,
}

impl Keychain {
    /// Load the base keychain from a registry credentials file.
    ///
    /// A missing or malformed file is reported to the caller, who is
    /// expected to continue with an empty keychain.
    pub fn from_file(path: &Path) -> Result<Self, KeychainError> {
        let content = std::fs::read(path).map_err(|source| KeychainError::NotFound {
            path: path.to_path_buf(),
            source,
        })?;
        let config: DockerConfig =
            serde_json::from_slice(&content).map_err(|source| KeychainError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::from_auth_entries(config.auths))
    }

    /// Decode pull-secret payloads into a merged keychain.
    ///
    /// Payloads of unrecognized type or with undecodable content are
    /// skipped with a warning; decoding never aborts the merge.
    pub fn from_secrets(secrets: &[RawSecret]) -> Self {
        let mut keychain = Keychain::default();
        for secret in secrets {
            let entries = match secret.secret_type.as_str() {
                SECRET_TYPE_DOCKER_CONFIG_JSON => {
                    serde_json::from_slice::<DockerConfig>(&secret.payload).map(|c| c.auths)
                }
                SECRET_TYPE_DOCKERCFG => {
                    serde_json::from_slice::<HashMap<String, AuthEntry>>(&secret.payload)
                }
                other => {
                    warn!(
                        secret = %secret.name,
                        secret_type = %other,
                        "skipping pull secret of unrecognized type"
                    );
                    continue;
                }
            };
            match entries {
                Ok(entries) => keychain = keychain.merge(Self::from_auth_entries(entries)),
                Err(error) => {
                    warn!(secret = %secret.name, error = %error, "skipping undecodable pull secret");
                }
            }
        }
        keychain
    }

    fn from_auth_entries(entries: HashMap<String, AuthEntry>) -> Self {
        let mut out = HashMap::with_capacity(entries.len());
        for (host, entry) in entries {
            out.insert(normalize_host(&host), entry.into_credential());
        }
        Self { entries: out }
    }

    /// Host-wise union; entries from `other` win on collision.
    pub fn merge(mut self, other: Keychain) -> Keychain {
        self.entries.extend(other.entries);
        self
    }

    /// Look up the credential for a registry host.
    ///
    /// Unknown hosts resolve to anonymous access; this never fails.
    pub fn resolve(&self, host: &str) -> Credential {
        self.entries
            .get(&normalize_host(host))
            .cloned()
            .unwrap_or(Credential::Anonymous)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl AuthEntry {
    fn into_credential(self) -> Credential {
        if let Some(token) = self.identitytoken {
            return Credential::Token(token);
        }
        if let (Some(username), Some(password)) = (self.username.as_ref(), self.password.as_ref())
        {
            return Credential::Basic {
                username: username.clone(),
                password: password.clone(),
            };
        }
        if let Some(auth) = self.auth.as_deref() {
            if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(auth) {
                if let Ok(text) = String::from_utf8(decoded) {
                    if let Some((username, password)) = text.split_once(':') {
                        return Credential::Basic {
                            username: username.to_string(),
                            password: password.to_string(),
                        };
                    }
                }
            }
        }
        Credential::Anonymous
    }
}

/// Credential files historically key entries on URLs such as
/// `https://index.docker.io/v1/`. Fold those to the bare host, and fold
/// the Docker Hub aliases together, so lookups by image registry match.
fn normalize_host(host: &str) -> String {
    let host = host
        .strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host);
    let host = host.split('/').next().unwrap_or(host);
    match host {
        "docker.io" | "registry-1.docker.io" => "index.docker.io".to_string(),
        other => other.to_string(),
    }
}

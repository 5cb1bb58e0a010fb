use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, Category};
use crate::error::CrawlError;
use crate::limiter::RateGovernor;

/// One set of API access keys.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default)]
    pub name: String,
    pub api_key: String,
    pub api_secret: String,
    pub access_token: String,
    pub access_token_secret: String,
}

impl Credential {
    pub fn new(
        name: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        access_token: impl Into<String>,
        access_token_secret: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            access_token: access_token.into(),
            access_token_secret: access_token_secret.into(),
        }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = fs_err::read_to_string(path)?;
        let mut credential: Credential = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid JSON in {}", path.display()))?;

        for (field, value) in [
            ("api_key", &credential.api_key),
            ("api_secret", &credential.api_secret),
            ("access_token", &credential.access_token),
            ("access_token_secret", &credential.access_token_secret),
        ] {
            if value.trim().is_empty() {
                anyhow::bail!("Empty {field} in {}", path.display());
            }
        }

        if credential.name.is_empty() {
            credential.name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        Ok(credential)
    }

    fn same_keys(&self, other: &Credential) -> bool {
        self.api_key == other.api_key && self.access_token == other.access_token
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("api_key", &"<redacted>")
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Reads every `*.json` credential file of `dir`, in name order.
///
/// Malformed files and duplicate names are skipped with a warning, finding
/// no usable credential at all is a [`CrawlError::NoCredentials`].
pub fn load_credentials(dir: impl AsRef<Path>) -> anyhow::Result<Vec<Credential>> {
    let dir = dir.as_ref();
    let pattern = dir.join("*.json");
    let pattern = pattern.to_string_lossy();

    let mut names = HashSet::new();
    let mut credentials = vec![];
    let entries =
        glob::glob(&pattern).with_context(|| format!("Invalid credential path {pattern}"))?;
    for entry in entries {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                log::warn!("Skipping unreadable credential entry: {e}");
                continue;
            }
        };
        match Credential::from_file(&path) {
            Ok(credential) if !names.insert(credential.name.clone()) => {
                log::warn!(
                    "Skipping {}: credential name {} already in use",
                    path.display(),
                    credential.name
                );
            }
            Ok(credential) => credentials.push(credential),
            Err(e) => log::warn!("Skipping credential file: {e:#}"),
        }
    }

    if credentials.is_empty() {
        return Err(CrawlError::NoCredentials(dir.display().to_string()).into());
    }
    log::debug!("Loaded {} credentials from {}", credentials.len(), dir.display());
    Ok(credentials)
}

#[derive(Debug)]
pub struct CredentialPool {
    credentials: Vec<Credential>,
    active: usize,
}

impl CredentialPool {
    /// Rate limits are tracked by name: unnamed credentials and repeated
    /// names are dropped with a warning.
    pub fn new(credentials: Vec<Credential>) -> Result<Self, CrawlError> {
        let mut names = HashSet::new();
        let credentials: Vec<_> = credentials
            .into_iter()
            .filter(|credential| {
                if credential.name.trim().is_empty() {
                    log::warn!("Ignoring a credential without a name");
                    false
                } else if !names.insert(credential.name.clone()) {
                    log::warn!("Ignoring another credential named {}", credential.name);
                    false
                } else {
                    true
                }
            })
            .collect();
        if credentials.is_empty() {
            return Err(CrawlError::NoCredentials(String::from("an empty credential list")));
        }
        Ok(Self {
            credentials,
            active: 0,
        })
    }

    pub fn active(&self) -> &Credential {
        &self.credentials[self.active]
    }

    pub fn credentials(&self) -> &[Credential] {
        &self.credentials
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn activate(&mut self, idx: usize) -> &Credential {
        if idx < self.credentials.len() {
            self.active = idx;
        }
        self.active()
    }

    /// Index of the credential with the most `category` headroom, other than
    /// the active one, or `None` when waiting is the only option.
    ///
    /// Costs one status call per candidate. Every reading is recorded in the
    /// governor so a switch does not need to check again.
    pub async fn best_candidate<B: Backend>(
        &self,
        backend: &mut B,
        governor: &mut RateGovernor,
        category: Category,
        now: DateTime<Utc>,
    ) -> Option<usize> {
        let headroom = governor.config().headroom;
        let current = self.active();
        let mut best: Option<(usize, u32)> = None;

        for (idx, candidate) in self.credentials.iter().enumerate() {
            if idx == self.active || candidate.same_keys(current) {
                continue;
            }
            if !governor.status_budget_left(&candidate.name, now) {
                log::debug!("No status calls left to check credential {}", candidate.name);
                continue;
            }

            governor.note_status_call(&candidate.name, now);
            let quota = match backend.authoritative_quota(candidate, category).await {
                Ok(quota) => quota,
                Err(e) => {
                    log::warn!("Skipping credential {}: {e}", candidate.name);
                    continue;
                }
            };
            governor.record(&candidate.name, category, quota, now);

            let remaining = governor.remaining(&candidate.name, category).unwrap_or(0);
            if quota.limit > 0 && remaining >= quota.limit {
                return Some(idx);
            }
            if remaining < headroom {
                continue;
            }
            if best.map_or(true, |(_, most)| remaining > most) {
                best = Some((idx, remaining));
            }
        }

        best.map(|(idx, _)| idx)
    }
}

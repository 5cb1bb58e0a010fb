use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::backend::{
    Backend, Category, EdgeKind, FetchError, Identifier, Post, ProfileRecord, Quota, TimelineRange,
};
use crate::config::ApiConfig;
use crate::credentials::Credential;

/// REST client for the social network API.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(api: &ApiConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::ClientBuilder::new()
            .gzip(true)
            .deflate(true)
            .user_agent(&api.user_agent)
            .timeout(Duration::from_secs(api.timeout_secs));
        if let Some(proxy) = &api.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy.as_str())?);
        }
        let client = builder.build()?;
        Ok(Self {
            client,
            base_url: api.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        credential: &Credential,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let url = format!("{}{path}", self.base_url);
        log::trace!("GET {url} {query:?}");

        let resp = self
            .client
            .get(&url)
            .bearer_auth(&credential.access_token)
            .query(query)
            .send()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<T>()
                .await
                .map_err(|e| FetchError::Transient(format!("Invalid response from {url}: {e}")));
        }
        let headers = resp.headers().clone();
        let body = resp.text().await.unwrap_or_default();
        Err(classify(status, &headers, body))
    }
}

/// Maps a failed response to what the crawler does about it.
fn classify(status: StatusCode, headers: &HeaderMap, body: String) -> FetchError {
    match status {
        StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => FetchError::NotFound,
        StatusCode::UNAUTHORIZED => FetchError::Unauthorized(body),
        StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited {
            retry_after: headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        },
        status => FetchError::Transient(format!("HTTP {status}: {body}")),
    }
}

fn timeline_query(range: TimelineRange) -> Vec<(&'static str, String)> {
    [("since", range.since), ("until", range.until)]
        .into_iter()
        .filter_map(|(key, date)| Some((key, date?.format("%Y-%m-%d").to_string())))
        .collect()
}

#[derive(Deserialize)]
struct RateLimitStatus {
    remaining: u32,
    limit: u32,
    #[serde(with = "chrono::serde::ts_seconds")]
    reset: DateTime<Utc>,
}

impl Backend for HttpBackend {
    async fn fetch_profile(
        &mut self,
        credential: &Credential,
        id: &Identifier,
    ) -> Result<ProfileRecord, FetchError> {
        let path = match id {
            Identifier::Id(id) => format!("/users/{id}"),
            Identifier::Handle(handle) => format!("/users/by-handle/{handle}"),
        };
        self.get(credential, &path, &[]).await
    }

    async fn fetch_edges(
        &mut self,
        credential: &Credential,
        id: u64,
        kind: EdgeKind,
        limit: Option<usize>,
    ) -> Result<Vec<u64>, FetchError> {
        let path = format!("/users/{id}/{}", kind.as_str());
        let query: Vec<_> = limit.map(|n| ("limit", n.to_string())).into_iter().collect();
        self.get(credential, &path, &query).await
    }

    async fn fetch_timeline(
        &mut self,
        credential: &Credential,
        id: u64,
        range: TimelineRange,
    ) -> Result<Vec<Post>, FetchError> {
        let path = format!("/users/{id}/timeline");
        self.get(credential, &path, &timeline_query(range)).await
    }

    async fn authoritative_quota(
        &mut self,
        credential: &Credential,
        category: Category,
    ) -> Result<Quota, FetchError> {
        let path = format!("/rate-limit/{}", category.as_str());
        let status: RateLimitStatus = self.get(credential, &path, &[]).await?;
        Ok(Quota {
            remaining: status.remaining,
            limit: status.limit,
            reset: status.reset,
        })
    }
}

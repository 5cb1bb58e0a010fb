mod backend;
mod config;
mod crawler;
mod credentials;
mod error;
mod http;
mod limiter;
mod store;

pub mod quota;

pub use backend::{
    Backend, Category, EdgeKind, FetchError, Identifier, Post, ProfileRecord, Quota, TimelineRange,
};
pub use config::{
    ApiConfig, CollectionLimits, CrawlerConfig, EdgeCaps, OnError, Strategy, ThrottleConfig,
};
pub use crawler::{crawl_network, CrawlReport, Crawler, KeepAll, Outcome, RelevanceFilter};
pub use credentials::{load_credentials, Credential, CredentialPool};
pub use error::CrawlError;
pub use http::HttpBackend;
pub use limiter::{Clock, Decision, ManualClock, Pacer, RateGovernor, SystemClock, Window};
pub use store::{
    FrontierState, FrontierStore, GrowthKind, HopGrowth, LoadOrigin, Loaded, StoredProfile,
    VisitedEntry,
};

pub use anyhow;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use std::fmt;
use tracing::{debug, instrument, warn};

use crate::config::Config;

pub mod model;

pub use model::{AssetRef, PageExport, PageSummary, ProjectInfo, ProjectSummary};
use model::{Envelope, STATUS_ERROR, STATUS_FOUND};

pub const GET_PROJECTS_LIST: &str = "v1/getprojectslist";
pub const GET_PROJECT_INFO: &str = "v1/getproject";
pub const GET_PAGES_LIST: &str = "v1/getpageslist";
pub const GET_PAGE_EXPORT: &str = "v1/getpageexport";

/// Read-only client for the Tilda API. Every call is a GET carrying the
/// public/secret key pair as query parameters.
#[derive(Clone)]
pub struct TildaClient {
    http: Client,
    base_url: Url,
    public_key: String,
    secret_key: String,
}

impl fmt::Debug for TildaClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TildaClient")
            .field("base_url", &self.base_url)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// The part of the API the synchronizer depends on.
#[async_trait]
pub trait TildaService: Send + Sync {
    /// Pages of a project, in API order. `None` when the API reported an error.
    async fn list_pages(&self, project_id: i64) -> Result<Option<Vec<PageSummary>>>;

    /// Full export of one page. `None` when the API reported an error.
    async fn fetch_page(&self, page_id: i64) -> Result<Option<PageExport>>;
}

impl TildaClient {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.tilda.base_url).context("invalid tilda.base_url")?;
        Self::with_base_url(
            cfg.tilda.public_key.clone(),
            cfg.tilda.secret_key.clone(),
            base_url,
        )
    }

    pub fn with_base_url(public_key: String, secret_key: String, base_url: Url) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("tilda-mirror/", env!("CARGO_PKG_VERSION")))
            .no_proxy()
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base_url,
            public_key,
            secret_key,
        })
    }

    pub fn build_request(&self, endpoint: &str, params: &[(&str, String)]) -> Result<reqwest::Request> {
        let url = self
            .base_url
            .join(endpoint)
            .context("invalid Tilda base URL")?;
        self.http
            .get(url)
            .query(&[
                ("publickey", self.public_key.as_str()),
                ("secretkey", self.secret_key.as_str()),
            ])
            .query(params)
            .build()
            .context("failed to build Tilda request")
    }

    /// Perform one call and unwrap the `{status, result}` envelope. API-level
    /// errors are logged and come back as `Ok(None)`; transport failures and
    /// undecodable payloads are `Err`.
    async fn call<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<Option<T>> {
        let request = self.build_request(endpoint, params)?;
        debug!(endpoint, ?params, "tilda api request");

        let res = self
            .http
            .execute(request)
            .await
            .with_context(|| format!("failed to reach Tilda ({})", endpoint))?;
        let status = res.status();
        let body = res
            .text()
            .await
            .with_context(|| format!("failed to read Tilda response ({})", endpoint))?;

        let envelope = match serde_json::from_str::<Envelope>(&body) {
            Ok(envelope) => envelope,
            Err(err) if !status.is_success() => {
                warn!(endpoint, %status, ?err, "tilda api http error");
                return Ok(None);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("invalid Tilda response JSON ({})", endpoint))
            }
        };

        match envelope.status.as_str() {
            STATUS_FOUND if status.is_success() => {
                let Some(result) = envelope.result else {
                    warn!(endpoint, "tilda api returned FOUND without a result");
                    return Ok(None);
                };
                let parsed = serde_json::from_value(result)
                    .with_context(|| format!("unexpected Tilda payload ({})", endpoint))?;
                Ok(Some(parsed))
            }
            STATUS_ERROR => {
                warn!(
                    endpoint,
                    %status,
                    message = envelope.message.as_deref().unwrap_or(""),
                    "tilda api error"
                );
                Ok(None)
            }
            other => {
                warn!(endpoint, %status, api_status = other, "tilda api unexpected status");
                Ok(None)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn list_projects(&self) -> Result<Option<Vec<ProjectSummary>>> {
        self.call(GET_PROJECTS_LIST, &[]).await
    }

    #[instrument(skip(self))]
    pub async fn project_info(&self, project_id: i64) -> Result<Option<ProjectInfo>> {
        self.call(GET_PROJECT_INFO, &[("projectid", project_id.to_string())])
            .await
    }

    #[instrument(skip(self))]
    pub async fn list_pages(&self, project_id: i64) -> Result<Option<Vec<PageSummary>>> {
        self.call(GET_PAGES_LIST, &[("projectid", project_id.to_string())])
            .await
    }

    #[instrument(skip(self))]
    pub async fn fetch_page(&self, page_id: i64) -> Result<Option<PageExport>> {
        self.call(GET_PAGE_EXPORT, &[("pageid", page_id.to_string())])
            .await
    }
}

#[async_trait]
impl TildaService for TildaClient {
    async fn list_pages(&self, project_id: i64) -> Result<Option<Vec<PageSummary>>> {
        TildaClient::list_pages(self, project_id).await
    }

    async fn fetch_page(&self, page_id: i64) -> Result<Option<PageExport>> {
        TildaClient::fetch_page(self, page_id).await
    }
}

use arena_core::config::RestConfig;
use arena_core::records::{Hub, Identity, MatchRecord, Tournament, User};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::error::RestError;
use crate::models::{Page, Ticket};

/// Thin typed wrapper over the platform's REST API. Missing records
/// come back as `Ok(None)`, never as an error.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: String,
}

impl RestClient {
    pub fn new(config: &RestConfig) -> Result<Self, RestError> {
        // relative joins drop the last path segment of a slash-less base
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url =
            Url::parse(&base).map_err(|error| RestError::BadUrl(error.to_string()))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            api_key: config.api_key.clone(),
        })
    }

    pub async fn hub(&self, id: &str) -> Result<Option<Hub>, RestError> {
        self.get_json(&format!("hubs/{id}")).await
    }

    pub async fn match_record(&self, id: &str) -> Result<Option<MatchRecord>, RestError> {
        self.get_json(&format!("matches/{id}")).await
    }

    pub async fn user(&self, id: &str) -> Result<Option<User>, RestError> {
        self.get_json(&format!("users/{id}")).await
    }

    pub async fn tournament(&self, id: &str) -> Result<Option<Tournament>, RestError> {
        self.get_json(&format!("tournaments/{id}")).await
    }

    /// The identity behind the configured API key.
    pub async fn identity(&self) -> Result<Option<Identity>, RestError> {
        self.get_json("me").await
    }

    pub async fn hub_matches(
        &self,
        hub_id: &str,
        start: usize,
        limit: usize,
    ) -> Result<Page<MatchRecord>, RestError> {
        self.get_page(&format!("hubs/{hub_id}/matches"), start, limit)
            .await
    }

    pub async fn match_tickets(
        &self,
        match_id: &str,
        start: usize,
        limit: usize,
    ) -> Result<Page<Ticket>, RestError> {
        self.get_page(&format!("matches/{match_id}/tickets"), start, limit)
            .await
    }

    /// Walk a hub's matches across pages until the listing runs dry.
    pub async fn all_hub_matches(
        &self,
        hub_id: &str,
        page_size: usize,
    ) -> Result<Vec<MatchRecord>, RestError> {
        let mut collected = Vec::new();
        let mut start = 0;
        loop {
            let page = self.hub_matches(hub_id, start, page_size).await?;
            let next = page.next_start();
            collected.extend(page.items);
            match next {
                Some(offset) if offset > start => start = offset,
                _ => return Ok(collected),
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, RestError> {
        let url = self.join(path)?;
        debug!(%url, "rest fetch");
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|error| RestError::Http(error.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(RestError::Status(response.status().as_u16()));
        }
        response
            .json()
            .await
            .map(Some)
            .map_err(|error| RestError::Decode(error.to_string()))
    }

    async fn get_page<T: DeserializeOwned>(
        &self,
        path: &str,
        start: usize,
        limit: usize,
    ) -> Result<Page<T>, RestError> {
        let mut url = self.join(path)?;
        url.query_pairs_mut()
            .append_pair("offset", &start.to_string())
            .append_pair("limit", &limit.to_string());

        let response = self
            .http
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|error| RestError::Http(error.to_string()))?;
        if !response.status().is_success() {
            return Err(RestError::Status(response.status().as_u16()));
        }
        response
            .json()
            .await
            .map_err(|error| RestError::Decode(error.to_string()))
    }

    fn join(&self, path: &str) -> Result<Url, RestError> {
        self.base_url
            .join(path)
            .map_err(|error| RestError::BadUrl(error.to_string()))
    }
}

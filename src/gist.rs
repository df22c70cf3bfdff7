//! [DocumentStore] backed by GitHub Gists.

use crate::error::Error;
use crate::store::{Container, DocumentStore, FileEntry, FilePatch, NewContainer};
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const GITHUB_API: &str = "https://api.github.com";

const ACCEPT_V3: &str = "application/vnd.github.v3+json";
const USER_AGENT: &str = concat!("pist/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

/// Gists client authorized with a personal access token (`gist` scope).
#[derive(Clone)]
pub struct GistStore {
    token: String,
    base_url: String,
    http: reqwest::Client,
}

impl GistStore {
    pub fn new(token: impl Into<String>) -> Result<Self, Error> {
        Ok(GistStore {
            token: token.into(),
            base_url: GITHUB_API.to_owned(),
            http: Self::client(Duration::from_secs(30))?,
        })
    }

    /// Use a different API root, ie. GitHub Enterprise (`https://host/api/v3`).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_owned();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, Error> {
        self.http = Self::client(timeout)?;
        Ok(self)
    }

    fn client(timeout: Duration) -> Result<reqwest::Client, Error> {
        Ok(reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?)
    }

    fn request(&self, method: Method, id: Option<&str>) -> RequestBuilder {
        let url = match id {
            Some(id) => format!("{}/gists/{}", self.base_url, id),
            None => format!("{}/gists", self.base_url),
        };
        let mut builder = self
            .http
            .request(method.clone(), url)
            .header(ACCEPT, ACCEPT_V3)
            .header(AUTHORIZATION, format!("token {}", self.token));
        if method == Method::GET {
            // API responses are cached for a while, which hides fresh answers from pollers
            let t = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis();
            builder = builder.query(&[("t", t.to_string())]);
        }
        builder
    }

    async fn send<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, Error> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::StoreStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response.json().await?)
    }
}

impl std::fmt::Debug for GistStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GistStore")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[async_trait]
impl DocumentStore for GistStore {
    async fn list(&self) -> Result<Vec<Container>, Error> {
        let builder = self
            .request(Method::GET, None)
            .query(&[("per_page", "100")]);
        Self::send(builder).await
    }

    async fn get(&self, container_id: &str) -> Result<Option<Container>, Error> {
        match Self::send(self.request(Method::GET, Some(container_id))).await {
            Ok(gist) => Ok(Some(gist)),
            Err(Error::StoreStatus { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                debug!("gist {} not found", container_id);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn create(&self, container: NewContainer) -> Result<String, Error> {
        let builder = self.request(Method::POST, None).json(&container);
        let created: Created = Self::send(builder).await?;
        debug!("created gist {}", created.id);
        Ok(created.id)
    }

    async fn update(&self, container_id: &str, patch: FilePatch) -> Result<String, Error> {
        let builder = self
            .request(Method::PATCH, Some(container_id))
            .json(&patch);
        let updated: Created = Self::send(builder).await?;
        Ok(updated.id)
    }

    async fn fetch_file(&self, file: &FileEntry) -> Result<Bytes, Error> {
        let response = self.http.get(&file.raw_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::StoreStatus {
                status: status.as_u16(),
                url: file.raw_url.clone(),
            });
        }
        Ok(response.bytes().await?)
    }
}

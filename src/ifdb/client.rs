use crate::incoming::config::IfdbConfig;
use anyhow::{Context, Result};
use reqwest::Url;
use reqwest::blocking::Client;
use std::time::Duration;

/// Known causes behind an `Error:` reply from the commit endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    InvalidCredential,
    NoPendingLink,
    PersistenceFailed,
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRejection {
    pub kind: RejectionKind,
    /// The reply line exactly as received.
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogReply {
    Ok,
    Rejected(RemoteRejection),
    Unexpected(String),
}

/// Interpret the first line of a commit reply.
pub fn parse_reply(first_line: &str) -> CatalogReply {
    let line = first_line.trim_end_matches(['\r', '\n']);
    if line.trim() == "OK" {
        return CatalogReply::Ok;
    }
    let Some(reason) = line.strip_prefix("Error: ") else {
        return CatalogReply::Unexpected(line.to_string());
    };
    let kind = if reason.starts_with("invalid API key") {
        RejectionKind::InvalidCredential
    } else if reason.starts_with("no link found") {
        RejectionKind::NoPendingLink
    } else if reason.starts_with("database update failed") {
        RejectionKind::PersistenceFailed
    } else {
        RejectionKind::Unrecognized
    };
    CatalogReply::Rejected(RemoteRejection {
        kind,
        line: line.to_string(),
    })
}

/// Tells the external catalog where a file ended up.
pub trait CatalogClient {
    /// One attempt; transport failures and non-2xx statuses are errors.
    fn commit(&self, external_id: &str, archive_path: &str) -> Result<CatalogReply>;
}

pub struct IfdbClient {
    http: Client,
    commit_url: String,
    api_key: String,
}

impl IfdbClient {
    pub fn new(cfg: &IfdbConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("failed to build IFDB http client")?;
        Ok(Self {
            http,
            commit_url: cfg.commit_url.clone(),
            api_key: cfg.api_key.clone(),
        })
    }

    fn commit_url(&self, external_id: &str, archive_path: &str) -> Result<Url> {
        Url::parse_with_params(
            &self.commit_url,
            [
                ("ifdbid", external_id),
                ("path", archive_path),
                ("key", self.api_key.as_str()),
            ],
        )
        .with_context(|| format!("invalid IFDB commit url: {}", self.commit_url))
    }
}

impl CatalogClient for IfdbClient {
    fn commit(&self, external_id: &str, archive_path: &str) -> Result<CatalogReply> {
        // reqwest errors carry the request url, and the url carries the key
        let url = self.commit_url(external_id, archive_path)?;
        let response = self
            .http
            .get(url)
            .send()
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("IFDB commit request for {archive_path} failed"))?;
        if !response.status().is_success() {
            anyhow::bail!("IFDB commit failed with status {}", response.status());
        }
        let body = response
            .text()
            .map_err(reqwest::Error::without_url)
            .context("failed to read IFDB commit reply")?;
        Ok(parse_reply(body.lines().next().unwrap_or("")))
    }
}

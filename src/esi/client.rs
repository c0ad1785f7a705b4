use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, AUTHORIZATION, ETAG, EXPIRES, IF_NONE_MATCH};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use super::error::EsiError;
use super::types::ContractItem;
use crate::config::EsiConfig;
use crate::engine::FetchOutcome;
use crate::owner::{Owner, OwnerDirectory, OwnerKind};

/// Cache lifetime assumed when a response carries no `Expires` header.
const DEFAULT_TTL_SECS: i64 = 300;

/// Authenticated ESI client. Tokens come from the owner directory per request.
#[derive(Clone)]
pub struct EsiClient {
  http: reqwest::Client,
  base_url: String,
  datasource: String,
  directory: Arc<dyn OwnerDirectory>,
}

struct Page {
  status: StatusCode,
  headers: HeaderMap,
  body: Vec<u8>,
}

impl EsiClient {
  pub fn new(config: &EsiConfig, directory: Arc<dyn OwnerDirectory>) -> Result<Self> {
    Url::parse(&config.base_url)
      .map_err(|e| eyre!("Invalid ESI base URL {}: {}", config.base_url, e))?;

    let http = reqwest::Client::builder()
      .user_agent(config.user_agent.clone())
      .timeout(std::time::Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url: config.base_url.clone(),
      datasource: config.datasource.clone(),
      directory,
    })
  }

  async fn get_page(
    &self,
    token: &str,
    path: &str,
    page: u32,
    etag: Option<&str>,
  ) -> Result<Page> {
    let url = build_url(&self.base_url, &self.datasource, path, page)?;

    let mut request = self
      .http
      .get(url)
      .header(AUTHORIZATION, format!("Bearer {}", token));
    if let Some(etag) = etag {
      request = request.header(IF_NONE_MATCH, etag);
    }

    let transport = |source| EsiError::Transport {
      endpoint: path.to_string(),
      source,
    };
    let response = request.send().await.map_err(transport)?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await.map_err(transport)?.to_vec();

    if !status.is_success() && status != StatusCode::NOT_MODIFIED {
      return Err(EsiError::from_response(path, status.as_u16(), &body).into());
    }

    Ok(Page {
      status,
      headers,
      body,
    })
  }

  /// Fetch every page of a collection endpoint on behalf of `owner`.
  ///
  /// With `etag`, the first page is requested conditionally and a `304`
  /// becomes [`FetchOutcome::NotModified`]. Expiry and ETag come from the
  /// first page.
  pub async fn fetch_collection<T: DeserializeOwned>(
    &self,
    owner: &Owner,
    path: &str,
    etag: Option<&str>,
  ) -> Result<FetchOutcome<T>> {
    let token = self.directory.access_token(owner)?;

    let first = self.get_page(&token, path, 1, etag).await?;
    let expires_at = expires_at(&first.headers, Utc::now());
    let new_etag = header_string(&first.headers, ETAG.as_str());

    if first.status == StatusCode::NOT_MODIFIED {
      return Ok(FetchOutcome::NotModified {
        expires_at,
        etag: new_etag.or_else(|| etag.map(str::to_string)),
      });
    }

    let pages = page_count(&first.headers);
    let mut records: Vec<T> = decode(path, &first.body)?;
    for page in 2..=pages {
      let next = self.get_page(&token, path, page, None).await?;
      records.extend(decode::<Vec<T>>(path, &next.body)?);
    }

    debug!(path, owner = %owner.key(), pages, records = records.len(), "Fetched");
    Ok(FetchOutcome::Modified {
      records,
      expires_at,
      etag: new_etag,
    })
  }

  /// Line items of one contract, fetched with the credentials of `owner`.
  pub async fn fetch_contract_items(
    &self,
    owner: &Owner,
    contract_id: i64,
  ) -> Result<Vec<ContractItem>> {
    let path = match owner.kind {
      OwnerKind::Character => format!("/characters/{}/contracts/{}/items/", owner.id, contract_id),
      OwnerKind::Corporation => {
        format!("/corporations/{}/contracts/{}/items/", owner.id, contract_id)
      }
    };

    let token = self.directory.access_token(owner)?;
    let page = self.get_page(&token, &path, 1, None).await?;
    decode(&path, &page.body)
  }
}

fn build_url(base_url: &str, datasource: &str, path: &str, page: u32) -> Result<Url> {
  let mut url = Url::parse(&format!("{}{}", base_url.trim_end_matches('/'), path))
    .map_err(|e| eyre!("Invalid ESI URL for {}: {}", path, e))?;
  url
    .query_pairs_mut()
    .append_pair("datasource", datasource);
  if page > 1 {
    url
      .query_pairs_mut()
      .append_pair("page", &page.to_string());
  }
  Ok(url)
}

fn decode<T: DeserializeOwned>(path: &str, body: &[u8]) -> Result<T> {
  serde_json::from_slice(body).map_err(|source| {
    EsiError::Decode {
      endpoint: path.to_string(),
      source,
    }
    .into()
  })
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
  headers
    .get(name)
    .and_then(|v| v.to_str().ok())
    .map(str::to_string)
}

/// Absolute expiry from the `Expires` header, or a short default.
fn expires_at(headers: &HeaderMap, now: DateTime<Utc>) -> DateTime<Utc> {
  header_string(headers, EXPIRES.as_str())
    .and_then(|v| DateTime::parse_from_rfc2822(&v).ok())
    .map(|t| t.with_timezone(&Utc))
    .unwrap_or_else(|| now + Duration::seconds(DEFAULT_TTL_SECS))
}

fn page_count(headers: &HeaderMap) -> u32 {
  header_string(headers, "x-pages")
    .and_then(|v| v.trim().parse::<u32>().ok())
    .unwrap_or(1)
    .max(1)
}

//! Remote collection sources: where fetch functions get their rows.

use std::fmt;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{header, Client, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use crate::cache::Cacheable;
use crate::config::RemoteConfig;
use crate::error::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
  Eq,
  Gte,
  Lte,
  Is,
}

impl FilterOp {
  fn as_str(self) -> &'static str {
    match self {
      FilterOp::Eq => "eq",
      FilterOp::Gte => "gte",
      FilterOp::Lte => "lte",
      FilterOp::Is => "is",
    }
  }
}

/// A server-side row filter, rendered as `column=op.value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
  pub column: String,
  pub op: FilterOp,
  pub value: String,
}

impl fmt::Display for Filter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}={}.{}", self.column, self.op.as_str(), self.value)
  }
}

/// What to read from the remote: one table, some filters, an ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRequest {
  pub table: String,
  pub filters: Vec<Filter>,
  /// Column and descending flag
  pub order: Option<(String, bool)>,
}

impl CollectionRequest {
  pub fn new(table: impl Into<String>) -> Self {
    Self {
      table: table.into(),
      filters: Vec::new(),
      order: None,
    }
  }

  fn filter(mut self, column: impl Into<String>, op: FilterOp, value: impl Into<String>) -> Self {
    self.filters.push(Filter {
      column: column.into(),
      op,
      value: value.into(),
    });
    self
  }

  pub fn eq(self, column: impl Into<String>, value: impl Into<String>) -> Self {
    self.filter(column, FilterOp::Eq, value)
  }

  pub fn gte(self, column: impl Into<String>, value: impl Into<String>) -> Self {
    self.filter(column, FilterOp::Gte, value)
  }

  pub fn lte(self, column: impl Into<String>, value: impl Into<String>) -> Self {
    self.filter(column, FilterOp::Lte, value)
  }

  pub fn is_null(self, column: impl Into<String>) -> Self {
    self.filter(column, FilterOp::Is, "null")
  }

  /// Restrict to one branch when a branch is given.
  pub fn in_branch(self, branch: Option<&str>) -> Self {
    match branch {
      Some(branch) => self.eq("branch_id", branch),
      None => self,
    }
  }

  pub fn order_by(mut self, column: impl Into<String>, descending: bool) -> Self {
    self.order = Some((column.into(), descending));
    self
  }

  /// Query string pairs for one page of this request.
  pub fn query_pairs(&self, limit: usize, offset: usize) -> Vec<(String, String)> {
    let mut pairs = vec![("select".to_string(), "*".to_string())];
    for filter in &self.filters {
      pairs.push((
        filter.column.clone(),
        format!("{}.{}", filter.op.as_str(), filter.value),
      ));
    }
    if let Some((column, descending)) = &self.order {
      let direction = if *descending { "desc" } else { "asc" };
      pairs.push(("order".to_string(), format!("{}.{}", column, direction)));
    }
    pairs.push(("limit".to_string(), limit.to_string()));
    pairs.push(("offset".to_string(), offset.to_string()));
    pairs
  }
}

/// Anything that can produce the rows of a collection.
pub trait CollectionSource: Clone + Send + Sync + 'static {
  fn fetch_collection<T: Cacheable>(
    &self,
    request: CollectionRequest,
  ) -> BoxFuture<'static, Result<Vec<T>, FetchError>>;
}

/// Bind a source and a request into a reusable fetch function.
pub fn fetcher<S, T>(
  source: S,
  request: CollectionRequest,
) -> impl Fn() -> BoxFuture<'static, Result<Vec<T>, FetchError>> + Send + Sync + 'static
where
  S: CollectionSource,
  T: Cacheable,
{
  move || source.fetch_collection(request.clone())
}

/// PostgREST-style HTTP source (`GET {base}/rest/v1/{table}?col=op.value`).
///
/// Clone is cheap; `reqwest::Client` shares its connection pool.
#[derive(Clone)]
pub struct RestSource {
  client: Client,
  base_url: Url,
  api_key: String,
  page_size: usize,
}

impl RestSource {
  pub fn new(config: &RemoteConfig, api_key: String) -> Result<Self> {
    if config.url.is_empty() {
      return Err(eyre!("No remote URL configured. Set remote.url in the config file."));
    }

    let mut base_url =
      Url::parse(&config.url).map_err(|e| eyre!("Invalid remote URL {}: {}", config.url, e))?;
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }

    let client = Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      api_key,
      page_size: config.page_size.max(1),
    })
  }

  fn table_url(&self, table: &str) -> Result<Url, FetchError> {
    self
      .base_url
      .join(&format!("rest/v1/{}", table))
      .map_err(|e| FetchError::fatal(format!("Invalid table URL for {}: {}", table, e)))
  }

  /// Read every page of `request`.
  pub async fn fetch_all<T: DeserializeOwned>(
    &self,
    request: &CollectionRequest,
  ) -> Result<Vec<T>, FetchError> {
    let url = self.table_url(&request.table)?;
    let mut rows = Vec::new();
    let mut offset = 0;

    loop {
      let response = self
        .client
        .get(url.clone())
        .query(&request.query_pairs(self.page_size, offset))
        .header("apikey", &self.api_key)
        .header(header::ACCEPT, "application/json")
        .bearer_auth(&self.api_key)
        .send()
        .await
        .map_err(classify_transport)?;

      let response = check_response(response).await?;
      let page: Vec<T> = response.json().await.map_err(classify_transport)?;

      let count = page.len();
      rows.extend(page);
      if count < self.page_size {
        break;
      }
      offset += count;
    }

    debug!(table = %request.table, rows = rows.len(), "Fetched collection");
    Ok(rows)
  }
}

impl CollectionSource for RestSource {
  fn fetch_collection<T: Cacheable>(
    &self,
    request: CollectionRequest,
  ) -> BoxFuture<'static, Result<Vec<T>, FetchError>> {
    let source = self.clone();
    async move { source.fetch_all(&request).await }.boxed()
  }
}

async fn check_response(response: Response) -> Result<Response, FetchError> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }
  let body = response.text().await.unwrap_or_default();
  warn!(status = status.as_u16(), "Remote request failed");
  Err(FetchError::from_status(status.as_u16(), &body))
}

fn classify_transport(err: reqwest::Error) -> FetchError {
  if let Some(status) = err.status() {
    return FetchError::from_status(status.as_u16(), &err.to_string());
  }
  if err.is_timeout() || err.is_connect() || err.is_request() {
    FetchError::transient(err.to_string())
  } else if err.is_decode() {
    FetchError::fatal(format!("Malformed response: {}", err))
  } else {
    FetchError::from_message(err.to_string())
  }
}


#[cfg(test)]
mod tests {
  use super::testing::StubSource;
  use super::*;
  use crate::models::Customer;
  use serde_json::json;

  #[test]
  fn test_query_pairs() {
    let request = CollectionRequest::new("attendance_records")
      .eq("employee_id", "e1")
      .gte("attendance_date", "2024-01-01")
      .order_by("attendance_date", true);

    let pairs = request.query_pairs(100, 200);
    assert_eq!(
      pairs,
      vec![
        ("select".to_string(), "*".to_string()),
        ("employee_id".to_string(), "eq.e1".to_string()),
        ("attendance_date".to_string(), "gte.2024-01-01".to_string()),
        ("order".to_string(), "attendance_date.desc".to_string()),
        ("limit".to_string(), "100".to_string()),
        ("offset".to_string(), "200".to_string()),
      ]
    );
  }

  #[test]
  fn test_branch_scoping() {
    let scoped = CollectionRequest::new("customers").in_branch(Some("b1"));
    assert_eq!(scoped.filters[0].to_string(), "branch_id=eq.b1");
    assert!(CollectionRequest::new("customers")
      .in_branch(None)
      .filters
      .is_empty());
    assert_eq!(
      CollectionRequest::new("lats_product_variants")
        .is_null("parent_variant_id")
        .filters[0]
        .to_string(),
      "parent_variant_id=is.null"
    );
  }

  #[test]
  fn test_rest_source_requires_url() {
    assert!(RestSource::new(&RemoteConfig::default(), "key".into()).is_err());

    let config = RemoteConfig {
      url: "https://pos.example.com/api".into(),
      ..RemoteConfig::default()
    };
    let source = RestSource::new(&config, "key".into()).unwrap();
    assert_eq!(
      source.table_url("customers").unwrap().as_str(),
      "https://pos.example.com/api/rest/v1/customers"
    );
  }

  #[tokio::test]
  async fn test_fetcher_applies_filters() {
    let source = StubSource::new();
    source.set_rows(
      "customers",
      vec![
        json!({"id": "c1", "name": "Amina", "branch_id": "b1"}),
        json!({"id": "c2", "name": "Baraka", "branch_id": "b2"}),
      ],
    );

    let fetch = fetcher::<_, Customer>(
      source.clone(),
      CollectionRequest::new("customers").in_branch(Some("b2")),
    );
    let rows = fetch().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, "c2");
    assert_eq!(source.calls(), 1);
  }
}

//! Search index gateway.
//!
//! The index holds an eventually consistent projection of user records and
//! is only ever updated after the primary store accepted a write.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cluster::Row;
use common::config::SearchConfig;
use dashmap::DashMap;
use reqwest::{Client, StatusCode, Url};
use serde_json::json;

use crate::error::{IdentityError, IdentityResult};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Partially update document `id` of `index` with `fields`.
    ///
    /// Resolves to `true` once the index acknowledged the update and to
    /// `false` when the document does not exist.
    async fn update(&self, index: &str, id: &str, fields: &Row) -> IdentityResult<bool>;
}

/// Build the index gateway named by `config.url`.
pub fn from_config(config: &SearchConfig) -> IdentityResult<Arc<dyn SearchIndex>> {
    if config.url.starts_with("memory://") {
        log::info!("Using in-memory search index");
        return Ok(Arc::new(InMemorySearchIndex::new()));
    }
    let index = ElasticsearchIndex::new(&config.url, config.timeout)?;
    log::info!("Using Elasticsearch at {}", config.url);
    Ok(Arc::new(index))
}

/// Elasticsearch over its REST API.
#[derive(Debug, Clone)]
pub struct ElasticsearchIndex {
    client: Client,
    base_url: Url,
}

impl ElasticsearchIndex {
    pub fn new(url: &str, timeout: Duration) -> IdentityResult<Self> {
        let base_url = Url::parse(url)
            .map_err(|e| IdentityError::InvalidRequest(format!("invalid search url {url}: {e}")))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(IdentityError::InvalidRequest(format!(
                "unsupported search url scheme: {url}"
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IdentityError::Server(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, base_url })
    }

    fn update_url(&self, index: &str, id: &str) -> IdentityResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| IdentityError::Server(format!("cannot extend url {}", self.base_url)))?
            .pop_if_empty()
            .push(index)
            .push("_update")
            .push(id);
        Ok(url)
    }
}

#[async_trait]
impl SearchIndex for ElasticsearchIndex {
    async fn update(&self, index: &str, id: &str, fields: &Row) -> IdentityResult<bool> {
        let url = self.update_url(index, id)?;
        let response = self
            .client
            .post(url)
            .json(&json!({ "doc": fields }))
            .send()
            .await
            .map_err(|e| IdentityError::Server(format!("index update failed: {e}")))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(IdentityError::Server(format!(
                    "index update returned {status}: {body}"
                )))
            }
        }
    }
}

/// Index kept in process memory, for tests and single-node setups.
#[derive(Debug, Default)]
pub struct InMemorySearchIndex {
    documents: DashMap<(String, String), Row>,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, index: &str, id: &str, document: Row) {
        self.documents
            .insert((index.to_string(), id.to_string()), document);
    }

    pub fn document(&self, index: &str, id: &str) -> Option<Row> {
        self.documents
            .get(&(index.to_string(), id.to_string()))
            .map(|doc| doc.value().clone())
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn update(&self, index: &str, id: &str, fields: &Row) -> IdentityResult<bool> {
        let Some(mut document) = self
            .documents
            .get_mut(&(index.to_string(), id.to_string()))
        else {
            return Ok(false);
        };
        for (field, value) in fields {
            document.insert(field.clone(), value.clone());
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster::row;
    use serde_json::Value;

    #[tokio::test]
    async fn test_in_memory_update_merges_fields() {
        let index = InMemorySearchIndex::new();
        index.insert(
            "user",
            "u1",
            row([("maskedEmail", json!("a***@x.com")), ("flagsValue", json!(3))]),
        );

        let acknowledged = index
            .update("user", "u1", &row([("maskedEmail", Value::Null), ("flagsValue", json!(1))]))
            .await
            .unwrap();
        assert!(acknowledged);

        let doc = index.document("user", "u1").unwrap();
        assert_eq!(doc.get("maskedEmail"), Some(&Value::Null));
        assert_eq!(doc.get("flagsValue"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_in_memory_update_of_missing_document() {
        let index = InMemorySearchIndex::new();
        assert!(!index.update("user", "nobody", &Row::new()).await.unwrap());
        assert!(index.document("user", "nobody").is_none());
    }

    #[test]
    fn test_update_url_escapes_segments() {
        let es = ElasticsearchIndex::new("http://es:9200/", Duration::from_secs(1)).unwrap();
        let url = es.update_url("user", "a/b c").unwrap();
        assert_eq!(url.as_str(), "http://es:9200/user/_update/a%2Fb%20c");

        let prefixed = ElasticsearchIndex::new("https://proxy/es", Duration::from_secs(1)).unwrap();
        assert_eq!(
            prefixed.update_url("user", "u1").unwrap().as_str(),
            "https://proxy/es/user/_update/u1"
        );
    }

    #[test]
    fn test_from_config_rejects_unknown_scheme() {
        let config = SearchConfig {
            url: "ftp://index".to_string(),
            ..SearchConfig::default()
        };
        assert!(matches!(
            from_config(&config),
            Err(IdentityError::InvalidRequest(_))
        ));
        assert!(from_config(&SearchConfig::default()).is_ok());
    }
}

use crate::errors::{AppError, AppResult};
use crate::models::{QueryCatalogEntry, QueryDescriptor};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type FetchFuture = Pin<Box<dyn Future<Output = AppResult<serde_json::Value>> + Send>>;
type Fetcher = Arc<dyn Fn(serde_json::Value) -> FetchFuture + Send + Sync>;

pub trait QueryParams: DeserializeOwned + Send + 'static {
    fn validate(&self) -> AppResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoParams {}

impl QueryParams for NoParams {}

#[derive(Clone)]
struct RegistryEntry {
    tables: Vec<String>,
    fetch: Fetcher,
}

#[derive(Clone, Default)]
pub struct QueryRegistry {
    entries: BTreeMap<String, RegistryEntry>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P, F, Fut>(&mut self, query_id: &str, tables: &[&str], fetch: F) -> AppResult<()>
    where
        P: QueryParams,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<serde_json::Value>> + Send + 'static,
    {
        if self.entries.contains_key(query_id) {
            return Err(AppError::Internal(format!("query registered twice: {}", query_id)));
        }

        let mut ordered_tables: Vec<String> = Vec::with_capacity(tables.len());
        for table in tables {
            if !ordered_tables.iter().any(|existing| existing == table) {
                ordered_tables.push((*table).to_string());
            }
        }

        let id = query_id.to_string();
        let fetcher: Fetcher = Arc::new(move |params: serde_json::Value| -> FetchFuture {
            let parsed = serde_json::from_value::<P>(params)
                .map_err(|error| AppError::InvalidParams(format!("{}: {}", id, error)))
                .and_then(|params| params.validate().map(|_| params));
            match parsed {
                Ok(params) => Box::pin(fetch(params)),
                Err(error) => Box::pin(async move { Err(error) }),
            }
        });

        self.entries.insert(
            query_id.to_string(),
            RegistryEntry {
                tables: ordered_tables,
                fetch: fetcher,
            },
        );
        Ok(())
    }

    pub fn is_query_registered(&self, query_id: &str) -> bool {
        self.entries.contains_key(query_id)
    }

    pub fn tables_for(&self, query_id: &str) -> Vec<String> {
        self.entries
            .get(query_id)
            .map(|entry| entry.tables.clone())
            .unwrap_or_default()
    }

    pub fn query_ids(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn catalog(&self) -> Vec<QueryCatalogEntry> {
        self.entries
            .iter()
            .map(|(query_id, entry)| QueryCatalogEntry {
                query_id: query_id.clone(),
                tables: entry.tables.clone(),
            })
            .collect()
    }

    pub fn resolve_query(&self, query_id: &str, params: serde_json::Value) -> FetchFuture {
        let Some(entry) = self.entries.get(query_id) else {
            tracing::debug!(query_id = %query_id, "rejecting unknown query");
            let error = AppError::UnknownQuery(query_id.to_string());
            return Box::pin(async move { Err(error) });
        };

        let params = match params {
            serde_json::Value::Null => serde_json::json!({}),
            serde_json::Value::Object(map) => serde_json::Value::Object(map),
            other => {
                let error = AppError::InvalidParams(format!(
                    "{}: params must be an object, got {}",
                    query_id,
                    json_kind(&other)
                ));
                return Box::pin(async move { Err(error) });
            }
        };

        (entry.fetch)(params)
    }

    pub async fn resolve(&self, query_id: &str, params: serde_json::Value) -> AppResult<serde_json::Value> {
        self.resolve_query(query_id, params).await
    }
}

pub trait QueryClient: Send + Sync {
    fn fetch(&self, descriptor: &QueryDescriptor) -> FetchFuture;
}

impl QueryClient for QueryRegistry {
    fn fetch(&self, descriptor: &QueryDescriptor) -> FetchFuture {
        self.resolve_query(&descriptor.query_id, descriptor.params_json())
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

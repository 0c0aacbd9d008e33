//! GraphQL document store client
//!
//! Thin typed wrapper over the store's HTTP surface: a GraphQL endpoint for
//! queries and mutations, a plain-text endpoint for schema DDL, and a
//! health check. Mutations follow the store's naming convention:
//! `create_<Collection>`, `update_<Collection>(docID, input)`,
//! `delete_<Collection>(docID)`, `upsert_<Collection>(filter, create, update)`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::StoreError;

const GRAPHQL_PATH: &str = "/api/v0/graphql";
const SCHEMA_PATH: &str = "/api/v0/schema";
const HEALTH_PATH: &str = "/health-check";

/// Response envelope returned by the GraphQL endpoint
#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<Value>,
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
    #[serde(default)]
    path: Option<Vec<Value>>,
}

/// Client for the document store's HTTP API
#[derive(Debug, Clone)]
pub struct GraphQlClient {
    base_url: String,
    http: reqwest::Client,
}

impl GraphQlClient {
    /// Create a client with the given request timeout
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Execute a GraphQL operation and return the `data` payload
    pub async fn execute(
        &self,
        query: &str,
        variables: Value,
        operation_name: Option<&str>,
    ) -> Result<Value, StoreError> {
        let url = format!("{}{}", self.base_url, GRAPHQL_PATH);
        let body = json!({
            "query": query,
            "variables": variables,
            "operationName": operation_name,
        });

        debug!(operation = ?operation_name, "Executing GraphQL operation");

        let response = self.http.post(&url).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Http { status, message });
        }

        let envelope: GraphQlResponse = response.json().await?;

        if let Some(errors) = envelope.errors
            && let Some(first) = errors.into_iter().next()
        {
            let path = first
                .path
                .map(|segments| {
                    segments
                        .iter()
                        .map(|s| s.as_str().map(String::from).unwrap_or_else(|| s.to_string()))
                        .collect::<Vec<_>>()
                        .join(".")
                })
                .unwrap_or_default();
            return Err(StoreError::Graphql {
                message: first.message,
                path,
            });
        }

        envelope
            .data
            .ok_or_else(|| StoreError::Malformed("response carried neither data nor errors".to_string()))
    }

    /// Apply schema DDL to the store (content-type text/plain)
    pub async fn apply_schema(&self, ddl: &str) -> Result<(), StoreError> {
        let url = format!("{}{}", self.base_url, SCHEMA_PATH);

        let response = self
            .http
            .post(&url)
            .header("content-type", "text/plain")
            .body(ddl.to_string())
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Http { status, message });
        }

        Ok(())
    }

    /// Check store health; Ok(()) when the store answers 200
    pub async fn health_check(&self) -> Result<(), StoreError> {
        let url = format!("{}{}", self.base_url, HEALTH_PATH);

        let response = self.http.get(&url).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(StoreError::Unhealthy(format!("health check returned {}", response.status())))
        }
    }

    /// Fetch all documents of a collection matching a filter expression
    pub async fn query_collection(
        &self,
        collection: &str,
        fields: &[&str],
        filter: Option<Value>,
    ) -> Result<Vec<Value>, StoreError> {
        let field_list = fields.join("\n");
        let query = match &filter {
            Some(_) => format!(
                "query($filter: {collection}FilterArg) {{ {collection}(filter: $filter) {{ _docID\n{field_list} }} }}"
            ),
            None => format!("query {{ {collection} {{ _docID\n{field_list} }} }}"),
        };
        let variables = match filter {
            Some(f) => json!({ "filter": f }),
            None => json!({}),
        };

        let data = self.execute(&query, variables, None).await?;
        let docs = data
            .get(collection)
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| StoreError::Malformed(format!("missing collection {collection} in response")))?;
        Ok(docs)
    }
}

/// Mutation surface the write sink needs. Kept as a trait so tests can
/// substitute an in-memory store.
#[async_trait]
pub trait StoreHandle: Send + Sync {
    /// Batched create. Returns one document per input, carrying `_docID`
    /// plus the requested return fields. The store may return them in any
    /// order when a return field identifies each document.
    async fn create_many(
        &self,
        collection: &str,
        docs: Vec<Value>,
        return_fields: &[String],
    ) -> Result<Vec<Value>, StoreError>;

    /// Update a single document by docID
    async fn update(&self, collection: &str, doc_id: &str, input: Value) -> Result<Value, StoreError>;

    /// Delete a single document by docID
    async fn delete(&self, collection: &str, doc_id: &str) -> Result<(), StoreError>;
}

#[async_trait]
impl StoreHandle for GraphQlClient {
    async fn create_many(
        &self,
        collection: &str,
        docs: Vec<Value>,
        return_fields: &[String],
    ) -> Result<Vec<Value>, StoreError> {
        let extra = return_fields.join("\n");
        let query = format!(
            "mutation($input: [{collection}MutationInputArg!]!) {{ \
             create_{collection}(input: $input) {{ _docID\n{extra} }} }}"
        );

        let data = self.execute(&query, json!({ "input": docs }), None).await?;
        let created = data
            .get(format!("create_{collection}"))
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| StoreError::Malformed(format!("create_{collection} returned no documents")))?;
        Ok(created)
    }

    async fn update(&self, collection: &str, doc_id: &str, input: Value) -> Result<Value, StoreError> {
        let query = format!(
            "mutation($docID: ID!, $input: {collection}MutationInputArg!) {{ \
             update_{collection}(docID: $docID, input: $input) {{ _docID }} }}"
        );

        let data = self
            .execute(&query, json!({ "docID": doc_id, "input": input }), None)
            .await?;
        data.get(format!("update_{collection}"))
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{collection}/{doc_id}")))
    }

    async fn delete(&self, collection: &str, doc_id: &str) -> Result<(), StoreError> {
        let query =
            format!("mutation($docID: ID!) {{ delete_{collection}(docID: $docID) {{ _docID }} }}");

        self.execute(&query, json!({ "docID": doc_id }), None).await?;
        Ok(())
    }
}

//! Minimal ksqlDB REST client.
//!
//! Used by the UNS-level grouping strategy (membership lookups, derived
//! stream management) and by the state query service (asset snapshots).
//! Only the three endpoints those need are wrapped:
//!
//! - `POST /query` for pull queries
//! - `POST /ksql` for statements (`CREATE`, `DROP`, `SHOW TABLES`)
//! - `GET /healthcheck`

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{Error, Result};

const KSQL_CONTENT_TYPE: &str = "application/vnd.ksql.v1+json";

/// Escape a value for inclusion in a single-quoted ksqlDB string literal.
pub fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// Rows returned by a pull query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Upper-cased column names, in schema order.
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    /// Values of one column across all rows.
    pub fn column(&self, name: &str) -> Vec<&Value> {
        let name = name.to_uppercase();
        match self.columns.iter().position(|c| *c == name) {
            Some(idx) => self.rows.iter().filter_map(|row| row.get(idx)).collect(),
            None => Vec::new(),
        }
    }

    /// Rows as JSON objects keyed by column name.
    pub fn records(&self) -> Vec<serde_json::Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
enum QueryFrame {
    Header { schema: String },
    Row { columns: Vec<Value> },
    FinalMessage(#[allow(dead_code)] String),
    ErrorMessage { message: String },
}

#[derive(Debug, Deserialize)]
struct KsqlError {
    message: Option<String>,
}

/// Extract the column names from a ksqlDB schema string such as
/// ``"`ASSET_UUID` STRING KEY, `UNS_LEVELS` MAP<STRING, STRING>"``.
fn parse_schema_columns(schema: &str) -> Vec<String> {
    let mut columns = Vec::new();
    let mut depth = 0usize;
    let mut in_name = false;
    let mut expecting_name = true;
    let mut current = String::new();

    for c in schema.chars() {
        match c {
            '`' if depth == 0 && expecting_name => {
                if in_name {
                    columns.push(current.to_uppercase());
                    current.clear();
                    expecting_name = false;
                }
                in_name = !in_name;
            }
            _ if in_name => current.push(c),
            '<' | '(' => depth += 1,
            '>' | ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => expecting_name = true,
            _ => {}
        }
    }
    columns
}

/// HTTP client for one ksqlDB server.
#[derive(Debug, Clone)]
pub struct KsqlClient {
    base_url: String,
    http: reqwest::Client,
}

impl KsqlClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build ksqlDB client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Run a pull query.
    pub async fn query(&self, sql: &str) -> Result<QueryResult> {
        let response = self
            .http
            .post(format!("{}/query", self.base_url))
            .header(reqwest::header::ACCEPT, KSQL_CONTENT_TYPE)
            .json(&json!({ "ksql": sql, "streamsProperties": {} }))
            .send()
            .await?;
        let body = Self::check(response).await?;

        let frames: Vec<QueryFrame> = serde_json::from_slice(&body)?;
        let mut result = QueryResult::default();
        for frame in frames {
            match frame {
                QueryFrame::Header { schema } => result.columns = parse_schema_columns(&schema),
                QueryFrame::Row { columns } => result.rows.push(columns),
                QueryFrame::FinalMessage(_) => {}
                QueryFrame::ErrorMessage { message } => return Err(Error::Upstream(message)),
            }
        }
        Ok(result)
    }

    /// Execute a statement and return the raw response entities.
    pub async fn execute(&self, statement: &str) -> Result<Vec<Value>> {
        let response = self
            .http
            .post(format!("{}/ksql", self.base_url))
            .header(reqwest::header::ACCEPT, KSQL_CONTENT_TYPE)
            .json(&json!({ "ksql": statement, "streamsProperties": {} }))
            .send()
            .await?;
        let body = Self::check(response).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Names of all tables, upper-cased.
    pub async fn tables(&self) -> Result<Vec<String>> {
        let entities = self.execute("SHOW TABLES;").await?;
        Ok(entities
            .iter()
            .filter_map(|e| e.get("tables").and_then(Value::as_array))
            .flatten()
            .filter_map(|t| t.get("name").and_then(Value::as_str))
            .map(str::to_uppercase)
            .collect())
    }

    /// Ping the server.
    pub async fn healthcheck(&self) -> Result<()> {
        let response = self
            .http
            .get(format!("{}/healthcheck", self.base_url))
            .send()
            .await?;
        let body = Self::check(response).await?;
        let healthy = serde_json::from_slice::<Value>(&body)
            .ok()
            .and_then(|v| v.get("isHealthy").and_then(Value::as_bool))
            .unwrap_or(true);
        if healthy {
            Ok(())
        } else {
            Err(Error::Unavailable("ksqlDB reports unhealthy".into()))
        }
    }

    async fn check(response: reqwest::Response) -> Result<bytes::Bytes> {
        let status = response.status();
        let body = response.bytes().await?;
        if status.is_success() {
            return Ok(body);
        }

        let message = serde_json::from_slice::<KsqlError>(&body)
            .ok()
            .and_then(|e| e.message)
            .unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned());
        if status.is_server_error() {
            Err(Error::Unavailable(format!("ksqlDB {status}: {message}")))
        } else {
            Err(Error::Upstream(format!("ksqlDB {status}: {message}")))
        }
    }
}

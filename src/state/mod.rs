//! Point-in-time asset state.
//!
//! The latest value of every data item lives in a ksqlDB table keyed by
//! `<asset_uuid>|<item id>`. [`KsqlStateStore`] answers single-item lookups
//! by key and whole-asset lookups by the `asset_uuid` column.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::ksql::{KsqlClient, escape_literal};
use crate::retry;

/// Latest state of one data item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataItemState {
    pub id: String,
    pub value: Value,
    #[serde(rename = "type")]
    pub item_type: Value,
    pub tag: Value,
    pub timestamp: Value,
}

/// `{asset_uuid, id, value, type, tag, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetDataItem {
    pub asset_uuid: String,
    #[serde(flatten)]
    pub item: DataItemState,
}

/// `{asset_uuid, dataItems: [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetState {
    pub asset_uuid: String,
    #[serde(rename = "dataItems")]
    pub data_items: Vec<DataItemState>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Latest state of one data item, `None` when unknown.
    async fn data_item(&self, asset_uuid: &str, item_id: &str) -> Result<Option<AssetDataItem>>;

    /// Latest state of all data items of an asset. Empty when unknown.
    async fn asset(&self, asset_uuid: &str) -> Result<Vec<DataItemState>>;

    async fn readiness(&self) -> std::result::Result<(), String>;
}

pub struct KsqlStateStore {
    client: KsqlClient,
    table: String,
}

impl KsqlStateStore {
    pub fn new(client: KsqlClient, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }

    pub fn from_url(url: &str, table: &str, timeout: Duration) -> Result<Self> {
        Ok(Self::new(KsqlClient::new(url, timeout)?, table))
    }

    fn data_item_query(&self, asset_uuid: &str, item_id: &str) -> String {
        format!(
            "SELECT asset_uuid, id, value, type, tag, timestamp FROM {} WHERE key = '{}|{}' LIMIT 1;",
            self.table,
            escape_literal(asset_uuid),
            escape_literal(item_id)
        )
    }

    fn asset_query(&self, asset_uuid: &str) -> String {
        format!(
            "SELECT asset_uuid, id, value, type, tag, timestamp FROM {} WHERE asset_uuid = '{}';",
            self.table,
            escape_literal(asset_uuid)
        )
    }

    async fn rows(&self, sql: &str) -> Result<Vec<serde_json::Map<String, Value>>> {
        let result = retry::with_policy("state_query", retry::metadata_policy(), || {
            self.client.query(sql)
        })
        .await?;
        Ok(result.records())
    }
}

fn field(row: &serde_json::Map<String, Value>, name: &str) -> Value {
    row.get(name).cloned().unwrap_or(Value::Null)
}

fn item_from_row(row: &serde_json::Map<String, Value>) -> Option<DataItemState> {
    let id = row.get("ID")?.as_str()?.to_string();
    Some(DataItemState {
        id,
        value: field(row, "VALUE"),
        item_type: field(row, "TYPE"),
        tag: field(row, "TAG"),
        timestamp: field(row, "TIMESTAMP"),
    })
}

#[async_trait]
impl StateStore for KsqlStateStore {
    async fn data_item(&self, asset_uuid: &str, item_id: &str) -> Result<Option<AssetDataItem>> {
        let rows = self.rows(&self.data_item_query(asset_uuid, item_id)).await?;
        Ok(rows.first().and_then(|row| {
            let item = item_from_row(row)?;
            let asset_uuid = row
                .get("ASSET_UUID")
                .and_then(Value::as_str)
                .unwrap_or(asset_uuid)
                .to_string();
            Some(AssetDataItem { asset_uuid, item })
        }))
    }

    async fn asset(&self, asset_uuid: &str) -> Result<Vec<DataItemState>> {
        let rows = self.rows(&self.asset_query(asset_uuid)).await?;
        Ok(rows.iter().filter_map(item_from_row).collect())
    }

    async fn readiness(&self) -> std::result::Result<(), String> {
        let tables = self
            .client
            .tables()
            .await
            .map_err(|e| format!("ksqlDB unreachable: {e}"))?;
        if tables.iter().any(|t| t.eq_ignore_ascii_case(&self.table)) {
            Ok(())
        } else {
            Err(format!("ksqlDB table '{}' does not exist", self.table))
        }
    }
}

impl std::fmt::Debug for KsqlStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KsqlStateStore")
            .field("url", &self.client.base_url())
            .field("table", &self.table)
            .finish()
    }
}

#[cfg(any(test, feature = "test-utilities"))]
pub use memory::InMemoryStateStore;

#[cfg(any(test, feature = "test-utilities"))]
mod memory {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;

    /// State store backed by a map, for tests.
    #[derive(Debug, Default)]
    pub struct InMemoryStateStore {
        items: Mutex<BTreeMap<(String, String), DataItemState>>,
        unavailable: Mutex<Option<String>>,
    }

    impl InMemoryStateStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn put(&self, asset_uuid: &str, item: DataItemState) {
            self.items
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert((asset_uuid.to_string(), item.id.clone()), item);
        }

        /// Fail every call with `Unavailable(reason)` until cleared with `None`.
        pub fn set_unavailable(&self, reason: Option<&str>) {
            *self.unavailable.lock().unwrap_or_else(|p| p.into_inner()) =
                reason.map(str::to_string);
        }

        fn check(&self) -> Result<()> {
            match self
                .unavailable
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone()
            {
                Some(reason) => Err(crate::error::Error::Unavailable(reason)),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl StateStore for InMemoryStateStore {
        async fn data_item(&self, asset_uuid: &str, item_id: &str) -> Result<Option<AssetDataItem>> {
            self.check()?;
            let items = self.items.lock().unwrap_or_else(|p| p.into_inner());
            Ok(items
                .get(&(asset_uuid.to_string(), item_id.to_string()))
                .map(|item| AssetDataItem {
                    asset_uuid: asset_uuid.to_string(),
                    item: item.clone(),
                }))
        }

        async fn asset(&self, asset_uuid: &str) -> Result<Vec<DataItemState>> {
            self.check()?;
            let items = self.items.lock().unwrap_or_else(|p| p.into_inner());
            Ok(items
                .iter()
                .filter(|((asset, _), _)| asset == asset_uuid)
                .map(|(_, item)| item.clone())
                .collect())
        }

        async fn readiness(&self) -> std::result::Result<(), String> {
            self.check().map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> KsqlStateStore {
        KsqlStateStore::from_url("http://localhost:8088", "assets", Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_queries_escape_literals() {
        let store = store();
        assert_eq!(
            store.data_item_query("A'1", "avail"),
            "SELECT asset_uuid, id, value, type, tag, timestamp FROM assets WHERE key = 'A''1|avail' LIMIT 1;"
        );
        assert!(store.asset_query("A'1").ends_with("WHERE asset_uuid = 'A''1';"));
    }

    #[test]
    fn test_item_from_row() {
        let row = json!({
            "ASSET_UUID": "WTVB01-001",
            "ID": "avail",
            "VALUE": "AVAILABLE",
            "TYPE": "Events",
            "TAG": "Availability",
            "TIMESTAMP": "2025-07-10T19:31:50.117382Z"
        });
        let item = item_from_row(row.as_object().unwrap()).unwrap();
        assert_eq!(item.id, "avail");
        assert_eq!(item.value, "AVAILABLE");

        let rendered = serde_json::to_value(AssetDataItem {
            asset_uuid: "WTVB01-001".into(),
            item,
        })
        .unwrap();
        assert_eq!(rendered["type"], "Events");
        assert_eq!(rendered["asset_uuid"], "WTVB01-001");
        assert_eq!(rendered["id"], "avail");
    }

    #[test]
    fn test_row_without_id_is_skipped() {
        let row = json!({ "VALUE": "x" });
        assert!(item_from_row(row.as_object().unwrap()).is_none());
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryStateStore::new();
        store.put(
            "WTVB01-001",
            DataItemState {
                id: "avail".into(),
                value: json!("AVAILABLE"),
                item_type: json!("Events"),
                tag: json!("Availability"),
                timestamp: json!("2025-07-10T19:31:50Z"),
            },
        );
        assert!(store.data_item("WTVB01-001", "avail").await.unwrap().is_some());
        assert!(store.data_item("WTVB01-001", "temp").await.unwrap().is_none());
        assert_eq!(store.asset("WTVB01-001").await.unwrap().len(), 1);
        assert!(store.asset("OTHER").await.unwrap().is_empty());

        store.set_unavailable(Some("down"));
        assert!(store.asset("WTVB01-001").await.is_err());
    }
}

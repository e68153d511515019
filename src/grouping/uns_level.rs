//! Grouping by one level of the Unified Namespace, backed by ksqlDB.
//!
//! The mapping table (`KSQLDB_UNS_MAP`) holds one row per asset with a
//! `UNS_LEVELS` map column; the configured level (e.g. `workcenter`) names
//! the group. Each group's derived log is a persistent ksqlDB stream joining
//! the master asset stream with the mapping table, filtered to that group.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::GroupingStrategy;
use crate::config::RouterConfig;
use crate::error::Result;
use crate::ksql::{KsqlClient, escape_literal};
use crate::types::GroupNaming;

const KSQL_TIMEOUT: Duration = Duration::from_secs(10);

/// UNS-level grouping strategy.
#[derive(Debug, Clone)]
pub struct UnsLevelGroupingStrategy {
    ksql: KsqlClient,
    level: String,
    uns_map: String,
    assets_stream: String,
    naming: GroupNaming,
}

impl UnsLevelGroupingStrategy {
    pub fn new(
        ksql: KsqlClient,
        level: &str,
        uns_map: impl Into<String>,
        assets_stream: impl Into<String>,
        naming: GroupNaming,
    ) -> Self {
        Self {
            ksql,
            level: escape_literal(level),
            uns_map: uns_map.into(),
            assets_stream: assets_stream.into(),
            naming,
        }
    }

    pub fn from_config(config: &RouterConfig) -> Result<Self> {
        let ksql = KsqlClient::new(&config.ksqldb_url, KSQL_TIMEOUT)?;
        Ok(Self::new(
            ksql,
            &config.grouping_level,
            &config.ksqldb_uns_map,
            &config.ksqldb_assets_stream,
            config.naming.clone(),
        ))
    }

    fn group_for_query(&self, entity_id: &str) -> String {
        format!(
            "SELECT UNS_LEVELS['{}'] AS GRP FROM {} WHERE ASSET_UUID = '{}';",
            self.level,
            self.uns_map,
            escape_literal(entity_id)
        )
    }

    fn all_groups_query(&self) -> String {
        format!(
            "SELECT UNS_LEVELS['{}'] AS GROUPS FROM {};",
            self.level, self.uns_map
        )
    }

    fn assets_in_group_query(&self, group: &str) -> String {
        format!(
            "SELECT ASSET_UUID FROM {} WHERE UNS_LEVELS['{}'] = '{}';",
            self.uns_map,
            self.level,
            escape_literal(group)
        )
    }

    fn create_stream_statement(&self, group: &str) -> String {
        let log = self.naming.derived_log_id(group);
        format!(
            "CREATE STREAM IF NOT EXISTS {log} \
             WITH (KAFKA_TOPIC='{log}', VALUE_FORMAT='JSON') AS \
             SELECT s.* FROM {stream} s \
             JOIN {map} h ON s.asset_uuid = h.asset_uuid \
             WHERE h.uns_levels['{level}'] = '{group}';",
            stream = self.assets_stream,
            map = self.uns_map,
            level = self.level,
            group = escape_literal(group),
        )
    }

    fn drop_stream_statement(&self, group: &str) -> String {
        format!(
            "DROP STREAM IF EXISTS {} DELETE TOPIC;",
            self.naming.derived_log_id(group)
        )
    }
}

fn as_group(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl GroupingStrategy for UnsLevelGroupingStrategy {
    fn name(&self) -> &'static str {
        "ksql"
    }

    async fn group_for(&self, entity_id: &str) -> Result<Option<String>> {
        let result = self.ksql.query(&self.group_for_query(entity_id)).await?;
        Ok(result.column("GRP").into_iter().find_map(as_group))
    }

    async fn all_groups(&self) -> Result<Vec<String>> {
        let result = self.ksql.query(&self.all_groups_query()).await?;
        let mut groups: Vec<String> = result.column("GROUPS").into_iter().filter_map(as_group).collect();
        groups.sort();
        groups.dedup();
        Ok(groups)
    }

    async fn assets_in_group(&self, group: &str) -> Result<Vec<String>> {
        let result = self.ksql.query(&self.assets_in_group_query(group)).await?;
        let mut assets: Vec<String> = result
            .column("ASSET_UUID")
            .into_iter()
            .filter_map(as_group)
            .collect();
        assets.sort();
        assets.dedup();
        Ok(assets)
    }

    async fn create_derived_log(&self, group: &str) -> Result<()> {
        self.ksql.execute(&self.create_stream_statement(group)).await?;
        tracing::info!(group, log = %self.naming.derived_log_id(group), "Derived stream ensured");
        Ok(())
    }

    async fn remove_derived_log(&self, group: &str) -> Result<()> {
        self.ksql.execute(&self.drop_stream_statement(group)).await?;
        tracing::info!(group, log = %self.naming.derived_log_id(group), "Derived stream dropped");
        Ok(())
    }

    async fn readiness(&self) -> std::result::Result<(), String> {
        match self.ksql.tables().await {
            Ok(tables) if tables.contains(&self.uns_map.to_uppercase()) => Ok(()),
            Ok(_) => Err(format!(
                "UNS mapping table '{}' not found in ksqlDB",
                self.uns_map
            )),
            Err(e) => Err(format!("ksqlDB connection failed: {e}")),
        }
    }
}

//! Grouping from a fixed entity → group table.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;

use super::GroupingStrategy;
use crate::error::Result;

/// In-process entity → group table.
///
/// Loaded from `STATIC_GROUPS` (a JSON object). Derived logs are assumed to
/// exist already, so create/remove are no-ops. Entries can be changed at
/// runtime with [`set_group`](Self::set_group) and
/// [`remove_entity`](Self::remove_entity).
#[derive(Debug, Default)]
pub struct StaticGroupingStrategy {
    table: DashMap<String, String>,
}

impl StaticGroupingStrategy {
    pub fn new(table: BTreeMap<String, String>) -> Self {
        Self {
            table: table.into_iter().collect(),
        }
    }

    pub fn set_group(&self, entity_id: impl Into<String>, group: impl Into<String>) {
        self.table.insert(entity_id.into(), group.into());
    }

    pub fn remove_entity(&self, entity_id: &str) {
        self.table.remove(entity_id);
    }
}

#[async_trait]
impl GroupingStrategy for StaticGroupingStrategy {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn group_for(&self, entity_id: &str) -> Result<Option<String>> {
        Ok(self.table.get(entity_id).map(|g| g.value().clone()))
    }

    async fn all_groups(&self) -> Result<Vec<String>> {
        let mut groups: Vec<String> = self.table.iter().map(|e| e.value().clone()).collect();
        groups.sort();
        groups.dedup();
        Ok(groups)
    }

    async fn assets_in_group(&self, group: &str) -> Result<Vec<String>> {
        let mut assets: Vec<String> = self
            .table
            .iter()
            .filter(|e| e.value() == group)
            .map(|e| e.key().clone())
            .collect();
        assets.sort();
        Ok(assets)
    }

    async fn create_derived_log(&self, _group: &str) -> Result<()> {
        Ok(())
    }

    async fn remove_derived_log(&self, _group: &str) -> Result<()> {
        Ok(())
    }

    async fn readiness(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

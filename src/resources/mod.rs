// Resource selection: descriptors, selectors and the paged query contract used by orchestrators.

mod index;

pub use index::{IndexSync, ResourceIndex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub id: String,
    /// Default adapter for collection; `None` means the resource has no stats endpoint.
    pub stats_adapter: Option<String>,
    /// Adapters the resource accepts as an override.
    #[serde(default)]
    pub supported_adapters: BTreeSet<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ResourceDescriptor {
    pub fn new(id: impl Into<String>, stats_adapter: Option<&str>) -> Self {
        let stats_adapter = stats_adapter.map(str::to_string);
        Self {
            id: id.into(),
            supported_adapters: stats_adapter.iter().cloned().collect(),
            stats_adapter,
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Without an override the default adapter is used. An override the resource
    /// does not declare selects no adapter at all.
    pub fn select_adapter(&self, override_adapter: Option<&str>) -> Option<String> {
        match override_adapter {
            Some(name) => self
                .supported_adapters
                .contains(name)
                .then(|| name.to_string()),
            None => self.stats_adapter.clone(),
        }
    }
}

/// Conjunction of optional clauses. An empty selector matches every resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSelector {
    #[serde(default)]
    pub ids: Option<BTreeSet<String>>,
    #[serde(default)]
    pub adapter: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ResourceSelector {
    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: Some(ids.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    pub fn matches(&self, resource: &ResourceDescriptor) -> bool {
        self.ids.as_ref().is_none_or(|ids| ids.contains(&resource.id))
            && self
                .adapter
                .as_ref()
                .is_none_or(|a| resource.supported_adapters.contains(a))
            && self
                .labels
                .iter()
                .all(|(k, v)| resource.labels.get(k) == Some(v))
    }

    /// Narrow this selection with extra clauses.
    pub fn and(mut self, extra: &ResourceSelector) -> Self {
        self.ids = match (self.ids.take(), extra.ids.as_ref()) {
            (Some(mine), Some(theirs)) => Some(mine.intersection(theirs).cloned().collect()),
            (mine, theirs) => mine.or_else(|| theirs.cloned()),
        };
        if extra.adapter.is_some() {
            self.adapter = extra.adapter.clone();
        }
        self.labels
            .extend(extra.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

impl fmt::Display for ResourceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(ids) = &self.ids {
            parts.push(format!("ids={}", ids.len()));
        }
        if let Some(adapter) = &self.adapter {
            parts.push(format!("adapter={}", adapter));
        }
        for (k, v) in &self.labels {
            parts.push(format!("{}={}", k, v));
        }
        if parts.is_empty() {
            write!(f, "*")
        } else {
            write!(f, "{}", parts.join(","))
        }
    }
}

/// Opaque resumption point of a paged query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    pub(crate) selector: ResourceSelector,
    pub(crate) after: String,
    pub(crate) page_size: usize,
}

impl fmt::Display for PageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "after:{}", self.after)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourcePage {
    pub resource_ids: Vec<String>,
    pub next: Option<PageCursor>,
}

#[async_trait]
pub trait ResourceQuery: Send + Sync {
    async fn describe(&self, resource_id: &str) -> Result<Option<ResourceDescriptor>>;

    async fn first_page(
        &self,
        selector: &ResourceSelector,
        page_size: usize,
    ) -> Result<ResourcePage>;

    async fn next_page(&self, cursor: &PageCursor) -> Result<ResourcePage>;
}

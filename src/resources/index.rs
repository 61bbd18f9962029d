// In-memory resource index ordered by id. Cursors resume strictly after the last id served,
// so concurrent inserts never cause a resource to be served twice in one walk.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use tokio::sync::RwLock;

use super::{PageCursor, ResourceDescriptor, ResourcePage, ResourceQuery, ResourceSelector};
use crate::error::Result;

/// Result of [`ResourceIndex::sync_adapter`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSync {
    pub added: usize,
    /// Ids that were dropped from the index.
    pub removed: Vec<String>,
}

#[derive(Default)]
pub struct ResourceIndex {
    resources: RwLock<BTreeMap<String, ResourceDescriptor>>,
}

impl ResourceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, resource: ResourceDescriptor) {
        self.resources
            .write()
            .await
            .insert(resource.id.clone(), resource);
    }

    pub async fn remove(&self, resource_id: &str) -> Option<ResourceDescriptor> {
        self.resources.write().await.remove(resource_id)
    }

    /// Replace every resource whose default adapter is `adapter` with `discovered`.
    pub async fn sync_adapter(
        &self,
        adapter: &str,
        discovered: Vec<ResourceDescriptor>,
    ) -> IndexSync {
        let mut resources = self.resources.write().await;
        let removed: Vec<String> = resources
            .values()
            .filter(|r| r.stats_adapter.as_deref() == Some(adapter))
            .filter(|r| !discovered.iter().any(|d| d.id == r.id))
            .map(|r| r.id.clone())
            .collect();
        for id in &removed {
            resources.remove(id);
        }
        let mut added = 0;
        for d in discovered {
            if resources.insert(d.id.clone(), d).is_none() {
                added += 1;
            }
        }
        IndexSync { added, removed }
    }

    pub async fn len(&self) -> usize {
        self.resources.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.resources.read().await.is_empty()
    }

    async fn page_after(
        &self,
        selector: &ResourceSelector,
        after: Bound<&str>,
        page_size: usize,
    ) -> ResourcePage {
        let resources = self.resources.read().await;
        let lower = match after {
            Bound::Excluded(id) => Bound::Excluded(id.to_string()),
            _ => Bound::Unbounded,
        };
        let mut matching = resources
            .range((lower, Bound::Unbounded))
            .map(|(_, r)| r)
            .filter(|r| selector.matches(r));
        let resource_ids: Vec<String> = matching
            .by_ref()
            .take(page_size.max(1))
            .map(|r| r.id.clone())
            .collect();
        let has_more = matching.next().is_some();
        let next = match (has_more, resource_ids.last()) {
            (true, Some(last)) => Some(PageCursor {
                selector: selector.clone(),
                after: last.clone(),
                page_size,
            }),
            _ => None,
        };
        ResourcePage { resource_ids, next }
    }
}

#[async_trait]
impl ResourceQuery for ResourceIndex {
    async fn describe(&self, resource_id: &str) -> Result<Option<ResourceDescriptor>> {
        Ok(self.resources.read().await.get(resource_id).cloned())
    }

    async fn first_page(
        &self,
        selector: &ResourceSelector,
        page_size: usize,
    ) -> Result<ResourcePage> {
        Ok(self
            .page_after(selector, Bound::Unbounded, page_size)
            .await)
    }

    async fn next_page(&self, cursor: &PageCursor) -> Result<ResourcePage> {
        Ok(self
            .page_after(
                &cursor.selector,
                Bound::Excluded(&cursor.after),
                cursor.page_size,
            )
            .await)
    }
}

// Docker container stats via bollard. Each running container is one resource.

mod stats;

use async_trait::async_trait;
use bollard::Docker;
use bollard::query_parameters::{ListContainersOptions, StatsOptions};
use futures_util::{StreamExt, stream};
use std::collections::{BTreeMap, HashMap};
use tracing::{instrument, warn};

use super::{StatSample, StatsAdapter, StatsRequest, StatsStream, StatsResponse, single_batch};
use crate::bucket::now_micros;
use crate::error::{Result, RollupError};
use crate::resources::ResourceDescriptor;

pub const DOCKER_ADAPTER: &str = "docker";

pub struct DockerStatsAdapter {
    docker: Docker,
}

impl DockerStatsAdapter {
    pub fn connect() -> anyhow::Result<Self> {
        let docker = Docker::connect_with_unix_defaults()?;
        Ok(Self { docker })
    }

    /// Running containers as resources, labelled with their name and image.
    #[instrument(skip(self), fields(adapter = "docker", operation = "discover"))]
    pub async fn discover(&self) -> Result<Vec<ResourceDescriptor>> {
        let filters = HashMap::from([("status".to_string(), vec!["running".to_string()])]);
        let options = ListContainersOptions {
            all: false,
            filters: Some(filters),
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| RollupError::query(format!("docker list_containers: {}", e)))?;

        let mut out = Vec::with_capacity(containers.len());
        for c in containers {
            let Some(id) = c.id else {
                continue;
            };
            let name = c
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| id.clone());
            let mut resource = ResourceDescriptor::new(id, Some(DOCKER_ADAPTER))
                .with_label("name", name)
                .with_label("kind", "container");
            if let Some(image) = c.image {
                resource = resource.with_label("image", image);
            }
            out.push(resource);
        }
        Ok(out)
    }

    fn adapter_error(resource_id: &str, reason: impl std::fmt::Display) -> RollupError {
        RollupError::Adapter {
            adapter: DOCKER_ADAPTER.to_string(),
            resource_id: resource_id.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl StatsAdapter for DockerStatsAdapter {
    fn name(&self) -> &str {
        DOCKER_ADAPTER
    }

    #[instrument(skip(self, request), fields(adapter = "docker", operation = "request_stats", resource_id = %request.resource_id))]
    async fn request_stats(&self, request: StatsRequest) -> Result<StatsStream> {
        // Not one-shot: the daemon waits for a second CPU sample so precpu_stats is populated.
        let options = StatsOptions {
            stream: false,
            ..Default::default()
        };
        let mut responses = self.docker.stats(&request.resource_id, Some(options));
        let response = match responses.next().await {
            Some(Ok(r)) => r,
            Some(Err(e)) => return Err(Self::adapter_error(&request.resource_id, e)),
            None => {
                warn!(resource_id = %request.resource_id, "docker returned no stats");
                return Ok(Box::pin(stream::once(async {
                    Ok(StatsResponse {
                        stats: Vec::new(),
                        is_final_batch: true,
                    })
                })));
            }
        };

        let source_micros = now_micros();
        let stat_values: BTreeMap<String, Vec<StatSample>> = stats::container_metrics(&response)
            .unwrap_or_default()
            .into_iter()
            .map(|(name, value)| {
                (
                    name,
                    vec![StatSample {
                        value,
                        source_micros,
                    }],
                )
            })
            .collect();
        Ok(Box::pin(stream::once(async move {
            Ok(single_batch(stat_values))
        })))
    }
}

//! Component health for the readiness endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::error;

use crate::index::DocumentIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Down,
}

/// Health of one internal component.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub name: String,
    pub status: HealthStatus,
}

/// Contributes one component's health to the readiness endpoint.
#[async_trait]
pub trait HealthIndicator: Send + Sync {
    async fn health(&self) -> Health;
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
}

/// Aggregate health response: DOWN as soon as any component is DOWN.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<BTreeMap<String, ComponentHealth>>,
}

pub async fn readiness_state(components: &[Arc<dyn HealthIndicator>]) -> HealthResponse {
    let mut all_up = true;
    let mut details = BTreeMap::new();

    for component in components {
        let health = component.health().await;
        all_up &= health.status == HealthStatus::Up;
        details.insert(health.name, ComponentHealth {
            status: health.status,
        });
    }

    HealthResponse {
        status: if all_up {
            HealthStatus::Up
        } else {
            HealthStatus::Down
        },
        components: Some(details),
    }
}

/// Pings the vector search index.
pub struct IndexHealthIndicator {
    index: Arc<dyn DocumentIndex>,
}

impl IndexHealthIndicator {
    pub fn new(index: Arc<dyn DocumentIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl HealthIndicator for IndexHealthIndicator {
    async fn health(&self) -> Health {
        let status = match self.index.ping().await {
            Ok(()) => HealthStatus::Up,
            Err(cause) => {
                error!(%cause, "index store is unavailable");
                HealthStatus::Down
            }
        };
        Health {
            name: "index".to_string(),
            status,
        }
    }
}

/// Pings the record store holding jobs and steps.
pub struct RecordStoreHealthIndicator {
    pool: SqlitePool,
}

impl RecordStoreHealthIndicator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HealthIndicator for RecordStoreHealthIndicator {
    async fn health(&self) -> Health {
        let status = match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => HealthStatus::Up,
            Err(cause) => {
                error!(%cause, "record store is unavailable");
                HealthStatus::Down
            }
        };
        Health {
            name: "recordstore".to_string(),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedIndicator(&'static str, HealthStatus);

    #[async_trait]
    impl HealthIndicator for FixedIndicator {
        async fn health(&self) -> Health {
            Health {
                name: self.0.to_string(),
                status: self.1,
            }
        }
    }

    #[tokio::test]
    async fn test_readiness_up_when_all_components_up() {
        let components: Vec<Arc<dyn HealthIndicator>> = vec![
            Arc::new(FixedIndicator("a", HealthStatus::Up)),
            Arc::new(FixedIndicator("b", HealthStatus::Up)),
        ];
        let state = readiness_state(&components).await;
        assert_eq!(state.status, HealthStatus::Up);
        assert_eq!(state.components.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_readiness_down_when_any_component_down() {
        let components: Vec<Arc<dyn HealthIndicator>> = vec![
            Arc::new(FixedIndicator("a", HealthStatus::Up)),
            Arc::new(FixedIndicator("b", HealthStatus::Down)),
        ];
        let state = readiness_state(&components).await;
        assert_eq!(state.status, HealthStatus::Down);
    }
}

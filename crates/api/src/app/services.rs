//! Wiring: store, pipeline, target lookup, controller and continuation dispatcher.

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;

use enrichq_infra::controller::ContinuationDispatcher;
use enrichq_infra::{Controller, ControllerConfig, ControllerStore, InMemoryStore, PostgresStore};
use enrichq_pipeline::{
    EnrichmentPipeline, HttpEnrichmentPipeline, HttpPipelineConfig, InMemoryTargets, TargetLookup,
};

use crate::config::AppConfig;
use crate::continuation::HttpContinuationDispatcher;

pub type AppController = Controller<dyn ControllerStore>;

#[derive(Clone)]
pub struct AppServices {
    pub controller: Arc<AppController>,
    pub continuation: Arc<dyn ContinuationDispatcher>,
}

impl AppServices {
    pub fn new(controller: Arc<AppController>, continuation: Arc<dyn ContinuationDispatcher>) -> Self {
        Self {
            controller,
            continuation,
        }
    }
}

/// Build services from configuration: Postgres when `USE_PERSISTENT_STORES=true`,
/// in-memory otherwise.
pub async fn build_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    let controller_config = ControllerConfig::default();

    let mut pipeline_config = HttpPipelineConfig::new(&config.pipeline_url);
    if let Some(token) = &config.pipeline_token {
        pipeline_config = pipeline_config.with_bearer_token(token);
    }
    let pipeline: Arc<dyn EnrichmentPipeline> =
        Arc::new(HttpEnrichmentPipeline::new(pipeline_config).context("failed to build enrichment pipeline")?);

    let (store, targets) = if config.use_persistent_stores {
        build_persistent_stores(config).await?
    } else {
        tracing::warn!("using in-memory stores; queue state is lost on restart");
        let store: Arc<dyn ControllerStore> = Arc::new(InMemoryStore::new());
        let targets: Arc<dyn TargetLookup> = Arc::new(InMemoryTargets::new());
        (store, targets)
    };

    let continuation_timeout = controller_config.budget + controller_config.item_timeout;
    let continuation = HttpContinuationDispatcher::new(&config.self_url, continuation_timeout)
        .context("failed to build continuation client")?;

    let controller = Controller::new(store, pipeline, targets, controller_config);
    Ok(AppServices::new(Arc::new(controller), Arc::new(continuation)))
}

async fn build_persistent_stores(
    config: &AppConfig,
) -> anyhow::Result<(Arc<dyn ControllerStore>, Arc<dyn TargetLookup>)> {
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;

    let pool = PgPool::connect(database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = Arc::new(PostgresStore::new(pool));
    store.migrate().await.context("failed to apply migrations")?;
    tracing::info!("using Postgres stores");

    let targets: Arc<dyn TargetLookup> = store.clone();
    let store: Arc<dyn ControllerStore> = store;
    Ok((store, targets))
}

//! Application state.

use cbuild_config::SystemConfig;
use cbuild_core::clock::Clock;
use cbuild_core::driver::{JobDriver, SourceStager};
use cbuild_core::reporter::StatusReporter;
use cbuild_core::store::{ExecutionStore, LockStore};
use cbuild_scheduler::{
    Bootstrap, Engine, ExecutionRunner, LockManager, SchedulerResult, StartRequest,
    StartedExecution,
};
use std::sync::Arc;

use crate::services::ManifestFetcher;
use crate::services::token_cache::TokenCache;

/// Adapters the server is wired with.
pub struct Services {
    pub lock_store: Arc<dyn LockStore>,
    pub executions: Arc<dyn ExecutionStore>,
    pub driver: Arc<dyn JobDriver>,
    pub stager: Arc<dyn SourceStager>,
    pub reporter: Arc<dyn StatusReporter>,
    pub manifests: Arc<dyn ManifestFetcher>,
    pub tokens: Arc<TokenCache>,
    pub clock: Arc<dyn Clock>,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SystemConfig>,
    pub executions: Arc<dyn ExecutionStore>,
    pub bootstrap: Arc<Bootstrap>,
    pub runner: ExecutionRunner,
    pub manifests: Arc<dyn ManifestFetcher>,
    pub tokens: Arc<TokenCache>,
}

impl AppState {
    pub fn new(config: Arc<SystemConfig>, services: Services) -> Self {
        let locks = Arc::new(LockManager::new(
            services.lock_store,
            services.clock.clone(),
            config.lock_timeout_seconds,
        ));
        let engine = Arc::new(Engine::new(
            locks.clone(),
            services.executions.clone(),
            services.driver,
            services.stager,
            services.reporter.clone(),
            services.clock.clone(),
            config.base_url.clone(),
        ));
        let bootstrap = Arc::new(Bootstrap::new(
            config.clone(),
            locks,
            services.executions.clone(),
            services.reporter,
            services.clock,
        ));

        Self {
            runner: ExecutionRunner::new(engine, services.executions.clone()),
            executions: services.executions,
            manifests: services.manifests,
            tokens: services.tokens,
            bootstrap,
            config,
        }
    }

    /// Start an execution and hand it to the runner.
    pub async fn start_execution(
        &self,
        request: StartRequest<'_>,
    ) -> SchedulerResult<StartedExecution> {
        let started = self.bootstrap.start_execution(request).await?;
        self.runner.spawn(started.state.clone());
        Ok(started)
    }
}

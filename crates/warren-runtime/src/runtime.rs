//! Runtime orchestration.
//!
//! [`WarrenRuntime`] owns the configuration, one [`Dispatcher`], a channel
//! factory and every consumer the configuration and the registered batch
//! handlers call for.
//!
//! ```rust,ignore
//! use warren_runtime::WarrenRuntime;
//!
//! let mut runtime = WarrenRuntime::builder()
//!     .config_file("config/warren.toml")
//!     .profile("production")
//!     .build()?
//!     .with_channel_factory(Arc::new(broker))
//!     .with_dispatcher(dispatcher);
//!
//! runtime.register_batch_handler(
//!     BatchConsumer::builder(BatchConsumerConfig::new("audit")).handler(store_audit),
//! )?;
//!
//! runtime.run().await?;
//! ```

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use futures::future;
use tokio::signal;
use tracing::{debug, error, info, warn};
use warren_core::BoxedChannelFactory;
use warren_framework::Dispatcher;

use crate::batch::{BatchConsumer, BatchRoute, EngineState};
use crate::config::{ConfigLoader, ConfigResult, WarrenConfig, validate_config};
use crate::consumer::Consumer;
use crate::error::{RuntimeError, RuntimeResult};
use crate::logging;

/// Consumers owned while the runtime is running.
struct Engines {
    consumers: Vec<Consumer>,
    batch_consumers: Vec<BatchConsumer>,
}

/// Runs the configured consumers against one dispatcher.
pub struct WarrenRuntime {
    config: WarrenConfig,
    factory: Option<BoxedChannelFactory>,
    dispatcher: Option<Arc<Dispatcher>>,
    batch_routes: Vec<BatchRoute>,
    engines: tokio::sync::Mutex<Option<Engines>>,
}

impl WarrenRuntime {
    /// Creates a runtime builder that loads configuration from files and the
    /// environment.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Creates a runtime from an already loaded configuration and initializes
    /// logging from it.
    pub fn from_config(config: &WarrenConfig) -> Self {
        logging::init_from_config(&config.logging);

        info!(
            log_level = %config.logging.level,
            log_format = ?config.logging.format,
            consumers = config.consumers.len(),
            batch_consumers = config.batch_consumers.len(),
            "Runtime initialized from configuration"
        );

        Self {
            config: config.clone(),
            factory: None,
            dispatcher: None,
            batch_routes: Vec::new(),
            engines: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &WarrenConfig {
        &self.config
    }

    /// Sets the broker capability used to open channels.
    pub fn with_channel_factory(mut self, factory: BoxedChannelFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Sets the dispatcher driven by the single-message consumers.
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(Arc::new(dispatcher));
        self
    }

    /// Registers a batch handler.
    ///
    /// A `batch_consumers` entry for the same queue in the configuration
    /// replaces the settings the route was declared with.
    ///
    /// # Errors
    ///
    /// Fails if the queue already has a batch handler or the effective
    /// settings are invalid.
    pub fn register_batch_handler(&mut self, route: BatchRoute) -> RuntimeResult<()> {
        let queue = route.queue_name().to_string();
        if self.batch_routes.iter().any(|r| r.queue_name() == queue) {
            return Err(RuntimeError::DuplicateBatchHandler(queue));
        }

        let route = match self.config.batch_consumer(&queue) {
            Some(configured) => {
                debug!(queue = %queue, "Using configured batch consumer settings");
                route.with_config(configured.clone())
            }
            None => route,
        };
        crate::config::validate_batch_consumer(route.config())?;

        info!(queue = %queue, "Registered batch handler");
        self.batch_routes.push(route);
        Ok(())
    }

    /// Returns whether the runtime is currently running.
    pub async fn is_running(&self) -> bool {
        self.engines.lock().await.is_some()
    }

    /// Returns the state of every batch consumer, in registration order.
    /// Empty while the runtime is stopped.
    pub async fn batch_consumer_states(&self) -> Vec<(String, EngineState)> {
        self.engines
            .lock()
            .await
            .as_ref()
            .map(|engines| {
                engines
                    .batch_consumers
                    .iter()
                    .map(|c| (c.queue_name().to_string(), c.state()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Starts every consumer.
    ///
    /// If one consumer fails to start, the ones already started are stopped
    /// again and the error is returned.
    pub async fn start(&self) -> RuntimeResult<()> {
        let mut engines = self.engines.lock().await;
        if engines.is_some() {
            warn!("Runtime is already running");
            return Ok(());
        }

        validate_config(&self.config)?;
        let factory = self
            .factory
            .clone()
            .ok_or(RuntimeError::MissingChannelFactory)?;

        for configured in &self.config.batch_consumers {
            if !self
                .batch_routes
                .iter()
                .any(|r| r.queue_name() == configured.queue_name)
            {
                warn!(queue = %configured.queue_name, "Batch consumer configured without a handler");
            }
        }

        let consumers = if self.config.consumers.is_empty() {
            Vec::new()
        } else {
            let dispatcher = self
                .dispatcher
                .clone()
                .ok_or(RuntimeError::MissingDispatcher)?;
            self.config
                .consumers
                .iter()
                .map(|c| Consumer::new(c.clone(), Arc::clone(&dispatcher), Arc::clone(&factory)))
                .collect()
        };
        let batch_consumers: Vec<BatchConsumer> = self
            .batch_routes
            .iter()
            .map(|route| route.clone().bind(Arc::clone(&factory)))
            .collect();

        info!("Starting Warren runtime");
        let started = Engines {
            consumers,
            batch_consumers,
        };

        if let Err(e) = Self::start_engines(&started).await {
            Self::stop_engines(started).await;
            return Err(e);
        }

        *engines = Some(started);
        info!("Runtime started");
        Ok(())
    }

    async fn start_engines(engines: &Engines) -> RuntimeResult<()> {
        for consumer in &engines.consumers {
            consumer
                .start()
                .await
                .map_err(|e| RuntimeError::engine(consumer.queue_name(), e))?;
        }
        for consumer in &engines.batch_consumers {
            consumer
                .start()
                .await
                .map_err(|e| RuntimeError::engine(consumer.queue_name(), e))?;
        }
        Ok(())
    }

    /// Disposes every consumer in parallel, returning the first failure.
    async fn stop_engines(engines: Engines) -> Option<RuntimeError> {
        let consumers = future::join_all(engines.consumers.iter().map(|consumer| async move {
            (consumer.queue_name(), consumer.dispose().await)
        }));
        let batch_consumers =
            future::join_all(engines.batch_consumers.iter().map(|consumer| async move {
                (consumer.queue_name(), consumer.dispose().await)
            }));
        let (consumers, batch_consumers) = future::join(consumers, batch_consumers).await;

        let mut first_error = None;
        for (queue, result) in consumers.into_iter().chain(batch_consumers) {
            if let Err(e) = result {
                error!(queue = %queue, error = %e, "Error while stopping consumer");
                first_error.get_or_insert(RuntimeError::engine(queue, e));
            }
        }
        first_error
    }

    /// Stops every consumer. Stopping a stopped runtime is a no-op.
    pub async fn stop(&self) -> RuntimeResult<()> {
        let Some(engines) = self.engines.lock().await.take() else {
            debug!("Runtime is not running");
            return Ok(());
        };

        info!("Stopping Warren runtime");
        let result = Self::stop_engines(engines).await;
        info!("Runtime stopped");

        match result {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Runs until Ctrl+C or SIGTERM.
    pub async fn run(&self) -> RuntimeResult<()> {
        self.start().await?;
        info!("Warren runtime is now running. Press Ctrl+C to stop.");

        let signal = wait_for_shutdown().await;
        let stopped = self.stop().await;
        signal.and(stopped)
    }

    /// Runs until `shutdown` completes.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        self.stop().await
    }
}

impl std::fmt::Debug for WarrenRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarrenRuntime")
            .field("consumers", &self.config.consumers.len())
            .field("batch_handlers", &self.batch_routes.len())
            .field("has_dispatcher", &self.dispatcher.is_some())
            .field("has_channel_factory", &self.factory.is_some())
            .finish()
    }
}

/// Waits for Ctrl+C, or SIGTERM on unix.
async fn wait_for_shutdown() -> RuntimeResult<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Builds a [`WarrenRuntime`] from layered configuration.
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
}

impl RuntimeBuilder {
    /// Creates a builder searching the current directory.
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new().with_current_dir(),
        }
    }

    /// Sets a specific configuration file to load.
    pub fn config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    /// Sets the configuration profile (e.g., "development", "production").
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    /// Adds a search path for configuration files.
    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    pub fn with_env(mut self) -> Self {
        self.config_loader = self.config_loader.with_env();
        self
    }

    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    /// Merges configuration programmatically.
    pub fn merge(mut self, config: WarrenConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    /// Loads the configuration and builds the runtime.
    pub fn build(self) -> ConfigResult<WarrenRuntime> {
        let config = self.config_loader.load()?;
        Ok(WarrenRuntime::from_config(&config))
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

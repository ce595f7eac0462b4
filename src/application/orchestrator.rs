//! Ownership root for the whole pipeline.
//!
//! The orchestrator owns the wrappers, collector, publisher, and control
//! plane; components never hold references back to it. Ticker and funding
//! rounds run at independent cadences; every background task watches one
//! shutdown channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::application::collector::Collector;
use crate::application::control::ControlPlane;
use crate::application::publisher::Publisher;
use crate::application::shared_state::SharedSymbolSet;
use crate::application::statistics::Statistics;
use crate::config::AppConfig;
use crate::domain::types::{DataKind, Symbol};
use crate::infrastructure::cache::CollectorCache;
use crate::infrastructure::exchanges;
use crate::infrastructure::rabbitmq::{RabbitTransport, run_consumer};
use crate::infrastructure::resilience::{CircuitState, HealthStatus, ResilientExchange};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct Orchestrator {
    config: AppConfig,
    wrappers: Vec<Arc<ResilientExchange>>,
    collector: Arc<Collector>,
    publisher: Publisher,
    control: Arc<ControlPlane>,
    statistics: Arc<Statistics>,
    transport: RabbitTransport,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Construct the full component graph. Connects to the broker (bounded
    /// retries, fatal on exhaustion) but does not start any loops yet.
    pub async fn build(config: AppConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_CLIENT_TIMEOUT)
            .user_agent(concat!("futurescan/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let statistics = Arc::new(Statistics::new());

        let initial_symbols: Vec<Symbol> = config
            .symbols
            .iter()
            .map(|s| Symbol::parse(s))
            .collect::<Result<_, _>>()?;
        let shared_symbols = Arc::new(SharedSymbolSet::new(initial_symbols));

        let mut wrappers = Vec::new();
        for name in &config.exchanges {
            let exchange_config = config.exchange_config(name);
            if !exchange_config.enabled {
                info!("Orchestrator: exchange '{name}' disabled in config");
                continue;
            }
            if config.credentials(name).is_some() {
                info!(
                    "Orchestrator: API credentials configured for '{name}' \
                     (market-data endpoints are public, keys are unused)"
                );
            }
            let adapter = exchanges::build_adapter(name, &exchange_config, http.clone())?;
            wrappers.push(Arc::new(ResilientExchange::new(adapter, &exchange_config)));
        }
        anyhow::ensure!(!wrappers.is_empty(), "no enabled exchanges configured");

        let transport = RabbitTransport::connect(&config.rabbitmq).await?;
        let data_sink = transport.topic_sink(&config.rabbitmq.data_exchange).await?;
        let response_sink = transport
            .topic_sink(&config.rabbitmq.response_exchange)
            .await?;

        let cache = Arc::new(CollectorCache::new(&config.cache));
        let collector = Arc::new(Collector::new(
            wrappers.clone(),
            cache,
            Arc::clone(&shared_symbols),
            Arc::clone(&statistics),
        ));

        let source = format!("{} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        let publisher = Publisher::new(
            data_sink,
            config.batch.clone(),
            Arc::clone(&statistics),
            source,
            config.environment.clone(),
        );

        let control = Arc::new(ControlPlane::new(
            shared_symbols,
            Arc::clone(&statistics),
            wrappers.clone(),
            response_sink,
        ));

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            wrappers,
            collector,
            publisher,
            control,
            statistics,
            transport,
            shutdown_tx,
            tasks: Vec::new(),
        })
    }

    /// Initialize the exchanges and start every loop. Fails only if zero
    /// exchanges come up or the control consumer cannot be created.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        info!(
            "Orchestrator: initializing {} exchanges...",
            self.wrappers.len()
        );
        let results = join_all(self.wrappers.iter().map(|wrapper| async move {
            (wrapper.id().clone(), wrapper.initialize().await)
        }))
        .await;

        let mut initialized = 0;
        for (id, result) in &results {
            match result {
                Ok(()) => initialized += 1,
                Err(e) => error!("Orchestrator: failed to initialize '{id}': {e}"),
            }
        }
        info!(
            "Orchestrator: {initialized}/{} exchanges initialized",
            results.len()
        );
        anyhow::ensure!(initialized > 0, "failed to initialize any exchange");

        for wrapper in &self.wrappers {
            self.tasks.push(wrapper.spawn_health_task(self.shutdown_rx()));
        }

        self.tasks
            .push(self.publisher.spawn_flush_task(self.shutdown_rx()));

        self.tasks.push(self.spawn_collection_loop(
            DataKind::Tickers,
            Duration::from_secs(self.config.ticker_interval_s),
        ));
        self.tasks.push(self.spawn_collection_loop(
            DataKind::FundingRates,
            Duration::from_secs(self.config.funding_rate_interval_s),
        ));

        let consumer = self
            .transport
            .control_consumer(&self.config.rabbitmq.control_queue)
            .await?;
        let control = Arc::clone(&self.control);
        self.tasks.push(tokio::spawn(run_consumer(
            consumer,
            self.shutdown_rx(),
            move |body| {
                let control = Arc::clone(&control);
                async move { control.process(&body).await }
            },
        )));

        self.tasks.push(self.spawn_report_loop());

        info!("Orchestrator: started");
        Ok(())
    }

    /// Signal shutdown, give tasks a bounded grace period, then tear down
    /// transports and adapters in reverse creation order.
    pub async fn stop(mut self) {
        info!("Orchestrator: stopping...");
        let _ = self.shutdown_tx.send(true);

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        for task in self.tasks.drain(..) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, task).await.is_err() {
                warn!("Orchestrator: task did not stop within grace period, aborting");
            }
        }

        // Anything the flush task did not get to
        self.publisher.drain_now().await;

        for wrapper in self.wrappers.iter().rev() {
            wrapper.close().await;
        }
        self.transport.close().await;
        info!("Orchestrator: stopped");
    }

    fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn spawn_collection_loop(&self, kind: DataKind, cadence: Duration) -> JoinHandle<()> {
        let collector = Arc::clone(&self.collector);
        let publisher = self.publisher.clone();
        let mut shutdown = self.shutdown_rx();

        tokio::spawn(async move {
            info!("Orchestrator: {kind} loop started (every {cadence:?})");
            let mut ticker = tokio::time::interval(cadence);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match kind {
                            DataKind::Tickers => {
                                let snapshot = collector.collect_tickers(cadence).await;
                                publisher.submit(&snapshot).await;
                            }
                            DataKind::FundingRates => {
                                let snapshot = collector.collect_funding_rates(cadence).await;
                                publisher.submit(&snapshot).await;
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!("Orchestrator: {kind} loop stopped");
        })
    }

    /// Periodic statistics report plus a health summary across wrappers.
    fn spawn_report_loop(&self) -> JoinHandle<()> {
        let statistics = Arc::clone(&self.statistics);
        let wrappers = self.wrappers.clone();
        let interval_s = self.config.performance.metrics_interval_s;
        let mut shutdown = self.shutdown_rx();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_s));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // skip the immediate first tick
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        statistics.report_and_reset(interval_s);

                        let mut healthy = 0;
                        let mut degraded = 0;
                        let mut unhealthy = 0;
                        let mut open_circuits = 0;
                        for wrapper in &wrappers {
                            match wrapper.health_status().await {
                                HealthStatus::Healthy => healthy += 1,
                                HealthStatus::Degraded => degraded += 1,
                                HealthStatus::Unhealthy => unhealthy += 1,
                                HealthStatus::Unknown => {}
                            }
                            if wrapper.circuit_state().await == CircuitState::Open {
                                open_circuits += 1;
                            }
                        }
                        info!(
                            "Health: {healthy} healthy, {degraded} degraded, {unhealthy} unhealthy, {open_circuits} open circuits"
                        );
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

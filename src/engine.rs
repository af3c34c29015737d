//! Engine assembly and lifecycle
//!
//! Wires every component together by explicit dependency passing and runs
//! the periodic workers. Components never reach for shared globals; the
//! engine owns construction order and hands each worker a shutdown receiver.

use crate::alerts::AlertManager;
use crate::collectors::ResourceCollector;
use crate::config::EngineConfig;
use crate::detect::AnomalyDetector;
use crate::export::{scrape, Exporter};
use crate::probe::{HealthProber, HttpTransport};
use crate::store::{RetentionPolicy, TimeSeriesStore};
use crate::trace::TraceRecorder;
use anyhow::Context;
use chrono::Duration as ChronoDuration;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

/// Owns all components and the workers that drive them
pub struct Engine {
    config: EngineConfig,
    store: Arc<TimeSeriesStore>,
    prober: Arc<HealthProber>,
    collector: Arc<ResourceCollector>,
    recorder: Arc<TraceRecorder>,
    detector: Arc<AnomalyDetector>,
    alerts: Arc<AlertManager>,
    exporter: Arc<Exporter>,
    shutdown_tx: watch::Sender<bool>,
    workers: JoinSet<anyhow::Result<()>>,
}

impl Engine {
    /// Build all components from a validated configuration
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        config.validate().context("invalid engine configuration")?;

        let retention = RetentionPolicy {
            max_age: ChronoDuration::seconds(config.retention.max_age_seconds),
            max_samples: config.retention.max_samples_per_series,
        };
        let store = Arc::new(TimeSeriesStore::new(
            retention,
            ChronoDuration::milliseconds(config.store.skew_tolerance_ms),
        ));

        let transport = HttpTransport::new(Duration::from_millis(config.probe.timeout_ms))
            .context("failed to build probe transport")?;
        let prober = Arc::new(HealthProber::new(
            Arc::new(transport),
            Arc::clone(&store),
            Duration::from_millis(config.probe.timeout_ms),
            Duration::from_secs(config.probe.default_interval_seconds),
            config.probe.degraded_threshold_ms,
            config.probe.worker_pool_size,
        ));

        let collector = Arc::new(ResourceCollector::new(
            Arc::clone(&store),
            Duration::from_secs(config.collect.interval_seconds),
        ));
        let recorder = Arc::new(TraceRecorder::new(ChronoDuration::seconds(
            config.retention.max_age_seconds,
        )));
        let detector = Arc::new(AnomalyDetector::new());
        let alerts = Arc::new(AlertManager::new(
            ChronoDuration::seconds(config.retention.history_retention_seconds),
            config.retention.history_max_events,
        ));
        let exporter = Arc::new(Exporter::new(
            Arc::clone(&store),
            Arc::clone(&recorder),
            Arc::clone(&alerts),
        ));

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            store,
            prober,
            collector,
            recorder,
            detector,
            alerts,
            exporter,
            shutdown_tx,
            workers: JoinSet::new(),
        })
    }

    pub fn store(&self) -> &Arc<TimeSeriesStore> {
        &self.store
    }

    pub fn prober(&self) -> &Arc<HealthProber> {
        &self.prober
    }

    pub fn collector(&self) -> &Arc<ResourceCollector> {
        &self.collector
    }

    pub fn recorder(&self) -> &Arc<TraceRecorder> {
        &self.recorder
    }

    pub fn detector(&self) -> &Arc<AnomalyDetector> {
        &self.detector
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    pub fn exporter(&self) -> &Arc<Exporter> {
        &self.exporter
    }

    /// Spawn the periodic workers and the scrape server
    ///
    /// Returns once everything is running; the workers keep going until
    /// `shutdown` is called or one of them hits a fatal store error.
    pub fn start(&mut self) -> anyhow::Result<()> {
        info!("starting engine workers");

        let prober = Arc::clone(&self.prober);
        let rx = self.shutdown_tx.subscribe();
        self.workers
            .spawn(async move { prober.run(rx).await.map_err(anyhow::Error::from) });

        let collector = Arc::clone(&self.collector);
        let rx = self.shutdown_tx.subscribe();
        self.workers
            .spawn(async move { collector.run(rx).await.map_err(anyhow::Error::from) });

        let rx = self.shutdown_tx.subscribe();
        self.workers.spawn(detect_loop(
            Arc::clone(&self.detector),
            Arc::clone(&self.store),
            Arc::clone(&self.alerts),
            Duration::from_secs(self.config.detect.interval_seconds),
            rx,
        ));

        let rx = self.shutdown_tx.subscribe();
        self.workers.spawn(prune_loop(
            Arc::clone(&self.store),
            Arc::clone(&self.recorder),
            Arc::clone(&self.alerts),
            Duration::from_secs(self.config.store.prune_interval_seconds),
            rx,
        ));

        let addr = self.config.listen_addr().context("invalid listen address")?;
        let exporter = Arc::clone(&self.exporter);
        let rx = self.shutdown_tx.subscribe();
        self.workers.spawn(async move {
            scrape::serve(addr, exporter, rx)
                .await
                .context("scrape endpoint failed")
        });

        Ok(())
    }

    /// Block until a worker fails
    ///
    /// A clean worker exit during shutdown is not a failure; a fatal store
    /// error is logged and propagated.
    pub async fn wait(&mut self) -> anyhow::Result<()> {
        while let Some(joined) = self.workers.join_next().await {
            match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => {
                    error!("engine worker failed: {:#}", e);
                    return Err(e);
                }
                Err(e) => {
                    error!("engine worker panicked: {}", e);
                    return Err(anyhow::Error::from(e));
                }
            }
        }
        Ok(())
    }

    /// Signal all workers to stop and wait for them to finish
    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        info!("shutting down engine");
        let _ = self.shutdown_tx.send(true);
        let result = self.wait().await;
        info!("engine shutdown complete");
        result
    }

    /// Start, then run until interrupted or a worker fails
    ///
    /// Either way the remaining workers are shut down before returning; a
    /// worker failure is propagated after the shutdown completes.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.start()?;

        let mut failure: Option<anyhow::Error> = None;
        tokio::select! {
            joined = self.workers.join_next() => {
                match joined {
                    Some(Ok(Ok(()))) | None => {}
                    Some(Ok(Err(e))) => {
                        error!("engine worker failed: {:#}", e);
                        failure = Some(e);
                    }
                    Some(Err(e)) => {
                        error!("engine worker panicked: {}", e);
                        failure = Some(anyhow::Error::from(e));
                    }
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for interrupt signal")?;
                info!("received interrupt signal");
            }
        }

        let shutdown_result = self.shutdown().await;
        match failure {
            Some(e) => Err(e),
            None => shutdown_result,
        }
    }
}

/// Periodic rule evaluation feeding the alert manager
async fn detect_loop(
    detector: Arc<AnomalyDetector>,
    store: Arc<TimeSeriesStore>,
    alerts: Arc<AlertManager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let transitions = detector.evaluate_tick(&store);
                if !transitions.is_empty() {
                    alerts.apply(&transitions);
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

/// Periodic retention enforcement across store, recorder and alert history
async fn prune_loop(
    store: Arc<TimeSeriesStore>,
    recorder: Arc<TraceRecorder>,
    alerts: Arc<AlertManager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.prune() {
                    Ok(removed) if removed > 0 => {
                        info!("pruned {} expired samples", removed);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("pruner cannot reach the store: {}", e);
                        return Err(anyhow::Error::from(e));
                    }
                }
                recorder.prune();
                alerts.prune();
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{AlertRule, CmpOp, Condition, SeriesSelector};
    use crate::model::{SeriesKey, Severity};
    use chrono::Utc;

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        // Ephemeral port so tests never collide.
        config.export.listen_addr = "127.0.0.1:0".to_string();
        config
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = test_config();
        config.probe.timeout_ms = 0;
        assert!(Engine::new(config).is_err());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let mut engine = Engine::new(test_config()).unwrap();
        engine.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_components_are_wired_to_one_store() {
        let engine = Engine::new(test_config()).unwrap();
        let key = SeriesKey::bare("cpu");
        engine.store().write(&key, Utc::now(), 42.0).unwrap();

        // The exporter reads the same store the engine writes.
        let text = engine
            .exporter()
            .render_exposition(&crate::export::ExportFilter::default());
        assert_eq!(text, "cpu 42\n");
    }

    #[tokio::test]
    async fn test_detector_feeds_alert_manager() {
        let mut engine = Engine::new(test_config()).unwrap();
        engine.detector().install_rule(AlertRule {
            name: "high_cpu".to_string(),
            selector: SeriesSelector::metric("cpu"),
            condition: Condition::Threshold {
                op: CmpOp::Gt,
                bound: 90.0,
            },
            severity: Severity::Critical,
            debounce: ChronoDuration::zero(),
        });
        engine
            .store()
            .write(&SeriesKey::bare("cpu"), Utc::now(), 99.0)
            .unwrap();

        engine.start().unwrap();
        // The detect interval is seconds; trigger one evaluation directly
        // instead of waiting for the ticker.
        let transitions = engine.detector().evaluate_tick(engine.store());
        engine.alerts().apply(&transitions);

        let active = engine.alerts().active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].rule, "high_cpu");

        engine.shutdown().await.unwrap();
    }
}

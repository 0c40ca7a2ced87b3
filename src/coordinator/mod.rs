pub mod force;

pub use force::{ForceAction, ForceActionFile, ForceCommand};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::domain::{
    ChargeDecision, DecisionKind, DecisionRecord, DerivedMetrics, Freshness, Inverter,
    OperationMode, PriceCurve, PricePoint, Priority, ResolvedAction, SellAction, SellDecision,
    SellMutation, SellingStatus, SystemSnapshot,
};
#[cfg(any(feature = "sim", test))]
use crate::domain::SimulatedInverter;
use crate::engine::{
    ChargeContext, ChargingEngine, ChargingState, SellContext, SellingEngine, SellingState,
};
use crate::forecast::{ConsumptionHistory, ForecastSource, HttpForecastClient};
use crate::market::{CachedPrices, PriceCacheFile, PriceSource, PseDayAheadClient};
use crate::storage::{DecisionStore, JsonlStore, PartialSessionLedger, SocDropLedger};
use crate::tariff::TariffCalculator;
use crate::telemetry::efficiency_score;
use crate::thresholds::ThresholdEngine;
use crate::util::{Clock, SystemClock};

/// Raised when the inverter has been lost beyond the configured fatal
/// timeout; main maps it to exit code 2.
#[derive(Debug, Error)]
#[error("inverter unreachable beyond fatal timeout")]
pub struct FatalRuntime;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

impl AppState {
    pub async fn new(cfg: AppConfig) -> Result<Self> {
        let tz = cfg.controller.tz()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(tz));

        #[cfg(feature = "sim")]
        {
            let inverter: Arc<dyn Inverter> = Arc::new(SimulatedInverter::new(50.0));
            return Self::with_collaborators(cfg, clock, inverter, None, None).await;
        }

        #[cfg(not(feature = "sim"))]
        {
            let _ = clock;
            anyhow::bail!(
                "no inverter driver compiled in; enable the `sim` feature or wire a driver via AppState::with_collaborators"
            );
        }
    }

    /// Wire the coordinator with explicit collaborators (tests, alternate
    /// hardware drivers).
    pub async fn with_collaborators(
        cfg: AppConfig,
        clock: Arc<dyn Clock>,
        inverter: Arc<dyn Inverter>,
        price_source: Option<Arc<dyn PriceSource>>,
        store: Option<Arc<dyn DecisionStore>>,
    ) -> Result<Self> {
        // First contact with the inverter is an init-fatal condition.
        let mut attempt = 0;
        loop {
            match inverter.connect().await {
                Ok(()) => break,
                Err(e) if attempt < cfg.controller.max_action_retries => {
                    attempt += 1;
                    warn!(error = %e, attempt, "inverter connect failed, retrying");
                    tokio::time::sleep(Duration::from_millis(
                        cfg.controller.retry_delay_ms * (1 << attempt.min(4)) as u64,
                    ))
                    .await;
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e))
                        .context("inverter unreachable during startup");
                }
            }
        }

        let data_dir = cfg.controller.data_dir.clone();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;

        let price_source: Arc<dyn PriceSource> = match price_source {
            Some(source) => source,
            None => Arc::new(PseDayAheadClient::new(
                cfg.market.base_url.clone(),
                Duration::from_secs(cfg.market.http_timeout_seconds),
                clock.timezone(),
            )?),
        };

        let forecast_source: Option<Arc<dyn ForecastSource>> = if cfg.forecast.enabled {
            cfg.forecast
                .base_url
                .as_ref()
                .map(|url| {
                    HttpForecastClient::new(
                        url.clone(),
                        Duration::from_secs(cfg.forecast.http_timeout_seconds),
                    )
                    .map(|client| Arc::new(client) as Arc<dyn ForecastSource>)
                })
                .transpose()?
        } else {
            None
        };

        let store: Arc<dyn DecisionStore> = match store {
            Some(store) => store,
            None => Arc::new(JsonlStore::new(&data_dir)?),
        };

        let thresholds = ThresholdEngine::new(&cfg.thresholds);
        let price_cache_file = PriceCacheFile::new(&data_dir);

        // Yesterday's curve survives a restart; thresholds learn from it too.
        let mut curve = PriceCurve::default();
        if let Some(cached) = price_cache_file.load() {
            let tariff = TariffCalculator::new(cfg.tariff.clone(), clock.timezone());
            let points = effective_points(&tariff, &cached.points);
            let observations: Vec<(DateTime<Utc>, f64)> = points
                .iter()
                .map(|p| (p.timestamp, p.effective_price_pln_kwh))
                .collect();
            thresholds.observe(&cfg.thresholds, &observations, clock.now_utc());
            curve.merge(points);
            info!(
                business_date = %cached.business_date,
                points = curve.len(),
                "restored price cache"
            );
        }

        let coordinator = Coordinator {
            cfg: RwLock::new(Arc::new(cfg)),
            clock: clock.clone(),
            inverter,
            price_source,
            forecast_source,
            store,
            thresholds,
            charging_engine: ChargingEngine::new(clock.clone()),
            selling_engine: SellingEngine::new(clock.clone()),
            charging_state: Mutex::new(ChargingState::default()),
            selling_state: Mutex::new(SellingState::default()),
            consumption: RwLock::new(ConsumptionHistory::new()),
            snapshot_cache: RwLock::new(None),
            curve: RwLock::new(curve),
            forecast_cache: RwLock::new(Vec::new()),
            soc_ledger: SocDropLedger::load(&data_dir),
            partial_ledger: PartialSessionLedger::load(&data_dir),
            force_file: ForceActionFile::new(&data_dir),
            price_cache_file,
            shutdown: CancellationToken::new(),
            last_snapshot_ok: RwLock::new(clock.now_utc()),
            stats: RwLock::new(DecisionStats::default()),
        };

        Ok(Self {
            coordinator: Arc::new(coordinator),
        })
    }
}

#[derive(Debug, Default, Clone)]
struct DecisionStats {
    decisions: u64,
    charges: u64,
    confidence_sum: f64,
}

impl DecisionStats {
    fn record(&mut self, kind: DecisionKind, confidence: f64) {
        self.decisions += 1;
        if kind == DecisionKind::Charge {
            self.charges += 1;
        }
        self.confidence_sum += confidence;
    }

    fn efficiency(&self) -> f64 {
        if self.decisions == 0 {
            return 0.0;
        }
        efficiency_score(
            self.confidence_sum / self.decisions as f64,
            self.charges as f64 / self.decisions as f64,
        )
    }
}

/// Liveness and cache-age summary served by `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub timestamp: DateTime<Utc>,
    pub charging_session_active: bool,
    pub selling_session_active: bool,
    pub high_price_threshold: f64,
    pub critical_charge_threshold: f64,
    pub threshold_samples: usize,
    pub snapshot_age_seconds: Option<i64>,
    pub price_points: usize,
    pub forecast_points: usize,
    pub today_soc_drop_percent: f64,
    pub efficiency_score: f64,
}

pub struct Coordinator {
    cfg: RwLock<Arc<AppConfig>>,
    clock: Arc<dyn Clock>,
    inverter: Arc<dyn Inverter>,
    price_source: Arc<dyn PriceSource>,
    forecast_source: Option<Arc<dyn ForecastSource>>,
    store: Arc<dyn DecisionStore>,
    thresholds: ThresholdEngine,
    charging_engine: ChargingEngine,
    selling_engine: SellingEngine,
    charging_state: Mutex<ChargingState>,
    selling_state: Mutex<SellingState>,
    consumption: RwLock<ConsumptionHistory>,
    snapshot_cache: RwLock<Option<SystemSnapshot>>,
    curve: RwLock<PriceCurve>,
    forecast_cache: RwLock<Vec<crate::domain::ForecastPoint>>,
    soc_ledger: SocDropLedger,
    partial_ledger: PartialSessionLedger,
    force_file: ForceActionFile,
    price_cache_file: PriceCacheFile,
    shutdown: CancellationToken,
    last_snapshot_ok: RwLock<DateTime<Utc>>,
    stats: RwLock<DecisionStats>,
}

impl Coordinator {
    pub fn config(&self) -> Arc<AppConfig> {
        Arc::clone(&self.cfg.read())
    }

    pub fn store(&self) -> Arc<dyn DecisionStore> {
        Arc::clone(&self.store)
    }

    pub fn latest_snapshot(&self) -> Option<SystemSnapshot> {
        self.snapshot_cache.read().clone()
    }

    pub fn price_curve(&self) -> PriceCurve {
        self.curve.read().clone()
    }

    pub fn submit_force_action(&self, command: ForceCommand) -> Result<()> {
        self.force_file.submit(command, self.clock.now_utc())
    }

    /// Re-read configuration from disk and swap it atomically. Threshold
    /// history, sessions and ledgers survive; the next tick sees the new
    /// values.
    pub fn reload_config(&self) -> Result<()> {
        let fresh = AppConfig::load()?;
        *self.cfg.write() = Arc::new(fresh);
        info!("configuration reloaded");
        Ok(())
    }

    pub fn status(&self) -> CoordinatorStatus {
        let now = self.clock.now_utc();
        let thresholds = self.thresholds.current();
        let snapshot_age = self
            .snapshot_cache
            .read()
            .as_ref()
            .map(|s| (now - s.timestamp).num_seconds());
        let today = self.clock.now_local().date_naive();
        CoordinatorStatus {
            timestamp: now,
            charging_session_active: self
                .charging_state
                .try_lock()
                .map(|s| s.session.is_some())
                .unwrap_or(false),
            selling_session_active: self
                .selling_state
                .try_lock()
                .map(|s| s.session.is_some())
                .unwrap_or(false),
            high_price_threshold: thresholds.high_price_pln_kwh,
            critical_charge_threshold: thresholds.critical_charge_pln_kwh,
            threshold_samples: thresholds.sample_count,
            snapshot_age_seconds: snapshot_age,
            price_points: self.curve.read().len(),
            forecast_points: self.forecast_cache.read().len(),
            today_soc_drop_percent: self.soc_ledger.drop_for(today),
            efficiency_score: self.stats.read().efficiency(),
        }
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Completes when the coordinator is shutting down, whether from a
    /// signal or a fatal runtime condition.
    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFutureOwned {
        self.shutdown.clone().cancelled_owned()
    }

    // ---- background tasks -------------------------------------------------

    async fn inverter_poll_loop(self: Arc<Self>) {
        loop {
            let cfg = self.config();
            let deadline = Duration::from_secs(cfg.controller.io_timeout_seconds);
            match tokio::time::timeout(deadline, self.inverter.snapshot()).await {
                Ok(Ok(snapshot)) => {
                    if let Err(e) = snapshot.validate() {
                        warn!(error = %e, "discarding invalid inverter snapshot");
                    } else {
                        *self.last_snapshot_ok.write() = self.clock.now_utc();
                        self.consumption
                            .write()
                            .record(snapshot.timestamp, snapshot.load_power_w / 1000.0);
                        *self.snapshot_cache.write() = Some(snapshot);
                    }
                }
                Ok(Err(e)) => warn!(error = %e, "inverter snapshot failed"),
                Err(_) => warn!("inverter snapshot timed out"),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(cfg.controller.inverter_refresh_seconds)) => {}
            }
        }
    }

    async fn price_refresh_loop(self: Arc<Self>) {
        loop {
            if let Err(e) = self.refresh_prices().await {
                warn!(error = %e, "price refresh failed");
            }
            if let Err(e) = self.refresh_forecast().await {
                debug!(error = %e, "forecast refresh failed");
            }

            let cfg = self.config();
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(cfg.controller.price_refresh_seconds)) => {}
            }
        }
    }

    async fn refresh_prices(&self) -> Result<()> {
        let cfg = self.config();
        let business_date = self.clock.now_local().date_naive();

        // one fetch per business day is enough; the cache answers the rest
        let already_cached = self
            .price_cache_file
            .load()
            .map(|c| c.business_date == business_date)
            .unwrap_or(false);
        if already_cached && !self.curve.read().is_empty() {
            return Ok(());
        }

        let deadline = Duration::from_secs(cfg.controller.io_timeout_seconds);
        let raw = tokio::time::timeout(deadline, self.price_source.fetch_day_ahead(business_date))
            .await
            .context("price fetch timed out")??;

        self.price_cache_file.store(&CachedPrices {
            business_date,
            fetched_at: self.clock.now_utc(),
            points: raw.clone(),
        })?;

        let tariff = TariffCalculator::new(cfg.tariff.clone(), self.clock.timezone());
        let points = effective_points(&tariff, &raw);
        let observations: Vec<(DateTime<Utc>, f64)> = points
            .iter()
            .map(|p| (p.timestamp, p.effective_price_pln_kwh))
            .collect();
        self.thresholds
            .observe(&cfg.thresholds, &observations, self.clock.now_utc());

        let mut curve = self.curve.write();
        curve.merge(points);
        curve.evict_before(self.clock.now_utc() - ChronoDuration::days(7));
        info!(points = curve.len(), %business_date, "price curve refreshed");
        Ok(())
    }

    async fn refresh_forecast(&self) -> Result<()> {
        let Some(source) = &self.forecast_source else {
            return Ok(());
        };
        let cfg = self.config();
        let deadline = Duration::from_secs(cfg.controller.io_timeout_seconds);
        match tokio::time::timeout(deadline, source.fetch_forecast()).await {
            Ok(Ok(points)) => {
                *self.forecast_cache.write() = points;
                Ok(())
            }
            Ok(Err(e)) => {
                // absent forecast means confidence 0 downstream, not a fault
                self.forecast_cache.write().clear();
                Err(e)
            }
            Err(_) => {
                self.forecast_cache.write().clear();
                anyhow::bail!("forecast fetch timed out")
            }
        }
    }

    async fn metrics_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(900)) => {}
            }
            if let Some(snapshot) = self.latest_snapshot() {
                if let Err(e) = self.store.append_system_state(&snapshot).await {
                    warn!(error = %e, "failed to persist system state");
                }
            }
        }
    }

    #[cfg(unix)]
    async fn signal_loop(self: Arc<Self>) {
        use tokio::signal::unix::{signal, SignalKind};
        let Ok(mut hangup) = signal(SignalKind::hangup()) else {
            return;
        };
        let Ok(mut user1) = signal(SignalKind::user_defined1()) else {
            return;
        };
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = hangup.recv() => {
                    if let Err(e) = self.reload_config() {
                        error!(error = %e, "config reload failed, keeping previous configuration");
                    }
                }
                _ = user1.recv() => {
                    info!("SIGUSR1 received, force action will be consumed next tick");
                }
            }
        }
    }

    // ---- control loop -----------------------------------------------------

    pub async fn control_loop(self: Arc<Self>) -> Result<()> {
        loop {
            let cfg = self.config();
            if self.shutdown.is_cancelled() {
                self.graceful_stop(&cfg).await;
                return Ok(());
            }

            if let Err(e) = self.tick(&cfg).await {
                if e.downcast_ref::<FatalRuntime>().is_some() {
                    // bring the HTTP server down with us so the process exits
                    self.shutdown.cancel();
                    return Err(e);
                }
                error!(error = %e, "control tick failed");
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let cfg = self.config();
                    self.graceful_stop(&cfg).await;
                    return Ok(());
                }
                _ = tokio::time::sleep(Duration::from_secs(cfg.controller.loop_interval_seconds)) => {}
            }
        }
    }

    async fn tick(&self, cfg: &AppConfig) -> Result<()> {
        let now = self.clock.now_utc();
        let local_date = self.clock.now_local().date_naive();

        // Fatal check: the poller has not managed a read for too long.
        let last_ok = *self.last_snapshot_ok.read();
        if (now - last_ok).num_seconds() > cfg.controller.fatal_timeout_seconds as i64 {
            return Err(FatalRuntime.into());
        }

        let Some(snapshot) = self.latest_snapshot() else {
            debug!("no snapshot yet, skipping tick");
            return Ok(());
        };
        if snapshot.freshness(now) == Freshness::Stale {
            let decision = ChargeDecision::wait(
                format!(
                    "Snapshot is {} min old - degraded data, waiting",
                    (now - snapshot.timestamp).num_minutes()
                ),
                Priority::Critical,
                1.0,
            );
            self.record_charge_decision(&snapshot, &decision).await;
            return Ok(());
        }

        {
            let mut charging = self.charging_state.lock().await;
            charging.reset_daily_if_new_day(local_date);
        }
        {
            let mut selling = self.selling_state.lock().await;
            selling.reset_daily_if_new_day(local_date);
        }

        self.thresholds.refresh(&cfg.thresholds, now);

        // Operator force action wins over everything except safety.
        let ttl = ChronoDuration::seconds(cfg.controller.force_action_ttl_seconds as i64);
        if let Some(action) = self.force_file.consume(now, ttl) {
            return self.apply_forced(cfg, &snapshot, action).await;
        }

        // Selling session in progress: the selling engine speaks first.
        if self.selling_state.lock().await.session.is_some() {
            let decision = self.evaluate_selling(cfg, &snapshot).await;
            return self.apply_sell_decision(cfg, &snapshot, decision).await;
        }

        // Charging session in progress.
        if self.charging_state.lock().await.session.is_some() {
            let decision = self.evaluate_charging(cfg, &snapshot).await;
            return self.apply_charge_decision(cfg, &snapshot, decision).await;
        }

        // Fresh evaluation: charging and selling are mutually exclusive,
        // resolved by priority (emergency > sell > charge > wait).
        let charge = self.evaluate_charging(cfg, &snapshot).await;
        let sell = self.evaluate_selling(cfg, &snapshot).await;
        match resolve(&charge, &sell) {
            ResolvedDecision::Charge => self.apply_charge_decision(cfg, &snapshot, charge).await,
            ResolvedDecision::Sell => self.apply_sell_decision(cfg, &snapshot, sell).await,
            ResolvedDecision::Wait => {
                // both engines want to wait; keep the more informative record
                self.record_charge_decision(&snapshot, &charge).await;
                Ok(())
            }
        }
    }

    async fn evaluate_charging(&self, cfg: &AppConfig, snapshot: &SystemSnapshot) -> ChargeDecision {
        // async lock first; the sync cache guards below must not live
        // across an await
        let state = self.charging_state.lock().await;
        let curve = self.curve.read().clone();
        let forecast = self.forecast_cache.read().clone();
        let thresholds = self.thresholds.current();
        let consumption = self.consumption.read();
        let partial_today = self.partial_ledger.count_today(
            self.clock.now_utc(),
            self.clock.timezone(),
            cfg.charging.partial.daily_reset_hour,
        );
        let ctx = ChargeContext {
            snapshot,
            curve: (!curve.is_empty()).then_some(&curve),
            forecast: &forecast,
            state: &state,
            thresholds: &thresholds,
            consumption: &consumption,
            partial_sessions_today: partial_today,
        };
        self.charging_engine.decide(cfg, &ctx)
    }

    async fn evaluate_selling(&self, cfg: &AppConfig, snapshot: &SystemSnapshot) -> SellDecision {
        let state = self.selling_state.lock().await;
        let curve = self.curve.read().clone();
        let forecast = self.forecast_cache.read().clone();
        let thresholds = self.thresholds.current();
        let consumption = self.consumption.read();
        let today = self.clock.now_local().date_naive();
        let ctx = SellContext {
            snapshot,
            curve: (!curve.is_empty()).then_some(&curve),
            forecast: &forecast,
            state: &state,
            thresholds: &thresholds,
            consumption: &consumption,
            today_soc_drop: self.soc_ledger.drop_for(today),
        };
        self.selling_engine.decide(cfg, &ctx)
    }

    async fn apply_forced(
        &self,
        cfg: &AppConfig,
        snapshot: &SystemSnapshot,
        action: ForceAction,
    ) -> Result<()> {
        info!(command = ?action.command, "applying forced action");
        let (resolved, kind, label) = match action.command {
            ForceCommand::Charge => (
                ResolvedAction::Charge {
                    target_soc: cfg.charging.target_soc,
                },
                DecisionKind::Charge,
                "forced charge",
            ),
            ForceCommand::Discharge => (
                ResolvedAction::StartSelling {
                    power_w: cfg.selling.grid_export_limit_w,
                    min_soc: cfg.selling.safety_margin_soc,
                },
                DecisionKind::Sell,
                "forced discharge",
            ),
            ForceCommand::Auto => (ResolvedAction::Wait, DecisionKind::Wait, "forced auto"),
        };

        if action.command == ForceCommand::Auto {
            // cancel whatever was running and fall back to normal control
            self.graceful_stop(cfg).await;
        } else {
            self.apply_with_retry(cfg, &resolved).await?;
        }

        let record = DecisionRecord {
            timestamp: self.clock.now_utc(),
            kind,
            action: format!("{resolved:?}"),
            reason: format!("{label} requested by operator"),
            confidence: 1.0,
            priority: Priority::High,
            snapshot: snapshot.clone(),
            metrics: self.derived_metrics(),
        };
        self.persist_record(record, kind, 1.0).await;
        Ok(())
    }

    async fn apply_charge_decision(
        &self,
        cfg: &AppConfig,
        snapshot: &SystemSnapshot,
        decision: ChargeDecision,
    ) -> Result<()> {
        let had_session = self.charging_state.lock().await.session.is_some();
        let resolved = if decision.should_charge {
            ResolvedAction::Charge {
                target_soc: decision.target_soc.unwrap_or(cfg.charging.target_soc),
            }
        } else if had_session {
            ResolvedAction::StopCharging
        } else {
            ResolvedAction::Wait
        };

        if resolved != ResolvedAction::Wait {
            self.apply_with_retry(cfg, &resolved).await?;
        }

        // mutations apply only after the inverter accepted the command
        {
            let now = self.clock.now_utc();
            let mut state = self.charging_state.lock().await;
            for mutation in &decision.mutations {
                if matches!(mutation, crate::domain::ChargeMutation::RecordPartialSession) {
                    if let Err(e) = self.partial_ledger.record(
                        now,
                        self.clock.timezone(),
                        cfg.charging.partial.daily_reset_hour,
                    ) {
                        warn!(error = %e, "failed to persist partial session");
                    }
                }
                state.apply(mutation, now);
            }
        }

        self.record_charge_decision(snapshot, &decision).await;
        Ok(())
    }

    async fn apply_sell_decision(
        &self,
        cfg: &AppConfig,
        snapshot: &SystemSnapshot,
        decision: SellDecision,
    ) -> Result<()> {
        let resolved = match &decision.action {
            SellAction::Start {
                power_w, min_soc, ..
            } => Some(ResolvedAction::StartSelling {
                power_w: *power_w,
                min_soc: *min_soc,
            }),
            SellAction::Stop => Some(ResolvedAction::StopSelling),
            SellAction::Continue => None,
            SellAction::Wait => None,
        };

        if let Some(resolved) = &resolved {
            self.apply_with_retry(cfg, resolved).await?;
        }

        {
            let mut state = self.selling_state.lock().await;
            let today = self.clock.now_local().date_naive();
            for mutation in &decision.mutations {
                if let SellMutation::CloseSession { end_soc, status } = mutation {
                    if *status != SellingStatus::Failed {
                        if let Some(session) = &state.session {
                            let drop = session.soc_drop(*end_soc);
                            if let Err(e) = self.soc_ledger.record_drop(today, drop) {
                                warn!(error = %e, "failed to persist SOC drop");
                            }
                        }
                    }
                }
                state.apply(mutation);
            }
        }

        let kind = match decision.action {
            SellAction::Wait => DecisionKind::Wait,
            _ => DecisionKind::Sell,
        };
        let priority = match decision.action {
            SellAction::Start { .. } | SellAction::Stop => Priority::High,
            SellAction::Continue => Priority::Medium,
            SellAction::Wait => Priority::Low,
        };
        let record = DecisionRecord {
            timestamp: self.clock.now_utc(),
            kind,
            action: format!("{:?}", decision.action),
            reason: decision.reason.clone(),
            confidence: decision.confidence,
            priority,
            snapshot: snapshot.clone(),
            metrics: self.derived_metrics(),
        };
        self.persist_record(record, kind, decision.confidence).await;
        Ok(())
    }

    async fn record_charge_decision(&self, snapshot: &SystemSnapshot, decision: &ChargeDecision) {
        let kind = if decision.should_charge {
            DecisionKind::Charge
        } else {
            DecisionKind::Wait
        };
        let record = DecisionRecord {
            timestamp: self.clock.now_utc(),
            kind,
            action: if decision.should_charge {
                format!("charge to {:.0}%", decision.target_soc.unwrap_or(0.0))
            } else {
                "wait".to_string()
            },
            reason: decision.reason.clone(),
            confidence: decision.confidence,
            priority: decision.priority,
            snapshot: snapshot.clone(),
            metrics: self.derived_metrics(),
        };
        self.persist_record(record, kind, decision.confidence).await;
    }

    fn derived_metrics(&self) -> DerivedMetrics {
        let thresholds = self.thresholds.current();
        let now = self.clock.now_utc();
        DerivedMetrics {
            current_price_pln_kwh: self.curve.read().effective_at(now),
            high_price_threshold: thresholds.high_price_pln_kwh,
            critical_charge_threshold: thresholds.critical_charge_pln_kwh,
            efficiency_score: self.stats.read().efficiency(),
        }
    }

    async fn persist_record(&self, record: DecisionRecord, kind: DecisionKind, confidence: f64) {
        self.stats.write().record(kind, confidence);
        if let Err(e) = self.store.append_decision(&record).await {
            warn!(error = %e, "failed to persist decision record");
        }
    }

    /// Command the inverter with bounded retries and exponential backoff.
    async fn apply_with_retry(&self, cfg: &AppConfig, action: &ResolvedAction) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.apply_action(cfg, action).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < cfg.controller.max_action_retries => {
                    attempt += 1;
                    let delay = cfg.controller.retry_delay_ms * (1 << attempt.min(4)) as u64;
                    warn!(error = %e, attempt, delay_ms = delay, "inverter command failed, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => {
                    error!(error = %e, action = ?action, "fatal_action_failure: inverter rejected command after retries");
                    return Err(e);
                }
            }
        }
    }

    async fn apply_action(&self, cfg: &AppConfig, action: &ResolvedAction) -> Result<()> {
        let deadline = Duration::from_secs(cfg.controller.io_timeout_seconds);
        let result = async {
            match action {
                ResolvedAction::Charge { .. } => {
                    self.inverter
                        .set_operation_mode(
                            OperationMode::FastCharge,
                            100.0,
                            cfg.battery.emergency_soc,
                        )
                        .await?;
                    self.inverter.start_fast_charge().await
                }
                ResolvedAction::StopCharging => {
                    self.inverter.stop_fast_charge().await?;
                    self.inverter
                        .set_operation_mode(OperationMode::General, 100.0, cfg.battery.critical_soc)
                        .await
                }
                ResolvedAction::StartSelling { power_w, min_soc } => {
                    self.inverter
                        .set_operation_mode(OperationMode::EcoDischarge, 100.0, *min_soc)
                        .await?;
                    self.inverter.set_grid_export_limit(*power_w).await
                }
                ResolvedAction::StopSelling => {
                    self.inverter.set_grid_export_limit(0.0).await?;
                    self.inverter
                        .set_battery_dod(100.0 - cfg.battery.critical_soc)
                        .await?;
                    self.inverter
                        .set_operation_mode(OperationMode::General, 100.0, cfg.battery.critical_soc)
                        .await
                }
                ResolvedAction::ContinueSelling | ResolvedAction::Wait => Ok(()),
            }
        };
        tokio::time::timeout(deadline, result)
            .await
            .map_err(|_| anyhow::anyhow!("inverter command timed out"))?
            .map_err(anyhow::Error::new)
    }

    /// On shutdown: stop charging, stop selling, restore defaults.
    async fn graceful_stop(&self, cfg: &AppConfig) {
        let charging_active = self.charging_state.lock().await.session.is_some();
        if charging_active {
            if let Err(e) = self.apply_action(cfg, &ResolvedAction::StopCharging).await {
                error!(error = %e, "failed to stop charging during shutdown");
            }
            let now = self.clock.now_utc();
            self.charging_state
                .lock()
                .await
                .apply(&crate::domain::ChargeMutation::CloseSession, now);
        }

        let selling_session = self.selling_state.lock().await.session.clone();
        if let Some(session) = selling_session {
            if let Err(e) = self.apply_action(cfg, &ResolvedAction::StopSelling).await {
                error!(error = %e, "failed to stop selling during shutdown");
            }
            let end_soc = self
                .latest_snapshot()
                .map(|s| s.soc_percent)
                .unwrap_or(session.start_soc);
            let today = self.clock.now_local().date_naive();
            if let Err(e) = self.soc_ledger.record_drop(today, session.soc_drop(end_soc)) {
                warn!(error = %e, "failed to persist SOC drop during shutdown");
            }
            self.selling_state
                .lock()
                .await
                .apply(&SellMutation::CloseSession {
                    end_soc,
                    status: SellingStatus::Cancelled,
                });
        }
    }
}

enum ResolvedDecision {
    Charge,
    Sell,
    Wait,
}

/// Priority resolution between a fresh charge and sell evaluation:
/// emergency charge > selling > charging > wait.
fn resolve(charge: &ChargeDecision, sell: &SellDecision) -> ResolvedDecision {
    if charge.should_charge && charge.priority == Priority::Emergency {
        return ResolvedDecision::Charge;
    }
    if sell.is_start() {
        return ResolvedDecision::Sell;
    }
    if charge.should_charge {
        return ResolvedDecision::Charge;
    }
    ResolvedDecision::Wait
}

fn effective_points(
    tariff: &TariffCalculator,
    raw: &[crate::market::RawPricePoint],
) -> Vec<PricePoint> {
    raw.iter()
        .filter_map(|r| {
            tariff
                .effective_price(r.market_price_pln_mwh, r.timestamp, None)
                .map(|effective| PricePoint {
                    timestamp: r.timestamp,
                    market_price_pln_mwh: r.market_price_pln_mwh,
                    effective_price_pln_kwh: effective,
                })
                .map_err(|e| {
                    warn!(error = %e, "skipping unpriceable market slot");
                    e
                })
                .ok()
        })
        .collect()
}

/// Handles to the spawned background tasks; `join` waits for the control
/// loop and surfaces its fatal error, if any.
pub struct CoordinatorRuntime {
    control: JoinHandle<Result<()>>,
    background: Vec<JoinHandle<()>>,
}

impl CoordinatorRuntime {
    pub async fn join(self) -> Result<()> {
        let result = self.control.await.unwrap_or_else(|e| {
            Err(anyhow::anyhow!("control loop panicked: {e}"))
        });
        for handle in self.background {
            handle.abort();
        }
        result
    }
}

pub fn spawn_coordinator_tasks(state: AppState) -> CoordinatorRuntime {
    let coordinator = state.coordinator;

    let mut background = Vec::new();
    background.push(tokio::spawn(Arc::clone(&coordinator).inverter_poll_loop()));
    background.push(tokio::spawn(Arc::clone(&coordinator).price_refresh_loop()));
    background.push(tokio::spawn(Arc::clone(&coordinator).metrics_loop()));
    #[cfg(unix)]
    background.push(tokio::spawn(Arc::clone(&coordinator).signal_loop()));

    let control = tokio::spawn(coordinator.control_loop());
    CoordinatorRuntime {
        control,
        background,
    }
}

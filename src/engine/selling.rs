use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::domain::forecast::{forecast_confidence, max_price, peak_within};
use crate::domain::{
    ForecastPoint, Freshness, PriceCurve, RiskLevel, SellAction, SellDecision, SellMutation,
    SellingSession, SellingStatus, SystemSnapshot,
};
use crate::forecast::ConsumptionHistory;
use crate::thresholds::Thresholds;
use crate::util::Clock;

/// Selling-engine state owned by the coordinator; mutated only through
/// [`SellMutation`] patches.
#[derive(Debug, Default)]
pub struct SellingState {
    pub session: Option<SellingSession>,
    pub daily_cycles: u32,
    pub cycles_date: Option<NaiveDate>,
}

impl SellingState {
    pub fn apply(&mut self, mutation: &SellMutation) {
        match mutation {
            SellMutation::StartSession(session) => {
                self.session = Some(session.clone());
            }
            SellMutation::CloseSession { status, .. } => {
                if let Some(session) = &mut self.session {
                    session.status = *status;
                }
                self.session = None;
            }
            SellMutation::IncrementDailyCycles => {
                self.daily_cycles += 1;
            }
        }
    }

    pub fn reset_daily_if_new_day(&mut self, local_date: NaiveDate) {
        if self.cycles_date != Some(local_date) {
            self.cycles_date = Some(local_date);
            self.daily_cycles = 0;
        }
    }
}

/// Inputs for one selling evaluation.
pub struct SellContext<'a> {
    pub snapshot: &'a SystemSnapshot,
    pub curve: Option<&'a PriceCurve>,
    pub forecast: &'a [ForecastPoint],
    pub state: &'a SellingState,
    pub thresholds: &'a Thresholds,
    pub consumption: &'a ConsumptionHistory,
    /// Cumulative SOC drop already booked for the local date
    pub today_soc_drop: f64,
}

/// Conservative, safety-first battery export policy.
pub struct SellingEngine {
    clock: Arc<dyn Clock>,
}

impl SellingEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn decide(&self, cfg: &AppConfig, ctx: &SellContext) -> SellDecision {
        let now = self.clock.now_utc();
        let soc = ctx.snapshot.soc_percent;

        if ctx.snapshot.freshness(now) == Freshness::Stale {
            return SellDecision::wait(
                "Snapshot stale - refusing to evaluate selling".to_string(),
                RiskLevel::High,
            );
        }

        // An active session is managed before anything else.
        if let Some(session) = &ctx.state.session {
            return self.manage_session(ctx, session, soc);
        }

        if !cfg.selling.enabled {
            return SellDecision::wait("Battery selling disabled".to_string(), RiskLevel::Low);
        }

        let Some(current_price) = ctx.curve.and_then(|c| c.effective_at(now)) else {
            return SellDecision::wait(
                "No price data available for selling evaluation".to_string(),
                RiskLevel::Low,
            );
        };

        let confidence_in_forecast = forecast_confidence(ctx.forecast);
        let emergency = current_price >= cfg.selling.emergency_sell_threshold_pln;
        if emergency {
            info!(
                price = format_args!("{current_price:.3}"),
                "emergency sell mode: price spike overrides protective gates"
            );
        }

        // Safety gates; each failure names the gate in the reason.
        let margin = self.effective_safety_margin(cfg, confidence_in_forecast);
        if let Some(gate_failure) = self.safety_gate_failure(cfg, ctx, soc, margin, emergency) {
            return SellDecision::wait(gate_failure, RiskLevel::High);
        }

        // Daily SOC-drop budget.
        if ctx.today_soc_drop >= cfg.selling.max_soc_drop_per_day {
            return SellDecision::wait(
                format!(
                    "Daily SOC drop limit reached: {:.1}% of {:.0}% max",
                    ctx.today_soc_drop, cfg.selling.max_soc_drop_per_day
                ),
                RiskLevel::High,
            );
        }

        let capacity = cfg.battery.capacity_kwh;
        let efficiency = cfg.battery.discharge_efficiency;
        let sellable_kwh = (soc - margin).max(0.0) / 100.0 * capacity * efficiency;

        // Sell-then-buy prevention: a sale that forces an expensive buy-back
        // later is a net loss, not revenue.
        if cfg.selling.sell_then_buy.enabled && !emergency {
            if let Some(block_reason) =
                self.sell_then_buy_block(cfg, ctx, current_price, sellable_kwh)
            {
                return SellDecision::wait(block_reason, RiskLevel::High);
            }
        }

        // Dynamic minimum SOC keyed to price magnitude.
        if !emergency {
            let min_soc = self.dynamic_min_soc(cfg, ctx, current_price, now);
            if soc < min_soc {
                return SellDecision::wait(
                    format!(
                        "Battery SOC {soc:.0}% below minimum threshold {min_soc:.0}% (price: {current_price:.3} PLN/kWh)"
                    ),
                    RiskLevel::Low,
                );
            }
        }

        if current_price < cfg.selling.min_selling_price_pln {
            return SellDecision::wait(
                format!(
                    "Current price {current_price:.3} PLN/kWh below minimum {:.2} PLN/kWh",
                    cfg.selling.min_selling_price_pln
                ),
                RiskLevel::Low,
            );
        }

        if !emergency {
            let profitable =
                cfg.selling.min_selling_price_pln * cfg.selling.profit_margin_multiplier;
            if current_price < profitable {
                return SellDecision::wait(
                    format!(
                        "Price {current_price:.3} below profitable threshold {profitable:.3} PLN/kWh"
                    ),
                    RiskLevel::Medium,
                );
            }
        }

        // With PV covering the household there is no deficit worth a cycle.
        if ctx.snapshot.pv_power_w >= ctx.snapshot.load_power_w {
            return SellDecision::wait(
                format!(
                    "PV power {:.0} W covers consumption {:.0} W - no need to sell battery",
                    ctx.snapshot.pv_power_w, ctx.snapshot.load_power_w
                ),
                RiskLevel::Low,
            );
        }

        // Cap the sale to the per-session and remaining daily budgets.
        let remaining_daily = cfg.selling.max_soc_drop_per_day - ctx.today_soc_drop;
        let max_drop = (soc - margin)
            .min(cfg.selling.max_soc_drop_per_session)
            .min(remaining_daily);
        if max_drop <= 0.0 {
            return SellDecision::wait(
                format!("SOC drop budget exhausted (daily remaining: {remaining_daily:.1}%)"),
                RiskLevel::Medium,
            );
        }

        let power_w = cfg.selling.grid_export_limit_w;
        let energy_kwh = (max_drop / 100.0) * capacity;
        let duration_hours = energy_kwh / (power_w / 1000.0);

        // Smart timing: a clearly higher peak inside the forecast window is
        // worth waiting for.
        if cfg.selling.smart_timing.enabled
            && !emergency
            && confidence_in_forecast >= cfg.selling.smart_timing.min_confidence
        {
            let window_end = now + Duration::hours(cfg.selling.smart_timing.peak_window_hours);
            if let Some(peak) = peak_within(ctx.forecast, now, window_end) {
                let gain_bar =
                    current_price * (1.0 + cfg.selling.smart_timing.min_peak_gain_ratio);
                if peak.price_pln_kwh >= gain_bar {
                    return SellDecision::wait(
                        format!(
                            "Higher peak {:.3} PLN/kWh at {} within {}h - waiting for peak (current {current_price:.3})",
                            peak.price_pln_kwh,
                            peak.timestamp
                                .with_timezone(&self.clock.timezone())
                                .format("%H:%M"),
                            cfg.selling.smart_timing.peak_window_hours
                        ),
                        RiskLevel::Low,
                    );
                }
            }
        }

        let expected_revenue =
            (power_w / 1000.0) * duration_hours * efficiency * current_price
                * cfg.selling.revenue_factor;

        let deficit_w = (ctx.snapshot.load_power_w - ctx.snapshot.pv_power_w).max(0.0);
        let confidence = self.confidence(cfg, soc, current_price, deficit_w, margin, now);
        let risk_level = self.risk_level(soc, current_price, duration_hours);

        if confidence >= 0.7 && expected_revenue >= 1.0 {
            let min_soc_floor = if emergency {
                0.0
            } else {
                self.dynamic_min_soc(cfg, ctx, current_price, now)
            };
            let session = SellingSession {
                session_id: Uuid::new_v4(),
                start_time: now,
                start_soc: soc,
                target_soc: (soc - max_drop).max(margin),
                selling_power_w: power_w,
                expected_revenue_pln: expected_revenue,
                status: SellingStatus::Active,
            };
            let prefix = if emergency { "EMERGENCY: " } else { "" };
            return SellDecision {
                action: SellAction::Start {
                    power_w,
                    min_soc: session.target_soc,
                    estimated_duration_hours: duration_hours,
                },
                expected_revenue_pln: expected_revenue,
                reason: format!(
                    "{prefix}Good selling opportunity: {soc:.0}% SOC, {current_price:.3} PLN/kWh, {expected_revenue:.2} PLN expected (min SOC floor {min_soc_floor:.0}%)"
                ),
                confidence,
                risk_level,
                mutations: vec![
                    SellMutation::StartSession(session),
                    SellMutation::IncrementDailyCycles,
                ],
            };
        }

        SellDecision::wait(
            format!("Not optimal: confidence {confidence:.2}, revenue {expected_revenue:.2} PLN"),
            risk_level,
        )
    }

    fn manage_session(
        &self,
        ctx: &SellContext,
        session: &SellingSession,
        soc: f64,
    ) -> SellDecision {
        let temp = ctx.snapshot.battery_temp_c;
        if !(-20.0..=50.0).contains(&temp) {
            return SellDecision {
                action: SellAction::Stop,
                expected_revenue_pln: 0.0,
                reason: format!("Battery temperature {temp:.1}C out of range - aborting export"),
                confidence: 1.0,
                risk_level: RiskLevel::High,
                mutations: vec![SellMutation::CloseSession {
                    end_soc: soc,
                    status: SellingStatus::Failed,
                }],
            };
        }

        let voltage = ctx.snapshot.grid_voltage_v;
        if voltage > 0.0 && !(200.0..=250.0).contains(&voltage) {
            return SellDecision {
                action: SellAction::Stop,
                expected_revenue_pln: 0.0,
                reason: format!("Grid voltage {voltage:.0}V outside safe range - aborting export"),
                confidence: 1.0,
                risk_level: RiskLevel::High,
                mutations: vec![SellMutation::CloseSession {
                    end_soc: soc,
                    status: SellingStatus::Failed,
                }],
            };
        }

        if session.reached_target(soc) {
            return SellDecision {
                action: SellAction::Stop,
                expected_revenue_pln: 0.0,
                reason: format!(
                    "Selling target reached (SOC {soc:.0}% at floor {:.0}%)",
                    session.target_soc
                ),
                confidence: 0.95,
                risk_level: RiskLevel::Low,
                mutations: vec![SellMutation::CloseSession {
                    end_soc: soc,
                    status: SellingStatus::Completed,
                }],
            };
        }

        SellDecision {
            action: SellAction::Continue,
            expected_revenue_pln: session.expected_revenue_pln,
            reason: format!(
                "Selling session active (SOC {soc:.0}%, floor {:.0}%)",
                session.target_soc
            ),
            confidence: 0.8,
            risk_level: RiskLevel::Low,
            mutations: Vec::new(),
        }
    }

    /// Evening hours keep a conservative floor for household demand; high
    /// forecast confidence outside them earns the aggressive one.
    fn effective_safety_margin(&self, cfg: &AppConfig, forecast_confidence: f64) -> f64 {
        let risk = &cfg.selling.risk_margin;
        if !risk.enabled {
            return cfg.selling.safety_margin_soc;
        }
        let hour = self.clock.now_local().hour();
        if (risk.evening_start_hour..risk.evening_end_hour).contains(&hour) {
            risk.conservative_margin_soc
        } else if forecast_confidence >= risk.min_confidence_aggressive {
            risk.aggressive_margin_soc
        } else {
            risk.moderate_margin_soc
        }
    }

    fn safety_gate_failure(
        &self,
        cfg: &AppConfig,
        ctx: &SellContext,
        soc: f64,
        margin: f64,
        emergency: bool,
    ) -> Option<String> {
        if soc <= margin {
            return Some(format!(
                "Battery SOC {soc:.0}% below safety margin {margin:.0}%"
            ));
        }

        let temp = ctx.snapshot.battery_temp_c;
        if !(-20.0..=50.0).contains(&temp) {
            return Some(format!(
                "Battery temperature {temp:.1}C outside operating range (-20C to 50C)"
            ));
        }

        let voltage = ctx.snapshot.grid_voltage_v;
        if voltage > 0.0 && !(200.0..=250.0).contains(&voltage) {
            return Some(format!(
                "Grid voltage {voltage:.0}V outside safe range (200-250V)"
            ));
        }

        if ctx.state.daily_cycles >= cfg.selling.max_daily_cycles {
            return Some(format!(
                "Daily cycle limit reached ({}/{})",
                ctx.state.daily_cycles, cfg.selling.max_daily_cycles
            ));
        }

        let hour = self.clock.now_local().hour();
        let night = hour >= cfg.selling.night_start_hour || hour < cfg.selling.night_end_hour;
        if night && !emergency {
            return Some(format!(
                "Night hours - preserving battery charge (hour {hour})"
            ));
        }

        None
    }

    fn sell_then_buy_block(
        &self,
        cfg: &AppConfig,
        ctx: &SellContext,
        current_price: f64,
        sellable_kwh: f64,
    ) -> Option<String> {
        let stb = &cfg.selling.sell_then_buy;
        let local_hour = self.clock.now_local().hour();
        let future_consumption_kwh = ctx.consumption.forecast_total_kwh(
            &cfg.charging.interim,
            local_hour,
            stb.analysis_hours,
        );

        // Consumption the buffer cannot absorb becomes a deficit bought back
        // from the grid later.
        let deficit_kwh =
            (future_consumption_kwh - sellable_kwh * stb.deficit_buffer_ratio).max(0.0);
        if deficit_kwh > sellable_kwh * stb.max_deficit_ratio {
            return Some(format!(
                "Sell-then-buy prevention: would create energy deficit ({deficit_kwh:.1} kWh > {:.0}% of sellable {sellable_kwh:.1} kWh)",
                stb.max_deficit_ratio * 100.0
            ));
        }

        if deficit_kwh > 0.0 {
            let max_future = if ctx.forecast.is_empty() {
                ctx.curve
                    .and_then(|c| {
                        c.peak_between(
                            self.clock.now_utc(),
                            self.clock.now_utc() + Duration::hours(stb.analysis_hours),
                        )
                    })
                    .map(|p| p.effective_price_pln_kwh)
                    .unwrap_or(current_price)
            } else {
                max_price(ctx.forecast, current_price)
            };
            let buy_back_cost = deficit_kwh * max_future * stb.buyback_price_buffer;
            let revenue_estimate = sellable_kwh * 0.8 * current_price;
            if buy_back_cost > revenue_estimate * stb.min_savings_ratio {
                return Some(format!(
                    "Sell-then-buy prevention: buy-back cost {buy_back_cost:.2} PLN exceeds {:.1}x selling revenue {revenue_estimate:.2} PLN",
                    stb.min_savings_ratio
                ));
            }
        }

        None
    }

    /// Price-keyed minimum SOC; the lowered floors require a peak hour and
    /// a recharge opportunity in the forecast.
    fn dynamic_min_soc(
        &self,
        cfg: &AppConfig,
        ctx: &SellContext,
        current_price: f64,
        now: DateTime<Utc>,
    ) -> f64 {
        let dynamic = &cfg.selling.dynamic_soc;
        if !dynamic.enabled {
            return cfg.selling.min_selling_soc;
        }

        let hour = self.clock.now_local().hour();
        if dynamic.require_peak_hours && !cfg.selling.peak_hours.contains(&hour) {
            return cfg.selling.min_selling_soc;
        }

        // Premium prices treat the recharge forecast as advisory; below
        // them it is a hard requirement.
        let premium = current_price >= dynamic.premium_price_pln;
        if dynamic.require_recharge_forecast && !premium {
            let window_end = now + Duration::hours(dynamic.recharge_window_hours);
            let recharge_bar = current_price * dynamic.recharge_price_ratio;
            let in_forecast = ctx
                .forecast
                .iter()
                .any(|p| p.timestamp <= window_end && p.price_pln_kwh <= recharge_bar);
            let in_curve = ctx
                .curve
                .map(|c| {
                    c.points_between(now, window_end)
                        .any(|p| p.effective_price_pln_kwh <= recharge_bar)
                })
                .unwrap_or(false);
            if !in_forecast && !in_curve {
                return cfg.selling.min_selling_soc;
            }
        }

        if current_price >= dynamic.super_premium_price_pln {
            dynamic.super_premium_min_soc
        } else if current_price >= dynamic.premium_price_pln {
            dynamic.premium_min_soc
        } else if current_price >= dynamic.very_high_price_pln {
            dynamic.very_high_min_soc
        } else if current_price >= dynamic.high_price_pln {
            dynamic.high_min_soc
        } else {
            cfg.selling.min_selling_soc
        }
    }

    /// Weighted factors: SOC headroom 30 %, price 30 %, household deficit
    /// 20 %, peak-hour bonus 10 %, margin headroom 10 %.
    fn confidence(
        &self,
        cfg: &AppConfig,
        soc: f64,
        price: f64,
        deficit_w: f64,
        margin: f64,
        _now: DateTime<Utc>,
    ) -> f64 {
        let soc_factor = (soc / 100.0).min(1.0);
        let price_factor = (price / 1.0).min(1.0);
        let deficit_factor = (deficit_w / 2000.0).min(1.0);
        let peak_factor = if cfg
            .selling
            .peak_hours
            .contains(&self.clock.now_local().hour())
        {
            1.0
        } else {
            0.0
        };
        let margin_span = cfg.selling.min_selling_soc - margin;
        let margin_factor = if margin_span <= 0.0 {
            if soc >= cfg.selling.min_selling_soc {
                1.0
            } else {
                0.0
            }
        } else {
            ((soc - margin) / margin_span).clamp(0.0, 1.0)
        };

        (soc_factor * 0.3
            + price_factor * 0.3
            + deficit_factor * 0.2
            + peak_factor * 0.1
            + margin_factor * 0.1)
            .clamp(0.0, 1.0)
    }

    fn risk_level(&self, soc: f64, price: f64, duration_hours: f64) -> RiskLevel {
        let mut score = 0u8;
        if soc < 85.0 {
            score += 1;
        }
        if soc < 75.0 {
            score += 1;
        }
        if price < 0.6 {
            score += 1;
        }
        if price < 0.4 {
            score += 1;
        }
        if duration_hours > 2.0 {
            score += 1;
        }
        if duration_hours > 4.0 {
            score += 1;
        }
        match score {
            0 | 1 => RiskLevel::Low,
            2 | 3 => RiskLevel::Medium,
            _ => RiskLevel::High,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PricePoint;
    use crate::util::FixedClock;
    use chrono::TimeZone;

    fn utc(h: u32, mi: u32) -> DateTime<Utc> {
        // June 2nd 2025: CEST, local = UTC + 2
        Utc.with_ymd_and_hms(2025, 6, 2, h, mi, 0).unwrap()
    }

    fn snapshot(soc: f64, now: DateTime<Utc>) -> SystemSnapshot {
        SystemSnapshot {
            soc_percent: soc,
            battery_temp_c: 25.0,
            pv_power_w: 0.0,
            load_power_w: 1500.0,
            grid_power_w: 1500.0,
            grid_voltage_v: 230.0,
            timestamp: now,
        }
    }

    fn curve(start: DateTime<Utc>, prices: &[f64]) -> PriceCurve {
        PriceCurve::new(
            prices
                .iter()
                .enumerate()
                .map(|(i, &eff)| PricePoint {
                    timestamp: start + Duration::hours(i as i64),
                    market_price_pln_mwh: eff * 1000.0,
                    effective_price_pln_kwh: eff,
                })
                .collect(),
        )
    }

    fn forecast(start: DateTime<Utc>, points: &[(i64, f64, f64)]) -> Vec<ForecastPoint> {
        points
            .iter()
            .map(|&(h, price, confidence)| ForecastPoint {
                timestamp: start + Duration::hours(h),
                price_pln_kwh: price,
                confidence,
            })
            .collect()
    }

    fn thresholds() -> Thresholds {
        Thresholds {
            high_price_pln_kwh: 0.80,
            critical_charge_pln_kwh: 0.45,
            computed_at: Utc::now(),
            sample_count: 100,
        }
    }

    struct Fixture {
        cfg: AppConfig,
        clock: Arc<FixedClock>,
        state: SellingState,
        consumption: ConsumptionHistory,
        today_drop: f64,
    }

    impl Fixture {
        fn new(now: DateTime<Utc>) -> Self {
            // a light household on record keeps the sell-then-buy deficit
            // analysis from dominating the happy paths
            Self::with_household_load(now, 0.2)
        }

        fn with_household_load(now: DateTime<Utc>, load_kw: f64) -> Self {
            let mut consumption = ConsumptionHistory::new();
            for d in 0..3 {
                for h in 0..24 {
                    consumption.record(
                        now - Duration::days(3) + Duration::days(d) + Duration::hours(h),
                        load_kw,
                    );
                }
            }
            Self {
                cfg: AppConfig::default(),
                clock: Arc::new(FixedClock::new(now)),
                state: SellingState::default(),
                consumption,
                today_drop: 0.0,
            }
        }

        fn decide(
            &self,
            snapshot: &SystemSnapshot,
            curve: Option<&PriceCurve>,
            forecast: &[ForecastPoint],
        ) -> SellDecision {
            let engine = SellingEngine::new(self.clock.clone());
            let t = thresholds();
            let ctx = SellContext {
                snapshot,
                curve,
                forecast,
                state: &self.state,
                thresholds: &t,
                consumption: &self.consumption,
                today_soc_drop: self.today_drop,
            };
            engine.decide(&self.cfg, &ctx)
        }
    }

    /// 17:00 UTC = 19:00 local: peak hour, not evening-safe... but evening
    /// margin applies (18-22 local), so use 15:00 UTC = 17:00 local for the
    /// peak-hour-but-not-evening cases.
    fn peak_hour_now() -> DateTime<Utc> {
        utc(15, 0)
    }

    #[test]
    fn below_safety_margin_never_starts() {
        let now = peak_hour_now();
        let fixture = Fixture::new(now);
        let c = curve(now, &[0.90, 0.85]);
        let d = fixture.decide(&snapshot(49.0, now), Some(&c), &[]);
        assert!(!d.is_start());
        assert!(d.reason.contains("safety margin"));
    }

    #[test]
    fn night_hours_block_selling() {
        let now = utc(21, 0); // 23:00 local
        let fixture = Fixture::new(now);
        let c = curve(now, &[0.90]);
        let d = fixture.decide(&snapshot(85.0, now), Some(&c), &[]);
        assert!(!d.is_start());
        assert!(d.reason.contains("Night hours"));
    }

    #[test]
    fn emergency_spike_overrides_night_block() {
        let now = utc(21, 0); // 23:00 local
        let fixture = Fixture::new(now);
        let c = curve(now, &[1.60]);
        let d = fixture.decide(&snapshot(85.0, now), Some(&c), &[]);
        assert!(d.is_start());
        assert!(d.reason.contains("EMERGENCY"));
    }

    #[test]
    fn battery_temperature_gates_selling() {
        let now = peak_hour_now();
        let fixture = Fixture::new(now);
        let c = curve(now, &[0.90]);
        let mut snap = snapshot(85.0, now);
        snap.battery_temp_c = 55.0;
        let d = fixture.decide(&snap, Some(&c), &[]);
        assert!(!d.is_start());
        assert!(d.reason.contains("temperature"));
    }

    #[test]
    fn grid_voltage_gates_selling() {
        let now = peak_hour_now();
        let fixture = Fixture::new(now);
        let c = curve(now, &[0.90]);
        let mut snap = snapshot(85.0, now);
        snap.grid_voltage_v = 260.0;
        let d = fixture.decide(&snap, Some(&c), &[]);
        assert!(!d.is_start());
        assert!(d.reason.contains("voltage"));
    }

    #[test]
    fn zero_voltage_reading_is_ignored() {
        let now = peak_hour_now();
        let fixture = Fixture::new(now);
        let c = curve(now, &[0.90]);
        let mut snap = snapshot(85.0, now);
        snap.grid_voltage_v = 0.0;
        let d = fixture.decide(&snap, Some(&c), &[]);
        assert!(d.is_start(), "invalid voltage reading must not block: {}", d.reason);
    }

    #[test]
    fn daily_cycle_limit_blocks() {
        let now = peak_hour_now();
        let mut fixture = Fixture::new(now);
        fixture.state.daily_cycles = 2;
        let c = curve(now, &[0.90]);
        let d = fixture.decide(&snapshot(85.0, now), Some(&c), &[]);
        assert!(!d.is_start());
        assert!(d.reason.contains("cycle limit"));
    }

    #[test]
    fn daily_soc_drop_budget_blocks() {
        let now = peak_hour_now();
        let mut fixture = Fixture::new(now);
        fixture.today_drop = 40.0;
        let c = curve(now, &[0.90]);
        let d = fixture.decide(&snapshot(85.0, now), Some(&c), &[]);
        assert!(!d.is_start());
        assert!(d.reason.contains("Daily SOC drop limit"));
    }

    #[test]
    fn remaining_daily_budget_caps_the_sale() {
        let now = peak_hour_now();
        let mut fixture = Fixture::new(now);
        fixture.today_drop = 25.0; // 15% left of the 40% daily budget
        let c = curve(now, &[0.90]);
        let d = fixture.decide(&snapshot(85.0, now), Some(&c), &[]);
        if let SellAction::Start { min_soc, .. } = d.action {
            // only the remaining 15% may be sold: floor = 85 - 15
            assert!((min_soc - 70.0).abs() < 1e-9, "floor was {min_soc}");
        } else {
            panic!("expected start, got {:?}: {}", d.action, d.reason);
        }
    }

    #[test]
    fn evening_uses_conservative_margin() {
        let now = utc(17, 0); // 19:00 local, evening band
        let fixture = Fixture::new(now);
        let c = curve(now, &[0.90]);
        // 54% sits below the 55% conservative margin but above moderate 50%
        let d = fixture.decide(&snapshot(54.0, now), Some(&c), &[]);
        assert!(!d.is_start());
        assert!(d.reason.contains("55"));
    }

    #[test]
    fn high_confidence_forecast_earns_aggressive_margin() {
        let now = peak_hour_now();
        let fixture = Fixture::new(now);
        let c = curve(now, &[0.90]);
        let f = forecast(now, &[(1, 0.85, 0.9), (2, 0.80, 0.9)]);
        // 49% is above the aggressive 48% margin but below moderate 50%
        let d = fixture.decide(&snapshot(49.0, now), Some(&c), &f);
        // the gate passes; the decision then fails later gates (min SOC),
        // proving the 48% margin was in effect
        assert!(!d.reason.contains("safety margin"));
    }

    #[test]
    fn sell_then_buy_blocks_large_deficit() {
        let now = peak_hour_now();
        // heavy consumption on record: 3 kW around the clock
        let fixture = Fixture::with_household_load(now, 3.0);
        let c = curve(now, &[0.85]);
        let f = forecast(now, &[(2, 1.20, 0.8), (4, 1.50, 0.8)]);
        let d = fixture.decide(&snapshot(82.0, now), Some(&c), &f);
        assert!(!d.is_start());
        assert!(d.reason.contains("Sell-then-buy"));
        assert!(d.reason.contains("energy deficit"));
    }

    #[test]
    fn sell_then_buy_blocks_costly_buyback() {
        let now = peak_hour_now();
        // modest deficit, but the buy-back would land on a 1.50 PLN/kWh peak
        let fixture = Fixture::with_household_load(now, 0.45);
        let c = curve(now, &[0.55]);
        let f = forecast(now, &[(6, 1.50, 0.8)]);
        let d = fixture.decide(&snapshot(85.0, now), Some(&c), &f);
        assert!(!d.is_start());
        assert!(d.reason.contains("buy-back cost"), "reason: {}", d.reason);
    }

    #[test]
    fn dynamic_floor_super_premium_sells_from_seventy() {
        let now = peak_hour_now(); // 17:00 local, peak hour
        let fixture = Fixture::new(now);
        let c = curve(now, &[1.25]);
        // recharge opportunity at 0.60 within 4h
        let f = forecast(now, &[(4, 0.60, 0.9)]);
        let d = fixture.decide(&snapshot(72.0, now), Some(&c), &f);
        assert!(d.is_start(), "expected start: {}", d.reason);
        assert!(d.reason.contains("70"), "floor should be 70: {}", d.reason);
    }

    #[test]
    fn dynamic_floor_falls_back_outside_peak_hours() {
        let now = utc(8, 0); // 10:00 local, not a peak hour
        let fixture = Fixture::new(now);
        let c = curve(now, &[1.25]);
        let f = forecast(now, &[(4, 0.60, 0.9)]);
        let d = fixture.decide(&snapshot(72.0, now), Some(&c), &f);
        assert!(!d.is_start());
        assert!(d.reason.contains("80"));
    }

    #[test]
    fn recharge_opportunity_required_below_premium() {
        let now = peak_hour_now();
        let fixture = Fixture::new(now);
        // 0.85: very-high tier wants 60% floor, but no recharge opportunity
        let c = curve(now, &[0.85, 0.84, 0.83]);
        let d = fixture.decide(&snapshot(65.0, now), Some(&c), &[]);
        assert!(!d.is_start());
        assert!(d.reason.contains("80"), "defaults to 80: {}", d.reason);
    }

    #[test]
    fn min_selling_price_gate() {
        let now = peak_hour_now();
        let mut fixture = Fixture::new(now);
        fixture.cfg.selling.dynamic_soc.enabled = false;
        let c = curve(now, &[0.40]);
        let d = fixture.decide(&snapshot(85.0, now), Some(&c), &[]);
        assert!(!d.is_start());
        assert!(d.reason.contains("below minimum"));
    }

    #[test]
    fn profit_margin_gate() {
        let now = peak_hour_now();
        let mut fixture = Fixture::new(now);
        fixture.cfg.selling.dynamic_soc.enabled = false;
        // above min 0.50 but below 0.75 profitable threshold
        let c = curve(now, &[0.60]);
        let d = fixture.decide(&snapshot(85.0, now), Some(&c), &[]);
        assert!(!d.is_start());
        assert!(d.reason.contains("profitable threshold"));
    }

    #[test]
    fn pv_surplus_blocks_selling() {
        let now = peak_hour_now();
        let fixture = Fixture::new(now);
        let c = curve(now, &[0.90]);
        let mut snap = snapshot(85.0, now);
        snap.pv_power_w = 2000.0;
        snap.load_power_w = 1500.0;
        let d = fixture.decide(&snap, Some(&c), &[]);
        assert!(!d.is_start());
        assert!(d.reason.contains("covers consumption"));
    }

    #[test]
    fn smart_timing_waits_for_higher_peak() {
        let now = peak_hour_now();
        let fixture = Fixture::new(now);
        let c = curve(now, &[0.90]);
        // 1.20 within 6h is >= 10% above 0.90
        let f = forecast(now, &[(3, 1.20, 0.8)]);
        let d = fixture.decide(&snapshot(85.0, now), Some(&c), &f);
        assert!(!d.is_start());
        assert!(d.reason.contains("waiting for peak"));
    }

    #[test]
    fn good_opportunity_starts_with_mutations() {
        let now = peak_hour_now();
        let fixture = Fixture::new(now);
        let c = curve(now, &[0.90]);
        let d = fixture.decide(&snapshot(85.0, now), Some(&c), &[]);
        assert!(d.is_start(), "expected start: {}", d.reason);
        assert!(d.expected_revenue_pln >= 1.0);
        assert!(d.confidence >= 0.7);
        assert!(d
            .mutations
            .iter()
            .any(|m| matches!(m, SellMutation::StartSession(_))));
        assert!(d
            .mutations
            .iter()
            .any(|m| matches!(m, SellMutation::IncrementDailyCycles)));
    }

    #[test]
    fn active_session_continues_until_target() {
        let now = peak_hour_now();
        let mut fixture = Fixture::new(now);
        fixture.state.session = Some(SellingSession {
            session_id: Uuid::new_v4(),
            start_time: now - Duration::hours(1),
            start_soc: 85.0,
            target_soc: 65.0,
            selling_power_w: 5000.0,
            expected_revenue_pln: 8.0,
            status: SellingStatus::Active,
        });
        let c = curve(now, &[0.90]);

        let d = fixture.decide(&snapshot(75.0, now), Some(&c), &[]);
        assert!(matches!(d.action, SellAction::Continue));

        // within the 1% hysteresis band of the floor
        let d = fixture.decide(&snapshot(66.0, now), Some(&c), &[]);
        assert!(matches!(d.action, SellAction::Stop));
        assert!(d.mutations.iter().any(|m| matches!(
            m,
            SellMutation::CloseSession {
                status: SellingStatus::Completed,
                ..
            }
        )));
    }

    #[test]
    fn session_aborts_on_temperature_excursion() {
        let now = peak_hour_now();
        let mut fixture = Fixture::new(now);
        fixture.state.session = Some(SellingSession {
            session_id: Uuid::new_v4(),
            start_time: now - Duration::minutes(20),
            start_soc: 85.0,
            target_soc: 65.0,
            selling_power_w: 5000.0,
            expected_revenue_pln: 8.0,
            status: SellingStatus::Active,
        });
        let mut snap = snapshot(80.0, now);
        snap.battery_temp_c = 52.0;
        let d = fixture.decide(&snap, None, &[]);
        assert!(matches!(d.action, SellAction::Stop));
        assert!(d.mutations.iter().any(|m| matches!(
            m,
            SellMutation::CloseSession {
                status: SellingStatus::Failed,
                ..
            }
        )));
    }

    #[test]
    fn state_applies_mutations() {
        let mut state = SellingState::default();
        let session = SellingSession {
            session_id: Uuid::new_v4(),
            start_time: Utc::now(),
            start_soc: 85.0,
            target_soc: 65.0,
            selling_power_w: 5000.0,
            expected_revenue_pln: 8.0,
            status: SellingStatus::Active,
        };
        state.apply(&SellMutation::StartSession(session));
        assert!(state.session.is_some());
        state.apply(&SellMutation::IncrementDailyCycles);
        assert_eq!(state.daily_cycles, 1);
        state.apply(&SellMutation::CloseSession {
            end_soc: 66.0,
            status: SellingStatus::Completed,
        });
        assert!(state.session.is_none());
    }

    #[test]
    fn daily_cycles_reset_on_new_day() {
        let mut state = SellingState {
            daily_cycles: 2,
            cycles_date: Some(NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()),
            ..Default::default()
        };
        state.reset_daily_if_new_day(NaiveDate::from_ymd_opt(2025, 6, 2).unwrap());
        assert_eq!(state.daily_cycles, 0);
    }

    proptest::proptest! {
        /// At or below the safety margin the engine never starts a sale.
        #[test]
        fn safety_margin_invariant(soc in 0.0f64..55.0, price in 0.1f64..1.4) {
            let now = peak_hour_now();
            let fixture = Fixture::new(now);
            let c = curve(now, &[price]);
            let d = fixture.decide(&snapshot(soc, now), Some(&c), &[]);
            // 55 covers every possible risk-adjusted margin
            proptest::prop_assert!(!d.is_start());
        }

        /// The daily budget is never exceeded by a newly started session.
        #[test]
        fn daily_budget_invariant(today_drop in 0.0f64..60.0) {
            let now = peak_hour_now();
            let mut fixture = Fixture::new(now);
            fixture.today_drop = today_drop;
            let c = curve(now, &[0.90]);
            let d = fixture.decide(&snapshot(85.0, now), Some(&c), &[]);
            if let SellAction::Start { min_soc, .. } = d.action {
                let drop = 85.0 - min_soc;
                proptest::prop_assert!(today_drop + drop <= 40.0 + 1e-9);
            }
        }
    }
}

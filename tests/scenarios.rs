//! End-to-end decision scenarios driving both engines through realistic
//! household situations.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use gridpilot::config::AppConfig;
use gridpilot::domain::{
    ForecastPoint, PriceCurve, PricePoint, Priority, SellAction, SystemSnapshot,
};
use gridpilot::engine::{
    ChargeContext, ChargingEngine, ChargingState, SellContext, SellingEngine, SellingState,
};
use gridpilot::forecast::ConsumptionHistory;
use gridpilot::thresholds::Thresholds;
use gridpilot::util::FixedClock;

fn utc(h: u32, mi: u32) -> DateTime<Utc> {
    // Monday June 2nd 2025, CEST: local time = UTC + 2
    Utc.with_ymd_and_hms(2025, 6, 2, h, mi, 0).unwrap()
}

fn snapshot(soc: f64, pv_w: f64, load_w: f64, now: DateTime<Utc>) -> SystemSnapshot {
    SystemSnapshot {
        soc_percent: soc,
        battery_temp_c: 25.0,
        pv_power_w: pv_w,
        load_power_w: load_w,
        grid_power_w: load_w - pv_w,
        grid_voltage_v: 230.0,
        timestamp: now,
    }
}

fn curve(start: DateTime<Utc>, effective: &[f64]) -> PriceCurve {
    PriceCurve::new(
        effective
            .iter()
            .enumerate()
            .map(|(i, &price)| PricePoint {
                timestamp: start + Duration::hours(i as i64),
                market_price_pln_mwh: price * 1000.0,
                effective_price_pln_kwh: price,
            })
            .collect(),
    )
}

fn thresholds(high: f64, critical: f64) -> Thresholds {
    Thresholds {
        high_price_pln_kwh: high,
        critical_charge_pln_kwh: critical,
        computed_at: Utc::now(),
        sample_count: 200,
    }
}

fn light_household(now: DateTime<Utc>) -> ConsumptionHistory {
    let mut history = ConsumptionHistory::new();
    for d in 0..3 {
        for h in 0..24 {
            history.record(now - Duration::days(3) + Duration::days(d) + Duration::hours(h), 0.3);
        }
    }
    history
}

fn charge_decision(
    cfg: &AppConfig,
    now: DateTime<Utc>,
    snap: &SystemSnapshot,
    prices: Option<&PriceCurve>,
    forecast: &[ForecastPoint],
    state: &ChargingState,
    t: &Thresholds,
    consumption: &ConsumptionHistory,
) -> gridpilot::domain::ChargeDecision {
    let engine = ChargingEngine::new(Arc::new(FixedClock::new(now)));
    let ctx = ChargeContext {
        snapshot: snap,
        curve: prices,
        forecast,
        state,
        thresholds: t,
        consumption,
        partial_sessions_today: 0,
    };
    engine.decide(cfg, &ctx)
}

fn sell_decision(
    cfg: &AppConfig,
    now: DateTime<Utc>,
    snap: &SystemSnapshot,
    prices: Option<&PriceCurve>,
    forecast: &[ForecastPoint],
    state: &SellingState,
    t: &Thresholds,
    consumption: &ConsumptionHistory,
    today_drop: f64,
) -> gridpilot::domain::SellDecision {
    let engine = SellingEngine::new(Arc::new(FixedClock::new(now)));
    let ctx = SellContext {
        snapshot: snap,
        curve: prices,
        forecast,
        state,
        thresholds: t,
        consumption,
        today_soc_drop: today_drop,
    };
    engine.decide(cfg, &ctx)
}

/// Scenario 1: a nearly empty battery charges immediately at any price.
#[test]
fn emergency_charge_beats_price_spike() {
    let cfg = AppConfig::default();
    let now = utc(12, 0);
    let snap = snapshot(4.0, 0.0, 900.0, now);
    let prices = curve(now, &[1.50, 1.55, 1.45]);
    let history = ConsumptionHistory::new();

    let d = charge_decision(
        &cfg,
        now,
        &snap,
        Some(&prices),
        &[],
        &ChargingState::default(),
        &thresholds(0.80, 0.45),
        &history,
    );

    assert!(d.should_charge);
    assert_eq!(d.priority, Priority::Emergency);
    assert!(d.confidence >= 0.9);
}

/// Scenario 2: at 10% and 21:00 with a steep drop an hour away, the engine
/// waits and says so; at 22:00 with the cheap price live, it charges.
#[test]
fn critical_battery_rides_out_an_imminent_price_drop() {
    let cfg = AppConfig::default();
    let t = thresholds(0.80, 0.45);
    let history = ConsumptionHistory::new();

    // 21:00 local = 19:00 UTC in June
    let evening = utc(19, 0);
    let snap = snapshot(10.0, 0.0, 600.0, evening);
    let prices = curve(evening, &[1.077, 0.660, 0.700, 0.720]);

    let d = charge_decision(
        &cfg,
        evening,
        &snap,
        Some(&prices),
        &[],
        &ChargingState::default(),
        &t,
        &history,
    );
    assert!(!d.should_charge);
    assert!(d.reason.contains("significant price drop coming"), "{}", d.reason);
    assert!(d.reason.contains("1.077 -> 0.660"), "{}", d.reason);

    // one hour later the cheap slot is live
    let late = utc(20, 0);
    let snap = snapshot(10.0, 0.0, 600.0, late);
    let prices = curve(late, &[0.660, 0.700, 0.720]);
    let d = charge_decision(
        &cfg,
        late,
        &snap,
        Some(&prices),
        &[],
        &ChargingState::default(),
        &t,
        &history,
    );
    assert!(d.should_charge, "{}", d.reason);
    assert_eq!(d.priority, Priority::Critical);
}

/// Scenario 3: at 10% with the price strictly above the high threshold the
/// engine holds out and the reason names the high price.
#[test]
fn ten_percent_battery_waits_out_a_high_price() {
    let cfg = AppConfig::default();
    let now = utc(19, 0);
    let snap = snapshot(10.0, 0.0, 600.0, now);
    let prices = curve(now, &[1.10, 0.90, 0.85]);
    let history = ConsumptionHistory::new();

    let d = charge_decision(
        &cfg,
        now,
        &snap,
        Some(&prices),
        &[],
        &ChargingState::default(),
        &thresholds(0.80, 0.45),
        &history,
    );

    assert!(!d.should_charge);
    assert!(d.reason.contains("high price"), "{}", d.reason);
}

/// Scenario 4: multi-window evaluation with interim cost. A cheap window
/// four hours out wins while the waiting cost stays small; when household
/// drain makes waiting expensive, the engine charges now instead.
#[test]
fn multi_window_weighs_savings_against_interim_cost() {
    let cfg = AppConfig::default();
    let now = utc(10, 0);
    let t = thresholds(0.80, 0.45);
    let snap = snapshot(40.0, 0.0, 400.0, now);

    // savings ~5 PLN vs interim ~2 PLN: wait and commit to the +4h window
    let prices = curve(now, &[0.80, 0.70, 0.60, 0.55, 0.30, 0.30, 0.30]);
    let light = light_household(now);
    let d = charge_decision(
        &cfg,
        now,
        &snap,
        Some(&prices),
        &[],
        &ChargingState::default(),
        &t,
        &light,
    );
    assert!(!d.should_charge, "{}", d.reason);
    assert!(d.reason.contains("net benefit"), "{}", d.reason);
    let committed = d.mutations.iter().find_map(|m| match m {
        gridpilot::domain::ChargeMutation::CommitWindow(c) => Some(c.window_time),
        _ => None,
    });
    assert_eq!(committed, Some(now + Duration::hours(4)));

    // a heavy household eats the savings: charge now
    let mut heavy = ConsumptionHistory::new();
    for day in 0..3 {
        for h in 0..24 {
            heavy.record(now - Duration::days(3) + Duration::days(day) + Duration::hours(h), 4.0);
        }
    }
    let d = charge_decision(
        &cfg,
        now,
        &snap,
        Some(&prices),
        &[],
        &ChargingState::default(),
        &t,
        &heavy,
    );
    assert!(d.should_charge, "{}", d.reason);
}

/// Scenario 5: a sale that forces an expensive buy-back later is blocked.
#[test]
fn sell_then_buy_risk_blocks_the_sale() {
    let cfg = AppConfig::default();
    // 17:00 local: peak hour, outside the evening margin band
    let now = utc(15, 0);
    let snap = snapshot(82.0, 0.0, 1500.0, now);
    let prices = curve(now, &[0.85, 0.90, 1.00]);
    // peak at 1.20 in 6h, max future price 1.50
    let forecast = vec![
        ForecastPoint {
            timestamp: now + Duration::hours(6),
            price_pln_kwh: 1.20,
            confidence: 0.8,
        },
        ForecastPoint {
            timestamp: now + Duration::hours(9),
            price_pln_kwh: 1.50,
            confidence: 0.8,
        },
    ];
    // enough predicted consumption to create a multi-kWh deficit
    let mut heavy = ConsumptionHistory::new();
    for day in 0..3 {
        for h in 0..24 {
            heavy.record(now - Duration::days(3) + Duration::days(day) + Duration::hours(h), 2.0);
        }
    }

    let d = sell_decision(
        &cfg,
        now,
        &snap,
        Some(&prices),
        &forecast,
        &SellingState::default(),
        &thresholds(0.80, 0.45),
        &heavy,
        0.0,
    );

    assert!(!d.is_start());
    assert!(d.reason.contains("Sell-then-buy"), "{}", d.reason);
}

/// Scenario 6: super-premium price during a peak hour with a recharge
/// opportunity lowers the selling floor to 70%.
#[test]
fn super_premium_price_sells_from_seventy_two_percent() {
    let cfg = AppConfig::default();
    let now = utc(15, 0); // 17:00 local
    let snap = snapshot(72.0, 0.0, 1500.0, now);
    let prices = curve(now, &[1.25, 1.10, 0.95]);
    // recharge opportunity at 0.60 within 4h
    let forecast = vec![ForecastPoint {
        timestamp: now + Duration::hours(4),
        price_pln_kwh: 0.60,
        confidence: 0.9,
    }];
    let light = light_household(now);

    let d = sell_decision(
        &cfg,
        now,
        &snap,
        Some(&prices),
        &forecast,
        &SellingState::default(),
        &thresholds(0.80, 0.45),
        &light,
        0.0,
    );

    assert!(d.is_start(), "{}", d.reason);
    assert!(d.reason.contains("70"), "{}", d.reason);
    match d.action {
        SellAction::Start { power_w, .. } => {
            assert_eq!(power_w, cfg.selling.grid_export_limit_w);
        }
        other => panic!("expected start, got {other:?}"),
    }
}

/// Selling invariants from the safety model: at or below the safety margin
/// the engine never starts, and the daily budget is never exceeded.
#[test]
fn selling_never_starts_below_margin() {
    let cfg = AppConfig::default();
    let now = utc(15, 0);
    let prices = curve(now, &[0.95]);
    let light = light_household(now);

    for soc in [20.0, 35.0, 48.0, 50.0] {
        let snap = snapshot(soc, 0.0, 1500.0, now);
        let d = sell_decision(
            &cfg,
            now,
            &snap,
            Some(&prices),
            &[],
            &SellingState::default(),
            &thresholds(0.80, 0.45),
            &light,
            0.0,
        );
        assert!(!d.is_start(), "soc {soc}: {}", d.reason);
    }
}

/// The charging engine in safe mode: no curve means charging only below the
/// critical floor.
#[test]
fn missing_price_curve_enters_safe_mode() {
    let cfg = AppConfig::default();
    let now = utc(12, 0);
    let history = ConsumptionHistory::new();
    let t = thresholds(0.80, 0.45);

    let snap = snapshot(9.0, 0.0, 600.0, now);
    let d = charge_decision(&cfg, now, &snap, None, &[], &ChargingState::default(), &t, &history);
    assert!(d.should_charge);

    let snap = snapshot(45.0, 0.0, 600.0, now);
    let d = charge_decision(&cfg, now, &snap, None, &[], &ChargingState::default(), &t, &history);
    assert!(!d.should_charge);
}

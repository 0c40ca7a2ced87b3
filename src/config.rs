use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use validator::Validate;

/// Top-level application configuration
///
/// Hot-reload swaps the whole record atomically; decision engines read the
/// values per call and never cache them.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    pub controller: ControllerConfig,

    #[validate(nested)]
    pub battery: BatteryConfig,

    #[validate(nested)]
    pub tariff: TariffConfig,

    #[validate(nested)]
    pub thresholds: ThresholdConfig,

    #[validate(nested)]
    pub charging: ChargingConfig,

    #[validate(nested)]
    pub selling: SellingConfig,

    #[validate(nested)]
    pub market: MarketConfig,

    #[validate(nested)]
    pub forecast: ForecastConfig,

    #[validate(nested)]
    pub telemetry: TelemetryConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("Failed to parse socket address")
    }
}

/// Control loop and collaborator I/O configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ControllerConfig {
    #[validate(range(min = 1, max = 3600))]
    pub loop_interval_seconds: u64,

    #[serde(default = "default_price_refresh_seconds")]
    #[validate(range(min = 30, max = 3600))]
    pub price_refresh_seconds: u64,

    #[serde(default = "default_inverter_refresh_seconds")]
    #[validate(range(min = 5, max = 600))]
    pub inverter_refresh_seconds: u64,

    /// Hard deadline applied to every external call (inverter, market, forecast)
    #[serde(default = "default_io_timeout_seconds")]
    #[validate(range(min = 1, max = 120))]
    pub io_timeout_seconds: u64,

    #[serde(default = "default_max_action_retries")]
    pub max_action_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Inverter lost for longer than this is a fatal runtime condition (exit 2)
    #[serde(default = "default_fatal_timeout_seconds")]
    pub fatal_timeout_seconds: u64,

    /// Force-action records older than this are ignored
    #[serde(default = "default_force_action_ttl_seconds")]
    pub force_action_ttl_seconds: u64,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// IANA timezone for tariff zones, peak hours and daily resets
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl ControllerConfig {
    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.timezone
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid timezone {}: {}", self.timezone, e))
    }
}

/// Battery pack parameters and the SOC ladder
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[validate(schema(function = "validate_battery_config"))]
pub struct BatteryConfig {
    #[validate(range(min = 0.1, max = 1000.0))]
    pub capacity_kwh: f64,

    #[validate(range(min = 0.1, max = 100.0))]
    pub max_charge_kw: f64,

    #[validate(range(min = 0.1, max = 100.0))]
    pub max_discharge_kw: f64,

    #[serde(default = "default_discharge_efficiency")]
    #[validate(range(min = 0.5, max = 1.0))]
    pub discharge_efficiency: f64,

    /// Below this SOC, charge regardless of price
    #[serde(default = "default_emergency_soc")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub emergency_soc: f64,

    /// Below this SOC, the smart-critical policy applies (strict `<`)
    #[serde(default = "default_critical_soc")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub critical_soc: f64,

    /// Below this SOC, high grid consumption justifies charging at a fair price
    #[serde(default = "default_low_soc")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub low_soc: f64,
}

fn validate_battery_config(config: &BatteryConfig) -> Result<(), validator::ValidationError> {
    if config.emergency_soc >= config.critical_soc {
        return Err(validator::ValidationError::new(
            "emergency_soc must be below critical_soc",
        ));
    }
    if config.critical_soc >= config.low_soc {
        return Err(validator::ValidationError::new(
            "critical_soc must be below low_soc",
        ));
    }
    Ok(())
}

/// Time-of-use tariff configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TariffConfig {
    #[serde(default = "default_tariff_kind")]
    pub kind: TariffKind,

    /// Additive distribution surcharge per zone (PLN/kWh)
    #[serde(default)]
    pub off_peak_surcharge_pln_kwh: f64,

    #[serde(default = "default_day_surcharge")]
    pub day_surcharge_pln_kwh: f64,

    #[serde(default = "default_peak_surcharge")]
    pub peak_surcharge_pln_kwh: f64,

    /// Fixed additive component always included in the effective price
    #[serde(default = "default_service_charge")]
    pub service_charge_pln_kwh: f64,

    /// Regulatory floor; the effective price never drops below it
    #[serde(default = "default_price_floor")]
    pub minimum_price_floor_pln_kwh: f64,

    /// Day-zone hours for two- and three-zone tariffs, as [start, end) pairs
    #[serde(default = "default_day_zone_hours")]
    pub day_zone_hours: Vec<(u32, u32)>,

    /// Peak-zone hours for the three-zone tariff, as [start, end) pairs
    #[serde(default = "default_peak_zone_hours")]
    pub peak_zone_hours: Vec<(u32, u32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TariffKind {
    Flat,
    TwoZone,
    ThreeZone,
    PolicySignal,
}

/// Adaptive price threshold configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ThresholdConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_min_samples")]
    #[validate(range(min = 1, max = 10000))]
    pub min_samples: usize,

    #[serde(default = "default_threshold_update_hours")]
    #[validate(range(min = 1, max = 48))]
    pub update_interval_hours: u32,

    #[serde(default = "default_high_percentile")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub high_percentile: f64,

    #[serde(default = "default_critical_percentile")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub critical_percentile: f64,

    #[serde(default = "default_winter_multiplier")]
    pub winter_multiplier: f64,

    #[serde(default = "default_shoulder_multiplier")]
    pub spring_multiplier: f64,

    #[serde(default = "default_summer_multiplier")]
    pub summer_multiplier: f64,

    #[serde(default = "default_shoulder_multiplier")]
    pub autumn_multiplier: f64,

    /// Clip bounds guarding against distribution collapse
    #[serde(default = "default_high_min")]
    pub high_min_pln_kwh: f64,

    #[serde(default = "default_high_max")]
    pub high_max_pln_kwh: f64,

    #[serde(default = "default_critical_min")]
    pub critical_min_pln_kwh: f64,

    #[serde(default = "default_critical_max")]
    pub critical_max_pln_kwh: f64,

    /// Used until enough samples accumulate
    #[serde(default = "default_fallback_high")]
    pub fallback_high_pln_kwh: f64,

    #[serde(default = "default_fallback_critical")]
    pub fallback_critical_pln_kwh: f64,

    #[serde(default = "default_history_days")]
    #[validate(range(min = 1, max = 60))]
    pub history_days: i64,
}

/// Charging decision engine configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ChargingConfig {
    /// SOC at which a running session stops (near-full)
    #[serde(default = "default_charge_target_soc")]
    #[validate(range(min = 50.0, max = 100.0))]
    pub target_soc: f64,

    /// Multi-window evaluation horizon
    #[serde(default = "default_evaluation_horizon_hours")]
    #[validate(range(min = 1, max = 48))]
    pub evaluation_horizon_hours: i64,

    /// Minimum net benefit (savings minus interim cost) to justify waiting
    #[serde(default = "default_net_benefit_threshold")]
    pub net_benefit_threshold_pln: f64,

    /// Minimum savings percentage to wait at critical SOC
    #[serde(default = "default_min_price_savings_percent")]
    pub min_price_savings_percent: f64,

    /// Base for the dynamic max-wait calculation at critical SOC
    #[serde(default = "default_base_max_wait_hours")]
    pub base_max_wait_hours: f64,

    /// Keep the 10 %-SOC boundary waiting when the price is above the high threshold
    #[serde(default = "default_true")]
    pub wait_at_ten_percent_if_high_price: bool,

    /// PV surplus above which grid charging is pointless
    #[serde(default = "default_overproduction_threshold_w")]
    pub overproduction_threshold_w: f64,

    /// Grid import above which a low battery justifies assisted charging
    #[serde(default = "default_high_consumption_threshold_w")]
    pub high_consumption_threshold_w: f64,

    /// Energy assumed per opportunistic charge when comparing windows
    #[serde(default = "default_window_charge_kwh")]
    pub window_charge_kwh: f64,

    #[validate(nested)]
    #[serde(default)]
    pub commitment: CommitmentConfig,

    #[validate(nested)]
    #[serde(default)]
    pub partial: PartialChargingConfig,

    #[validate(nested)]
    #[serde(default)]
    pub hysteresis: HysteresisConfig,

    #[validate(nested)]
    #[serde(default)]
    pub interim: InterimCostConfig,
}

/// Window commitment (prevents infinite postponement)
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CommitmentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_commitment_margin_minutes")]
    pub margin_minutes: i64,

    /// Postponement allowance for SOC at or above the `low` urgency band
    #[serde(default = "default_max_postponements")]
    pub max_postponements: u32,

    /// SOC below which no postponement is allowed
    #[serde(default = "default_urgency_critical_soc")]
    pub urgency_critical_soc: f64,

    /// SOC below which one postponement is allowed
    #[serde(default = "default_urgency_urgent_soc")]
    pub urgency_urgent_soc: f64,

    /// SOC below which two postponements are allowed
    #[serde(default = "default_urgency_low_soc")]
    pub urgency_low_soc: f64,

    /// Session protection duration buffer over the estimated time-to-target
    #[serde(default = "default_protection_buffer_percent")]
    pub protection_buffer_percent: f64,
}

impl Default for CommitmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            margin_minutes: default_commitment_margin_minutes(),
            max_postponements: default_max_postponements(),
            urgency_critical_soc: default_urgency_critical_soc(),
            urgency_urgent_soc: default_urgency_urgent_soc(),
            urgency_low_soc: default_urgency_low_soc(),
            protection_buffer_percent: default_protection_buffer_percent(),
        }
    }
}

/// Partial and preventive charging
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PartialChargingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_max_partial_sessions")]
    pub max_sessions_per_day: u32,

    #[serde(default = "default_min_partial_charge_kwh")]
    pub min_charge_kwh: f64,

    /// Local hour at which the daily partial-session counter resets
    #[serde(default = "default_partial_reset_hour")]
    #[validate(range(min = 0, max = 23))]
    pub daily_reset_hour: u32,

    #[serde(default = "default_true")]
    pub preventive_enabled: bool,

    #[serde(default = "default_preventive_scan_hours")]
    pub preventive_scan_ahead_hours: i64,

    /// Expensive period must last at least this long to trigger preventive charging
    #[serde(default = "default_preventive_min_duration_hours")]
    pub preventive_min_high_price_duration_hours: f64,

    /// Forecast SOC below this during the expensive period triggers preventive charging
    #[serde(default = "default_preventive_critical_soc")]
    pub preventive_critical_soc_forecast: f64,
}

impl Default for PartialChargingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_sessions_per_day: default_max_partial_sessions(),
            min_charge_kwh: default_min_partial_charge_kwh(),
            daily_reset_hour: default_partial_reset_hour(),
            preventive_enabled: true,
            preventive_scan_ahead_hours: default_preventive_scan_hours(),
            preventive_min_high_price_duration_hours: default_preventive_min_duration_hours(),
            preventive_critical_soc_forecast: default_preventive_critical_soc(),
        }
    }
}

/// Normal-tier hysteresis (session consolidation for battery longevity)
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct HysteresisConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_normal_start_threshold")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub normal_start_threshold: f64,

    #[serde(default = "default_normal_stop_threshold")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub normal_stop_threshold: f64,

    #[serde(default = "default_min_session_minutes")]
    pub min_session_duration_minutes: i64,

    /// Required discharge since the last full charge before a new session may start
    #[serde(default = "default_min_discharge_depth")]
    pub min_discharge_depth_percent: f64,

    #[serde(default = "default_max_sessions_per_day")]
    pub max_sessions_per_day: u32,

    /// Entry price gate: percentile of recent prices
    #[serde(default = "default_entry_percentile")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub entry_percentile: f64,

    /// Fallback entry gate when too few recent prices: multiple of the cheapest next-24h price
    #[serde(default = "default_entry_fallback_multiplier")]
    pub entry_fallback_multiplier: f64,
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            normal_start_threshold: default_normal_start_threshold(),
            normal_stop_threshold: default_normal_stop_threshold(),
            min_session_duration_minutes: default_min_session_minutes(),
            min_discharge_depth_percent: default_min_discharge_depth(),
            max_sessions_per_day: default_max_sessions_per_day(),
            entry_percentile: default_entry_percentile(),
            entry_fallback_multiplier: default_entry_fallback_multiplier(),
        }
    }
}

/// Interim grid-cost estimation while waiting for a cheaper window
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct InterimCostConfig {
    /// Used when the consumption history is shorter than `min_history_hours`
    #[serde(default = "default_fallback_consumption_kw")]
    pub fallback_consumption_kw: f64,

    #[serde(default = "default_min_history_hours")]
    pub min_history_hours: i64,

    #[serde(default = "default_evening_multiplier")]
    pub evening_multiplier: f64,

    #[serde(default = "default_night_multiplier")]
    pub night_multiplier: f64,
}

impl Default for InterimCostConfig {
    fn default() -> Self {
        Self {
            fallback_consumption_kw: default_fallback_consumption_kw(),
            min_history_hours: default_min_history_hours(),
            evening_multiplier: default_evening_multiplier(),
            night_multiplier: default_night_multiplier(),
        }
    }
}

/// Selling decision engine configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[validate(schema(function = "validate_selling_config"))]
pub struct SellingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Default minimum SOC to start a selling session
    #[serde(default = "default_min_selling_soc")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub min_selling_soc: f64,

    /// Floor below which selling is always forbidden (baseline; risk adjustment moves it)
    #[serde(default = "default_safety_margin_soc")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub safety_margin_soc: f64,

    #[serde(default = "default_min_selling_price")]
    pub min_selling_price_pln: f64,

    /// Price must exceed `min_selling_price_pln` times this to be worth a cycle
    #[serde(default = "default_profit_margin_multiplier")]
    pub profit_margin_multiplier: f64,

    /// Price at or above this bypasses the SOC floor, profit gate and sell-then-buy check
    #[serde(default = "default_emergency_sell_threshold")]
    pub emergency_sell_threshold_pln: f64,

    #[serde(default = "default_max_daily_cycles")]
    pub max_daily_cycles: u32,

    #[serde(default = "default_peak_hours")]
    pub peak_hours: Vec<u32>,

    #[serde(default = "default_night_start_hour")]
    pub night_start_hour: u32,

    #[serde(default = "default_night_end_hour")]
    pub night_end_hour: u32,

    #[serde(default = "default_grid_export_limit_w")]
    pub grid_export_limit_w: f64,

    #[serde(default = "default_max_soc_drop_per_session")]
    pub max_soc_drop_per_session: f64,

    #[serde(default = "default_max_soc_drop_per_day")]
    pub max_soc_drop_per_day: f64,

    /// Models grid feed-in deductions; 1.0 = full wholesale price
    #[serde(default = "default_revenue_factor")]
    pub revenue_factor: f64,

    #[validate(nested)]
    #[serde(default)]
    pub dynamic_soc: DynamicSocConfig,

    #[validate(nested)]
    #[serde(default)]
    pub risk_margin: RiskMarginConfig,

    #[validate(nested)]
    #[serde(default)]
    pub smart_timing: SmartTimingConfig,

    #[validate(nested)]
    #[serde(default)]
    pub sell_then_buy: SellThenBuyConfig,
}

fn validate_selling_config(config: &SellingConfig) -> Result<(), validator::ValidationError> {
    if config.safety_margin_soc >= config.min_selling_soc {
        return Err(validator::ValidationError::new(
            "safety_margin_soc must be below min_selling_soc",
        ));
    }
    Ok(())
}

/// Price-keyed minimum SOC to start selling
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DynamicSocConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_super_premium_threshold")]
    pub super_premium_price_pln: f64,

    #[serde(default = "default_super_premium_min_soc")]
    pub super_premium_min_soc: f64,

    #[serde(default = "default_premium_threshold")]
    pub premium_price_pln: f64,

    #[serde(default = "default_premium_min_soc")]
    pub premium_min_soc: f64,

    #[serde(default = "default_very_high_threshold")]
    pub very_high_price_pln: f64,

    #[serde(default = "default_very_high_min_soc")]
    pub very_high_min_soc: f64,

    #[serde(default = "default_high_threshold")]
    pub high_price_pln: f64,

    #[serde(default = "default_high_min_soc")]
    pub high_min_soc: f64,

    #[serde(default = "default_true")]
    pub require_peak_hours: bool,

    #[serde(default = "default_true")]
    pub require_recharge_forecast: bool,

    /// Recharge opportunity means a forecast price at or below this fraction of the current price
    #[serde(default = "default_recharge_price_ratio")]
    pub recharge_price_ratio: f64,

    #[serde(default = "default_recharge_window_hours")]
    pub recharge_window_hours: i64,
}

impl Default for DynamicSocConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            super_premium_price_pln: default_super_premium_threshold(),
            super_premium_min_soc: default_super_premium_min_soc(),
            premium_price_pln: default_premium_threshold(),
            premium_min_soc: default_premium_min_soc(),
            very_high_price_pln: default_very_high_threshold(),
            very_high_min_soc: default_very_high_min_soc(),
            high_price_pln: default_high_threshold(),
            high_min_soc: default_high_min_soc(),
            require_peak_hours: true,
            require_recharge_forecast: true,
            recharge_price_ratio: default_recharge_price_ratio(),
            recharge_window_hours: default_recharge_window_hours(),
        }
    }
}

/// Risk-adjusted safety margin for selling
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct RiskMarginConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_conservative_margin")]
    pub conservative_margin_soc: f64,

    #[serde(default = "default_moderate_margin")]
    pub moderate_margin_soc: f64,

    #[serde(default = "default_aggressive_margin")]
    pub aggressive_margin_soc: f64,

    #[serde(default = "default_evening_start_hour")]
    pub evening_start_hour: u32,

    #[serde(default = "default_evening_end_hour")]
    pub evening_end_hour: u32,

    #[serde(default = "default_aggressive_confidence")]
    pub min_confidence_aggressive: f64,
}

impl Default for RiskMarginConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            conservative_margin_soc: default_conservative_margin(),
            moderate_margin_soc: default_moderate_margin(),
            aggressive_margin_soc: default_aggressive_margin(),
            evening_start_hour: default_evening_start_hour(),
            evening_end_hour: default_evening_end_hour(),
            min_confidence_aggressive: default_aggressive_confidence(),
        }
    }
}

/// Wait-for-peak timing
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SmartTimingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// A peak must be at least this much higher than the current price (fraction)
    #[serde(default = "default_peak_gain_ratio")]
    pub min_peak_gain_ratio: f64,

    #[serde(default = "default_peak_window_hours")]
    pub peak_window_hours: i64,

    #[serde(default = "default_timing_min_confidence")]
    pub min_confidence: f64,
}

impl Default for SmartTimingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_peak_gain_ratio: default_peak_gain_ratio(),
            peak_window_hours: default_peak_window_hours(),
            min_confidence: default_timing_min_confidence(),
        }
    }
}

/// Sell-then-buy prevention
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SellThenBuyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_stb_analysis_hours")]
    pub analysis_hours: i64,

    /// Buy-back price volatility buffer applied to the max forecast price
    #[serde(default = "default_buyback_buffer")]
    pub buyback_price_buffer: f64,

    /// Block when the deficit exceeds this fraction of sellable energy
    #[serde(default = "default_max_deficit_ratio")]
    pub max_deficit_ratio: f64,

    /// Block when buy-back cost exceeds revenue times this ratio
    #[serde(default = "default_min_savings_ratio")]
    pub min_savings_ratio: f64,

    /// Consumption below this fraction of sellable energy is absorbed by the buffer
    #[serde(default = "default_deficit_buffer_ratio")]
    pub deficit_buffer_ratio: f64,
}

impl Default for SellThenBuyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            analysis_hours: default_stb_analysis_hours(),
            buyback_price_buffer: default_buyback_buffer(),
            max_deficit_ratio: default_max_deficit_ratio(),
            min_savings_ratio: default_min_savings_ratio(),
            deficit_buffer_ratio: default_deficit_buffer_ratio(),
        }
    }
}

/// Day-ahead market client configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct MarketConfig {
    #[validate(url)]
    pub base_url: String,

    #[serde(default = "default_io_timeout_seconds")]
    pub http_timeout_seconds: u64,
}

/// Price forecast client configuration (optional collaborator)
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ForecastConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "default_io_timeout_seconds")]
    pub http_timeout_seconds: u64,
}

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,
}

// Default value functions
fn default_true() -> bool { true }
fn default_price_refresh_seconds() -> u64 { 300 }
fn default_inverter_refresh_seconds() -> u64 { 30 }
fn default_io_timeout_seconds() -> u64 { 10 }
fn default_max_action_retries() -> u32 { 3 }
fn default_retry_delay_ms() -> u64 { 1000 }
fn default_fatal_timeout_seconds() -> u64 { 300 }
fn default_force_action_ttl_seconds() -> u64 { 900 }
fn default_data_dir() -> PathBuf { PathBuf::from("data") }
fn default_timezone() -> String { "Europe/Warsaw".to_string() }
fn default_discharge_efficiency() -> f64 { 0.95 }
fn default_emergency_soc() -> f64 { 5.0 }
fn default_critical_soc() -> f64 { 12.0 }
fn default_low_soc() -> f64 { 30.0 }
fn default_tariff_kind() -> TariffKind { TariffKind::TwoZone }
fn default_day_surcharge() -> f64 { 0.10 }
fn default_peak_surcharge() -> f64 { 0.18 }
fn default_service_charge() -> f64 { 0.0892 }
fn default_price_floor() -> f64 { 0.0050 }
fn default_day_zone_hours() -> Vec<(u32, u32)> { vec![(6, 13), (15, 22)] }
fn default_peak_zone_hours() -> Vec<(u32, u32)> { vec![(7, 10), (18, 21)] }
fn default_min_samples() -> usize { 48 }
fn default_threshold_update_hours() -> u32 { 3 }
fn default_high_percentile() -> f64 { 0.75 }
fn default_critical_percentile() -> f64 { 0.25 }
fn default_winter_multiplier() -> f64 { 1.10 }
fn default_summer_multiplier() -> f64 { 0.90 }
fn default_shoulder_multiplier() -> f64 { 1.00 }
fn default_high_min() -> f64 { 0.60 }
fn default_high_max() -> f64 { 1.40 }
fn default_critical_min() -> f64 { 0.25 }
fn default_critical_max() -> f64 { 0.70 }
fn default_fallback_high() -> f64 { 0.80 }
fn default_fallback_critical() -> f64 { 0.45 }
fn default_history_days() -> i64 { 30 }
fn default_charge_target_soc() -> f64 { 90.0 }
fn default_evaluation_horizon_hours() -> i64 { 12 }
fn default_net_benefit_threshold() -> f64 { 0.10 }
fn default_min_price_savings_percent() -> f64 { 30.0 }
fn default_base_max_wait_hours() -> f64 { 6.0 }
fn default_overproduction_threshold_w() -> f64 { 500.0 }
fn default_high_consumption_threshold_w() -> f64 { 2000.0 }
fn default_window_charge_kwh() -> f64 { 10.0 }
fn default_commitment_margin_minutes() -> i64 { 30 }
fn default_max_postponements() -> u32 { 3 }
fn default_urgency_critical_soc() -> f64 { 15.0 }
fn default_urgency_urgent_soc() -> f64 { 20.0 }
fn default_urgency_low_soc() -> f64 { 30.0 }
fn default_protection_buffer_percent() -> f64 { 10.0 }
fn default_max_partial_sessions() -> u32 { 4 }
fn default_min_partial_charge_kwh() -> f64 { 2.0 }
fn default_partial_reset_hour() -> u32 { 6 }
fn default_preventive_scan_hours() -> i64 { 12 }
fn default_preventive_min_duration_hours() -> f64 { 3.0 }
fn default_preventive_critical_soc() -> f64 { 15.0 }
fn default_normal_start_threshold() -> f64 { 85.0 }
fn default_normal_stop_threshold() -> f64 { 95.0 }
fn default_min_session_minutes() -> i64 { 30 }
fn default_min_discharge_depth() -> f64 { 10.0 }
fn default_max_sessions_per_day() -> u32 { 4 }
fn default_entry_percentile() -> f64 { 0.40 }
fn default_entry_fallback_multiplier() -> f64 { 1.10 }
fn default_fallback_consumption_kw() -> f64 { 1.0 }
fn default_min_history_hours() -> i64 { 24 }
fn default_evening_multiplier() -> f64 { 1.5 }
fn default_night_multiplier() -> f64 { 0.8 }
fn default_min_selling_soc() -> f64 { 80.0 }
fn default_safety_margin_soc() -> f64 { 50.0 }
fn default_min_selling_price() -> f64 { 0.50 }
fn default_profit_margin_multiplier() -> f64 { 1.5 }
fn default_emergency_sell_threshold() -> f64 { 1.50 }
fn default_max_daily_cycles() -> u32 { 2 }
fn default_peak_hours() -> Vec<u32> { vec![17, 18, 19, 20, 21] }
fn default_night_start_hour() -> u32 { 22 }
fn default_night_end_hour() -> u32 { 6 }
fn default_grid_export_limit_w() -> f64 { 5000.0 }
fn default_max_soc_drop_per_session() -> f64 { 20.0 }
fn default_max_soc_drop_per_day() -> f64 { 40.0 }
fn default_revenue_factor() -> f64 { 1.0 }
fn default_super_premium_threshold() -> f64 { 1.20 }
fn default_super_premium_min_soc() -> f64 { 70.0 }
fn default_premium_threshold() -> f64 { 0.90 }
fn default_premium_min_soc() -> f64 { 75.0 }
fn default_very_high_threshold() -> f64 { 0.80 }
fn default_very_high_min_soc() -> f64 { 60.0 }
fn default_high_threshold() -> f64 { 0.70 }
fn default_high_min_soc() -> f64 { 80.0 }
fn default_recharge_price_ratio() -> f64 { 0.70 }
fn default_recharge_window_hours() -> i64 { 12 }
fn default_conservative_margin() -> f64 { 55.0 }
fn default_moderate_margin() -> f64 { 50.0 }
fn default_aggressive_margin() -> f64 { 48.0 }
fn default_evening_start_hour() -> u32 { 18 }
fn default_evening_end_hour() -> u32 { 22 }
fn default_aggressive_confidence() -> f64 { 0.8 }
fn default_peak_gain_ratio() -> f64 { 0.10 }
fn default_peak_window_hours() -> i64 { 6 }
fn default_timing_min_confidence() -> f64 { 0.5 }
fn default_stb_analysis_hours() -> i64 { 12 }
fn default_buyback_buffer() -> f64 { 1.25 }
fn default_max_deficit_ratio() -> f64 { 0.5 }
fn default_min_savings_ratio() -> f64 { 1.5 }
fn default_deficit_buffer_ratio() -> f64 { 0.4 }
fn default_log_level() -> String { "info".to_string() }

impl Default for AppConfig {
    /// Defaults suitable for the simulated hardware mode.
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            controller: ControllerConfig {
                loop_interval_seconds: 60,
                price_refresh_seconds: default_price_refresh_seconds(),
                inverter_refresh_seconds: default_inverter_refresh_seconds(),
                io_timeout_seconds: default_io_timeout_seconds(),
                max_action_retries: default_max_action_retries(),
                retry_delay_ms: default_retry_delay_ms(),
                fatal_timeout_seconds: default_fatal_timeout_seconds(),
                force_action_ttl_seconds: default_force_action_ttl_seconds(),
                data_dir: default_data_dir(),
                timezone: default_timezone(),
            },
            battery: BatteryConfig {
                capacity_kwh: 20.0,
                max_charge_kw: 5.0,
                max_discharge_kw: 5.0,
                discharge_efficiency: default_discharge_efficiency(),
                emergency_soc: default_emergency_soc(),
                critical_soc: default_critical_soc(),
                low_soc: default_low_soc(),
            },
            tariff: TariffConfig {
                kind: default_tariff_kind(),
                off_peak_surcharge_pln_kwh: 0.0,
                day_surcharge_pln_kwh: default_day_surcharge(),
                peak_surcharge_pln_kwh: default_peak_surcharge(),
                service_charge_pln_kwh: default_service_charge(),
                minimum_price_floor_pln_kwh: default_price_floor(),
                day_zone_hours: default_day_zone_hours(),
                peak_zone_hours: default_peak_zone_hours(),
            },
            thresholds: ThresholdConfig {
                enabled: true,
                min_samples: default_min_samples(),
                update_interval_hours: default_threshold_update_hours(),
                high_percentile: default_high_percentile(),
                critical_percentile: default_critical_percentile(),
                winter_multiplier: default_winter_multiplier(),
                spring_multiplier: default_shoulder_multiplier(),
                summer_multiplier: default_summer_multiplier(),
                autumn_multiplier: default_shoulder_multiplier(),
                high_min_pln_kwh: default_high_min(),
                high_max_pln_kwh: default_high_max(),
                critical_min_pln_kwh: default_critical_min(),
                critical_max_pln_kwh: default_critical_max(),
                fallback_high_pln_kwh: default_fallback_high(),
                fallback_critical_pln_kwh: default_fallback_critical(),
                history_days: default_history_days(),
            },
            charging: ChargingConfig {
                target_soc: default_charge_target_soc(),
                evaluation_horizon_hours: default_evaluation_horizon_hours(),
                net_benefit_threshold_pln: default_net_benefit_threshold(),
                min_price_savings_percent: default_min_price_savings_percent(),
                base_max_wait_hours: default_base_max_wait_hours(),
                wait_at_ten_percent_if_high_price: true,
                overproduction_threshold_w: default_overproduction_threshold_w(),
                high_consumption_threshold_w: default_high_consumption_threshold_w(),
                window_charge_kwh: default_window_charge_kwh(),
                commitment: CommitmentConfig::default(),
                partial: PartialChargingConfig::default(),
                hysteresis: HysteresisConfig::default(),
                interim: InterimCostConfig::default(),
            },
            selling: SellingConfig {
                enabled: true,
                min_selling_soc: default_min_selling_soc(),
                safety_margin_soc: default_safety_margin_soc(),
                min_selling_price_pln: default_min_selling_price(),
                profit_margin_multiplier: default_profit_margin_multiplier(),
                emergency_sell_threshold_pln: default_emergency_sell_threshold(),
                max_daily_cycles: default_max_daily_cycles(),
                peak_hours: default_peak_hours(),
                night_start_hour: default_night_start_hour(),
                night_end_hour: default_night_end_hour(),
                grid_export_limit_w: default_grid_export_limit_w(),
                max_soc_drop_per_session: default_max_soc_drop_per_session(),
                max_soc_drop_per_day: default_max_soc_drop_per_day(),
                revenue_factor: default_revenue_factor(),
                dynamic_soc: DynamicSocConfig::default(),
                risk_margin: RiskMarginConfig::default(),
                smart_timing: SmartTimingConfig::default(),
                sell_then_buy: SellThenBuyConfig::default(),
            },
            market: MarketConfig {
                base_url: "https://api.raporty.pse.pl".to_string(),
                http_timeout_seconds: default_io_timeout_seconds(),
            },
            forecast: ForecastConfig {
                enabled: false,
                base_url: None,
                http_timeout_seconds: default_io_timeout_seconds(),
            },
            telemetry: TelemetryConfig {
                log_level: default_log_level(),
                log_json: false,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from TOML files and environment variables
    ///
    /// Configuration is loaded in this order (later overrides earlier):
    /// 1. config/default.toml (base configuration)
    /// 2. config/<environment>.toml when an environment is given
    /// 3. Environment variables with GRIDPILOT__ prefix
    pub fn load() -> Result<Self> {
        Self::load_with_env(None)
    }

    /// Load configuration with a specific environment override
    pub fn load_with_env(environment: Option<&str>) -> Result<Self> {
        let mut figment = Figment::new().merge(Toml::file("config/default.toml"));

        if let Some(env) = environment {
            let env_file = format!("config/{}.toml", env);
            figment = figment.merge(Toml::file(env_file));
        }

        // GRIDPILOT__SERVER__PORT -> server.port
        figment = figment.merge(Env::prefixed("GRIDPILOT__").split("__"));

        let config: AppConfig = figment
            .extract()
            .context("Failed to parse configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        Ok(config)
    }
}

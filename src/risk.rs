// ─────────────────────────────────────────────────────────────────────────────
// risk.rs — Risk Monitoring
//
// Observes state after each tick's placements and raises alerts; it never
// mutates trading state and never halts the engine. Breaches alert, the
// engine keeps quoting.
//
//   - MMR: maintenance_margin / equity per account vs. the alert threshold
//   - stuck hedges: unmatched lots older than the configured horizon
//   - daily report boundary: once per UTC+8 day at the configured hour
// ─────────────────────────────────────────────────────────────────────────────
use chrono::{DateTime, FixedOffset, NaiveDate, Timelike, Utc};

use crate::exchange::AccountSummary;
use crate::hedger::SymbolState;

/// The daily report clock runs in UTC+8.
const REPORT_UTC_OFFSET_SECS: i32 = 8 * 3600;

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub mmr_alert_threshold: f64,
    pub stuck_hours: i64,
    /// Hour of day (UTC+8) at which the daily stuck report goes out.
    pub daily_report_hour: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self { mmr_alert_threshold: 0.70, stuck_hours: 6, daily_report_hour: 9 }
    }
}

#[derive(Debug, Clone)]
pub struct StuckLotReport {
    pub instrument: String,
    pub earliest_ts_s: i64,
    pub age_hours: f64,
}

pub struct RiskMonitor {
    config: RiskConfig,
    last_report_day: Option<NaiveDate>,
}

impl RiskMonitor {
    pub fn new(config: RiskConfig) -> Self {
        Self { config, last_report_day: None }
    }

    /// Returns the MMR ratio when it breaches the alert threshold.
    pub fn check_mmr(&self, summary: &AccountSummary) -> Option<f64> {
        if summary.equity <= 0.0 {
            return None;
        }
        let ratio = summary.maintenance_margin / summary.equity;
        if ratio >= self.config.mmr_alert_threshold {
            Some(ratio)
        } else {
            None
        }
    }

    /// Scans one symbol's ledger for lots unmatched past the stuck horizon.
    pub fn find_stuck(&self, state: &SymbolState, now_s: i64) -> Option<StuckLotReport> {
        let earliest = state.lots.earliest_ts()?;
        let age_s = now_s - earliest;
        if age_s < self.config.stuck_hours * 3600 {
            return None;
        }
        Some(StuckLotReport {
            instrument: state.config.instrument.clone(),
            earliest_ts_s: earliest,
            age_hours: age_s as f64 / 3600.0,
        })
    }

    /// True exactly once per UTC+8 day, the first time the clock passes the
    /// configured hour.
    pub fn daily_report_due(&mut self, now: DateTime<Utc>) -> Option<NaiveDate> {
        let local = now.with_timezone(&report_offset());
        if local.hour() < self.config.daily_report_hour {
            return None;
        }
        let today = local.date_naive();
        if self.last_report_day == Some(today) {
            return None;
        }
        self.last_report_day = Some(today);
        Some(today)
    }
}

fn report_offset() -> FixedOffset {
    // 8h east is always a valid offset.
    FixedOffset::east_opt(REPORT_UTC_OFFSET_SECS).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Account, Side};
    use chrono::TimeZone;
    use crate::hedger::{PositionMode, SymbolConfig};
    use crate::ledger::FillLot;

    fn summary(equity: f64, mm: f64) -> AccountSummary {
        AccountSummary { equity, maintenance_margin: mm, available_balance: 0.0 }
    }

    fn symbol_state() -> SymbolState {
        SymbolState::new(SymbolConfig {
            instrument: "BTC_USDT_Perp".to_string(),
            enabled: true,
            order_notional_usdt: 1000.0,
            imbalance_limit_usdt: 2000.0,
            max_total_position_usdt: 0.0,
            min_total_position_usdt: 0.0,
            a_side_when_equal: Side::Buy,
            position_mode: PositionMode::Increase,
        })
    }

    #[test]
    fn test_mmr_threshold() {
        let monitor = RiskMonitor::new(RiskConfig::default());
        assert!(monitor.check_mmr(&summary(1000.0, 500.0)).is_none());
        assert!((monitor.check_mmr(&summary(1000.0, 700.0)).unwrap() - 0.70).abs() < 1e-12);
        assert!(monitor.check_mmr(&summary(1000.0, 900.0)).is_some());
        // Zero equity never divides.
        assert!(monitor.check_mmr(&summary(0.0, 100.0)).is_none());
    }

    #[test]
    fn test_stuck_detection_uses_earliest_lot() {
        let monitor = RiskMonitor::new(RiskConfig::default());
        let mut st = symbol_state();
        assert!(monitor.find_stuck(&st, 100_000).is_none());

        st.lots.push(FillLot {
            account: Account::A,
            instrument: "BTC_USDT_Perp".to_string(),
            side: Side::Buy,
            size: 1.0,
            guard_price: 1000.0,
            ts_s: 0,
        });
        st.lots.push(FillLot {
            account: Account::A,
            instrument: "BTC_USDT_Perp".to_string(),
            side: Side::Buy,
            size: 1.0,
            guard_price: 1000.0,
            ts_s: 20_000,
        });

        // 5h59m: below the 6h horizon.
        assert!(monitor.find_stuck(&st, 6 * 3600 - 60).is_none());
        // Past the horizon: reported with the earliest timestamp.
        let report = monitor.find_stuck(&st, 6 * 3600 + 60).unwrap();
        assert_eq!(report.earliest_ts_s, 0);
        assert!(report.age_hours > 6.0);
    }

    #[test]
    fn test_daily_report_fires_once_per_day() {
        let mut monitor = RiskMonitor::new(RiskConfig::default());

        // 08:00 UTC+8 — before the report hour.
        let before = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        assert!(monitor.daily_report_due(before).is_none());

        // 09:30 UTC+8.
        let due = Utc.with_ymd_and_hms(2024, 5, 1, 1, 30, 0).unwrap();
        assert!(monitor.daily_report_due(due).is_some());
        // Later the same day: already reported.
        let later = Utc.with_ymd_and_hms(2024, 5, 1, 5, 0, 0).unwrap();
        assert!(monitor.daily_report_due(later).is_none());

        // Next day fires again.
        let next = Utc.with_ymd_and_hms(2024, 5, 2, 1, 30, 0).unwrap();
        assert!(monitor.daily_report_due(next).is_some());
    }
}

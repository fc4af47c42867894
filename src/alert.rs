// ─────────────────────────────────────────────────────────────────────────────
// alert.rs — Alert Gateway & Deduplication
//
// One outbound push per alert to a preconfigured chat gateway. Every alert
// kind carries its own dedup cooldown, keyed by (kind, instrument / account /
// order id as appropriate). Push failures are logged and dropped — the tick
// never blocks or retries on the alert path.
//
// Also owns the daily stuck-hedge accumulator and its CSV report file.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    AuthFailure,
    PostOnlyCooldown,
    NonStrategyOrder,
    Mmr,
    StuckHedge,
    PermanentOrderError,
    TransientRepeated,
    DailyStuckReport,
}

impl AlertKind {
    pub fn label(self) -> &'static str {
        match self {
            AlertKind::AuthFailure => "auth_failure",
            AlertKind::PostOnlyCooldown => "post_only_cooldown",
            AlertKind::NonStrategyOrder => "non_strategy_order_present",
            AlertKind::Mmr => "mmr_alert",
            AlertKind::StuckHedge => "stuck_hedge",
            AlertKind::PermanentOrderError => "order_error",
            AlertKind::TransientRepeated => "transient_repeated",
            AlertKind::DailyStuckReport => "daily_stuck_report",
        }
    }

    /// Minimum spacing between two pushes with the same key.
    pub fn cooldown_secs(self) -> i64 {
        match self {
            AlertKind::AuthFailure => 600,
            AlertKind::PostOnlyCooldown => 300,
            AlertKind::NonStrategyOrder => 86_400,
            AlertKind::Mmr => 3_600,
            AlertKind::StuckHedge => 3_600,
            AlertKind::PermanentOrderError => 3_600,
            AlertKind::TransientRepeated => 600,
            AlertKind::DailyStuckReport => 0,
        }
    }
}

/// Chat-gateway endpoint. Absent in tests: alerts then only hit the log.
#[derive(Debug, Clone)]
pub struct AlertGateway {
    pub url: String,
    pub chat_id: String,
    pub api_key: String,
}

pub struct AlertManager {
    gateway: Option<AlertGateway>,
    client: reqwest::Client,
    last_sent: HashMap<String, i64>,
    /// instrument → earliest unmatched-lot timestamp seen today.
    stuck_daily: HashMap<String, i64>,
    report_path: String,
    /// For test assertions and the daily report: everything that passed dedup.
    pub sent_log: Vec<(AlertKind, String)>,
}

impl AlertManager {
    pub fn new(gateway: Option<AlertGateway>, report_path: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            gateway,
            client,
            last_sent: HashMap::new(),
            stuck_daily: HashMap::new(),
            report_path,
            sent_log: Vec::new(),
        }
    }

    /// Emits one alert unless the same (kind, key) fired inside its cooldown.
    /// Returns whether the alert went out.
    pub async fn notify(&mut self, kind: AlertKind, key: &str, text: String, now_s: i64) -> bool {
        let dedup_key = format!("{}:{}", kind.label(), key);
        if let Some(last) = self.last_sent.get(&dedup_key) {
            if now_s - last < kind.cooldown_secs() {
                log::debug!("[ALERT] {} suppressed by dedup window", dedup_key);
                return false;
            }
        }
        self.last_sent.insert(dedup_key, now_s);
        log::warn!("[ALERT] {} {}: {}", kind.label(), key, text);
        self.sent_log.push((kind, text.clone()));
        self.push(&text).await;
        true
    }

    async fn push(&self, text: &str) {
        let Some(gw) = &self.gateway else {
            return;
        };
        let body = serde_json::json!({
            "chat_id": gw.chat_id,
            "api_key": gw.api_key,
            "text": text,
        });
        match self.client.post(&gw.url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => log::error!("[ALERT] gateway returned {}", resp.status()),
            Err(e) => log::error!("[ALERT] push failed: {}", e),
        }
    }

    // ─── Daily stuck report ───────────────────────────────────────────────────

    /// Records one stuck instrument, keeping the earliest unmatched timestamp.
    pub fn record_stuck(&mut self, instrument: &str, earliest_ts_s: i64) {
        self.stuck_daily
            .entry(instrument.to_string())
            .and_modify(|ts| *ts = (*ts).min(earliest_ts_s))
            .or_insert(earliest_ts_s);
    }

    pub fn stuck_count(&self) -> usize {
        self.stuck_daily.len()
    }

    /// Emits the daily report and resets the accumulator. `date` is the UTC+8
    /// report day.
    pub async fn emit_daily_report(&mut self, date: chrono::NaiveDate, now_s: i64) {
        if self.stuck_daily.is_empty() {
            log::info!("[REPORT] {} — no stuck hedges today.", date);
            return;
        }
        let mut entries: Vec<(String, i64)> =
            self.stuck_daily.drain().collect();
        entries.sort();

        let mut lines = vec![format!("Stuck hedge report {} ({} instruments):", date, entries.len())];
        for (instrument, ts) in &entries {
            let age_h = (now_s - ts) as f64 / 3600.0;
            lines.push(format!("  {} unmatched for {:.1}h", instrument, age_h));
        }
        let text = lines.join("\n");

        if let Err(e) = self.append_report_rows(date, &entries, now_s) {
            log::error!("[REPORT] CSV append failed: {}", e);
        }
        self.notify(AlertKind::DailyStuckReport, date.to_string().as_str(), text, now_s)
            .await;
    }

    fn append_report_rows(
        &self,
        date: chrono::NaiveDate,
        entries: &[(String, i64)],
        now_s: i64,
    ) -> Result<(), String> {
        let existed = std::path::Path::new(&self.report_path).exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.report_path)
            .map_err(|e| e.to_string())?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if !existed {
            writer
                .write_record(["date", "instrument", "earliest_unmatched_ts", "age_hours"])
                .map_err(|e| e.to_string())?;
        }
        for (instrument, ts) in entries {
            let age_h = (now_s - ts) as f64 / 3600.0;
            writer
                .write_record([
                    date.to_string(),
                    instrument.clone(),
                    ts.to_string(),
                    format!("{:.2}", age_h),
                ])
                .map_err(|e| e.to_string())?;
        }
        writer.flush().map_err(|e| e.to_string())
    }
}

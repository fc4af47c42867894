// ─────────────────────────────────────────────────────────────────────────────
// hedge-engine-rs: Dual-Account Maker-Only Hedging Engine
//
// Two exchange accounts (A and B) are driven as one symmetric pair: whenever
// one account accumulates a position through a resting post-only order, the
// other account posts the opposing order at a price that keeps the pair at
// worst break-even per fill. The engine never takes liquidity.
//
// One cooperative control loop per process. Per tick: fetch A/B state in
// parallel, reconcile managed orders into the fill ledger, match lots across
// accounts, decide and place under the caps, then run risk checks and alerts.
// ─────────────────────────────────────────────────────────────────────────────
mod alert;
mod exchange;
mod execution;
mod hedger;
mod instruments;
mod ledger;
mod orders;
mod reconcile;
mod risk;
mod signing;
mod symbols;

use alert::{AlertGateway, AlertManager};
use exchange::{Credentials, LiveExchange};
use execution::{EngineConfig, HedgeEngine};
use risk::RiskConfig;

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

/// Missing required configuration is a fatal startup error (exit code 2).
fn env_required(name: &str) -> String {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => v,
        _ => {
            log::error!("{} must be set", name);
            std::process::exit(2);
        }
    }
}

fn load_credentials(tag: &str) -> Credentials {
    Credentials {
        api_key: env_required(&format!("HEDGE_{}_API_KEY", tag)),
        signing_key: env_required(&format!("HEDGE_{}_SIGNING_KEY", tag)),
        account_id: env_required(&format!("HEDGE_{}_ACCOUNT_ID", tag)),
        main_account_id: env_required(&format!("HEDGE_{}_MAIN_ACCOUNT_ID", tag)),
    }
}

#[tokio::main]
async fn main() {
    // Load .env file if present (silently ignored if missing)
    dotenvy::dotenv().ok();
    env_logger::init();
    log::info!("hedge-engine-rs starting…");

    // ─── Environment config ───────────────────────────────────────────────────
    let config = EngineConfig {
        loop_interval_sec: env_u64("HEDGE_LOOP_INTERVAL_SEC", 2),
        book_depth: env_u64("HEDGE_BOOK_DEPTH", 10) as u32,
        single_order_diff_usdt: env_f64("HEDGE_SINGLE_ORDER_DIFF_USDT", 20.0),
        max_runtime_sec: env_u64("HEDGE_MAX_RUNTIME_SEC", 0),
        cancel_on_stop: env_bool("HEDGE_CANCEL_ON_STOP", true),
        stop_keep_strategy_orders: env_u64("HEDGE_STOP_KEEP_ORDERS", 0) as usize,
        post_only_max_retry: env_u64("HEDGE_POST_ONLY_MAX_RETRY", 5) as u32,
        post_only_cooldown_sec: env_u64("HEDGE_POST_ONLY_COOLDOWN_SEC", 300) as i64,
        partial_fill_timeout_sec: env_u64("HEDGE_PARTIAL_FILL_TIMEOUT_SEC", 1800) as i64,
    };
    let risk_config = RiskConfig {
        mmr_alert_threshold: env_f64("HEDGE_MMR_ALERT_THRESHOLD", 0.70),
        stuck_hours: env_u64("HEDGE_STUCK_HOURS", 6) as i64,
        daily_report_hour: env_u64("HEDGE_DAILY_REPORT_HOUR", 9) as u32,
    };

    log::info!("  Loop interval:  {}s", config.loop_interval_sec);
    log::info!("  Max runtime:    {}", if config.max_runtime_sec == 0 {
        "unbounded".to_string()
    } else {
        format!("{}s", config.max_runtime_sec)
    });
    log::info!(
        "  Cancel on stop: {} (keep {})",
        config.cancel_on_stop, config.stop_keep_strategy_orders
    );

    // ─── Symbols file ─────────────────────────────────────────────────────────
    let symbols_path = env_required("HEDGE_SYMBOLS_FILE");
    let symbol_configs = match symbols::load_symbols(&symbols_path) {
        Ok(configs) => configs,
        Err(e) => {
            log::error!("Symbols file rejected: {}", e);
            std::process::exit(2);
        }
    };
    if symbol_configs.iter().filter(|c| c.enabled).count() == 0 {
        log::error!("No enabled symbols in {} — nothing to do.", symbols_path);
        std::process::exit(2);
    }

    // ─── Accounts & alert gateway ─────────────────────────────────────────────
    let base_url = env_required("HEDGE_API_URL");
    let creds_a = load_credentials("A");
    let creds_b = load_credentials("B");
    if creds_a.account_id == creds_b.account_id {
        log::error!("Accounts A and B must be distinct.");
        std::process::exit(2);
    }
    let gateway_a = LiveExchange::new(base_url.clone(), creds_a);
    let gateway_b = LiveExchange::new(base_url, creds_b);

    let alert_gateway = match (
        std::env::var("HEDGE_ALERT_URL"),
        std::env::var("HEDGE_ALERT_CHAT_ID"),
        std::env::var("HEDGE_ALERT_API_KEY"),
    ) {
        (Ok(url), Ok(chat_id), Ok(api_key)) if !url.is_empty() => {
            Some(AlertGateway { url, chat_id, api_key })
        }
        _ => {
            log::warn!("Alert gateway not configured — alerts go to the log only.");
            None
        }
    };
    let report_path = std::env::var("HEDGE_STUCK_REPORT_PATH")
        .unwrap_or_else(|_| "stuck_report.csv".to_string());
    let alerts = AlertManager::new(alert_gateway, report_path);

    // ─── Engine ───────────────────────────────────────────────────────────────
    let mut engine = HedgeEngine::new(
        config.clone(),
        risk_config,
        Box::new(gateway_a),
        Box::new(gateway_b),
        symbol_configs,
        alerts,
    );

    if let Err(e) = engine.reconcile_startup(chrono::Utc::now().timestamp()).await {
        log::error!("Startup reconciliation failed: {}", e);
        std::process::exit(1);
    }

    // ─── Main loop ────────────────────────────────────────────────────────────
    log::info!("Entering main loop [session={}].", engine.session_id);
    let started = std::time::Instant::now();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let mut stop = false;
        tokio::select! {
            _ = &mut shutdown => {
                log::info!("Stop signal received.");
                stop = true;
            }
            _ = tokio::time::sleep(std::time::Duration::from_secs(config.loop_interval_sec)) => {}
        }
        if stop {
            break;
        }
        if config.max_runtime_sec > 0 && started.elapsed().as_secs() >= config.max_runtime_sec {
            log::info!("Max runtime {}s reached.", config.max_runtime_sec);
            break;
        }
        engine.tick(chrono::Utc::now().timestamp()).await;
    }

    engine.shutdown_cleanup().await;
    log::info!("Shutdown complete.");
}

// ─────────────────────────────────────────────────────────────────────────────
// execution.rs — Hedge Execution Engine
//
// Owns both account gateways and every SymbolState, and drives one tick:
//
//   fetch barrier (A ∥ B) → per symbol: position snapshot → order reconcile
//   → lot matching → decide → cancel/place (post-only retry + cooldown)
//   → risk checks and alerts
//
// A fetch failure skips the whole tick; the engine never trades on a view it
// could not refresh. Ambiguous placement outcomes (timeouts) stay PENDING in
// the order table and resolve through the two-tick reconcile grace.
// ─────────────────────────────────────────────────────────────────────────────
use crate::alert::{AlertKind, AlertManager};
use crate::exchange::{
    is_sentinel_order_id, Account, AccountSummary, ExchangeClient, GatewayError, OpenOrderView,
    PerAccount, PositionInfo,
};
use crate::hedger::{self, HedgeAction, PlacePlan, PositionSnapshot, SymbolConfig, SymbolState};
use crate::instruments::InstrumentRegistry;
use crate::ledger::FillLot;
use crate::orders::{ManagedOrder, STRATEGY_CLIENT_ID_BASE, STRATEGY_CLIENT_ID_SPAN};
use crate::risk::{RiskConfig, RiskMonitor};

/// Consecutive transient fetch failures before an alert goes out.
const TRANSIENT_ALERT_THRESHOLD: u32 = 5;

const SHUTDOWN_CANCEL_TIMEOUT_SECS: u64 = 5;

// ─── Engine Config ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub loop_interval_sec: u64,
    pub book_depth: u32,
    /// Below this A/B notional difference the per-account cap tightens to 1.
    pub single_order_diff_usdt: f64,
    /// 0 = run forever.
    pub max_runtime_sec: u64,
    pub cancel_on_stop: bool,
    /// Newest strategy orders kept per (account, instrument) at shutdown.
    pub stop_keep_strategy_orders: usize,
    pub post_only_max_retry: u32,
    pub post_only_cooldown_sec: i64,
    pub partial_fill_timeout_sec: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            loop_interval_sec: 2,
            book_depth: 10,
            single_order_diff_usdt: 20.0,
            max_runtime_sec: 0,
            cancel_on_stop: true,
            stop_keep_strategy_orders: 0,
            post_only_max_retry: 5,
            post_only_cooldown_sec: 300,
            partial_fill_timeout_sec: 1800,
        }
    }
}

// ─── The Hedge Engine ─────────────────────────────────────────────────────────

pub struct HedgeEngine {
    pub config: EngineConfig,
    pub gateways: PerAccount<Box<dyn ExchangeClient>>,
    pub states: Vec<SymbolState>,
    pub alerts: AlertManager,
    pub risk: RiskMonitor,
    pub registry: InstrumentRegistry,
    pub summaries: PerAccount<AccountSummary>,
    pub session_id: String,
    next_client_id: u64,
    consecutive_transient: u32,
}

impl HedgeEngine {
    pub fn new(
        config: EngineConfig,
        risk_config: RiskConfig,
        gateway_a: Box<dyn ExchangeClient>,
        gateway_b: Box<dyn ExchangeClient>,
        symbol_configs: Vec<SymbolConfig>,
        alerts: AlertManager,
    ) -> Self {
        let states = symbol_configs.into_iter().map(SymbolState::new).collect();
        Self {
            config,
            gateways: PerAccount { a: gateway_a, b: gateway_b },
            states,
            alerts,
            risk: RiskMonitor::new(risk_config),
            registry: InstrumentRegistry::new(),
            summaries: PerAccount::default(),
            session_id: uuid::Uuid::new_v4().to_string(),
            next_client_id: seed_client_id(),
            consecutive_transient: 0,
        }
    }

    /// Startup adoption of pre-existing positions and orders, then an
    /// immediate matching pass so opposing synthetic lots pair up.
    pub async fn reconcile_startup(&mut self, now_s: i64) -> Result<(), GatewayError> {
        log::info!("[ENGINE] Startup reconciliation [session={}]...", self.session_id);
        let (ra, rb) = {
            let (ga, gb) = self.gateways.split_mut();
            tokio::join!(fetch_account(ga), fetch_account(gb))
        };
        let (pa, oa, _) = ra?;
        let (pb, ob, _) = rb?;

        for st in &mut self.states {
            crate::reconcile::adopt_positions(st, Account::A, &pa, now_s);
            crate::reconcile::adopt_positions(st, Account::B, &pb, now_s);
            crate::reconcile::adopt_orders(st, Account::A, &oa, &mut self.alerts, now_s).await;
            crate::reconcile::adopt_orders(st, Account::B, &ob, &mut self.alerts, now_s).await;
            st.lots.match_lots();
        }
        log::info!("[ENGINE] Startup reconciliation done.");
        Ok(())
    }

    /// One full tick. Fetch errors skip the tick and surface through alerts.
    pub async fn tick(&mut self, now_s: i64) {
        let (ra, rb) = {
            let (ga, gb) = self.gateways.split_mut();
            tokio::join!(fetch_account(ga), fetch_account(gb))
        };
        let ((pa, oa, sa), (pb, ob, sb)) = match (ra, rb) {
            (Ok(a), Ok(b)) => (a, b),
            (Err(e), _) | (_, Err(e)) => {
                self.handle_fetch_error(e, now_s).await;
                return;
            }
        };
        self.consecutive_transient = 0;
        self.summaries = PerAccount { a: sa, b: sb };

        let HedgeEngine { config, gateways, states, alerts, registry, next_client_id, .. } = self;
        let (ga, gb) = gateways.split_mut();

        for st in states.iter_mut() {
            if !st.config.enabled {
                continue;
            }
            let instrument = st.config.instrument.clone();

            *st.positions.get_mut(Account::A) = snapshot(&pa, &instrument);
            *st.positions.get_mut(Account::B) = snapshot(&pb, &instrument);

            // Metadata once (registry-cached), top of book every tick. A
            // stale book is kept on fetch failure; the tick proceeds with
            // what it has.
            if st.meta.is_none() {
                match registry.ensure(ga.as_mut(), &instrument).await {
                    Ok(meta) => st.meta = Some(meta),
                    Err(e) => {
                        log::warn!("[ENGINE] {} metadata fetch failed: {}", instrument, e);
                        continue;
                    }
                }
            }
            match ga.book_top(&instrument, config.book_depth).await {
                Ok(book) => st.book = Some(book),
                Err(e) => log::warn!("[ENGINE] {} book fetch failed: {} (stale kept)", instrument, e),
            }

            // Reconcile fills -> lots -> match, then decide and act.
            let mut deltas =
                st.orders.reconcile(Account::A, &oa, now_s, config.partial_fill_timeout_sec);
            deltas.extend(
                st.orders.reconcile(Account::B, &ob, now_s, config.partial_fill_timeout_sec),
            );
            for d in deltas {
                log::info!(
                    "[FILL] {} {} {} size={} @ {}",
                    d.instrument, d.account.label(), d.side.label(), d.size, d.price
                );
                st.lots.push(FillLot {
                    account: d.account,
                    instrument: d.instrument,
                    side: d.side,
                    size: d.size,
                    guard_price: d.price,
                    ts_s: now_s,
                });
            }
            st.orders.finalize_terminal();
            st.lots.match_lots();

            let actions = hedger::decide(st, config.single_order_diff_usdt, now_s);
            execute_actions(config, ga, gb, st, alerts, next_client_id, actions, now_s).await;
        }

        self.run_risk_checks(now_s).await;
    }

    async fn run_risk_checks(&mut self, now_s: i64) {
        for account in [Account::A, Account::B] {
            if let Some(ratio) = self.risk.check_mmr(self.summaries.get(account)) {
                self.alerts
                    .notify(
                        AlertKind::Mmr,
                        account.label(),
                        format!(
                            "Account {} MMR {:.3} over threshold (equity {:.2}, mm {:.2})",
                            account.label(),
                            ratio,
                            self.summaries.get(account).equity,
                            self.summaries.get(account).maintenance_margin
                        ),
                        now_s,
                    )
                    .await;
            }
        }

        for st in &self.states {
            if let Some(stuck) = self.risk.find_stuck(st, now_s) {
                self.alerts.record_stuck(&stuck.instrument, stuck.earliest_ts_s);
                self.alerts
                    .notify(
                        AlertKind::StuckHedge,
                        &stuck.instrument,
                        format!(
                            "{} has a hedge lot unmatched for {:.1}h",
                            stuck.instrument, stuck.age_hours
                        ),
                        now_s,
                    )
                    .await;
            }
        }

        if let Some(now) = chrono::DateTime::from_timestamp(now_s, 0) {
            if let Some(date) = self.risk.daily_report_due(now) {
                self.alerts.emit_daily_report(date, now_s).await;
            }
        }
    }

    async fn handle_fetch_error(&mut self, err: GatewayError, now_s: i64) {
        match &err {
            GatewayError::Auth(msg) => {
                log::error!("[ENGINE] Auth failure, skipping tick: {}", msg);
                self.alerts
                    .notify(
                        AlertKind::AuthFailure,
                        "engine",
                        format!("Authentication failure: {}", msg),
                        now_s,
                    )
                    .await;
            }
            GatewayError::RateLimited => {
                log::warn!("[ENGINE] Rate limited, backing off to next tick.");
            }
            other => {
                self.consecutive_transient += 1;
                log::warn!(
                    "[ENGINE] Fetch failed ({} consecutive): {}",
                    self.consecutive_transient, other
                );
                if self.consecutive_transient >= TRANSIENT_ALERT_THRESHOLD {
                    self.alerts
                        .notify(
                            AlertKind::TransientRepeated,
                            "engine",
                            format!(
                                "{} consecutive failed fetch cycles: {}",
                                self.consecutive_transient, other
                            ),
                            now_s,
                        )
                        .await;
                }
            }
        }
    }

    /// Stop-time cleanup: cancel strategy orders except the newest keep-count
    /// per (account, instrument). Foreign orders are never touched.
    pub async fn shutdown_cleanup(&mut self) {
        if !self.config.cancel_on_stop {
            log::info!("[ENGINE] cancel_on_stop disabled — leaving orders resting.");
            return;
        }
        let keep = self.config.stop_keep_strategy_orders;
        let HedgeEngine { gateways, states, .. } = self;
        let (ga, gb) = gateways.split_mut();

        for st in states.iter_mut() {
            let instrument = st.config.instrument.clone();
            for account in [Account::A, Account::B] {
                let to_cancel: Vec<(u64, Option<String>)> = {
                    let live = st.orders.live_strategy(account);
                    // live is oldest-first; keep the newest `keep`.
                    live.iter()
                        .rev()
                        .skip(keep)
                        .map(|o| (o.client_id, o.exchange_order_id.clone()))
                        .collect()
                };
                let gw = if account == Account::A { &mut *ga } else { &mut *gb };
                for (client_id, order_id) in to_cancel {
                    let Some(order_id) = order_id else {
                        log::warn!(
                            "[STOP] {} {} client_id={} has no exchange id — leaving",
                            instrument, account.label(), client_id
                        );
                        continue;
                    };
                    let cancel = gw.cancel(&instrument, &order_id);
                    match tokio::time::timeout(
                        std::time::Duration::from_secs(SHUTDOWN_CANCEL_TIMEOUT_SECS),
                        cancel,
                    )
                    .await
                    {
                        Ok(Ok(())) => {
                            st.orders.mark_cancelled(client_id);
                            log::info!(
                                "[STOP] {} {} cancelled client_id={}",
                                instrument, account.label(), client_id
                            );
                        }
                        Ok(Err(e)) => log::warn!(
                            "[STOP] {} {} cancel failed for client_id={}: {}",
                            instrument, account.label(), client_id, e
                        ),
                        Err(_) => log::warn!(
                            "[STOP] {} {} cancel timed out for client_id={}",
                            instrument, account.label(), client_id
                        ),
                    }
                }
            }
        }
    }
}

// ─── Tick helpers ─────────────────────────────────────────────────────────────

async fn fetch_account(
    gw: &mut Box<dyn ExchangeClient>,
) -> Result<(Vec<PositionInfo>, Vec<OpenOrderView>, AccountSummary), GatewayError> {
    let positions = gw.positions().await?;
    let orders = gw.open_orders().await?;
    let summary = gw.account_summary().await?;
    Ok((positions, orders, summary))
}

fn snapshot(positions: &[PositionInfo], instrument: &str) -> PositionSnapshot {
    positions
        .iter()
        .find(|p| p.instrument == instrument)
        .map(|p| PositionSnapshot { signed_base: p.signed_base, entry_price: p.entry_price })
        .unwrap_or_default()
}

fn seed_client_id() -> u64 {
    let now_ms = chrono::Utc::now().timestamp_millis() as u64;
    let jitter = rand::random::<u16>() as u64;
    STRATEGY_CLIENT_ID_BASE + (now_ms.wrapping_mul(1000).wrapping_add(jitter)) % STRATEGY_CLIENT_ID_SPAN
}

fn take_client_id(next: &mut u64) -> u64 {
    let id = *next;
    *next += 1;
    if *next >= STRATEGY_CLIENT_ID_BASE + STRATEGY_CLIENT_ID_SPAN {
        *next = STRATEGY_CLIENT_ID_BASE;
    }
    id
}

async fn execute_actions(
    config: &EngineConfig,
    ga: &mut Box<dyn ExchangeClient>,
    gb: &mut Box<dyn ExchangeClient>,
    st: &mut SymbolState,
    alerts: &mut AlertManager,
    next_client_id: &mut u64,
    actions: Vec<HedgeAction>,
    now_s: i64,
) {
    for action in actions {
        match action {
            HedgeAction::Cancel { account, client_id } => {
                let instrument = st.config.instrument.clone();
                let order_id =
                    st.orders.get(client_id).and_then(|o| o.exchange_order_id.clone());
                let Some(order_id) = order_id else {
                    log::debug!(
                        "[CANCEL] {} {} client_id={} has no exchange id yet — next tick",
                        instrument, account.label(), client_id
                    );
                    continue;
                };
                let gw = if account == Account::A { &mut *ga } else { &mut *gb };
                match gw.cancel(&instrument, &order_id).await {
                    Ok(()) => {
                        st.orders.mark_cancelled(client_id);
                        log::info!(
                            "[CANCEL] {} {} client_id={} ({})",
                            instrument, account.label(), client_id, order_id
                        );
                    }
                    // Keep tracking; the reconcile pass settles the truth.
                    Err(e) => log::warn!(
                        "[CANCEL] {} {} failed for client_id={}: {}",
                        instrument, account.label(), client_id, e
                    ),
                }
            }
            HedgeAction::Place(plan) => {
                let gw = if plan.account == Account::A { &mut *ga } else { &mut *gb };
                place_with_retry(config, gw, st, alerts, next_client_id, plan, now_s).await;
            }
        }
    }
}

/// Submits one planned order, re-pricing on post-only rejection up to the
/// retry budget. Every retry honours the plan's guard price. Exhaustion puts
/// the (instrument, account) pair into cooldown.
async fn place_with_retry(
    config: &EngineConfig,
    gw: &mut Box<dyn ExchangeClient>,
    st: &mut SymbolState,
    alerts: &mut AlertManager,
    next_client_id: &mut u64,
    plan: PlacePlan,
    now_s: i64,
) {
    let Some(meta) = st.meta else { return };
    let instrument = st.config.instrument.clone();
    let mut price = plan.price;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let client_id = take_client_id(next_client_id);
        st.orders.insert(ManagedOrder::new_strategy(
            client_id,
            plan.account,
            &instrument,
            plan.side,
            price,
            plan.size,
            Some(plan.guard_price),
            now_s,
        ));

        match gw.place_post_only(&instrument, plan.side, price, plan.size, client_id).await {
            Ok(order_id) => {
                if !is_sentinel_order_id(&order_id) {
                    if let Some(order) = st.orders.get_mut(client_id) {
                        order.exchange_order_id = Some(order_id.clone());
                    }
                }
                log::info!(
                    "[PLACE] {} {} {} {} @ {} client_id={} id={} guard={}{}",
                    instrument,
                    plan.account.label(),
                    plan.side.label(),
                    plan.size,
                    price,
                    client_id,
                    if order_id.is_empty() { "-" } else { order_id.as_str() },
                    plan.guard_price,
                    if plan.corrective { " (corrective)" } else { "" }
                );
                return;
            }
            Err(GatewayError::PostOnlyRejected) => {
                st.orders.mark_rejected(client_id);
                st.orders.finalize_terminal();
                if attempt >= config.post_only_max_retry {
                    *st.cooldown_until_s.get_mut(plan.account) =
                        now_s + config.post_only_cooldown_sec;
                    log::warn!(
                        "[PLACE] {} {} post-only rejected {} times — cooldown {}s",
                        instrument, plan.account.label(), attempt, config.post_only_cooldown_sec
                    );
                    alerts
                        .notify(
                            AlertKind::PostOnlyCooldown,
                            &format!("{}:{}", instrument, plan.account.label()),
                            format!(
                                "{} account {}: post-only rejected {} times, cooling down {}s",
                                instrument,
                                plan.account.label(),
                                attempt,
                                config.post_only_cooldown_sec
                            ),
                            now_s,
                        )
                        .await;
                    return;
                }
                // Refresh the book and re-price against the same guard.
                match gw.book_top(&instrument, config.book_depth).await {
                    Ok(book) => {
                        st.book = Some(book);
                        price = hedger::price_for(plan.side, &book, plan.guard_price, meta.tick_size);
                    }
                    Err(e) => {
                        log::warn!(
                            "[PLACE] {} book refresh failed mid-retry: {} — giving up this tick",
                            instrument, e
                        );
                        return;
                    }
                }
            }
            Err(GatewayError::InsufficientSize(msg)) => {
                st.orders.mark_rejected(client_id);
                st.orders.finalize_terminal();
                log::debug!("[PLACE] {} size rejected: {}", instrument, msg);
                return;
            }
            Err(GatewayError::RateLimited) => {
                st.orders.mark_rejected(client_id);
                st.orders.finalize_terminal();
                log::warn!("[PLACE] {} rate limited — backing off to next tick", instrument);
                return;
            }
            Err(GatewayError::Auth(msg)) => {
                st.orders.mark_rejected(client_id);
                st.orders.finalize_terminal();
                alerts
                    .notify(
                        AlertKind::AuthFailure,
                        "engine",
                        format!("Authentication failure during placement: {}", msg),
                        now_s,
                    )
                    .await;
                return;
            }
            Err(GatewayError::Transient(msg)) => {
                // Ambiguous: the order may have landed. Leave it PENDING; the
                // reconcile grace period resolves it either way.
                log::warn!(
                    "[PLACE] {} transient failure, outcome unknown (client_id={}): {}",
                    instrument, client_id, msg
                );
                return;
            }
            Err(GatewayError::Permanent(msg)) => {
                st.orders.mark_rejected(client_id);
                st.orders.finalize_terminal();
                alerts
                    .notify(
                        AlertKind::PermanentOrderError,
                        &format!("{}:{}", instrument, plan.account.label()),
                        format!("{} account {}: placement rejected: {}", instrument, plan.account.label(), msg),
                        now_s,
                    )
                    .await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Side, SimExchange};
    use crate::hedger::PositionMode;

    const INST: &str = "BTC_USDT_Perp";

    fn symbol_config() -> SymbolConfig {
        SymbolConfig {
            instrument: INST.to_string(),
            enabled: true,
            order_notional_usdt: 1000.0,
            imbalance_limit_usdt: 2000.0,
            max_total_position_usdt: 50_000.0,
            min_total_position_usdt: 0.0,
            a_side_when_equal: Side::Buy,
            position_mode: PositionMode::Increase,
        }
    }

    fn sim(bid: f64, ask: f64) -> SimExchange {
        let mut s = SimExchange::new();
        s.set_book(INST, bid, ask);
        s.set_meta(INST, 0.1, 0.001, 3);
        s.summary = AccountSummary {
            equity: 10_000.0,
            maintenance_margin: 100.0,
            available_balance: 9_000.0,
        };
        s
    }

    fn engine(sim_a: SimExchange, sim_b: SimExchange) -> HedgeEngine {
        let alerts = AlertManager::new(
            None,
            std::env::temp_dir()
                .join(format!("exec_test_{}.csv", uuid::Uuid::new_v4()))
                .to_string_lossy()
                .to_string(),
        );
        HedgeEngine::new(
            EngineConfig::default(),
            RiskConfig::default(),
            Box::new(sim_a),
            Box::new(sim_b),
            vec![symbol_config()],
            alerts,
        )
    }

    fn sim_of(engine: &mut HedgeEngine, account: Account) -> &mut SimExchange {
        engine.gateways.get_mut(account).as_sim_mut().unwrap()
    }

    #[tokio::test]
    async fn test_flat_start_places_symmetric_pair() {
        let mut eng = engine(sim(1002.0, 1002.1), sim(1002.0, 1002.1));
        eng.tick(1000).await;

        let a = sim_of(&mut eng, Account::A);
        assert_eq!(a.placed.len(), 1);
        assert_eq!(a.placed[0].side, Side::Buy);
        assert_eq!(a.placed[0].price, 1002.0);
        assert!((a.placed[0].size - 0.998).abs() < 1e-9);

        let b = sim_of(&mut eng, Account::B);
        assert_eq!(b.placed.len(), 1);
        assert_eq!(b.placed[0].side, Side::Sell);
        assert_eq!(b.placed[0].price, 1002.1);
    }

    #[tokio::test]
    async fn test_second_tick_is_idempotent() {
        let mut eng = engine(sim(1002.0, 1002.1), sim(1002.0, 1002.1));
        eng.tick(1000).await;
        eng.tick(1002).await;

        // Orders from tick one are resting; nothing new goes out, nothing is
        // cancelled.
        assert_eq!(sim_of(&mut eng, Account::A).placed.len(), 1);
        assert_eq!(sim_of(&mut eng, Account::B).placed.len(), 1);
        assert!(sim_of(&mut eng, Account::A).cancelled.is_empty());
        assert!(sim_of(&mut eng, Account::B).cancelled.is_empty());
    }

    #[tokio::test]
    async fn test_startup_position_drives_guarded_hedge() {
        // A long 1500U @ 1000, B flat, ask below the guard: B's sell is
        // pinned at the guard price.
        let mut sim_a = sim(999.0, 999.1);
        sim_a.set_position(INST, 1.5, 1000.0);
        let mut eng = engine(sim_a, sim(999.0, 999.1));

        eng.reconcile_startup(100).await.unwrap();
        eng.tick(102).await;

        let a = sim_of(&mut eng, Account::A);
        assert!(a.placed.is_empty()); // large side posts nothing new

        let b = sim_of(&mut eng, Account::B);
        assert_eq!(b.placed.len(), 1);
        assert_eq!(b.placed[0].side, Side::Sell);
        assert_eq!(b.placed[0].price, 1000.0); // guard wins over ask 999.1
    }

    #[tokio::test]
    async fn test_foreign_order_alerted_and_never_cancelled() {
        let mut sim_a = sim(1002.0, 1002.1);
        sim_a.orders.push(OpenOrderView {
            order_id: "foreign-1".to_string(),
            client_id: None,
            instrument: INST.to_string(),
            side: Side::Sell,
            limit_price: 1010.0,
            size: 1.0,
            traded: 0.0,
            post_only: false,
            created_ms: 0,
        });
        let mut eng = engine(sim_a, sim(1002.0, 1002.1));
        eng.reconcile_startup(100).await.unwrap();

        assert!(eng
            .alerts
            .sent_log
            .iter()
            .any(|(kind, _)| *kind == AlertKind::NonStrategyOrder));

        eng.tick(102).await;
        eng.shutdown_cleanup().await;
        assert!(!sim_of(&mut eng, Account::A)
            .cancelled
            .iter()
            .any(|id| id == "foreign-1"));
    }

    #[tokio::test]
    async fn test_post_only_exhaustion_sets_cooldown() {
        let mut sim_a = sim(1002.0, 1002.1);
        sim_a.post_only_rejects = 5; // the whole retry budget bounces
        let mut eng = engine(sim_a, sim(1002.0, 1002.1));
        eng.tick(1000).await;

        // No A order survived, cooldown armed, alert fired.
        assert!(sim_of(&mut eng, Account::A).placed.is_empty());
        assert_eq!(*eng.states[0].cooldown_until_s.get(Account::A), 1000 + 300);
        assert!(eng
            .alerts
            .sent_log
            .iter()
            .any(|(kind, _)| *kind == AlertKind::PostOnlyCooldown));

        // B is unaffected.
        assert_eq!(sim_of(&mut eng, Account::B).placed.len(), 1);

        // Within the cooldown window A stays quiet.
        eng.tick(1100).await;
        assert!(sim_of(&mut eng, Account::A).placed.is_empty());

        // After expiry A quotes again.
        eng.tick(1000 + 301).await;
        assert_eq!(sim_of(&mut eng, Account::A).placed.len(), 1);
    }

    #[tokio::test]
    async fn test_fill_flows_into_ledger_and_matches() {
        let mut eng = engine(sim(1002.0, 1002.1), sim(1002.0, 1002.1));
        eng.tick(1000).await;

        // A's buy fills completely; the venue reflects position + traded.
        let placed = sim_of(&mut eng, Account::A).placed[0].clone();
        sim_of(&mut eng, Account::A).fill_order(&placed.order_id, placed.size);
        eng.tick(1002).await;

        // The fill became an A buy lot with guard = limit price.
        let lot_queue = eng.states[0].lots.queue(Account::A, crate::exchange::Side::Buy);
        assert_eq!(lot_queue.len(), 1);
        assert_eq!(lot_queue.front().unwrap().guard_price, 1002.0);

        // B's sell fills too (at 1002.1 >= guard 1002.0): the pair matches
        // and the ledger drains.
        let placed_b = sim_of(&mut eng, Account::B).placed[0].clone();
        sim_of(&mut eng, Account::B).fill_order(&placed_b.order_id, placed_b.size);
        eng.tick(1004).await;
        // B sold less base than A bought (same notional, higher price), so
        // only a sliver of the buy lot can remain.
        let rest: f64 = eng.states[0].lots.iter_all().map(|l| l.size).sum();
        assert!(rest < 0.002, "unmatched remainder {} too large", rest);
    }

    #[tokio::test]
    async fn test_sentinel_ack_aligned_on_next_tick() {
        let mut sim_a = sim(1002.0, 1002.1);
        sim_a.ack_with_sentinel = true;
        let mut eng = engine(sim_a, sim(1002.0, 1002.1));
        eng.tick(1000).await;

        let cid = sim_of(&mut eng, Account::A).placed[0].client_id;
        assert!(eng.states[0].orders.get(cid).unwrap().exchange_order_id.is_none());

        eng.tick(1002).await;
        let aligned = eng.states[0].orders.get(cid).unwrap().exchange_order_id.clone();
        assert!(aligned.unwrap().starts_with("real-"));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_but_keeps_newest() {
        let mut eng = engine(sim(1002.0, 1002.1), sim(1002.0, 1002.1));
        eng.config.stop_keep_strategy_orders = 1;
        eng.tick(1000).await;

        // One resting strategy order per account, keep-count 1: nothing goes.
        eng.shutdown_cleanup().await;
        assert!(sim_of(&mut eng, Account::A).cancelled.is_empty());

        // Keep-count 0 cancels them all.
        eng.config.stop_keep_strategy_orders = 0;
        eng.shutdown_cleanup().await;
        assert_eq!(sim_of(&mut eng, Account::A).cancelled.len(), 1);
        assert_eq!(sim_of(&mut eng, Account::B).cancelled.len(), 1);
    }

    #[tokio::test]
    async fn test_mmr_breach_alerts_per_account() {
        let mut sim_a = sim(1002.0, 1002.1);
        sim_a.summary.maintenance_margin = 7_500.0; // ratio 0.75
        let mut eng = engine(sim_a, sim(1002.0, 1002.1));
        eng.tick(1000).await;

        let mmr_alerts: Vec<_> = eng
            .alerts
            .sent_log
            .iter()
            .filter(|(kind, _)| *kind == AlertKind::Mmr)
            .collect();
        assert_eq!(mmr_alerts.len(), 1);
        assert!(mmr_alerts[0].1.contains("Account A"));
    }
}

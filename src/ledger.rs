// ─────────────────────────────────────────────────────────────────────────────
// ledger.rs — Fill Ledger & Cross-Account Matching
//
// Four FIFO queues per instrument, keyed by (account, side). A lot enters the
// ledger whenever a managed order's traded size advances (guard price = the
// order's limit price; post-only execution is at-or-better than limit, so the
// limit bounds the real fill) or when the startup reconciler synthesises lots
// from pre-existing positions.
//
// The matcher pairs lots across accounts and opposite sides under the
// non-loss inequality: the sell leg's guard must be >= the buy leg's guard.
// Oldest lots match first; among same-age candidates the one leaving more
// protection margin wins.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::VecDeque;

use crate::exchange::{Account, Side};

const SIZE_EPS: f64 = 1e-12;

#[derive(Debug, Clone)]
pub struct FillLot {
    pub account: Account,
    pub instrument: String,
    pub side: Side,
    /// Remaining unmatched size in base units. Always > 0 while queued.
    pub size: f64,
    /// Protected execution price: a buy lot's hedge sell must execute at or
    /// above this; a sell lot's hedge buy at or below.
    pub guard_price: f64,
    pub ts_s: i64,
}

/// One completed pairing, for logging and tests.
#[derive(Debug, Clone)]
pub struct MatchEvent {
    pub instrument: String,
    pub size: f64,
    pub buy_account: Account,
    pub buy_guard: f64,
    pub sell_guard: f64,
    pub buy_ts_s: i64,
    pub sell_ts_s: i64,
}

/// Per-instrument lot queues.
#[derive(Debug, Default)]
pub struct LotBook {
    queues: [VecDeque<FillLot>; 4],
}

fn queue_index(account: Account, side: Side) -> usize {
    match (account, side) {
        (Account::A, Side::Buy) => 0,
        (Account::A, Side::Sell) => 1,
        (Account::B, Side::Buy) => 2,
        (Account::B, Side::Sell) => 3,
    }
}

impl LotBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, lot: FillLot) {
        if lot.size <= SIZE_EPS {
            return;
        }
        log::debug!(
            "[LEDGER] {} {} {} lot size={} guard={} ts={}",
            lot.instrument, lot.account.label(), lot.side.label(),
            lot.size, lot.guard_price, lot.ts_s
        );
        self.queues[queue_index(lot.account, lot.side)].push_back(lot);
    }

    pub fn queue(&self, account: Account, side: Side) -> &VecDeque<FillLot> {
        &self.queues[queue_index(account, side)]
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.is_empty())
    }

    pub fn has_lots(&self, account: Account, side: Side) -> bool {
        !self.queues[queue_index(account, side)].is_empty()
    }

    /// Oldest unmatched lot for one account, across both sides.
    pub fn oldest_for_account(&self, account: Account) -> Option<&FillLot> {
        let buys = self.queue(account, Side::Buy).front();
        let sells = self.queue(account, Side::Sell).front();
        match (buys, sells) {
            (Some(b), Some(s)) => Some(if b.ts_s <= s.ts_s { b } else { s }),
            (Some(b), None) => Some(b),
            (None, Some(s)) => Some(s),
            (None, None) => None,
        }
    }

    pub fn iter_all(&self) -> impl Iterator<Item = &FillLot> {
        self.queues.iter().flat_map(|q| q.iter())
    }

    pub fn earliest_ts(&self) -> Option<i64> {
        self.iter_all().map(|l| l.ts_s).min()
    }

    /// Runs the matcher to exhaustion. After this returns, no admissible pair
    /// remains anywhere in the book.
    pub fn match_lots(&mut self) -> Vec<MatchEvent> {
        let mut events = Vec::new();
        loop {
            let before = events.len();
            // Two possible pairings: A buys hedged by B sells, and B buys
            // hedged by A sells.
            self.match_direction(Account::A, &mut events);
            self.match_direction(Account::B, &mut events);
            if events.len() == before {
                break;
            }
        }
        events
    }

    /// Pairs buy lots of `buy_account` against sell lots of the other account
    /// until no admissible pair remains in this direction.
    fn match_direction(&mut self, buy_account: Account, events: &mut Vec<MatchEvent>) {
        let buy_idx = queue_index(buy_account, Side::Buy);
        let sell_idx = queue_index(buy_account.other(), Side::Sell);

        'outer: loop {
            for bi in 0..self.queues[buy_idx].len() {
                let buy_guard = self.queues[buy_idx][bi].guard_price;
                if let Some(si) = pick_sell(&self.queues[sell_idx], buy_guard) {
                    let qty = self.queues[buy_idx][bi]
                        .size
                        .min(self.queues[sell_idx][si].size);
                    let (buy_ts, sell_ts, sell_guard, instrument) = {
                        let b = &self.queues[buy_idx][bi];
                        let s = &self.queues[sell_idx][si];
                        (b.ts_s, s.ts_s, s.guard_price, b.instrument.clone())
                    };

                    self.queues[buy_idx][bi].size -= qty;
                    self.queues[sell_idx][si].size -= qty;
                    if self.queues[sell_idx][si].size <= SIZE_EPS {
                        self.queues[sell_idx].remove(si);
                    }
                    if self.queues[buy_idx][bi].size <= SIZE_EPS {
                        self.queues[buy_idx].remove(bi);
                    }

                    log::info!(
                        "[MATCH] {} {} buy(guard={}) x {} sell(guard={}) size={}",
                        instrument, buy_account.label(), buy_guard,
                        buy_account.other().label(), sell_guard, qty
                    );
                    events.push(MatchEvent {
                        instrument,
                        size: qty,
                        buy_account,
                        buy_guard,
                        sell_guard,
                        buy_ts_s: buy_ts,
                        sell_ts_s: sell_ts,
                    });
                    // Indices shifted; restart the scan.
                    continue 'outer;
                }
            }
            break;
        }
    }
}

/// Picks the sell lot to pair against a buy guard: oldest admissible first,
/// ties on timestamp broken by the larger protection margin.
fn pick_sell(sells: &VecDeque<FillLot>, buy_guard: f64) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, lot) in sells.iter().enumerate() {
        if lot.guard_price + SIZE_EPS < buy_guard {
            continue;
        }
        match best {
            None => best = Some(i),
            Some(b) => {
                let cur = &sells[b];
                if lot.ts_s < cur.ts_s
                    || (lot.ts_s == cur.ts_s && lot.guard_price > cur.guard_price)
                {
                    best = Some(i);
                }
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lot(account: Account, side: Side, size: f64, guard: f64, ts: i64) -> FillLot {
        FillLot {
            account,
            instrument: "BTC_USDT_Perp".to_string(),
            side,
            size,
            guard_price: guard,
            ts_s: ts,
        }
    }

    #[test]
    fn test_basic_pairing() {
        let mut book = LotBook::new();
        book.push(lot(Account::A, Side::Buy, 1.0, 1000.0, 10));
        book.push(lot(Account::B, Side::Sell, 1.0, 1002.0, 11));

        let events = book.match_lots();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].size, 1.0);
        assert!(book.is_empty());
    }

    #[test]
    fn test_price_protection_blocks_losing_pair() {
        let mut book = LotBook::new();
        // Hedge sell guard below the buy guard would lock in a loss.
        book.push(lot(Account::A, Side::Buy, 1.0, 1002.0, 10));
        book.push(lot(Account::B, Side::Sell, 1.0, 1000.0, 11));

        assert!(book.match_lots().is_empty());
        assert!(book.has_lots(Account::A, Side::Buy));
        assert!(book.has_lots(Account::B, Side::Sell));
    }

    #[test]
    fn test_guard_inequality_on_every_match() {
        let mut book = LotBook::new();
        book.push(lot(Account::A, Side::Buy, 2.0, 1001.0, 1));
        book.push(lot(Account::A, Side::Sell, 1.0, 1005.0, 2));
        book.push(lot(Account::B, Side::Sell, 3.0, 1001.0, 3));
        book.push(lot(Account::B, Side::Buy, 1.5, 1004.0, 4));

        for ev in book.match_lots() {
            assert!(ev.sell_guard >= ev.buy_guard);
        }
    }

    #[test]
    fn test_same_account_and_same_side_never_pair() {
        let mut book = LotBook::new();
        book.push(lot(Account::A, Side::Buy, 1.0, 1000.0, 1));
        book.push(lot(Account::A, Side::Sell, 1.0, 1010.0, 2));
        book.push(lot(Account::B, Side::Buy, 1.0, 990.0, 3));
        // A-buy/A-sell share an account; A-buy/B-buy share a side.
        assert!(book.match_lots().is_empty());
    }

    #[test]
    fn test_partial_match_leaves_remainder_at_head() {
        let mut book = LotBook::new();
        book.push(lot(Account::A, Side::Buy, 2.0, 1000.0, 10));
        book.push(lot(Account::B, Side::Sell, 0.5, 1001.0, 11));

        let events = book.match_lots();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].size, 0.5);

        let head = book.queue(Account::A, Side::Buy).front().unwrap();
        assert!((head.size - 1.5).abs() < 1e-12);
        assert!(!book.has_lots(Account::B, Side::Sell));
    }

    #[test]
    fn test_fifo_oldest_first() {
        let mut book = LotBook::new();
        book.push(lot(Account::A, Side::Buy, 1.0, 1000.0, 10));
        book.push(lot(Account::A, Side::Buy, 1.0, 999.0, 20));
        book.push(lot(Account::B, Side::Sell, 1.0, 1001.0, 30));

        let events = book.match_lots();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].buy_ts_s, 10);
        // The younger buy lot is still waiting.
        assert_eq!(book.queue(Account::A, Side::Buy).front().unwrap().ts_s, 20);
    }

    #[test]
    fn test_blocked_head_does_not_starve_younger_lots() {
        let mut book = LotBook::new();
        // Head buy lot is unmatchable (guard too high), the younger one pairs.
        book.push(lot(Account::A, Side::Buy, 1.0, 1010.0, 10));
        book.push(lot(Account::A, Side::Buy, 1.0, 1000.0, 20));
        book.push(lot(Account::B, Side::Sell, 1.0, 1002.0, 30));

        let events = book.match_lots();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].buy_ts_s, 20);
        assert_eq!(book.queue(Account::A, Side::Buy).front().unwrap().ts_s, 10);
    }

    #[test]
    fn test_equal_age_prefers_larger_margin() {
        let mut book = LotBook::new();
        book.push(lot(Account::A, Side::Buy, 1.0, 1000.0, 10));
        book.push(lot(Account::B, Side::Sell, 1.0, 1001.0, 50));
        book.push(lot(Account::B, Side::Sell, 1.0, 1003.0, 50));

        let events = book.match_lots();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sell_guard, 1003.0);
    }

    #[test]
    fn test_match_runs_to_exhaustion() {
        let mut book = LotBook::new();
        book.push(lot(Account::A, Side::Buy, 1.0, 1000.0, 1));
        book.push(lot(Account::A, Side::Buy, 2.0, 999.0, 2));
        book.push(lot(Account::B, Side::Sell, 1.5, 1000.0, 3));
        book.push(lot(Account::B, Side::Sell, 1.5, 1001.0, 4));

        book.match_lots();
        // Invariant: nothing admissible remains.
        for b in book.queue(Account::A, Side::Buy) {
            for s in book.queue(Account::B, Side::Sell) {
                assert!(s.guard_price < b.guard_price);
            }
        }
    }

    #[test]
    fn test_oldest_for_account_spans_sides() {
        let mut book = LotBook::new();
        book.push(lot(Account::A, Side::Sell, 1.0, 1000.0, 5));
        book.push(lot(Account::A, Side::Buy, 1.0, 1000.0, 9));
        let oldest = book.oldest_for_account(Account::A).unwrap();
        assert_eq!(oldest.side, Side::Sell);
        assert_eq!(oldest.ts_s, 5);
    }
}

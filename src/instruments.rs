// ─────────────────────────────────────────────────────────────────────────────
// instruments.rs — Instrument metadata registry
//
// Caches per-instrument contract metadata (tick size, minimum size, base
// decimals) fetched once through the gateway, and owns the price/size
// rounding used everywhere in the engine. Rounding is directional on
// purpose: sells round UP to the tick, buys round DOWN, so a rounded price
// can never violate the guard inequality it was derived from.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::HashMap;

use crate::exchange::{ExchangeClient, GatewayError, InstrumentMeta};

/// Canonical instrument id: the venue spells the perp suffix `_Perp`, config
/// files and operators habitually write `_PERP`.
pub fn canonical(name: &str) -> String {
    if let Some(stem) = name.strip_suffix("_PERP") {
        format!("{}_Perp", stem)
    } else {
        name.to_string()
    }
}

#[derive(Debug, Default)]
pub struct InstrumentRegistry {
    metas: HashMap<String, InstrumentMeta>,
}

impl InstrumentRegistry {
    pub fn new() -> Self {
        Self { metas: HashMap::new() }
    }

    pub fn get(&self, instrument: &str) -> Option<InstrumentMeta> {
        self.metas.get(instrument).copied()
    }

    /// Fetches and caches metadata the first time an instrument is seen.
    pub async fn ensure(
        &mut self,
        gateway: &mut dyn ExchangeClient,
        instrument: &str,
    ) -> Result<InstrumentMeta, GatewayError> {
        if let Some(meta) = self.metas.get(instrument) {
            return Ok(*meta);
        }
        let meta = gateway.instrument_meta(instrument).await?;
        log::info!(
            "[INSTRUMENTS] {} tick={} min_size={} base_decimals={}",
            instrument, meta.tick_size, meta.min_size, meta.base_decimals
        );
        self.metas.insert(instrument.to_string(), meta);
        Ok(meta)
    }
}

// ─── Rounding ─────────────────────────────────────────────────────────────────

// Epsilon absorbs binary-representation noise so 1002.0 / 0.1 does not floor
// to 10019 ticks.
const TICK_EPS: f64 = 1e-9;

pub fn floor_to_tick(price: f64, tick: f64) -> f64 {
    if tick <= 0.0 {
        return price;
    }
    let ticks = (price / tick + TICK_EPS).floor();
    round_decimals(ticks * tick, 12)
}

pub fn ceil_to_tick(price: f64, tick: f64) -> f64 {
    if tick <= 0.0 {
        return price;
    }
    let ticks = (price / tick - TICK_EPS).ceil();
    round_decimals(ticks * tick, 12)
}

/// Floors a base-unit size to the instrument's size step and decimal budget.
pub fn floor_to_step(size: f64, step: f64, base_decimals: u32) -> f64 {
    let stepped = if step > 0.0 {
        (size / step + TICK_EPS).floor() * step
    } else {
        size
    };
    let factor = 10_f64.powi(base_decimals.min(12) as i32);
    (stepped * factor + TICK_EPS).floor() / factor
}

fn round_decimals(val: f64, decimals: u32) -> f64 {
    let factor = 10_f64.powi(decimals as i32);
    (val * factor).round() / factor
}

// ─────────────────────────────────────────────────────────────────────────────
// symbols.rs — Symbols file loading
//
// The symbols file is a JSON array of per-instrument configs. Instrument
// names are canonicalised on load; unknown JSON fields are ignored; disabled
// entries are kept (the engine skips them). A broken file is a fatal startup
// error, never a silent default.
// ─────────────────────────────────────────────────────────────────────────────
use std::fs;
use std::path::Path;

use crate::hedger::SymbolConfig;
use crate::instruments::canonical;

pub fn load_symbols<P: AsRef<Path>>(path: P) -> Result<Vec<SymbolConfig>, String> {
    let content = fs::read_to_string(&path)
        .map_err(|e| format!("cannot read symbols file {:?}: {}", path.as_ref(), e))?;
    let mut configs: Vec<SymbolConfig> = serde_json::from_str(&content)
        .map_err(|e| format!("cannot parse symbols file {:?}: {}", path.as_ref(), e))?;

    for cfg in &mut configs {
        cfg.instrument = canonical(&cfg.instrument);
        if cfg.order_notional_usdt <= 0.0 {
            return Err(format!("{}: order_notional_usdt must be > 0", cfg.instrument));
        }
        if cfg.max_total_position_usdt < 0.0 || cfg.min_total_position_usdt < 0.0 {
            return Err(format!("{}: position bounds must be >= 0", cfg.instrument));
        }
    }

    let enabled = configs.iter().filter(|c| c.enabled).count();
    log::info!(
        "Loaded {} symbol configs from {:?} ({} enabled).",
        configs.len(),
        path.as_ref(),
        enabled
    );
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Side;
    use crate::hedger::PositionMode;

    fn write_tmp(name: &str, content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_canonicalises_and_ignores_unknown_fields() {
        let path = write_tmp(
            "symbols_ok.json",
            r#"[{
                "instrument": "BTC_USDT_PERP",
                "order_notional_usdt": 1000,
                "imbalance_limit_usdt": 2000,
                "max_total_position_usdt": 50000,
                "a_side_when_equal": "buy",
                "position_mode": "increase",
                "comment": "ignored by the loader"
            }]"#,
        );
        let configs = load_symbols(&path).unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].instrument, "BTC_USDT_Perp");
        assert!(configs[0].enabled); // defaulted
        assert_eq!(configs[0].a_side_when_equal, Side::Buy);
        assert_eq!(configs[0].position_mode, PositionMode::Increase);
    }

    #[test]
    fn test_disabled_entries_are_kept() {
        let path = write_tmp(
            "symbols_disabled.json",
            r#"[{
                "instrument": "ETH_USDT_Perp",
                "enabled": false,
                "order_notional_usdt": 500,
                "imbalance_limit_usdt": 1000,
                "a_side_when_equal": "sell",
                "position_mode": "decrease"
            }]"#,
        );
        let configs = load_symbols(&path).unwrap();
        assert_eq!(configs.len(), 1);
        assert!(!configs[0].enabled);
    }

    #[test]
    fn test_bad_notional_rejected() {
        let path = write_tmp(
            "symbols_bad.json",
            r#"[{
                "instrument": "ETH_USDT_Perp",
                "order_notional_usdt": 0,
                "imbalance_limit_usdt": 1000,
                "a_side_when_equal": "sell",
                "position_mode": "increase"
            }]"#,
        );
        assert!(load_symbols(&path).is_err());
    }

    #[test]
    fn test_missing_file_rejected() {
        assert!(load_symbols("/nonexistent/symbols.json").is_err());
    }
}

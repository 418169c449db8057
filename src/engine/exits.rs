//! # engine::exits
//!
//! Pure exit-condition evaluation for one price tick against one open trade.
//!
//! ```text
//!  stop-loss       price ≤ buy × (1 − sl%/100)                    → SELL
//!  trailing-profit price ≥ buy × (1 + act%/100) once → armed, peak = max(price)
//!                  armed && price ≤ peak × (1 − dev%/100)          → SELL
//! ```
//!
//! Stop-loss wins when both hold on the same tick.

use crate::models::{SellTrigger, StopLossConfig, TrailingProfitConfig, TrailingState};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitSignal {
    Hold,
    StopLoss { threshold: f64 },
    TrailingProfit { peak: f64, threshold: f64 },
}

impl ExitSignal {
    pub fn trigger(&self) -> Option<SellTrigger> {
        match self {
            ExitSignal::Hold => None,
            ExitSignal::StopLoss { .. } => Some(SellTrigger::StopLoss),
            ExitSignal::TrailingProfit { .. } => Some(SellTrigger::TrailingProfit),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub signal:    ExitSignal,
    /// `true` on the tick that first reached the activation threshold.
    pub activated: bool,
}

/// Evaluates `price` for a trade bought at `buy_price`, updating the
/// trailing peak in `state`.
pub fn evaluate(
    buy_price: f64,
    price: f64,
    stop_loss: &StopLossConfig,
    trailing_profit: &TrailingProfitConfig,
    state: &mut TrailingState,
) -> Evaluation {
    let mut activated = false;

    if trailing_profit.enabled {
        if !state.activated {
            let activation = buy_price * (1.0 + trailing_profit.activation_percent / 100.0);
            if price >= activation {
                state.activated = true;
                state.peak = Some(price);
                activated = true;
            }
        } else {
            state.peak = Some(state.peak.map_or(price, |peak| peak.max(price)));
        }
    }

    if stop_loss.enabled {
        let threshold = buy_price * (1.0 - stop_loss.percent / 100.0);
        if price <= threshold {
            return Evaluation {
                signal: ExitSignal::StopLoss { threshold },
                activated,
            };
        }
    }

    if trailing_profit.enabled && state.activated {
        if let Some(peak) = state.peak {
            let threshold = peak * (1.0 - trailing_profit.deviation_percent / 100.0);
            if price <= threshold {
                return Evaluation {
                    signal: ExitSignal::TrailingProfit { peak, threshold },
                    activated,
                };
            }
        }
    }

    Evaluation {
        signal: ExitSignal::Hold,
        activated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trailing(act: f64, dev: f64) -> TrailingProfitConfig {
        TrailingProfitConfig {
            enabled:            true,
            activation_percent: act,
            deviation_percent:  dev,
        }
    }

    fn stop(pct: f64) -> StopLossConfig {
        StopLossConfig {
            enabled: true,
            percent: pct,
        }
    }

    #[test]
    fn test_trailing_fires_on_third_tick() {
        let mut state = TrailingState::default();
        let off = StopLossConfig::default();
        let config = trailing(20.0, 10.0);

        let first = evaluate(100.0, 110.0, &off, &config, &mut state);
        assert_eq!(first.signal, ExitSignal::Hold);
        assert!(!state.activated);

        let second = evaluate(100.0, 150.0, &off, &config, &mut state);
        assert_eq!(second.signal, ExitSignal::Hold);
        assert!(second.activated);
        assert_eq!(state.peak, Some(150.0));

        let third = evaluate(100.0, 134.0, &off, &config, &mut state);
        assert!(matches!(third.signal, ExitSignal::TrailingProfit { peak, .. } if peak == 150.0));
        assert_eq!(third.signal.trigger(), Some(SellTrigger::TrailingProfit));
    }

    #[test]
    fn test_no_trigger_above_peak_deviation() {
        let mut state = TrailingState::default();
        let off = StopLossConfig::default();
        let config = trailing(20.0, 10.0);
        for price in [100.0, 150.0, 120.0] {
            let eval = evaluate(100.0, price, &off, &config, &mut state);
            if price == 120.0 {
                assert!(matches!(eval.signal, ExitSignal::TrailingProfit { .. }));
            } else {
                assert_eq!(eval.signal, ExitSignal::Hold);
            }
        }

        let mut state = TrailingState::default();
        for price in [150.0, 140.0, 136.0] {
            assert_eq!(evaluate(100.0, price, &off, &config, &mut state).signal, ExitSignal::Hold);
        }
    }

    #[test]
    fn test_peak_only_rises() {
        let mut state = TrailingState::default();
        let off = StopLossConfig::default();
        let config = trailing(10.0, 50.0);
        for price in [120.0, 180.0, 130.0, 170.0] {
            evaluate(100.0, price, &off, &config, &mut state);
        }
        assert_eq!(state.peak, Some(180.0));
    }

    #[test]
    fn test_stop_loss_takes_precedence() {
        let mut state = TrailingState {
            activated: true,
            peak:      Some(200.0),
        };
        let eval = evaluate(100.0, 85.0, &stop(10.0), &trailing(20.0, 10.0), &mut state);
        assert!(matches!(eval.signal, ExitSignal::StopLoss { threshold } if (threshold - 90.0).abs() < 1e-9));
        assert_eq!(eval.signal.trigger(), Some(SellTrigger::StopLoss));
    }

    #[test]
    fn test_stop_loss_boundary_is_inclusive() {
        let mut state = TrailingState::default();
        let off = TrailingProfitConfig::default();
        assert_eq!(
            evaluate(100.0, 90.01, &stop(10.0), &off, &mut state).signal,
            ExitSignal::Hold
        );
        assert!(matches!(
            evaluate(100.0, 89.0, &stop(10.0), &off, &mut state).signal,
            ExitSignal::StopLoss { .. }
        ));
    }

    #[test]
    fn test_disabled_configs_never_fire() {
        let mut state = TrailingState::default();
        let eval = evaluate(
            100.0,
            1.0,
            &StopLossConfig::default(),
            &TrailingProfitConfig::default(),
            &mut state,
        );
        assert_eq!(eval.signal, ExitSignal::Hold);
        assert_eq!(state, TrailingState::default());
    }
}

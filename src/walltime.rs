use serde::Serialize;

use crate::config::ConfigError;

/// Slack left between the minimum lag and the synthetic clock after a leap.
pub const LEAP_SAFETY_MARGIN_SECS: f64 = 5.0;
pub const DEFAULT_MIN_LAG_SECS: f64 = 60.0;
pub const DEFAULT_MAX_LAG_FLOOR_SECS: f64 = 300.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WalltimeCouplingOptions {
    pub min_lag_secs: f64,
    pub max_lag_secs: f64,
}
impl WalltimeCouplingOptions {
    /// `min = 60 s`, `max = max(300 s, ceil(5 * leap))`.
    pub fn for_leap(leap_secs: f64) -> Self {
        Self {
            min_lag_secs: DEFAULT_MIN_LAG_SECS,
            max_lag_secs: DEFAULT_MAX_LAG_FLOOR_SECS.max((5.0 * leap_secs).ceil()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CouplingDecision {
    /// Generate the next fragment.
    Generate,
    /// Too close to wall time; try again later.
    Throttle,
    /// Too far behind; jump the synthetic clock forward first.
    Leap { by_secs: f64 },
}

/// Keeps a synthetic clock inside `[now - max_lag, now - min_lag]`.
#[derive(Debug, Clone, Copy)]
pub struct WalltimeCoupling {
    opts: WalltimeCouplingOptions,
    leap_secs: f64,
}
impl WalltimeCoupling {
    pub fn new(opts: WalltimeCouplingOptions, leap_secs: f64) -> Result<Self, ConfigError> {
        if !(opts.min_lag_secs >= 0.0
            && opts.max_lag_secs > opts.min_lag_secs + LEAP_SAFETY_MARGIN_SECS)
        {
            return Err(ConfigError::LagBounds {
                min_lag_secs: opts.min_lag_secs,
                max_lag_secs: opts.max_lag_secs,
            });
        }
        // otherwise neither branch of the decision rule is ever reachable
        if opts.max_lag_secs <= leap_secs {
            return Err(ConfigError::LagWindowTooNarrow {
                max_lag_secs: opts.max_lag_secs,
                leap_secs,
            });
        }
        Ok(Self { opts, leap_secs })
    }

    pub fn options(&self) -> WalltimeCouplingOptions {
        self.opts
    }
    /// Wall-time width of one fragment.
    pub fn leap_secs(&self) -> f64 {
        self.leap_secs
    }

    pub fn decide(&self, lag_secs: f64) -> CouplingDecision {
        assert_lag_non_negative(lag_secs);
        if lag_secs > self.opts.max_lag_secs {
            return CouplingDecision::Leap {
                by_secs: lag_secs - self.opts.min_lag_secs - LEAP_SAFETY_MARGIN_SECS,
            };
        }
        if lag_secs - self.leap_secs > self.opts.min_lag_secs {
            return CouplingDecision::Generate;
        }
        CouplingDecision::Throttle
    }
}

/// Lag of a synthetic clock behind wall time.
///
/// # Panics
///
/// If the synthetic clock is ahead of wall time.
pub fn lag_secs(now_secs: f64, last_sample_secs: f64) -> f64 {
    let lag = now_secs - last_sample_secs;
    assert_lag_non_negative(lag);
    lag
}

fn assert_lag_non_negative(lag_secs: f64) {
    assert!(
        lag_secs >= 0.0,
        "synthetic clock ran ahead of wall time: lag is {lag_secs} s"
    );
}

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub fn mtime() -> Instant {
    Instant::now()
}

/// Seconds elapsed since `t0` (monotonic).
pub fn secs_since(t0: Instant) -> f64 {
    t0.elapsed().as_secs_f64()
}

/// Wall-clock time in seconds since the epoch.
pub fn wall_now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub fn wall_now_millis() -> i64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    i64::try_from(millis).unwrap_or(i64::MAX)
}

pub async fn sleep_secs(secs: f64) {
    if secs <= 0.0 || !secs.is_finite() {
        return;
    }
    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
}

#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}
impl Deadline {
    pub fn in_secs(secs: f64) -> Self {
        Self::after(Duration::from_secs_f64(secs.max(0.0)))
    }
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    /// Seconds left until the deadline; negative once it has passed.
    pub fn remaining_secs(&self) -> f64 {
        let now = Instant::now();
        if now <= self.at {
            (self.at - now).as_secs_f64()
        } else {
            -(now - self.at).as_secs_f64()
        }
    }
    /// Seconds past the deadline; negative while it is still ahead.
    pub fn over_by_secs(&self) -> f64 {
        -self.remaining_secs()
    }
    pub fn passed(&self) -> bool {
        Instant::now() > self.at
    }
    /// Whether waiting `secs` from now would end past the deadline.
    pub fn would_pass_after(&self, secs: f64) -> bool {
        self.remaining_secs() < secs
    }
}

//! Human-plausible pacing between retrieved units.

use std::time::Duration;

use rand::Rng;
use rand_distr::StandardNormal;
use tokio::time::Instant;

const HOUR: Duration = Duration::from_secs(3600);

/// Delay envelope for a worker, in seconds.
#[derive(Debug, Clone)]
pub struct PacingConfig {
    pub min_delay: f64,
    pub max_delay: f64,
    pub jitter_std_dev: f64,
    pub delay_floor: f64,
    pub reading_pause_probability: f64,
    pub reading_pause: (f64, f64),
    pub burst_threshold: (u32, u32),
    pub burst_delay: (f64, f64),
    /// Units allowed per one-hour window; `None` disables the cap.
    pub messages_per_hour: Option<u32>,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_delay: 0.1,
            max_delay: 0.2,
            jitter_std_dev: 1.0,
            delay_floor: 1.0,
            reading_pause_probability: 0.1,
            reading_pause: (5.0, 15.0),
            burst_threshold: (10, 20),
            burst_delay: (1.0, 2.0),
            messages_per_hour: Some(10_000),
        }
    }
}

fn uniform<R: Rng + ?Sized>(rng: &mut R, (low, high): (f64, f64)) -> f64 {
    if high > low {
        rng.gen_range(low..=high)
    } else {
        low
    }
}

/// Uniform draw from `range`, in seconds.
pub fn uniform_delay(range: (f64, f64)) -> Duration {
    Duration::from_secs_f64(uniform(&mut rand::thread_rng(), range).max(0.0))
}

/// Fixed one-hour windows with a unit allowance each.
#[derive(Debug, Clone)]
pub struct HourlyBudget {
    limit: Option<u32>,
    window_start: Instant,
    used: u32,
}

impl HourlyBudget {
    pub fn new(limit: Option<u32>) -> Self {
        Self {
            limit: limit.filter(|limit| *limit > 0),
            window_start: Instant::now(),
            used: 0,
        }
    }

    /// Count one unit. Once the window's allowance is spent, returns the time
    /// left until the next window opens.
    pub fn register(&mut self) -> Option<Duration> {
        let limit = self.limit?;
        let now = Instant::now();
        if now.saturating_duration_since(self.window_start) >= HOUR {
            self.window_start = now;
            self.used = 0;
        }

        self.used += 1;
        if self.used < limit {
            return None;
        }
        self.window_start += HOUR;
        self.used = 0;
        Some(self.window_start.saturating_duration_since(now))
    }
}

/// Per-worker pacing state. Owns the burst counter and the hourly budget.
#[derive(Debug, Clone)]
pub struct HumanPacer {
    config: PacingConfig,
    burst_count: u32,
    burst_threshold: u32,
    budget: HourlyBudget,
}

impl HumanPacer {
    pub fn new(config: PacingConfig) -> Self {
        let burst_threshold = Self::draw_threshold(&config);
        let budget = HourlyBudget::new(config.messages_per_hour);
        Self {
            config,
            burst_count: 0,
            burst_threshold,
            budget,
        }
    }

    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    fn draw_threshold(config: &PacingConfig) -> u32 {
        let (low, high) = config.burst_threshold;
        let low = low.max(1);
        rand::thread_rng().gen_range(low..=high.max(low))
    }

    /// `uniform(min, max) + N(0, σ)` floored at the configured minimum.
    pub fn unit_delay(&self) -> Duration {
        let mut rng = rand::thread_rng();
        let base = uniform(&mut rng, (self.config.min_delay, self.config.max_delay));
        let jitter = rng.sample::<f64, _>(StandardNormal) * self.config.jitter_std_dev;
        Duration::from_secs_f64((base + jitter).max(self.config.delay_floor).max(0.0))
    }

    /// Occasionally linger as if reading.
    pub fn reading_pause(&self) -> Option<Duration> {
        let mut rng = rand::thread_rng();
        let probability = self.config.reading_pause_probability.clamp(0.0, 1.0);
        rng.gen_bool(probability)
            .then(|| Duration::from_secs_f64(uniform(&mut rng, self.config.reading_pause)))
    }

    /// Count a unit; returns a burst delay once the counter reaches its
    /// randomly drawn threshold, then starts a new cycle.
    pub fn register_unit(&mut self) -> Option<Duration> {
        self.burst_count += 1;
        if self.burst_count < self.burst_threshold {
            return None;
        }
        self.burst_count = 0;
        self.burst_threshold = Self::draw_threshold(&self.config);
        Some(uniform_delay(self.config.burst_delay))
    }

    /// Wait owed once the hourly allowance runs out.
    pub fn hourly_wait(&mut self) -> Option<Duration> {
        self.budget.register()
    }
}

impl Default for HumanPacer {
    fn default() -> Self {
        Self::new(PacingConfig::default())
    }
}

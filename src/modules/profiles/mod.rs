//! Synthetic client identities.
//!
//! Profiles are drawn with market-share weights rather than uniformly, cached
//! per session, and re-drawn once a session has worn the same identity for a
//! randomised 2–4 hours.

use once_cell::sync::Lazy;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

const MIN_ROTATION_AGE: Duration = Duration::from_secs(2 * 3600);
const MAX_ROTATION_AGE: Duration = Duration::from_secs(4 * 3600);

/// A synthetic client identity: fingerprint ids for each HTTP backend plus the
/// user-agent and header set a real browser of that kind would send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserProfile {
    pub name: String,
    pub primary_fingerprint: String,
    pub secondary_fingerprint: String,
    pub user_agent: String,
    pub headers: Vec<(String, String)>,
    pub weight: u32,
}

impl BrowserProfile {
    /// True for Chromium-family identities, which send client-hint headers.
    pub fn is_chromium(&self) -> bool {
        self.primary_fingerprint.starts_with("chrome")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProfileError {
    #[error("profile set is empty")]
    Empty,
    #[error("profile weights must sum to 100, got {0}")]
    InvalidWeights(u32),
}

fn base_headers() -> Vec<(String, String)> {
    vec![
        (
            "Accept".into(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8"
                .into(),
        ),
        ("Accept-Language".into(), "en-US,en;q=0.9".into()),
        ("Accept-Encoding".into(), "gzip, deflate, br".into()),
        ("DNT".into(), "1".into()),
        ("Connection".into(), "keep-alive".into()),
        ("Upgrade-Insecure-Requests".into(), "1".into()),
    ]
}

fn chromium_headers(sec_ch_ua: &str, platform: &str) -> Vec<(String, String)> {
    let mut headers = base_headers();
    headers.extend([
        ("sec-ch-ua".to_string(), sec_ch_ua.to_string()),
        ("sec-ch-ua-mobile".to_string(), "?0".to_string()),
        ("sec-ch-ua-platform".to_string(), platform.to_string()),
        ("Sec-Fetch-Site".to_string(), "none".to_string()),
        ("Sec-Fetch-Mode".to_string(), "navigate".to_string()),
        ("Sec-Fetch-User".to_string(), "?1".to_string()),
        ("Sec-Fetch-Dest".to_string(), "document".to_string()),
    ]);
    headers
}

static DEFAULT_PROFILES: Lazy<Vec<BrowserProfile>> = Lazy::new(|| {
    const CHROME_CH_UA: &str = r#""Chromium";v="112", "Google Chrome";v="112", "Not:A-Brand";v="99""#;
    vec![
        BrowserProfile {
            name: "chrome_win".into(),
            primary_fingerprint: "chrome110".into(),
            secondary_fingerprint: "chrome_112".into(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/112.0.0.0 Safari/537.36".into(),
            headers: chromium_headers(CHROME_CH_UA, r#""Windows""#),
            weight: 55,
        },
        BrowserProfile {
            name: "chrome_mac".into(),
            primary_fingerprint: "chrome110".into(),
            secondary_fingerprint: "chrome_112".into(),
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/112.0.0.0 Safari/537.36".into(),
            headers: chromium_headers(CHROME_CH_UA, r#""macOS""#),
            weight: 25,
        },
        BrowserProfile {
            name: "firefox_win".into(),
            primary_fingerprint: "firefox109".into(),
            secondary_fingerprint: "firefox_110".into(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:110.0) Gecko/20100101 Firefox/110.0".into(),
            headers: base_headers(),
            weight: 15,
        },
        BrowserProfile {
            name: "safari_mac".into(),
            primary_fingerprint: "safari16".into(),
            secondary_fingerprint: "safari_16_0".into(),
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.0 Safari/605.1.15".into(),
            headers: base_headers(),
            weight: 5,
        },
    ]
});

/// Built-in profile table with the desktop market-share weighting.
pub fn default_profiles() -> Vec<BrowserProfile> {
    DEFAULT_PROFILES.clone()
}

#[derive(Debug, Clone)]
struct CachedProfile {
    profile: BrowserProfile,
    assigned_at: Instant,
    rotation_age: Duration,
}

/// Per-session profile cache with weighted selection.
#[derive(Debug, Clone)]
pub struct ProfileManager {
    profiles: Arc<Vec<BrowserProfile>>,
    total_weight: u32,
    rotation_age: (Duration, Duration),
    cache: Arc<RwLock<HashMap<String, CachedProfile>>>,
}

impl ProfileManager {
    pub fn new(profiles: Vec<BrowserProfile>) -> Result<Self, ProfileError> {
        if profiles.is_empty() {
            return Err(ProfileError::Empty);
        }
        let total_weight: u32 = profiles.iter().map(|profile| profile.weight).sum();
        if total_weight != 100 {
            return Err(ProfileError::InvalidWeights(total_weight));
        }

        Ok(Self {
            profiles: Arc::new(profiles),
            total_weight,
            rotation_age: (MIN_ROTATION_AGE, MAX_ROTATION_AGE),
            cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Override the 2–4 h rotation window.
    pub fn with_rotation_age(mut self, min: Duration, max: Duration) -> Self {
        self.rotation_age = (min, max.max(min));
        self
    }

    pub fn profiles(&self) -> &[BrowserProfile] {
        &self.profiles
    }

    /// Cumulative-weight draw over the configured profile set.
    pub fn draw(&self) -> BrowserProfile {
        let mut rng = rand::thread_rng();
        let roll = rng.gen_range(0..self.total_weight);
        let mut cumulative = 0;
        for profile in self.profiles.iter() {
            cumulative += profile.weight;
            if roll < cumulative {
                return profile.clone();
            }
        }
        // Weights sum to total_weight, so the loop always returns; keep the
        // compiler satisfied with the heaviest tail entry.
        self.profiles[self.profiles.len() - 1].clone()
    }

    /// Cached profile for `session_id`, drawing (or re-drawing once the
    /// rotation age has passed) as needed.
    pub fn get_or_create(&self, session_id: &str) -> BrowserProfile {
        let now = Instant::now();
        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = cache.get(session_id)
                && now.saturating_duration_since(entry.assigned_at) <= entry.rotation_age
            {
                return entry.profile.clone();
            }
        }
        self.assign(session_id, now)
    }

    /// Evict and re-draw regardless of age.
    pub fn rotate(&self, session_id: &str) -> BrowserProfile {
        self.assign(session_id, Instant::now())
    }

    /// Drop entries that outlived the maximum rotation age. Returns how many
    /// sessions were evicted.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let max_age = self.rotation_age.1;
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let before = cache.len();
        cache.retain(|_, entry| now.saturating_duration_since(entry.assigned_at) <= max_age);
        before - cache.len()
    }

    pub fn forget(&self, session_id: &str) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.remove(session_id);
    }

    pub fn cached_sessions(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn assign(&self, session_id: &str, now: Instant) -> BrowserProfile {
        let profile = self.draw();
        let (min, max) = self.rotation_age;
        let rotation_age = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };

        log::debug!(
            "session {session_id} assigned profile {} (rotates after {}s)",
            profile.name,
            rotation_age.as_secs()
        );

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.insert(
            session_id.to_string(),
            CachedProfile {
                profile: profile.clone(),
                assigned_at: now,
                rotation_age,
            },
        );
        profile
    }
}

impl Default for ProfileManager {
    fn default() -> Self {
        Self {
            profiles: Arc::new(default_profiles()),
            total_weight: 100,
            rotation_age: (MIN_ROTATION_AGE, MAX_ROTATION_AGE),
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_sum_to_hundred() {
        let total: u32 = default_profiles().iter().map(|p| p.weight).sum();
        assert_eq!(total, 100);
        assert!(ProfileManager::new(default_profiles()).is_ok());
    }

    #[test]
    fn rejects_bad_weights() {
        let mut profiles = default_profiles();
        profiles[0].weight = 10;
        assert_eq!(
            ProfileManager::new(profiles).unwrap_err(),
            ProfileError::InvalidWeights(55)
        );
        assert_eq!(ProfileManager::new(Vec::new()).unwrap_err(), ProfileError::Empty);
    }

    #[test]
    fn weighted_draws_follow_market_share() {
        let manager = ProfileManager::default();
        let draws = 10_000;
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..draws {
            *counts.entry(manager.draw().name).or_default() += 1;
        }

        for profile in manager.profiles() {
            let observed = *counts.get(&profile.name).unwrap_or(&0) as f64 / draws as f64;
            let expected = profile.weight as f64 / 100.0;
            assert!(
                (observed - expected).abs() < 0.03,
                "{} drawn {observed:.3}, expected {expected:.3}",
                profile.name
            );
        }
    }

    #[test]
    fn chromium_profiles_carry_client_hints() {
        let profiles = default_profiles();
        let chrome = profiles.iter().find(|p| p.name == "chrome_mac").unwrap();
        assert!(chrome.is_chromium());
        assert_eq!(chrome.header("sec-ch-ua-platform"), Some(r#""macOS""#));
        let firefox = profiles.iter().find(|p| p.name == "firefox_win").unwrap();
        assert!(firefox.header("sec-ch-ua").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn session_profile_is_sticky_until_rotation_age() {
        let manager = ProfileManager::default()
            .with_rotation_age(Duration::from_secs(60), Duration::from_secs(60));
        let first = manager.get_or_create("session-1");
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(manager.get_or_create("session-1"), first);

        manager.get_or_create("session-2");
        assert_eq!(manager.cached_sessions(), 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        // Re-drawn: the entry is refreshed even if the draw lands on the same profile.
        manager.get_or_create("session-1");
        assert_eq!(manager.sweep(), 1);
        assert_eq!(manager.cached_sessions(), 1);
    }
}

//! Block and challenge page recognition.
//!
//! A response counts as a challenge when it carries a blocking status and its
//! body matches one of the known interstitial fragments or contains a
//! challenge container element.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

/// Statuses the platform uses for interstitial pages.
pub const BLOCK_STATUSES: &[u16] = &[403, 503];

/// Text fragments found in interstitial challenge pages.
pub const BLOCK_MARKERS: &[&str] = &[
    "challenge-platform",
    "jschl-answer",
    "cf-challenge",
    "__cf_chl_jschl_tk__",
    "Checking your browser",
    "DDoS protection by",
];

/// Elements present while a challenge is still being shown.
pub const CHALLENGE_SELECTORS: &[&str] =
    &[".challenge-container", "#challenge-form", ".cf-challenge"];

/// Elements signalling the real application has loaded.
pub const LOADED_SELECTORS: &[&str] = &["#app-mount", ".app", "[data-app-loaded]"];

static MARKER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    let alternation = BLOCK_MARKERS
        .iter()
        .map(|marker| regex::escape(marker))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&alternation).expect("invalid block marker regex")
});

static CONTAINER_SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| {
    CHALLENGE_SELECTORS
        .iter()
        .map(|selector| Selector::parse(selector).expect("invalid challenge selector"))
        .collect()
});

/// What the detector found in a blocked response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDetection {
    pub status: u16,
    pub markers: Vec<String>,
    pub container: Option<String>,
}

/// Stateless detector over response status and body.
#[derive(Debug, Clone, Default)]
pub struct BlockDetector;

impl BlockDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn detect(&self, status: u16, body: &str) -> Option<BlockDetection> {
        if !BLOCK_STATUSES.contains(&status) {
            return None;
        }

        let mut markers: Vec<String> = MARKER_PATTERN
            .find_iter(body)
            .map(|found| found.as_str().to_string())
            .collect();
        markers.dedup();

        let container = find_container(body);

        if markers.is_empty() && container.is_none() {
            return None;
        }

        log::debug!(
            "challenge page detected (status {status}, markers {:?}, container {:?})",
            markers,
            container
        );

        Some(BlockDetection {
            status,
            markers,
            container,
        })
    }

    pub fn is_challenge(&self, status: u16, body: &str) -> bool {
        self.detect(status, body).is_some()
    }
}

fn find_container(body: &str) -> Option<String> {
    // Skip the parse for bodies that cannot hold any of the selectors.
    if !body.contains("challenge") {
        return None;
    }
    let document = Html::parse_document(body);
    CHALLENGE_SELECTORS
        .iter()
        .zip(CONTAINER_SELECTORS.iter())
        .find(|(_, selector)| document.select(selector).next().is_some())
        .map(|(raw, _)| (*raw).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_marker_on_blocking_status() {
        let detector = BlockDetector::new();
        let body = "<html><title>Just a moment</title><p>Checking your browser before accessing</p></html>";
        let detection = detector.detect(503, body).unwrap();
        assert_eq!(detection.markers, vec!["Checking your browser".to_string()]);
        assert!(detector.detect(200, body).is_none());
    }

    #[test]
    fn detects_challenge_container() {
        let detector = BlockDetector::new();
        let body = r#"<html><body><form id="challenge-form" action="/x"></form></body></html>"#;
        let detection = detector.detect(403, body).unwrap();
        assert_eq!(detection.container.as_deref(), Some("#challenge-form"));
    }

    #[test]
    fn plain_forbidden_is_not_a_challenge() {
        let detector = BlockDetector::new();
        assert!(!detector.is_challenge(403, r#"{"message": "Missing Access", "code": 50001}"#));
        assert!(!detector.is_challenge(404, "cf-challenge"));
    }
}

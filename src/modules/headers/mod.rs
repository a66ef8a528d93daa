//! Header composition and order perturbation.

use rand::seq::SliceRandom;

use crate::modules::profiles::BrowserProfile;
use crate::modules::session::StickyMaterial;

pub type HeaderList = Vec<(String, String)>;

fn upsert(headers: &mut HeaderList, name: &str, value: &str) {
    match headers
        .iter_mut()
        .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
    {
        Some(entry) => entry.1 = value.to_string(),
        None => headers.push((name.to_string(), value.to_string())),
    }
}

/// Profile headers, then the session's sticky challenge material, then the
/// caller's overrides. Later layers replace earlier ones case-insensitively.
pub fn compose(
    profile: &BrowserProfile,
    sticky: &StickyMaterial,
    overrides: &[(String, String)],
) -> HeaderList {
    let mut headers = profile.headers.clone();
    upsert(
        &mut headers,
        "User-Agent",
        sticky.user_agent.as_deref().unwrap_or(&profile.user_agent),
    );

    if let Some(cookie) = &sticky.cookie_header {
        let merged = match overrides
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("cookie"))
        {
            Some((_, caller)) => format!("{caller}; {cookie}"),
            None => cookie.clone(),
        };
        upsert(&mut headers, "Cookie", &merged);
    }

    for (name, value) in overrides {
        if name.eq_ignore_ascii_case("cookie") && sticky.cookie_header.is_some() {
            continue;
        }
        upsert(&mut headers, name, value);
    }
    headers
}

/// Randomise emission order; a fixed order is itself a fingerprint.
pub fn shuffle(headers: &mut HeaderList) {
    headers.shuffle(&mut rand::thread_rng());
}

pub fn get<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

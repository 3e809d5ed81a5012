//! Randomized fixtures shared by the crate's tests.

use chrono::{Duration, Utc};
use rand::Rng;
use rand::seq::SliceRandom;
use uuid::Uuid;

use crate::models::ad::{Ad, Gender, Platform, QueryProfile};

const COUNTRIES: &[&str] = &[
    "US", "TW", "GB", "AU", "FR", "DE", "JP", "IN", "BR", "ZA", "CN", "RU", "ES", "IT", "SE", "NO",
    "NL", "DK", "MX", "AR", "PL", "BE", "FI", "NZ",
];

/// A random ad with the given version: age span within 18-65, a non-empty
/// subset of each targeting set, active for roughly a week around now.
pub fn mock_ad(version: u64) -> Ad {
    let mut rng = rand::rng();

    let age_start: u8 = rng.random_range(18..=64);
    let age_end: u8 = rng.random_range(age_start..=(age_start + 10).min(65));

    let mut genders = vec![Gender::M, Gender::F];
    genders.shuffle(&mut rng);
    genders.truncate(rng.random_range(1..=2));

    let mut countries: Vec<String> = COUNTRIES.iter().map(|c| c.to_string()).collect();
    countries.shuffle(&mut rng);
    countries.truncate(rng.random_range(1..=4));

    let mut platforms = vec![Platform::Android, Platform::Ios, Platform::Web];
    platforms.shuffle(&mut rng);
    platforms.truncate(rng.random_range(1..=3));

    let now = Utc::now();
    Ad {
        id: Uuid::new_v4(),
        title: "Weekend getaway sale".into(),
        content: "Two nights for the price of one".into(),
        start_at: now - Duration::days(rng.random_range(1..=7)),
        end_at: now + Duration::days(rng.random_range(1..=7)),
        age_start,
        age_end,
        gender: genders,
        country: countries,
        platform: platforms,
        version,
        is_active: true,
        created_at: now,
    }
}

/// A fully unconstrained profile (every attribute on the wildcard branch).
pub fn mock_profile() -> QueryProfile {
    QueryProfile {
        age: None,
        country: None,
        gender: None,
        platform: None,
        offset: 0,
        limit: 10,
    }
}

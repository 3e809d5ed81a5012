use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

use uuid::Uuid;

use crate::error::AdError;
use crate::models::ad::{Ad, Gender, Platform, QueryProfile};

/// Multi-attribute ad index: a four-level prefix tree keyed in the fixed
/// order age → country → platform → gender, with a recency-sorted set of ad
/// ids at each leaf.
///
/// Each level maps a concrete attribute value, or `None` for the "no filter
/// on this attribute" branch, to the next level. An ad is inserted into
/// every path of the cross product of its targeting predicates (each
/// dimension contributing its values plus `None`), so a lookup is a single
/// descent regardless of how the request mixes constrained and unconstrained
/// attributes.
#[derive(Debug, Default)]
pub struct MultiAttrIndex {
    ages: HashMap<Option<u8>, CountryLevel>,
}

#[derive(Debug, Default)]
struct CountryLevel {
    countries: HashMap<Option<String>, PlatformLevel>,
}

#[derive(Debug, Default)]
struct PlatformLevel {
    platforms: HashMap<Option<Platform>, GenderLevel>,
}

#[derive(Debug, Default)]
struct GenderLevel {
    genders: HashMap<Option<Gender>, RecencySet>,
}

/// Leaf set ordered most-recent-first, ties broken by ad id.
#[derive(Debug, Default)]
struct RecencySet {
    entries: BTreeSet<(Reverse<i64>, Uuid)>,
}

impl RecencySet {
    fn insert(&mut self, score: i64, id: Uuid) {
        self.entries.insert((Reverse(score), id));
    }

    fn remove(&mut self, score: i64, id: Uuid) -> bool {
        self.entries.remove(&(Reverse(score), id))
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn page(&self, offset: usize, limit: usize) -> Vec<Uuid> {
        self.entries
            .iter()
            .skip(offset)
            .take(limit)
            .map(|(_, id)| *id)
            .collect()
    }
}

fn age_keys(ad: &Ad) -> Vec<Option<u8>> {
    std::iter::once(None)
        .chain((ad.age_start..=ad.age_end).map(Some))
        .collect()
}

fn country_keys(ad: &Ad) -> Vec<Option<String>> {
    std::iter::once(None)
        .chain(ad.country.iter().cloned().map(Some))
        .collect()
}

fn platform_keys(ad: &Ad) -> Vec<Option<Platform>> {
    std::iter::once(None)
        .chain(ad.platform.iter().copied().map(Some))
        .collect()
}

fn gender_keys(ad: &Ad) -> Vec<Option<Gender>> {
    std::iter::once(None)
        .chain(ad.gender.iter().copied().map(Some))
        .collect()
}

impl MultiAttrIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ages.is_empty()
    }

    /// Insert an ad into every path its predicates demand. Idempotent under
    /// the same `(id, created_at)`.
    pub fn insert(&mut self, ad: &Ad) {
        let score = ad.score();
        for age in age_keys(ad) {
            let country_level = self.ages.entry(age).or_default();
            for country in country_keys(ad) {
                let platform_level = country_level.countries.entry(country).or_default();
                for platform in platform_keys(ad) {
                    let gender_level = platform_level.platforms.entry(platform).or_default();
                    for gender in gender_keys(ad) {
                        gender_level
                            .genders
                            .entry(gender)
                            .or_default()
                            .insert(score, ad.id);
                    }
                }
            }
        }
    }

    /// Remove an ad from every path it was inserted into, pruning nodes that
    /// become empty. The caller must pass the ad with the exact predicates it
    /// was stored under; a missing leaf or entry means the index and the ad
    /// map have diverged.
    pub fn remove(&mut self, ad: &Ad) -> Result<(), AdError> {
        let score = ad.score();
        let mut missing = false;
        for age in age_keys(ad) {
            let Some(country_level) = self.ages.get_mut(&age) else {
                missing = true;
                continue;
            };
            for country in country_keys(ad) {
                let Some(platform_level) = country_level.countries.get_mut(&country) else {
                    missing = true;
                    continue;
                };
                for platform in platform_keys(ad) {
                    let Some(gender_level) = platform_level.platforms.get_mut(&platform) else {
                        missing = true;
                        continue;
                    };
                    for gender in gender_keys(ad) {
                        match gender_level.genders.get_mut(&gender) {
                            Some(set) => {
                                if !set.remove(score, ad.id) {
                                    missing = true;
                                }
                                if set.is_empty() {
                                    gender_level.genders.remove(&gender);
                                }
                            }
                            None => missing = true,
                        }
                    }
                    if gender_level.genders.is_empty() {
                        platform_level.platforms.remove(&platform);
                    }
                }
                if platform_level.platforms.is_empty() {
                    country_level.countries.remove(&country);
                }
            }
            if country_level.countries.is_empty() {
                self.ages.remove(&age);
            }
        }
        if missing {
            return Err(AdError::Internal(format!(
                "ad {} was not fully present in the index",
                ad.id
            )));
        }
        Ok(())
    }

    /// Descend with the profile's attribute values, substituting the `None`
    /// branch wherever the request leaves an attribute unconstrained, and
    /// page the leaf by rank.
    pub fn query(&self, profile: &QueryProfile) -> Result<(Vec<Uuid>, usize), AdError> {
        let leaf = self
            .ages
            .get(&profile.age)
            .and_then(|l| l.countries.get(&profile.country))
            .and_then(|l| l.platforms.get(&profile.platform))
            .and_then(|l| l.genders.get(&profile.gender))
            .ok_or(AdError::NoAdsFound)?;

        let total = leaf.len();
        if total == 0 {
            return Err(AdError::NoAdsFound);
        }
        if profile.offset >= total {
            return Err(AdError::OffsetOutOfRange);
        }
        Ok((leaf.page(profile.offset, profile.limit), total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn ad(id: u128, created_secs: i64) -> Ad {
        let created_at = Utc.timestamp_opt(created_secs, 0).unwrap();
        Ad {
            id: Uuid::from_u128(id),
            title: "Morning coffee deal".into(),
            content: "Half price before 9am".into(),
            start_at: created_at - Duration::hours(1),
            end_at: created_at + Duration::hours(1),
            age_start: 18,
            age_end: 30,
            gender: vec![Gender::M],
            country: vec!["TW".into()],
            platform: vec![Platform::Ios],
            version: 1,
            is_active: true,
            created_at,
        }
    }

    fn profile(
        age: Option<u8>,
        country: Option<&str>,
        gender: Option<Gender>,
        platform: Option<Platform>,
    ) -> QueryProfile {
        QueryProfile {
            age,
            country: country.map(str::to_string),
            gender,
            platform,
            offset: 0,
            limit: 10,
        }
    }

    #[test]
    fn full_profile_match() {
        let mut index = MultiAttrIndex::new();
        let a = ad(1, 1_700_000_000);
        index.insert(&a);

        let (ids, total) = index
            .query(&profile(
                Some(20),
                Some("TW"),
                Some(Gender::M),
                Some(Platform::Ios),
            ))
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(ids, vec![a.id]);
    }

    #[test]
    fn empty_dimensions_hit_the_wildcard_branch() {
        let mut index = MultiAttrIndex::new();
        let a = ad(1, 1_700_000_000);
        index.insert(&a);

        let (ids, total) = index.query(&profile(Some(20), None, None, None)).unwrap();
        assert_eq!(total, 1);
        assert_eq!(ids, vec![a.id]);

        let (ids, _) = index.query(&profile(None, None, None, None)).unwrap();
        assert_eq!(ids, vec![a.id]);
    }

    #[test]
    fn age_boundaries_are_inclusive() {
        let mut index = MultiAttrIndex::new();
        index.insert(&ad(1, 1_700_000_000));

        assert!(index.query(&profile(Some(18), None, None, None)).is_ok());
        assert!(index.query(&profile(Some(30), None, None, None)).is_ok());
        assert!(matches!(
            index.query(&profile(Some(31), None, None, None)),
            Err(AdError::NoAdsFound)
        ));
        assert!(matches!(
            index.query(&profile(Some(17), None, None, None)),
            Err(AdError::NoAdsFound)
        ));
    }

    #[test]
    fn mismatched_attribute_returns_no_ads() {
        let mut index = MultiAttrIndex::new();
        index.insert(&ad(1, 1_700_000_000));

        assert!(matches!(
            index.query(&profile(Some(20), Some("US"), None, None)),
            Err(AdError::NoAdsFound)
        ));
        assert!(matches!(
            index.query(&profile(Some(20), None, Some(Gender::F), None)),
            Err(AdError::NoAdsFound)
        ));
        assert!(matches!(
            index.query(&profile(Some(20), None, None, Some(Platform::Web))),
            Err(AdError::NoAdsFound)
        ));
    }

    #[test]
    fn recency_order_with_id_tiebreak() {
        let mut index = MultiAttrIndex::new();
        index.insert(&ad(1, 100));
        index.insert(&ad(2, 300));
        index.insert(&ad(3, 200));
        index.insert(&ad(4, 200));

        let (ids, total) = index.query(&profile(None, None, None, None)).unwrap();
        assert_eq!(total, 4);
        assert_eq!(
            ids,
            vec![
                Uuid::from_u128(2),
                Uuid::from_u128(3),
                Uuid::from_u128(4),
                Uuid::from_u128(1),
            ]
        );
    }

    #[test]
    fn insert_is_idempotent() {
        let mut index = MultiAttrIndex::new();
        let a = ad(1, 1_700_000_000);
        index.insert(&a);
        index.insert(&a);

        let (_, total) = index.query(&profile(None, None, None, None)).unwrap();
        assert_eq!(total, 1);
    }

    #[test]
    fn remove_undoes_every_matching_query() {
        let mut index = MultiAttrIndex::new();
        let a = ad(1, 1_700_000_000);
        index.insert(&a);
        index.remove(&a).unwrap();

        assert!(index.is_empty());
        for p in [
            profile(Some(20), Some("TW"), Some(Gender::M), Some(Platform::Ios)),
            profile(Some(20), None, None, None),
            profile(None, None, None, None),
        ] {
            assert!(matches!(index.query(&p), Err(AdError::NoAdsFound)));
        }
    }

    #[test]
    fn remove_keeps_other_ads_intact() {
        let mut index = MultiAttrIndex::new();
        let a = ad(1, 100);
        let b = ad(2, 200);
        index.insert(&a);
        index.insert(&b);
        index.remove(&a).unwrap();

        let (ids, total) = index.query(&profile(None, None, None, None)).unwrap();
        assert_eq!(total, 1);
        assert_eq!(ids, vec![b.id]);
    }

    #[test]
    fn remove_of_unknown_ad_reports_divergence() {
        let mut index = MultiAttrIndex::new();
        index.insert(&ad(1, 100));
        assert!(index.remove(&ad(2, 200)).is_err());
    }

    #[test]
    fn pagination_reconstructs_the_full_result() {
        let mut index = MultiAttrIndex::new();
        for i in 0..25u128 {
            index.insert(&ad(i + 1, 1000 + i as i64));
        }

        let mut pages = Vec::new();
        let mut offset = 0;
        loop {
            let mut p = profile(None, None, None, None);
            p.offset = offset;
            p.limit = 10;
            match index.query(&p) {
                Ok((ids, total)) => {
                    assert_eq!(total, 25);
                    offset += ids.len();
                    pages.extend(ids);
                }
                Err(AdError::OffsetOutOfRange) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(pages.len(), 25);
        let mut deduped = pages.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), 25, "pages contained duplicates");
        // Most recent first: ids were inserted with increasing scores.
        assert_eq!(pages[0], Uuid::from_u128(25));
        assert_eq!(pages[24], Uuid::from_u128(1));
    }

    #[test]
    fn offset_past_the_end_is_out_of_range() {
        let mut index = MultiAttrIndex::new();
        index.insert(&ad(1, 100));

        let mut p = profile(None, None, None, None);
        p.offset = 1;
        assert!(matches!(index.query(&p), Err(AdError::OffsetOutOfRange)));
    }

    #[test]
    fn multi_valued_sets_match_each_member() {
        let mut index = MultiAttrIndex::new();
        let mut a = ad(1, 100);
        a.country = vec!["TW".into(), "US".into()];
        a.gender = vec![Gender::M, Gender::F];
        a.platform = vec![Platform::Ios, Platform::Web];
        index.insert(&a);

        for country in ["TW", "US"] {
            for gender in [Gender::M, Gender::F] {
                for platform in [Platform::Ios, Platform::Web] {
                    let (ids, _) = index
                        .query(&profile(
                            Some(25),
                            Some(country),
                            Some(gender),
                            Some(platform),
                        ))
                        .unwrap();
                    assert_eq!(ids, vec![a.id]);
                }
            }
        }

        index.remove(&a).unwrap();
        assert!(index.is_empty());
    }
}

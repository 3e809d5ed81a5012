use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::AdError;

/// Pagination cap for the read API.
pub const MAX_LIMIT: usize = 100;

const MIN_TITLE_CHARS: usize = 5;
const MAX_TITLE_CHARS: usize = 100;
const MIN_AGE: u8 = 1;
const MAX_AGE: u8 = 100;

/// Genders an ad may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Gender {
    M,
    F,
}

impl FromStr for Gender {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "M" => Ok(Gender::M),
            "F" => Ok(Gender::F),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gender::M => f.write_str("M"),
            Gender::F => f.write_str("F"),
        }
    }
}

/// Platforms an ad may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
    Web,
}

impl FromStr for Platform {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "android" => Ok(Platform::Android),
            "ios" => Ok(Platform::Ios),
            "web" => Ok(Platform::Web),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Android => f.write_str("android"),
            Platform::Ios => f.write_str("ios"),
            Platform::Web => f.write_str("web"),
        }
    }
}

/// A targeted advertisement.
///
/// `version` is the write-path sequence number allocated under the
/// distributed lock; it doubles as the replication log entry id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ad {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub age_start: u8,
    pub age_end: u8,
    pub gender: Vec<Gender>,
    pub country: Vec<String>,
    pub platform: Vec<Platform>,
    #[serde(default)]
    pub version: u64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl Ad {
    /// Recency score used by the in-memory index.
    pub fn score(&self) -> i64 {
        self.created_at.timestamp()
    }
}

/// Body of `POST /api/v1/ad`. The id is client-assignable so retries after a
/// timeout stay idempotent; a v4 id is generated when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAdRequest {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub title: String,
    pub content: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub age_start: u8,
    pub age_end: u8,
    pub gender: Vec<Gender>,
    pub country: Vec<String>,
    pub platform: Vec<Platform>,
}

impl CreateAdRequest {
    /// Validation gate of the write path; nothing invalid reaches the store.
    pub fn validate(&self) -> Result<(), AdError> {
        let title_chars = self.title.chars().count();
        if !(MIN_TITLE_CHARS..=MAX_TITLE_CHARS).contains(&title_chars) {
            return Err(AdError::Validation(format!(
                "title must be {MIN_TITLE_CHARS}-{MAX_TITLE_CHARS} characters, got {title_chars}"
            )));
        }
        if self.content.is_empty() {
            return Err(AdError::Validation("content must not be empty".into()));
        }
        if self.end_at <= self.start_at {
            return Err(AdError::Validation("end_at must be after start_at".into()));
        }
        if self.age_start < MIN_AGE || self.age_start > self.age_end || self.age_end > MAX_AGE {
            return Err(AdError::Validation(format!(
                "age bounds must satisfy {MIN_AGE} <= age_start <= age_end <= {MAX_AGE}"
            )));
        }
        if self.gender.is_empty() {
            return Err(AdError::Validation("gender must not be empty".into()));
        }
        if self.country.is_empty() {
            return Err(AdError::Validation("country must not be empty".into()));
        }
        for code in &self.country {
            if !is_alpha2(code) {
                return Err(AdError::Validation(format!(
                    "country '{code}' is not an ISO-3166-1 alpha-2 code"
                )));
            }
        }
        if self.platform.is_empty() {
            return Err(AdError::Validation("platform must not be empty".into()));
        }
        Ok(())
    }

    /// Build the ad this request describes. Duplicate set entries are
    /// collapsed so the index cross product stays minimal.
    pub fn into_ad(self, created_at: DateTime<Utc>) -> Ad {
        let mut gender = self.gender;
        gender.sort();
        gender.dedup();
        let mut country = self.country;
        country.sort();
        country.dedup();
        let mut platform = self.platform;
        platform.sort();
        platform.dedup();

        Ad {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            title: self.title,
            content: self.content,
            start_at: self.start_at,
            end_at: self.end_at,
            age_start: self.age_start,
            age_end: self.age_end,
            gender,
            country,
            platform,
            version: 0,
            is_active: true,
            created_at,
        }
    }
}

fn is_alpha2(code: &str) -> bool {
    code.len() == 2 && code.bytes().all(|b| b.is_ascii_uppercase())
}

/// Query-string parameters of `GET /api/v1/ad`. Absent or empty fields mean
/// "no constraint on this attribute".
#[derive(Debug, Clone, Deserialize)]
pub struct GetAdRequest {
    #[serde(default, deserialize_with = "empty_as_none")]
    pub age: Option<u8>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub country: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub gender: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub platform: Option<String>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

impl Default for GetAdRequest {
    fn default() -> Self {
        Self {
            age: None,
            country: None,
            gender: None,
            platform: None,
            offset: 0,
            limit: default_limit(),
        }
    }
}

/// Treat `?age=` the same as an absent parameter.
fn empty_as_none<'de, D, T>(de: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Debug,
{
    let opt = Option::<String>::deserialize(de)?;
    match opt.as_deref() {
        None | Some("") => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("{e:?}"))),
    }
}

impl GetAdRequest {
    /// Validate and normalize into the typed viewer profile the index
    /// understands.
    pub fn profile(&self) -> Result<QueryProfile, AdError> {
        if let Some(age) = self.age {
            if !(MIN_AGE..=MAX_AGE).contains(&age) {
                return Err(AdError::Validation(format!(
                    "age must be within {MIN_AGE}-{MAX_AGE}, got {age}"
                )));
            }
        }
        let country = match self.country.as_deref() {
            None => None,
            Some(code) if is_alpha2(code) => Some(code.to_string()),
            Some(code) => {
                return Err(AdError::Validation(format!(
                    "country '{code}' is not an ISO-3166-1 alpha-2 code"
                )));
            }
        };
        let gender = match self.gender.as_deref() {
            None => None,
            Some(s) => Some(
                s.parse::<Gender>()
                    .map_err(|_| AdError::Validation(format!("gender '{s}' must be M or F")))?,
            ),
        };
        let platform = match self.platform.as_deref() {
            None => None,
            Some(s) => Some(s.parse::<Platform>().map_err(|_| {
                AdError::Validation(format!("platform '{s}' must be android, ios or web"))
            })?),
        };
        if self.limit < 1 || self.limit > MAX_LIMIT {
            return Err(AdError::Validation(format!(
                "limit must be within 1-{MAX_LIMIT}, got {}",
                self.limit
            )));
        }
        Ok(QueryProfile {
            age: self.age,
            country,
            gender,
            platform,
            offset: self.offset,
            limit: self.limit,
        })
    }
}

/// A validated viewer profile plus pagination, ready for the index.
#[derive(Debug, Clone)]
pub struct QueryProfile {
    pub age: Option<u8>,
    pub country: Option<String>,
    pub gender: Option<Gender>,
    pub platform: Option<Platform>,
    pub offset: usize,
    pub limit: usize,
}

/// Response page of the read API.
#[derive(Debug, Serialize)]
pub struct GetAdsPage {
    pub ads: Vec<Ad>,
    pub total: usize,
}

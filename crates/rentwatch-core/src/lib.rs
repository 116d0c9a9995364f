//! Core domain model and field normalisation for rentwatch.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

static PRICE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\d{1,3}(?:\.\d{3})+|\d+)(?:,\d{2})?").expect("valid price regex"));
static EXPENSES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{1,3}(?:\.\d{3})+|\d+").expect("valid expenses regex"));
static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid number regex"));

/// Raw listing record as produced by a crawler, before any normalisation.
///
/// Only `link` is mandatory; every other field carries the text the page
/// showed, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    pub link: String,
    pub price: Option<String>,
    pub expenses: Option<String>,
    pub location: Option<String>,
    pub address: Option<String>,
    pub rooms: Option<String>,
    pub m2: Option<String>,
    pub years: Option<String>,
    pub image: Option<String>,
}

impl RawListing {
    pub fn new(link: impl Into<String>) -> Self {
        Self {
            link: link.into(),
            ..Default::default()
        }
    }

    /// Trimmed link used as the dedup key, `None` when blank.
    pub fn normalized_link(&self) -> Option<String> {
        text_or_none(&self.link)
    }

    /// Parse every attribute, falling back to `None` for anything that does not parse.
    pub fn normalize(&self) -> ListingAttributes {
        ListingAttributes {
            price: self.price.as_deref().and_then(parse_price),
            expenses: self.expenses.as_deref().and_then(parse_expenses),
            location: self.location.as_deref().and_then(text_or_none),
            address: self.address.as_deref().and_then(text_or_none),
            rooms: self.rooms.as_deref().and_then(extract_number),
            m2: self.m2.as_deref().and_then(extract_number),
            years: self.years.as_deref().and_then(text_or_none),
            image: self.image.as_deref().and_then(text_or_none),
        }
    }
}

/// Normalised listing attributes. Stored once on first sighting and never refreshed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingAttributes {
    pub price: Option<i64>,
    pub expenses: Option<i64>,
    pub location: Option<String>,
    pub address: Option<String>,
    pub rooms: Option<i64>,
    pub m2: Option<i64>,
    pub years: Option<String>,
    pub image: Option<String>,
}

/// Persisted listing row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: i64,
    pub link: String,
    #[serde(flatten)]
    pub attributes: ListingAttributes,
    /// Seen in the most recent completed crawl pass.
    pub is_active: bool,
    /// Remote record not created yet.
    pub is_new: bool,
    /// Remote record confirmed inactive.
    pub deactivation_synced: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Lifecycle status of the mirrored remote record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Active,
    Inactive,
}

/// Trim and drop empty strings.
pub fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parse a price like `$ 350.000` or `USD 1.200,50` into whole units.
///
/// Dots are thousands separators, a trailing `,dd` is a decimal part and is dropped.
pub fn parse_price(text: &str) -> Option<i64> {
    let matched = PRICE_RE.find(text)?.as_str();
    let whole = matched.split(',').next().unwrap_or_default();
    whole.replace('.', "").parse().ok()
}

/// Parse the monthly expenses amount, e.g. `+ $ 85.000 expensas`.
pub fn parse_expenses(text: &str) -> Option<i64> {
    let matched = EXPENSES_RE.find(text.trim())?.as_str();
    matched.replace('.', "").parse().ok()
}

/// First run of digits in `text`, e.g. `3 dormitorios` -> 3.
pub fn extract_number(text: &str) -> Option<i64> {
    NUMBER_RE.find(text.trim())?.as_str().parse().ok()
}

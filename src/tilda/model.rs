use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::model::AssetKind;

/// Status value Tilda uses for a successful lookup.
pub const STATUS_FOUND: &str = "FOUND";
pub const STATUS_ERROR: &str = "ERROR";

/// Every API response is wrapped in `{ status, result | message }`.
#[derive(Deserialize, Debug)]
pub struct Envelope {
    #[serde(default, deserialize_with = "null_default")]
    pub status: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProjectSummary {
    #[serde(deserialize_with = "int")]
    pub id: i64,
    #[serde(default, deserialize_with = "null_default")]
    pub title: String,
    #[serde(default, deserialize_with = "null_default")]
    pub descr: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProjectInfo {
    #[serde(deserialize_with = "int")]
    pub id: i64,
    #[serde(default, deserialize_with = "null_default")]
    pub title: String,
    #[serde(default, deserialize_with = "null_default")]
    pub descr: String,
    #[serde(default, deserialize_with = "null_default")]
    pub customdomain: String,
}

/// One row of `getpageslist`.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PageSummary {
    #[serde(deserialize_with = "int")]
    pub id: i64,
    #[serde(default, deserialize_with = "int_or_zero")]
    pub projectid: i64,
    #[serde(default, deserialize_with = "null_default")]
    pub title: String,
    #[serde(default, deserialize_with = "null_default")]
    pub alias: String,
    #[serde(default, deserialize_with = "opt_int")]
    pub published: Option<i64>,
}

/// A `{from, to}` pair: CDN origin and the filename the export refers to.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AssetRef {
    #[serde(default, deserialize_with = "null_default")]
    pub from: String,
    #[serde(default, deserialize_with = "null_default")]
    pub to: String,
}

/// Payload of `getpageexport`.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PageExport {
    #[serde(deserialize_with = "int")]
    pub id: i64,
    #[serde(default, deserialize_with = "int_or_zero")]
    pub projectid: i64,
    #[serde(default, deserialize_with = "null_default")]
    pub title: String,
    #[serde(default, deserialize_with = "null_default")]
    pub alias: String,
    #[serde(default, deserialize_with = "null_default")]
    pub html: String,
    /// Publish time in unix seconds; absent for never-published pages.
    #[serde(default, deserialize_with = "opt_int")]
    pub published: Option<i64>,
    #[serde(default, deserialize_with = "null_default")]
    pub images: Vec<AssetRef>,
    #[serde(default, deserialize_with = "null_default")]
    pub css: Vec<AssetRef>,
    #[serde(default, deserialize_with = "null_default")]
    pub js: Vec<AssetRef>,
}

impl PageExport {
    /// The export's entries for one asset kind.
    pub fn assets(&self, kind: AssetKind) -> &[AssetRef] {
        match kind {
            AssetKind::Image => &self.images,
            AssetKind::Style => &self.css,
            AssetKind::Script => &self.js,
        }
    }
}

// Tilda sends most numbers as strings ("1234"), sometimes as numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum Loose {
    Num(i64),
    Str(String),
    Null,
}

fn loose_to_opt<E: serde::de::Error>(v: Loose) -> Result<Option<i64>, E> {
    match v {
        Loose::Num(n) => Ok(Some(n)),
        Loose::Null => Ok(None),
        Loose::Str(s) if s.trim().is_empty() => Ok(None),
        Loose::Str(s) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| E::custom(format!("expected integer, got {:?}", s))),
    }
}

fn int<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    loose_to_opt(Loose::deserialize(d)?)?
        .ok_or_else(|| serde::de::Error::custom("expected integer, got empty value"))
}

fn int_or_zero<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    Ok(loose_to_opt(Loose::deserialize(d)?)?.unwrap_or(0))
}

// `null` reads the same as a missing field.
fn null_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

fn opt_int<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    loose_to_opt(Loose::deserialize(d)?)
}

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// The three asset kinds a page carries. Each maps to its own table and
/// its own directory under the page's asset root.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AssetKind {
    Image,
    Style,
    Script,
}

impl AssetKind {
    pub const ALL: [AssetKind; 3] = [AssetKind::Style, AssetKind::Script, AssetKind::Image];

    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Image => "image",
            AssetKind::Style => "style",
            AssetKind::Script => "script",
        }
    }

    /// Directory name under `<assets>/<page_id>/`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            AssetKind::Image => "img",
            AssetKind::Style => "css",
            AssetKind::Script => "js",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            AssetKind::Image => "tilda_images",
            AssetKind::Style => "tilda_styles",
            AssetKind::Script => "tilda_scripts",
        }
    }
}

/// Stored page row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Page {
    pub id: i64,
    pub page_id: i64,
    pub project_id: i64,
    pub published: bool,
    pub title: Option<String>,
    pub alias: Option<String>,
    pub html: Option<String>,
    pub published_at: Option<i64>,
}

impl Page {
    pub fn published_at_utc(&self) -> Option<DateTime<Utc>> {
        self.published_at
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
    }
}

/// Values written by an upsert of the page header.
#[derive(Debug, Clone)]
pub struct PageUpsert<'a> {
    pub page_id: i64,
    pub project_id: i64,
    pub title: &'a str,
    pub alias: &'a str,
    pub html: &'a str,
    pub published_at: i64,
}

/// Stored image, stylesheet or script row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetRecord {
    pub id: i64,
    pub tilda_page_id: i64,
    pub source_url: String,
    pub path: String,
    pub name: String,
}

/// Row to insert when replacing a page's assets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAsset {
    pub source_url: String,
    pub path: String,
    pub name: String,
}

/// A stored page together with its three asset collections.
#[derive(Debug, Clone)]
pub struct PageAssets {
    pub page: Page,
    pub images: Vec<AssetRecord>,
    pub styles: Vec<AssetRecord>,
    pub scripts: Vec<AssetRecord>,
}

/// Replace every occurrence of each `from` with its `to`, pair by pair, over
/// the whole document. Plain text replacement: a filename that is a substring
/// of another filename matches inside it too.
pub fn rewrite_html(html: &str, replacements: &[(String, String)]) -> String {
    let mut out = html.to_string();
    for (from, to) in replacements {
        if from.is_empty() {
            continue;
        }
        out = out.replace(from.as_str(), to);
    }
    out
}

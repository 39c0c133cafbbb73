//! Row mappers used by repositories.
//!
//! Keep these focused on column extraction. Business logic lives in `sync`.

use crate::model::{AssetRecord, Page};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

pub(crate) const PAGE_COLUMNS: &str =
    "id, page_id, project_id, published, title, alias, html, published_at";

pub(crate) fn page_from_row(row: &SqliteRow) -> Page {
    Page {
        id: row.get("id"),
        page_id: row.get("page_id"),
        project_id: row.get("project_id"),
        published: row.get::<i64, _>("published") != 0,
        title: row.try_get::<Option<String>, _>("title").ok().flatten(),
        alias: row.try_get::<Option<String>, _>("alias").ok().flatten(),
        html: row.try_get::<Option<String>, _>("html").ok().flatten(),
        published_at: row.try_get::<Option<i64>, _>("published_at").ok().flatten(),
    }
}

pub(crate) fn asset_from_row(row: &SqliteRow) -> AssetRecord {
    AssetRecord {
        id: row.get("id"),
        tilda_page_id: row.get("tilda_page_id"),
        source_url: row.get("source_url"),
        path: row.get("path"),
        name: row.get("name"),
    }
}

use super::model::{asset_from_row, page_from_row, PAGE_COLUMNS};
use crate::model::{AssetKind, AssetRecord, NewAsset, Page, PageAssets, PageUpsert};
use anyhow::{Context, Result};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, instrument};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {}", normalized))?;
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. In-memory URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{}", expanded_path);
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn find_page(pool: &Pool, page_id: i64, project_id: i64) -> Result<Option<Page>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM tilda_pages WHERE page_id = ? AND project_id = ?",
        PAGE_COLUMNS
    ))
    .bind(page_id)
    .bind(project_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(page_from_row))
}

/// Look a page up by its CMS id alone. Page ids are unique across Tilda, so
/// this is what host-side rendering uses.
#[instrument(skip_all)]
pub async fn find_page_by_page_id(pool: &Pool, page_id: i64) -> Result<Option<Page>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM tilda_pages WHERE page_id = ? ORDER BY published_at DESC, id DESC LIMIT 1",
        PAGE_COLUMNS
    ))
    .bind(page_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(page_from_row))
}

#[instrument(skip_all)]
pub async fn list_pages(pool: &Pool, project_id: i64) -> Result<Vec<Page>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM tilda_pages WHERE project_id = ? ORDER BY page_id",
        PAGE_COLUMNS
    ))
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(page_from_row).collect())
}

/// Write a synced page in one transaction: the header (with its final HTML)
/// and every asset kind in `assets`. Returns the page row id. Nothing is
/// visible to readers unless every statement succeeds.
#[instrument(skip_all, fields(page_id = page.page_id, project_id = page.project_id))]
pub async fn store_page(
    pool: &Pool,
    page: &PageUpsert<'_>,
    assets: &[(AssetKind, &[NewAsset])],
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id = upsert_page(&mut *tx, page).await?;
    for (kind, records) in assets {
        replace_assets(&mut *tx, id, *kind, records).await?;
    }
    tx.commit().await.context("failed to commit page sync")?;
    Ok(id)
}

/// Insert or update the page header for `(page_id, project_id)`, marking it
/// published. Returns the row id.
pub async fn upsert_page(conn: &mut SqliteConnection, page: &PageUpsert<'_>) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO tilda_pages (page_id, project_id, published, title, alias, html, published_at) \
         VALUES (?, ?, 1, ?, ?, ?, ?) \
         ON CONFLICT(page_id, project_id) DO UPDATE SET \
            published = 1, title = excluded.title, alias = excluded.alias, \
            html = excluded.html, published_at = excluded.published_at, \
            updated_at = CURRENT_TIMESTAMP \
         RETURNING id",
    )
    .bind(page.page_id)
    .bind(page.project_id)
    .bind(page.title)
    .bind(page.alias)
    .bind(page.html)
    .bind(page.published_at)
    .fetch_one(&mut *conn)
    .await
    .context("failed to upsert tilda page")?;
    Ok(rec.get("id"))
}

/// Drop every asset of `kind` owned by the page and insert `assets` in their
/// place. Runs on the caller's connection so it joins the caller's
/// transaction. Returns the number of inserted rows.
pub async fn replace_assets(
    conn: &mut SqliteConnection,
    tilda_page_id: i64,
    kind: AssetKind,
    assets: &[NewAsset],
) -> Result<u64> {
    let removed = sqlx::query(&format!(
        "DELETE FROM {} WHERE tilda_page_id = ?",
        kind.table()
    ))
    .bind(tilda_page_id)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("failed to clear {}", kind.table()))?
    .rows_affected();

    let mut inserted = 0;
    if !assets.is_empty() {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "INSERT INTO {} (tilda_page_id, source_url, path, name) ",
            kind.table()
        ));
        qb.push_values(assets, |mut b, asset| {
            b.push_bind(tilda_page_id)
                .push_bind(asset.source_url.clone())
                .push_bind(asset.path.clone())
                .push_bind(asset.name.clone());
        });
        inserted = qb
            .build()
            .execute(&mut *conn)
            .await
            .with_context(|| format!("failed to insert into {}", kind.table()))?
            .rows_affected();
    }
    debug!(kind = kind.as_str(), removed, inserted, "replaced assets");
    Ok(inserted)
}

#[instrument(skip_all)]
pub async fn list_assets(pool: &Pool, tilda_page_id: i64, kind: AssetKind) -> Result<Vec<AssetRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT id, tilda_page_id, source_url, path, name FROM {} WHERE tilda_page_id = ? ORDER BY id",
        kind.table()
    ))
    .bind(tilda_page_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(asset_from_row).collect())
}

/// Load a page by CMS id together with all three asset collections.
#[instrument(skip_all)]
pub async fn load_page_assets(pool: &Pool, page_id: i64) -> Result<Option<PageAssets>> {
    let Some(page) = find_page_by_page_id(pool, page_id).await? else {
        return Ok(None);
    };
    let images = list_assets(pool, page.id, AssetKind::Image).await?;
    let styles = list_assets(pool, page.id, AssetKind::Style).await?;
    let scripts = list_assets(pool, page.id, AssetKind::Script).await?;
    Ok(Some(PageAssets {
        page,
        images,
        styles,
        scripts,
    }))
}

use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tilda_mirror::assets::{AssetFetcher, AssetLayout};
use tilda_mirror::db;
use tilda_mirror::model::AssetKind;
use tilda_mirror::sync::{PageSync, SyncOutcome};
use tilda_mirror::tilda::{AssetRef, PageExport, PageSummary, TildaService};
use tokio::sync::Mutex;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn cdn(name: &str) -> String {
    format!("https://static.tildacdn.com/{}", name)
}

fn refs(names: &[&str]) -> Vec<AssetRef> {
    names
        .iter()
        .map(|n| AssetRef {
            from: cdn(n),
            to: n.to_string(),
        })
        .collect()
}

fn export(published: Option<i64>, html: &str, images: &[&str], css: &[&str], js: &[&str]) -> PageExport {
    PageExport {
        id: 100,
        projectid: 42,
        title: format!("Home {}", published.unwrap_or(0)),
        alias: "home".into(),
        html: html.into(),
        published,
        images: refs(images),
        css: refs(css),
        js: refs(js),
    }
}

/// Serves whatever export is currently set for a page id.
#[derive(Clone, Default)]
struct FakeTilda {
    exports: Arc<Mutex<HashMap<i64, PageExport>>>,
    listing: Arc<Mutex<Option<Vec<PageSummary>>>>,
}

impl FakeTilda {
    async fn publish(&self, export: PageExport) {
        *self.listing.lock().await = Some(vec![PageSummary {
            id: export.id,
            projectid: export.projectid,
            title: export.title.clone(),
            alias: export.alias.clone(),
            published: export.published,
        }]);
        self.exports.lock().await.insert(export.id, export);
    }
}

#[async_trait::async_trait]
impl TildaService for FakeTilda {
    async fn list_pages(&self, _project_id: i64) -> Result<Option<Vec<PageSummary>>> {
        Ok(self.listing.lock().await.clone())
    }

    async fn fetch_page(&self, page_id: i64) -> Result<Option<PageExport>> {
        Ok(self.exports.lock().await.get(&page_id).cloned())
    }
}

/// Writes `body of <url>` to the destination and remembers every call.
#[derive(Clone, Default)]
struct RecordingFetcher {
    calls: Arc<Mutex<Vec<String>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl RecordingFetcher {
    async fn fail_on(&self, url: String) {
        self.failing.lock().await.insert(url);
    }

    async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl AssetFetcher for RecordingFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        self.calls.lock().await.push(url.to_string());
        if self.failing.lock().await.contains(url) {
            return Err(anyhow!("connection reset fetching {}", url));
        }
        let body = format!("body of {}", url);
        tokio::fs::write(dest, &body).await?;
        Ok(body.len() as u64)
    }
}

fn file_names(dir: PathBuf) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|rd| {
            rd.map(|e| e.unwrap().file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[tokio::test]
async fn project_scenario_create_noop_replace() {
    let pool = setup_pool().await;
    let td = tempfile::tempdir().unwrap();
    let layout = AssetLayout::new(td.path().to_path_buf(), "/tilda/");
    let api = FakeTilda::default();
    let fetcher = RecordingFetcher::default();
    let sync = PageSync::new(&pool, &api, &fetcher, layout.clone());

    api.publish(export(
        Some(1000),
        r#"<img src="a.png"><div data-original="a.png"></div><img src="b.png">"#,
        &["a.png", "b.png"],
        &["tilda-grid.css"],
        &["tilda-scripts.js", "jquery-1.10.2.min.js"],
    ))
    .await;

    // first pass creates everything
    let report = sync.sync_project(42).await.unwrap();
    assert_eq!(report.listed, 1);
    assert_eq!(report.synced, vec![100]);
    assert_eq!(report.failed_assets, 0);

    let page = db::find_page(&pool, 100, 42).await.unwrap().unwrap();
    assert_eq!(page.published_at, Some(1000));
    assert!(page.published);
    assert_eq!(page.title.as_deref(), Some("Home 1000"));
    assert_eq!(
        page.html.as_deref(),
        Some(r#"<img src="/tilda/100/img/a.png"><div data-original="/tilda/100/img/a.png"></div><img src="/tilda/100/img/b.png">"#)
    );

    let first = db::load_page_assets(&pool, 100).await.unwrap().unwrap();
    assert_eq!(first.images.len(), 2);
    assert_eq!(first.styles.len(), 1);
    assert_eq!(first.scripts.len(), 1);
    assert_eq!(first.images[0].source_url, cdn("a.png"));
    assert_eq!(first.images[0].path, "/tilda/100/img/a.png");
    assert_eq!(first.styles[0].path, "/tilda/100/css/tilda-grid.css");
    assert_eq!(first.scripts[0].name, "tilda-scripts.js");

    assert_eq!(file_names(layout.dir_for(100, AssetKind::Image)), vec!["a.png", "b.png"]);
    assert_eq!(file_names(layout.dir_for(100, AssetKind::Style)), vec!["tilda-grid.css"]);
    assert_eq!(file_names(layout.dir_for(100, AssetKind::Script)), vec!["tilda-scripts.js"]);
    let calls_after_first = fetcher.calls().await;
    assert_eq!(calls_after_first.len(), 4);
    assert!(!calls_after_first.iter().any(|u| u.contains("jquery")));

    // same publish time: nothing changes, not even row ids
    let report = sync.sync_project(42).await.unwrap();
    assert_eq!(report.up_to_date, vec![100]);
    assert!(report.synced.is_empty());

    let second = db::load_page_assets(&pool, 100).await.unwrap().unwrap();
    assert_eq!(second.page, first.page);
    assert_eq!(second.images, first.images);
    assert_eq!(second.styles, first.styles);
    assert_eq!(second.scripts, first.scripts);
    assert_eq!(fetcher.calls().await.len(), 4);
    assert_eq!(file_names(layout.dir_for(100, AssetKind::Image)), vec!["a.png", "b.png"]);

    // newer publish: everything replaced
    api.publish(export(
        Some(2000),
        r#"<img src="c.png">"#,
        &["c.png"],
        &[],
        &["other.js"],
    ))
    .await;
    let report = sync.sync_project(42).await.unwrap();
    assert_eq!(report.synced, vec![100]);

    let third = db::load_page_assets(&pool, 100).await.unwrap().unwrap();
    assert_eq!(third.page.id, first.page.id);
    assert_eq!(third.page.published_at, Some(2000));
    assert_eq!(third.page.title.as_deref(), Some("Home 2000"));
    assert_eq!(third.page.html.as_deref(), Some(r#"<img src="/tilda/100/img/c.png">"#));
    assert_eq!(
        third.images.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
        vec!["c.png"]
    );
    assert!(third.styles.is_empty());
    assert_eq!(
        third.scripts.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
        vec!["other.js"]
    );
    assert!(third.images.iter().all(|a| !first.images.contains(a)));

    assert_eq!(file_names(layout.dir_for(100, AssetKind::Image)), vec!["c.png"]);
    assert!(file_names(layout.dir_for(100, AssetKind::Style)).is_empty());
    assert_eq!(file_names(layout.dir_for(100, AssetKind::Script)), vec!["other.js"]);
}

#[tokio::test]
async fn older_or_unpublished_exports_are_ignored() {
    let pool = setup_pool().await;
    let td = tempfile::tempdir().unwrap();
    let api = FakeTilda::default();
    let fetcher = RecordingFetcher::default();
    let sync = PageSync::new(
        &pool,
        &api,
        &fetcher,
        AssetLayout::new(td.path().to_path_buf(), "/tilda"),
    );

    api.publish(export(None, "<p>draft</p>", &["a.png"], &[], &[])).await;
    assert_eq!(sync.sync_page(100).await.unwrap(), SyncOutcome::Unpublished);
    assert!(db::find_page(&pool, 100, 42).await.unwrap().is_none());
    assert!(fetcher.calls().await.is_empty());

    api.publish(export(Some(1000), "<p>v1</p>", &[], &[], &[])).await;
    assert!(matches!(sync.sync_page(100).await.unwrap(), SyncOutcome::Synced(_)));

    api.publish(export(Some(500), "<p>older</p>", &["a.png"], &[], &[])).await;
    assert_eq!(
        sync.sync_page(100).await.unwrap(),
        SyncOutcome::UpToDate {
            stored_published_at: 1000
        }
    );
    let page = db::find_page(&pool, 100, 42).await.unwrap().unwrap();
    assert_eq!(page.html.as_deref(), Some("<p>v1</p>"));
    assert!(fetcher.calls().await.is_empty());
}

#[tokio::test]
async fn missing_export_and_listing_store_nothing() {
    let pool = setup_pool().await;
    let td = tempfile::tempdir().unwrap();
    let api = FakeTilda::default();
    let fetcher = RecordingFetcher::default();
    let sync = PageSync::new(
        &pool,
        &api,
        &fetcher,
        AssetLayout::new(td.path().to_path_buf(), "/tilda"),
    );

    let report = sync.sync_project(42).await.unwrap();
    assert_eq!(report.listed, 0);
    assert!(report.synced.is_empty());

    assert_eq!(sync.sync_page(100).await.unwrap(), SyncOutcome::NotFound);
    let pages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tilda_pages")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(pages, 0);
}

#[tokio::test]
async fn duplicate_images_are_fetched_once_and_rewritten_everywhere() {
    let pool = setup_pool().await;
    let td = tempfile::tempdir().unwrap();
    let api = FakeTilda::default();
    let fetcher = RecordingFetcher::default();
    let sync = PageSync::new(
        &pool,
        &api,
        &fetcher,
        AssetLayout::new(td.path().to_path_buf(), "/tilda"),
    );

    let mut page = export(
        Some(1000),
        r#"<img src="logo.png"><a><img src="logo.png"></a><img src="hero.jpg">"#,
        &["logo.png", "hero.jpg"],
        &[],
        &[],
    );
    page.images.insert(
        1,
        AssetRef {
            from: "https://static.tildacdn.com/mirror/logo.png".into(),
            to: "logo.png".into(),
        },
    );
    api.publish(page).await;

    let SyncOutcome::Synced(report) = sync.sync_page(100).await.unwrap() else {
        panic!("expected a sync");
    };
    assert_eq!(report.images.skipped, vec!["logo.png".to_string()]);
    assert_eq!(report.images.recorded, 2);
    assert_eq!(
        fetcher.calls().await,
        vec![cdn("logo.png"), cdn("hero.jpg")]
    );

    let stored = db::find_page(&pool, 100, 42).await.unwrap().unwrap();
    assert_eq!(
        stored.html.as_deref(),
        Some(r#"<img src="/tilda/100/img/logo.png"><a><img src="/tilda/100/img/logo.png"></a><img src="/tilda/100/img/hero.jpg">"#)
    );
    let html = stored.html.unwrap();
    assert!(!html.contains("src=\"logo.png\""));
}

#[tokio::test]
async fn failed_download_keeps_page_and_record() {
    let pool = setup_pool().await;
    let td = tempfile::tempdir().unwrap();
    let layout = AssetLayout::new(td.path().to_path_buf(), "/tilda");
    let api = FakeTilda::default();
    let fetcher = RecordingFetcher::default();
    fetcher.fail_on(cdn("b.png")).await;
    let sync = PageSync::new(&pool, &api, &fetcher, layout.clone());

    api.publish(export(
        Some(1000),
        r#"<img src="a.png"><img src="b.png">"#,
        &["a.png", "b.png"],
        &["t.css"],
        &[],
    ))
    .await;

    let SyncOutcome::Synced(report) = sync.sync_page(100).await.unwrap() else {
        panic!("expected a sync");
    };
    assert_eq!(report.failed_count(), 1);
    assert_eq!(report.images.failed[0].name, "b.png");
    assert!(report.images.failed[0].error.contains("connection reset"));
    assert_eq!(report.images.downloaded.len(), 1);
    assert_eq!(report.styles.downloaded.len(), 1);

    let assets = db::load_page_assets(&pool, 100).await.unwrap().unwrap();
    assert_eq!(assets.images.len(), 2);
    assert_eq!(
        assets.page.html.as_deref(),
        Some(r#"<img src="/tilda/100/img/a.png"><img src="/tilda/100/img/b.png">"#)
    );
    assert_eq!(file_names(layout.dir_for(100, AssetKind::Image)), vec!["a.png"]);
}

#[tokio::test]
async fn existing_asset_directories_are_emptied_first() {
    let pool = setup_pool().await;
    let td = tempfile::tempdir().unwrap();
    let layout = AssetLayout::new(td.path().to_path_buf(), "/tilda");
    let css_dir = layout.dir_for(100, AssetKind::Style);
    std::fs::create_dir_all(&css_dir).unwrap();
    std::fs::write(css_dir.join("stale.css"), "old").unwrap();

    let api = FakeTilda::default();
    let fetcher = RecordingFetcher::default();
    let sync = PageSync::new(&pool, &api, &fetcher, layout.clone());
    api.publish(export(Some(1000), "", &[], &["fresh.css"], &[])).await;
    sync.sync_page(100).await.unwrap();

    assert_eq!(file_names(css_dir), vec!["fresh.css"]);
}

#[tokio::test]
async fn unsafe_file_names_are_refused() {
    let pool = setup_pool().await;
    let td = tempfile::tempdir().unwrap();
    let api = FakeTilda::default();
    let fetcher = RecordingFetcher::default();
    let sync = PageSync::new(
        &pool,
        &api,
        &fetcher,
        AssetLayout::new(td.path().join("assets"), "/tilda"),
    );
    api.publish(export(Some(1000), "", &[], &[], &["../../escape.js", "ok.js"]))
        .await;

    let SyncOutcome::Synced(report) = sync.sync_page(100).await.unwrap() else {
        panic!("expected a sync");
    };
    assert_eq!(report.scripts.failed.len(), 1);
    assert_eq!(report.scripts.recorded, 1);
    assert_eq!(fetcher.calls().await, vec![cdn("ok.js")]);
    assert!(!td.path().join("escape.js").exists());
}

#[tokio::test]
async fn failed_store_is_retried_on_next_pass() {
    let pool = setup_pool().await;
    let td = tempfile::tempdir().unwrap();
    let api = FakeTilda::default();
    let fetcher = RecordingFetcher::default();
    let sync = PageSync::new(
        &pool,
        &api,
        &fetcher,
        AssetLayout::new(td.path().to_path_buf(), "/tilda"),
    );
    api.publish(export(Some(1000), r#"<img src="a.png">"#, &["a.png"], &["t.css"], &[]))
        .await;

    sqlx::query("ALTER TABLE tilda_images RENAME TO tilda_images_moved")
        .execute(&pool)
        .await
        .unwrap();
    assert!(sync.sync_page(100).await.is_err());
    assert!(db::find_page(&pool, 100, 42).await.unwrap().is_none());

    sqlx::query("ALTER TABLE tilda_images_moved RENAME TO tilda_images")
        .execute(&pool)
        .await
        .unwrap();
    assert!(matches!(sync.sync_page(100).await.unwrap(), SyncOutcome::Synced(_)));

    let assets = db::load_page_assets(&pool, 100).await.unwrap().unwrap();
    assert_eq!(assets.page.published_at, Some(1000));
    assert_eq!(assets.page.html.as_deref(), Some(r#"<img src="/tilda/100/img/a.png">"#));
    assert_eq!(assets.images.len(), 1);
    assert_eq!(assets.styles.len(), 1);
}

mod over_http {
    use super::*;
    use mockito::{Matcher, Server};
    use tilda_mirror::assets::HttpFetcher;
    use tilda_mirror::tilda::TildaClient;

    fn client(server: &Server) -> TildaClient {
        let base = reqwest::Url::parse(&format!("{}/", server.url())).unwrap();
        TildaClient::with_base_url("pub".into(), "sec".into(), base).unwrap()
    }

    #[tokio::test]
    async fn export_is_mirrored_end_to_end() {
        let mut server = Server::new_async().await;
        let body = serde_json::json!({
            "status": "FOUND",
            "result": {
                "id": "100",
                "projectid": "42",
                "title": "Home",
                "alias": "",
                "html": "<img src=\"a.png\">",
                "published": "1000",
                "images": [{"from": format!("{}/static/a.png", server.url()), "to": "a.png"}],
                "css": [],
                "js": [{"from": format!("{}/static/jquery.js", server.url()), "to": "jquery-1.10.2.min.js"}]
            }
        });
        server
            .mock("GET", "/v1/getpageexport")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("publickey".into(), "pub".into()),
                Matcher::UrlEncoded("secretkey".into(), "sec".into()),
                Matcher::UrlEncoded("pageid".into(), "100".into()),
            ]))
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/static/a.png")
            .with_status(200)
            .with_body("PNG")
            .create_async()
            .await;
        let jquery = server
            .mock("GET", "/static/jquery.js")
            .expect(0)
            .create_async()
            .await;

        let pool = setup_pool().await;
        let td = tempfile::tempdir().unwrap();
        let layout = AssetLayout::new(td.path().to_path_buf(), "/tilda");
        let api = client(&server);
        let fetcher = HttpFetcher::new().unwrap();
        let sync = PageSync::new(&pool, &api, &fetcher, layout.clone());

        let SyncOutcome::Synced(report) = sync.sync_page(100).await.unwrap() else {
            panic!("expected a sync");
        };
        assert_eq!(report.failed_count(), 0);
        assert_eq!(report.scripts.skipped, vec!["jquery-1.10.2.min.js".to_string()]);
        jquery.assert_async().await;

        let page = db::find_page(&pool, 100, 42).await.unwrap().unwrap();
        assert_eq!(page.html.as_deref(), Some("<img src=\"/tilda/100/img/a.png\">"));
        let written = layout.dir_for(100, AssetKind::Image).join("a.png");
        assert_eq!(std::fs::read_to_string(written).unwrap(), "PNG");
    }

    #[tokio::test]
    async fn api_error_leaves_store_untouched() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v1/getpageexport")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"status":"ERROR","message":"Wrong page id"}"#)
            .create_async()
            .await;

        let pool = setup_pool().await;
        let td = tempfile::tempdir().unwrap();
        let api = client(&server);
        let fetcher = HttpFetcher::new().unwrap();
        let sync = PageSync::new(
            &pool,
            &api,
            &fetcher,
            AssetLayout::new(td.path().to_path_buf(), "/tilda"),
        );

        assert_eq!(sync.sync_page(100).await.unwrap(), SyncOutcome::NotFound);
        assert!(db::find_page_by_page_id(&pool, 100).await.unwrap().is_none());
        assert_eq!(std::fs::read_dir(td.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn project_pass_survives_null_fields_and_a_broken_page() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v1/getpageslist")
            .match_query(Matcher::UrlEncoded("projectid".into(), "42".into()))
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "status": "FOUND",
                    "result": [
                        { "id": "100", "projectid": "42", "title": null, "published": "1000" },
                        { "id": "101", "projectid": "42", "title": "Broken", "published": "1000" },
                        { "id": "102", "projectid": "42", "title": "About", "published": "1000" }
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;
        server
            .mock("GET", "/v1/getpageexport")
            .match_query(Matcher::UrlEncoded("pageid".into(), "100".into()))
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "status": "FOUND",
                    "result": {
                        "id": "100", "projectid": "42", "title": "Home", "alias": null,
                        "html": "<p>home</p>", "published": "1000",
                        "images": null, "css": null, "js": null
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;
        server
            .mock("GET", "/v1/getpageexport")
            .match_query(Matcher::UrlEncoded("pageid".into(), "101".into()))
            .with_status(200)
            .with_body(r#"{"status":"FOUND","result":{"id":"not-a-number"}}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/v1/getpageexport")
            .match_query(Matcher::UrlEncoded("pageid".into(), "102".into()))
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "status": "FOUND",
                    "result": {
                        "id": "102", "projectid": "42", "title": "About", "alias": "about",
                        "html": "<p>about</p>", "published": "1000"
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let pool = setup_pool().await;
        let td = tempfile::tempdir().unwrap();
        let api = client(&server);
        let fetcher = HttpFetcher::new().unwrap();
        let sync = PageSync::new(
            &pool,
            &api,
            &fetcher,
            AssetLayout::new(td.path().to_path_buf(), "/tilda"),
        );

        let report = sync.sync_project(42).await.unwrap();
        assert_eq!(report.listed, 3);
        assert_eq!(report.synced, vec![100, 102]);
        assert_eq!(report.failed, vec![101]);

        let home = db::find_page(&pool, 100, 42).await.unwrap().unwrap();
        assert_eq!(home.alias.as_deref(), Some(""));
        assert_eq!(home.html.as_deref(), Some("<p>home</p>"));
        assert!(db::find_page(&pool, 101, 42).await.unwrap().is_none());
        assert!(db::find_page(&pool, 102, 42).await.unwrap().is_some());
    }
}

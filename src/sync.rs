//! Page synchronization: fetch an export, decide whether it is newer than
//! what is stored, persist it and mirror its assets.
use anyhow::Result;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{error, info, instrument, warn};

use crate::assets::{self, AssetFetcher, AssetLayout};
use crate::db::{self, Pool};
use crate::model::{rewrite_html, AssetKind, NewAsset, PageUpsert};
use crate::tilda::{AssetRef, PageExport, TildaService};

/// Hosts ship their own copy of this jQuery build; Tilda's is never mirrored.
pub const BUNDLED_JQUERY: &str = "jquery-1.10.2.min.js";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloaded {
    pub name: String,
    pub path: PathBuf,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAsset {
    pub name: String,
    pub source_url: String,
    pub error: String,
}

/// What happened to each entry of one asset kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetBatch {
    pub downloaded: Vec<Downloaded>,
    pub failed: Vec<FailedAsset>,
    /// Entries neither downloaded nor recorded (duplicates, bundled jQuery).
    /// Unsafe file names are reported under `failed` and not recorded either.
    pub skipped: Vec<String>,
    /// Rows written for this kind.
    pub recorded: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageReport {
    pub row_id: i64,
    pub page_id: i64,
    pub project_id: i64,
    pub published_at: i64,
    pub images: AssetBatch,
    pub styles: AssetBatch,
    pub scripts: AssetBatch,
}

impl PageReport {
    pub fn failed_count(&self) -> usize {
        self.images.failed.len() + self.styles.failed.len() + self.scripts.failed.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The API had nothing for this page id.
    NotFound,
    /// The export carries no publish time, so there is nothing to compare.
    Unpublished,
    /// Stored copy is as new or newer; nothing touched.
    UpToDate { stored_published_at: i64 },
    Synced(PageReport),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectReport {
    pub project_id: i64,
    pub listed: usize,
    pub synced: Vec<i64>,
    pub up_to_date: Vec<i64>,
    pub skipped: Vec<i64>,
    /// Pages whose sync returned an error; the pass moved on to the next page.
    pub failed: Vec<i64>,
    pub failed_assets: usize,
}

/// One asset kind after its downloads, before anything is written.
struct Mirrored {
    kind: AssetKind,
    batch: AssetBatch,
    records: Vec<NewAsset>,
    replacements: Vec<(String, String)>,
}

/// Runs syncs one page at a time against a pool, an API and a fetcher.
pub struct PageSync<'a> {
    pool: &'a Pool,
    api: &'a dyn TildaService,
    fetcher: &'a dyn AssetFetcher,
    layout: AssetLayout,
}

impl<'a> PageSync<'a> {
    pub fn new(
        pool: &'a Pool,
        api: &'a dyn TildaService,
        fetcher: &'a dyn AssetFetcher,
        layout: AssetLayout,
    ) -> Self {
        Self {
            pool,
            api,
            fetcher,
            layout,
        }
    }

    /// Sync every page the API lists for `project_id`, in order. An API error
    /// on the listing means nothing to do this round. A page that fails is
    /// logged and listed under `failed`; the remaining pages still sync.
    #[instrument(skip(self))]
    pub async fn sync_project(&self, project_id: i64) -> Result<ProjectReport> {
        let mut report = ProjectReport {
            project_id,
            ..Default::default()
        };
        let Some(pages) = self.api.list_pages(project_id).await? else {
            warn!(project_id, "no page list; nothing to sync");
            return Ok(report);
        };
        report.listed = pages.len();

        for summary in pages {
            match self.sync_page(summary.id).await {
                Ok(SyncOutcome::Synced(page)) => {
                    report.failed_assets += page.failed_count();
                    report.synced.push(summary.id);
                }
                Ok(SyncOutcome::UpToDate { .. }) => report.up_to_date.push(summary.id),
                Ok(SyncOutcome::NotFound | SyncOutcome::Unpublished) => {
                    report.skipped.push(summary.id)
                }
                Err(err) => {
                    error!(page_id = summary.id, ?err, "page sync failed");
                    report.failed.push(summary.id);
                }
            }
        }

        info!(
            project_id,
            listed = report.listed,
            synced = report.synced.len(),
            up_to_date = report.up_to_date.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            failed_assets = report.failed_assets,
            "project sync finished"
        );
        Ok(report)
    }

    #[instrument(skip(self))]
    pub async fn sync_page(&self, page_id: i64) -> Result<SyncOutcome> {
        let Some(export) = self.api.fetch_page(page_id).await? else {
            info!(page_id, "no export returned");
            return Ok(SyncOutcome::NotFound);
        };
        self.store_export(&export).await
    }

    /// Persist an already fetched export if it is newer than the stored copy.
    pub async fn store_export(&self, export: &PageExport) -> Result<SyncOutcome> {
        let Some(published_at) = export.published else {
            info!(page_id = export.id, "page has no publish time; skipping");
            return Ok(SyncOutcome::Unpublished);
        };

        if let Some(stored) = db::find_page(self.pool, export.id, export.projectid).await? {
            if let Some(stored_at) = stored.published_at.filter(|at| *at >= published_at) {
                info!(page_id = export.id, stored_at, published_at, "page is up to date");
                return Ok(SyncOutcome::UpToDate {
                    stored_published_at: stored_at,
                });
            }
        }

        // Files first, then one transaction for the page and all its rows, so
        // a failed write leaves the stored publish time behind and the next
        // pass retries.
        let mut mirrored = Vec::with_capacity(AssetKind::ALL.len());
        for kind in AssetKind::ALL {
            mirrored.push(self.mirror_assets(export.id, kind, export.assets(kind)).await);
        }
        let replacements: Vec<(String, String)> = mirrored
            .iter()
            .flat_map(|m| m.replacements.iter().cloned())
            .collect();
        let html = rewrite_html(&export.html, &replacements);

        let rows: Vec<(AssetKind, &[NewAsset])> = mirrored
            .iter()
            .map(|m| (m.kind, m.records.as_slice()))
            .collect();
        let row_id = db::store_page(
            self.pool,
            &PageUpsert {
                page_id: export.id,
                project_id: export.projectid,
                title: &export.title,
                alias: &export.alias,
                html: &html,
                published_at,
            },
            &rows,
        )
        .await?;

        let mut report = PageReport {
            row_id,
            page_id: export.id,
            project_id: export.projectid,
            published_at,
            images: AssetBatch::default(),
            styles: AssetBatch::default(),
            scripts: AssetBatch::default(),
        };
        for m in mirrored {
            match m.kind {
                AssetKind::Image => report.images = m.batch,
                AssetKind::Style => report.styles = m.batch,
                AssetKind::Script => report.scripts = m.batch,
            }
        }
        info!(
            page_id = export.id,
            project_id = export.projectid,
            published_at,
            images = report.images.recorded,
            styles = report.styles.recorded,
            scripts = report.scripts.recorded,
            failed = report.failed_count(),
            "page synced"
        );
        Ok(SyncOutcome::Synced(report))
    }

    /// Mirror one asset kind on disk: wipe its directory and download each
    /// entry. Returns the rows to store and, for images, the
    /// filename → local URL pairs to apply to the HTML.
    async fn mirror_assets(&self, page_id: i64, kind: AssetKind, entries: &[AssetRef]) -> Mirrored {
        let dir = self.layout.dir_for(page_id, kind);
        let dir_error = match assets::prepare_dir(&dir).await {
            Ok(()) => None,
            Err(err) => {
                warn!(dir = %dir.display(), ?err, "failed to prepare asset directory");
                Some(format!("asset directory {} unavailable: {}", dir.display(), err))
            }
        };

        let mut batch = AssetBatch::default();
        let mut records = Vec::with_capacity(entries.len());
        let mut replacements = Vec::new();
        let mut seen = HashSet::new();

        for entry in entries {
            if kind == AssetKind::Script && entry.to == BUNDLED_JQUERY {
                batch.skipped.push(entry.to.clone());
                continue;
            }
            if kind == AssetKind::Image && !seen.insert(entry.to.as_str()) {
                batch.skipped.push(entry.to.clone());
                continue;
            }

            if !is_plain_file_name(&entry.to) {
                warn!(name = %entry.to, "refusing asset with unsafe file name");
                batch.failed.push(FailedAsset {
                    name: entry.to.clone(),
                    source_url: entry.from.clone(),
                    error: format!("unsafe file name {:?}", entry.to),
                });
                continue;
            }

            let url = self.layout.url_for(page_id, kind, &entry.to);
            let dest = dir.join(&entry.to);
            let outcome = match &dir_error {
                Some(err) => Err(err.clone()),
                None => assets::fetch_logged(self.fetcher, &entry.from, &dest)
                    .await
                    .map_err(|err| format!("{:#}", err)),
            };
            match outcome {
                Ok(bytes) => batch.downloaded.push(Downloaded {
                    name: entry.to.clone(),
                    path: dest,
                    bytes,
                }),
                Err(error) => batch.failed.push(FailedAsset {
                    name: entry.to.clone(),
                    source_url: entry.from.clone(),
                    error,
                }),
            }

            records.push(NewAsset {
                source_url: entry.from.clone(),
                path: url.clone(),
                name: entry.to.clone(),
            });
            if kind == AssetKind::Image {
                replacements.push((entry.to.clone(), url));
            }
        }

        batch.recorded = records.len() as u64;
        Mirrored {
            kind,
            batch,
            records,
            replacements,
        }
    }
}

/// A single path component: no separators, not `.`/`..`, not empty.
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

use tilda_mirror::assets::HttpFetcher;
use tilda_mirror::config::{self, Config};
use tilda_mirror::db;
use tilda_mirror::render::{self, HtmlPartialRenderer};
use tilda_mirror::sync::{PageSync, SyncOutcome};
use tilda_mirror::tilda::TildaClient;

#[derive(Debug, Parser)]
#[command(author, version, about = "Mirror Tilda pages and their assets into a local database")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sync every page of a project
    Sync {
        #[arg(long)]
        project: Option<i64>,
        /// Repeat every N seconds instead of exiting after one pass
        #[arg(long)]
        every: Option<u64>,
    },
    /// Sync a single page
    SyncPage {
        page_id: i64,
        /// Public key sent along with a publish notification; must match the config
        #[arg(long)]
        public_key: Option<String>,
    },
    /// List pages of a project as reported by the API
    Pages {
        #[arg(long)]
        project: Option<i64>,
    },
    /// List pages stored locally
    Stored {
        #[arg(long)]
        project: Option<i64>,
    },
    /// List projects available to the configured keys
    Projects,
    /// Show one project's details
    Project {
        #[arg(long)]
        project: Option<i64>,
    },
    /// Print the stored HTML of a page
    Html { page_id: i64 },
    /// Print the asset tags of a page
    Assets { page_id: i64 },
    /// Print a <select> of the project's pages
    Select {
        field: String,
        #[arg(long)]
        project: Option<i64>,
        #[arg(long)]
        selected: Option<i64>,
    },
    /// Print a sample config file
    ExampleConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if let Command::ExampleConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;
    let client = TildaClient::from_config(&cfg)?;

    match args.command {
        Command::Sync { project, every } => {
            let project_id = cfg.project_id(project)?;
            let interval = every.unwrap_or(cfg.app.sync_interval_secs);
            let pool = open_db(&cfg).await?;
            let fetcher = HttpFetcher::new()?;
            let sync = PageSync::new(&pool, &client, &fetcher, cfg.asset_layout());
            loop {
                // Passes never overlap: the next one starts after this one returns.
                match sync.sync_project(project_id).await {
                    Ok(report) => info!(
                        synced = report.synced.len(),
                        up_to_date = report.up_to_date.len(),
                        failed_pages = report.failed.len(),
                        failed_assets = report.failed_assets,
                        "sync pass done"
                    ),
                    Err(err) if interval > 0 => error!(?err, "sync pass failed"),
                    Err(err) => return Err(err),
                }
                if interval == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(interval)).await;
            }
        }
        Command::SyncPage { page_id, public_key } => {
            if let Some(key) = public_key {
                if !cfg.verify_public_key(&key) {
                    return Err(anyhow!("public key does not match configuration"));
                }
            }
            let pool = open_db(&cfg).await?;
            let fetcher = HttpFetcher::new()?;
            let sync = PageSync::new(&pool, &client, &fetcher, cfg.asset_layout());
            match sync.sync_page(page_id).await? {
                SyncOutcome::Synced(report) => {
                    println!(
                        "page {} synced: {} images, {} styles, {} scripts, {} failed downloads",
                        page_id,
                        report.images.recorded,
                        report.styles.recorded,
                        report.scripts.recorded,
                        report.failed_count()
                    );
                    for failed in report
                        .images
                        .failed
                        .iter()
                        .chain(&report.styles.failed)
                        .chain(&report.scripts.failed)
                    {
                        println!("  failed {} ({}): {}", failed.name, failed.source_url, failed.error);
                    }
                }
                SyncOutcome::UpToDate { stored_published_at } => {
                    println!("page {} up to date (published {})", page_id, stored_published_at)
                }
                SyncOutcome::Unpublished => println!("page {} has no publish time", page_id),
                SyncOutcome::NotFound => println!("page {} not returned by the API", page_id),
            }
        }
        Command::Pages { project } => {
            let project_id = cfg.project_id(project)?;
            for (id, title) in render::list_page_options(&client, project_id).await? {
                println!("{}\t{}", id, title);
            }
        }
        Command::Stored { project } => {
            let project_id = cfg.project_id(project)?;
            let pool = open_db(&cfg).await?;
            for page in db::list_pages(&pool, project_id).await? {
                let published = page
                    .published_at_utc()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{}\t{}\t{}\t{}",
                    page.page_id,
                    published,
                    page.alias.unwrap_or_default(),
                    page.title.unwrap_or_default()
                );
            }
        }
        Command::Projects => {
            for project in client.list_projects().await?.unwrap_or_default() {
                println!("{}\t{}", project.id, project.title);
            }
        }
        Command::Project { project } => {
            let project_id = cfg.project_id(project)?;
            let info = client
                .project_info(project_id)
                .await?
                .ok_or_else(|| anyhow!("Tilda returned no info for project {}", project_id))?;
            println!("ID: {}", info.id);
            println!("Title: {}", info.title);
            println!("Description: {}", info.descr);
            println!("Custom domain: {}", info.customdomain);
        }
        Command::Html { page_id } => {
            let pool = open_db(&cfg).await?;
            let html = render::render_html(&pool, page_id)
                .await?
                .ok_or_else(|| anyhow!("page {} has not been synced", page_id))?;
            print!("{}", html);
        }
        Command::Assets { page_id } => {
            let pool = open_db(&cfg).await?;
            let partial = render::register_assets(&pool, &HtmlPartialRenderer, page_id)
                .await?
                .ok_or_else(|| anyhow!("page {} has not been synced", page_id))?;
            print!("{}", partial);
        }
        Command::Select {
            field,
            project,
            selected,
        } => {
            let project_id = cfg.project_id(project)?;
            let options = render::list_page_options(&client, project_id).await?;
            println!("{}", render::render_page_select(&field, &options, selected));
        }
        Command::ExampleConfig => print!("{}", config::example()),
    }

    Ok(())
}

async fn open_db(cfg: &Config) -> Result<db::Pool> {
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    Ok(pool)
}

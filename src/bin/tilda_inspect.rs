use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;
use tilda_mirror::config;
use tilda_mirror::tilda::TildaClient;

#[derive(Parser, Debug)]
#[command(about = "Print what the Tilda API exports for one page, without storing anything")]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Page ID to inspect
    #[arg(long)]
    page_id: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let client = TildaClient::from_config(&cfg)?;

    let page = client
        .fetch_page(args.page_id)
        .await?
        .ok_or_else(|| anyhow!("Tilda returned no export for page {}", args.page_id))?;
    println!("Page ID: {}", page.id);
    println!("Project ID: {}", page.projectid);
    println!("Title: {}", page.title);
    println!("Alias: {}", page.alias);
    println!("Published: {}", page.published.map(|p| p.to_string()).unwrap_or_else(|| "-".into()));
    println!("HTML: {} bytes", page.html.len());
    for (label, list) in [("Images", &page.images), ("CSS", &page.css), ("JS", &page.js)] {
        println!("{} ({}):", label, list.len());
        for asset in list {
            println!("  {} <- {}", asset.to, asset.from);
        }
    }
    Ok(())
}

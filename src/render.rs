//! Host-facing helpers: page pickers, asset tags and stored HTML.
use anyhow::Result;

use crate::db::{self, Pool};
use crate::model::PageAssets;
use crate::tilda::TildaService;

/// Turns a page's stored assets into markup the host drops into its layout.
pub trait PartialRenderer: Send + Sync {
    fn render_assets(&self, assets: &PageAssets) -> String;
}

/// Default partial: one `<link>` per stylesheet, one `<script>` per script,
/// in stored order.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlPartialRenderer;

impl PartialRenderer for HtmlPartialRenderer {
    fn render_assets(&self, assets: &PageAssets) -> String {
        let mut out = String::new();
        for style in &assets.styles {
            out.push_str(&format!(
                "<link rel=\"stylesheet\" href=\"{}\">\n",
                html_attr(&style.path)
            ));
        }
        for script in &assets.scripts {
            out.push_str(&format!(
                "<script src=\"{}\"></script>\n",
                html_attr(&script.path)
            ));
        }
        out
    }
}

/// `(id, title)` pairs for a project, in API order, for a selection control.
/// Empty when the API reports an error.
pub async fn list_page_options(
    api: &dyn TildaService,
    project_id: i64,
) -> Result<Vec<(i64, String)>> {
    Ok(api
        .list_pages(project_id)
        .await?
        .unwrap_or_default()
        .into_iter()
        .map(|p| (p.id, p.title))
        .collect())
}

/// A `<select>` named `field` listing `options`, with `selected` preselected.
pub fn render_page_select(field: &str, options: &[(i64, String)], selected: Option<i64>) -> String {
    let mut out = format!(
        "<select id=\"{}\" name=\"{}\">\n",
        html_attr(field),
        html_attr(field)
    );
    for (id, title) in options {
        let mark = if Some(*id) == selected { " selected" } else { "" };
        out.push_str(&format!(
            "  <option value=\"{}\"{}>{}</option>\n",
            id,
            mark,
            html_escape(title)
        ));
    }
    out.push_str("</select>");
    out
}

/// Render the asset partial for a synced page; `None` if it was never synced.
pub async fn register_assets(
    pool: &Pool,
    renderer: &dyn PartialRenderer,
    page_id: i64,
) -> Result<Option<String>> {
    Ok(db::load_page_assets(pool, page_id)
        .await?
        .map(|assets| renderer.render_assets(&assets)))
}

/// Stored (already rewritten) HTML of a page.
pub async fn render_html(pool: &Pool, page_id: i64) -> Result<Option<String>> {
    Ok(db::find_page_by_page_id(pool, page_id)
        .await?
        .and_then(|page| page.html))
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn html_attr(s: &str) -> String {
    html_escape(s).replace('"', "&quot;")
}

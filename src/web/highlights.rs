//! Highlight report pages: one page per highlight type (plus "all"), each
//! over several recency windows.

use anyhow::{bail, Result};
use sqlx::Row;
use std::fmt::Write as _;

use crate::db::{App, PgTx};
use crate::types::submission_id_from_branch_name;
use crate::web::{atomic_write, html_escape, page_footer, page_header};

/// Page modes: the combined page plus one per highlight type.
pub const MODES: &[&str] = &[
    "all",
    "assertion",
    "compiler",
    "core",
    "linker",
    "panic",
    "regress",
    "sanitizer",
    "tap",
    "test",
];

/// Recency windows in days; "current" keeps only the last two days.
const WINDOWS: &[(&str, i32)] = &[("", 2), ("-7", 7), ("-30", 30), ("-90", 90)];

const PAGE_LIMIT: i64 = 500;

struct HighlightRow {
    task_id: String,
    task_name: String,
    branch_name: String,
    highlight_type: String,
    source: String,
    excerpt: String,
}

async fn load_highlights(
    tx: &mut PgTx,
    mode: &str,
    days: i32,
) -> Result<Vec<HighlightRow>> {
    let rows = sqlx::query(
        "select h.task_id, h.type, h.source, h.excerpt, t.task_name, b.branch_name
           from highlight h
           join task t using (task_id)
           join build b on b.build_id = t.build_id
          where ($1 = 'all' or h.type = $1)
            and t.created > now() - make_interval(days => $2)
          order by t.created desc
          limit $3",
    )
    .bind(mode)
    .bind(days)
    .bind(PAGE_LIMIT)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows
        .iter()
        .map(|r| HighlightRow {
            task_id: r.get("task_id"),
            task_name: r.get("task_name"),
            branch_name: r.get("branch_name"),
            highlight_type: r.get("type"),
            source: r.get("source"),
            excerpt: r.get("excerpt"),
        })
        .collect())
}

fn render(mode: &str, rows: &[HighlightRow]) -> String {
    let mut body = String::new();
    page_header(&mut body, &format!("Highlights: {mode}"));
    body.push_str("<p>");
    for other in MODES {
        let _ = write!(body, "<a href=\"{other}.html\">{other}</a> ");
    }
    body.push_str("</p>\n");
    for row in rows {
        let submission = submission_id_from_branch_name(&row.branch_name)
            .map(|id| format!("cf/{id}"))
            .unwrap_or_else(|| row.branch_name.clone());
        let _ = write!(
            body,
            "<h2>{} / {} <a href=\"https://cirrus-ci.com/task/{}\">{}</a> ({})</h2>\n\
             <p>{}</p>\n<pre>{}</pre>\n",
            html_escape(&submission),
            html_escape(&row.task_name),
            html_escape(&row.task_id),
            html_escape(&row.task_id),
            html_escape(&row.highlight_type),
            html_escape(&row.source),
            html_escape(&row.excerpt),
        );
    }
    page_footer(&mut body);
    body
}

/// Queue handler: regenerate one type's pages (or the combined pages when
/// the key is "all") over every recency window.
pub async fn rebuild_type(app: &App, tx: &mut PgTx, mode: &str) -> Result<()> {
    if !MODES.contains(&mode) {
        bail!("unrecognised highlight page mode {mode:?}");
    }
    for (suffix, days) in WINDOWS {
        let rows = load_highlights(tx, mode, *days).await?;
        let file = format!("highlights/{mode}{suffix}.html");
        atomic_write(&app.config.web_root.join(file), &render(mode, &rows))?;
    }
    Ok(())
}

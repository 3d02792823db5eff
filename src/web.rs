//! Generated status pages.
//!
//! Every page is rewritten from scratch and moved into place atomically, so
//! a crashed tick never leaves a half-written page behind.  Styling is
//! deliberately minimal; these pages are working surfaces, not a product.

pub mod highlights;

use anyhow::{Context, Result};
use sqlx::Row;
use std::fmt::Write as _;
use std::path::Path;

use crate::commitfest::CommitfestInfo;
use crate::db::App;
use crate::types::ACTIVE_SUBMISSION_STATUSES;

const APPLY_PASSING_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="90" height="20"><rect width="90" height="20" rx="3" fill="#4c1"/><text x="45" y="14" fill="#fff" font-family="Verdana,sans-serif" font-size="11" text-anchor="middle">apply passing</text></svg>"##;

const APPLY_FAILING_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="90" height="20"><rect width="90" height="20" rx="3" fill="#e05d44"/><text x="45" y="14" fill="#fff" font-family="Verdana,sans-serif" font-size="11" text-anchor="middle">apply failing</text></svg>"##;

/// Write a file via a temp path and an atomic rename.
pub fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("tmp{}", std::process::id()));
    std::fs::write(&tmp, contents).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

pub fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// File name for an author's page: ASCII-folded, lowercased, hyphenated.
pub fn author_slug(author: &str) -> String {
    let mut slug = String::new();
    for c in author.trim().to_lowercase().chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            slug.push(c);
        } else if c.is_whitespace() && !slug.ends_with('-') {
            slug.push('-');
        }
        // anything else (accents, punctuation) is dropped
    }
    format!("{}.html", slug.trim_matches('-'))
}

pub fn page_header(body: &mut String, title: &str) {
    let _ = write!(
        body,
        "<html>\n<head>\n<meta charset=\"UTF-8\"/>\n<title>{}</title>\n\
         <style type=\"text/css\">\n\
         body {{ margin: 1rem auto; font-family: sans-serif; color: #444; max-width: 920px; }}\n\
         table {{ border-collapse: collapse; font-size: 0.875rem; width: 100%; }}\n\
         td {{ padding: 0.5rem 1rem 0.5rem 0; border-bottom: solid 1px rgba(0,0,0,.2); }}\n\
         </style>\n</head>\n<body>\n<h1>{}</h1>\n\
         <p><a href=\"index.html\">Current commitfest</a> |\n\
         <a href=\"next.html\">Next commitfest</a> |\n\
         <a href=\"highlights/all.html\">Highlights</a> |\n\
         <a href=\"statistics.html\">Statistics</a></p>\n",
        html_escape(title),
        html_escape(title),
    );
}

pub fn page_footer(body: &mut String) {
    body.push_str("</body>\n</html>\n");
}

struct PageRow {
    commitfest_id: i32,
    submission_id: i64,
    name: String,
    status: String,
    authors: Vec<String>,
    branch_status: Option<String>,
    apply_url: Option<String>,
    version: Option<String>,
}

async fn load_rows(app: &App, commitfest_id: i32) -> Result<Vec<PageRow>> {
    let rows = sqlx::query(
        "select s.commitfest_id, s.submission_id, s.name, s.status, s.authors,
                b.status as branch_status, b.url, b.version
           from submission s
           left join lateral (select status, url, version
                                from branch
                               where branch.submission_id = s.submission_id
                               order by created desc
                               limit 1) b on true
          where s.commitfest_id = $1
            and s.status = any($2)
          order by s.status, s.name",
    )
    .bind(commitfest_id)
    .bind(
        ACTIVE_SUBMISSION_STATUSES
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>(),
    )
    .fetch_all(&app.pool)
    .await?;
    Ok(rows
        .iter()
        .map(|r| PageRow {
            commitfest_id: r.get("commitfest_id"),
            submission_id: r.get("submission_id"),
            name: r.get::<Option<String>, _>("name").unwrap_or_default(),
            status: r.get::<Option<String>, _>("status").unwrap_or_default(),
            authors: r.get("authors"),
            branch_status: r.get("branch_status"),
            apply_url: r.get("url"),
            version: r.get("version"),
        })
        .collect())
}

fn render_submissions(title: &str, rows: &[PageRow]) -> String {
    let mut body = String::new();
    page_header(&mut body, title);
    body.push_str("<table>\n");
    let mut last_status = "";
    for row in rows {
        if row.status != last_status {
            let _ = write!(
                body,
                "<tr><td colspan=\"6\"><h2>{}</h2></td></tr>\n",
                html_escape(&row.status)
            );
            last_status = &row.status;
        }
        let mut name = row.name.clone();
        if name.chars().count() > 80 {
            name = name.chars().take(80).collect();
            name.push_str("...");
        }
        let author_links: Vec<String> = row
            .authors
            .iter()
            .map(|a| {
                format!(
                    "<a href=\"{}\">{}</a>",
                    author_slug(a),
                    html_escape(a)
                )
            })
            .collect();
        let badge = format!(
            "<img src=\"{}/{}.apply.svg\"/>",
            row.commitfest_id, row.submission_id
        );
        let apply_cell = match &row.apply_url {
            Some(url) => format!("<a href=\"{}\">{badge}</a>", html_escape(url)),
            None => badge,
        };
        let _ = write!(
            body,
            "<tr>\n<td>{}/{}</td>\n\
             <td><a href=\"https://commitfest.postgresql.org/patch/{}\">{}</a></td>\n\
             <td>{}</td>\n<td>{}</td>\n<td>{}</td>\n<td>{}</td>\n</tr>\n",
            row.commitfest_id,
            row.submission_id,
            row.submission_id,
            html_escape(&name),
            author_links.join(", "),
            row.version.as_deref().unwrap_or(""),
            apply_cell,
            row.branch_status.as_deref().unwrap_or(""),
        );
    }
    body.push_str("</table>\n");
    page_footer(&mut body);
    body
}

fn write_badges(app: &App, rows: &[PageRow]) -> Result<()> {
    for row in rows {
        let dir = app.config.web_root.join(row.commitfest_id.to_string());
        let svg = match row.branch_status.as_deref() {
            Some("failed") => APPLY_FAILING_SVG,
            _ => APPLY_PASSING_SVG,
        };
        atomic_write(&dir.join(format!("{}.apply.svg", row.submission_id)), svg)?;
    }
    Ok(())
}

fn render_author_pages(app: &App, rows: &[PageRow]) -> Result<()> {
    let mut authors: Vec<&String> = rows.iter().flat_map(|r| &r.authors).collect();
    authors.sort();
    authors.dedup();
    for author in authors {
        let theirs: Vec<&PageRow> = rows
            .iter()
            .filter(|r| r.authors.iter().any(|a| a == author))
            .collect();
        let mut body = String::new();
        page_header(&mut body, &format!("Patches by {author}"));
        body.push_str("<table>\n");
        for row in &theirs {
            let _ = write!(
                body,
                "<tr><td>{}/{}</td><td>{}</td><td>{}</td></tr>\n",
                row.commitfest_id,
                row.submission_id,
                html_escape(&row.name),
                row.branch_status.as_deref().unwrap_or(""),
            );
        }
        body.push_str("</table>\n");
        page_footer(&mut body);
        atomic_write(&app.config.web_root.join(author_slug(author)), &body)?;
    }
    Ok(())
}

/// Regenerate the main status pages: one per polled commitfest plus the
/// per-author pages and apply badges.
pub async fn rebuild(app: &App, commitfests: &[CommitfestInfo]) -> Result<()> {
    let mut all_rows = Vec::new();
    for (index, commitfest) in commitfests.iter().enumerate() {
        let rows = load_rows(app, commitfest.id).await?;
        let file = if index == 0 { "index.html" } else { "next.html" };
        let title = if commitfest.name.is_empty() {
            format!("Patch Tester: commitfest {}", commitfest.id)
        } else {
            format!("Patch Tester: {}", commitfest.name)
        };
        atomic_write(
            &app.config.web_root.join(file),
            &render_submissions(&title, &rows),
        )?;
        write_badges(app, &rows)?;
        all_rows.extend(rows);
    }
    render_author_pages(app, &all_rows)?;
    Ok(())
}

/// Regenerate the per-command duration statistics page.
pub async fn rebuild_statistics(app: &App) -> Result<()> {
    let rows = sqlx::query(
        "select t.task_name,
                c.name,
                count(*) filter (where t.created > now() - interval '7 days') as n_7,
                avg(c.duration) filter (where t.created > now() - interval '7 days') as avg_7,
                stddev(c.duration) filter (where t.created > now() - interval '7 days') as stddev_7,
                count(*) filter (where t.created > now() - interval '30 days') as n_30,
                avg(c.duration) filter (where t.created > now() - interval '30 days') as avg_30,
                stddev(c.duration) filter (where t.created > now() - interval '30 days') as stddev_30,
                count(*) filter (where t.created > now() - interval '365 days') as n_365,
                avg(c.duration) filter (where t.created > now() - interval '365 days') as avg_365,
                stddev(c.duration) filter (where t.created > now() - interval '365 days') as stddev_365
           from task t
           join task_command c using (task_id)
          where c.name in ('configure', 'build', 'test_world', 'check_world')
            and t.status = 'COMPLETED'
          group by 1, 2
          order by 1, 2",
    )
    .fetch_all(&app.pool)
    .await?;

    let mut body = String::new();
    page_header(&mut body, "Task step durations");
    body.push_str(
        "<p>Time taken, in seconds, for successfully completed task steps over\n\
         7/30/365-day windows.</p>\n<table>\n\
         <tr><td>Task</td><td>Step</td>\
         <td>n</td><td>avg</td><td>stddev</td>\
         <td>n</td><td>avg</td><td>stddev</td>\
         <td>n</td><td>avg</td><td>stddev</td></tr>\n",
    );
    let mut last_task = String::new();
    for row in &rows {
        let task: String = row.get("task_name");
        let shown_task = if task == last_task { "" } else { task.as_str() };
        let command: String = row.get("name");
        let _ = write!(body, "<tr><td>{}</td><td>{}</td>", html_escape(shown_task), html_escape(&command));
        for window in ["7", "30", "365"] {
            let n: i64 = row.get(format!("n_{window}").as_str());
            let avg: Option<f64> = row.get(format!("avg_{window}").as_str());
            let stddev: Option<f64> = row.get(format!("stddev_{window}").as_str());
            let _ = write!(
                body,
                "<td align=\"right\">{}</td><td align=\"right\">{:.2}</td><td align=\"right\">{:.2}</td>",
                n,
                avg.unwrap_or(0.0),
                stddev.unwrap_or(0.0),
            );
        }
        body.push_str("</tr>\n");
        last_task = task;
    }
    body.push_str("</table>\n");
    page_footer(&mut body);
    atomic_write(&app.config.web_root.join("statistics.html"), &body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_creates_dirs_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/page.html");
        atomic_write(&path, "one").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one");
        atomic_write(&path, "two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        // no temp litter left behind
        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn test_author_slug() {
        assert_eq!(author_slug("A. Hacker"), "a-hacker.html");
        assert_eq!(author_slug("  Jose Nunez  "), "jose-nunez.html");
        assert_eq!(author_slug("O'Brien"), "obrien.html");
    }

    #[test]
    fn test_html_escape() {
        assert_eq!(
            html_escape(r#"a <b> & "c""#),
            "a &lt;b&gt; &amp; &quot;c&quot;"
        );
    }
}

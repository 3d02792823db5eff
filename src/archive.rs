//! Mail-archive "flat thread" scanning.
//!
//! The archive has no JSON API for attachments, so we scan the flat HTML
//! page line-wise: each message section starts with a message-id marker and
//! is followed by its attachment links.  The selected message is the last
//! one in the thread carrying at least one attachment we know how to apply.

use anyhow::Result;
use regex::Regex;
use std::sync::OnceLock;

use crate::net::{Fetcher, HttpError};

const ARCHIVE_HOST: &str = "https://www.postgresql.org";

/// One message of a flat thread, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMessage {
    pub message_id: String,
    pub attachment_urls: Vec<String>,
}

/// The chosen patch set for a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestPatchSet {
    pub message_id: String,
    pub patch_urls: Vec<String>,
}

fn message_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"<td><a href="/message-id/[^"]+">([^<]+)</a></td>"#).unwrap())
}

fn attachment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"<a href="(/message-id/attachment/[^"]+)">"#).unwrap())
}

/// Individual patch files, optionally compressed.
fn is_plain_patch(url: &str) -> bool {
    let base = url
        .trim_end_matches(".gz")
        .trim_end_matches(".bz2");
    base.ends_with(".patch") || base.ends_with(".diff")
}

/// Single-archive attachments.
fn is_archive(url: &str) -> bool {
    url.ends_with(".tar")
        || url.ends_with(".tgz")
        || url.ends_with(".tar.gz")
        || url.ends_with(".tar.bz2")
        || url.ends_with(".zip")
}

fn is_acceptable(url: &str) -> bool {
    // .tar.gz would also pass the plain-patch suffix stripping, so check
    // archives first
    is_archive(url) || is_plain_patch(url)
}

/// Scan a flat-thread HTML page into messages with their acceptable
/// attachments.  Attachment URLs containing `/nocfbot` are ignored.
pub fn parse_flat_thread(html: &str) -> Vec<ThreadMessage> {
    let mut messages: Vec<ThreadMessage> = Vec::new();
    for line in html.lines() {
        if let Some(captures) = message_marker_re().captures(line) {
            messages.push(ThreadMessage {
                message_id: captures[1].to_string(),
                attachment_urls: Vec::new(),
            });
            continue;
        }
        if let Some(captures) = attachment_re().captures(line) {
            let href = &captures[1];
            if href.contains("/nocfbot") || !is_acceptable(href) {
                continue;
            }
            if let Some(message) = messages.last_mut() {
                message
                    .attachment_urls
                    .push(format!("{ARCHIVE_HOST}{href}"));
            }
        }
    }
    messages
}

/// Apply the tarball disambiguation rules to one message's attachments:
/// plain patches win over tarballs when mixed; a lone tarball is accepted;
/// multiple tarballs are rejected.
pub fn select_patch_urls(attachment_urls: &[String]) -> Option<Vec<String>> {
    let (archives, patches): (Vec<_>, Vec<_>) = attachment_urls
        .iter()
        .cloned()
        .partition(|url| is_archive(url));
    if !patches.is_empty() {
        return Some(patches);
    }
    match archives.len() {
        0 => None,
        1 => Some(archives),
        _ => None, // we don't know how to combine multiple tarballs
    }
}

/// The last message in the thread with at least one acceptable attachment,
/// after disambiguation.  A selected message rejected by the tarball rules
/// yields None; we do not fall back to earlier messages.
pub fn latest_patch_set(html: &str) -> Option<LatestPatchSet> {
    let messages = parse_flat_thread(html);
    let selected = messages
        .iter()
        .rev()
        .find(|m| !m.attachment_urls.is_empty())?;
    let patch_urls = select_patch_urls(&selected.attachment_urls)?;
    Some(LatestPatchSet {
        message_id: selected.message_id.clone(),
        patch_urls,
    })
}

/// Fetch a flat-thread page and pick the latest patch set.  A 404 means the
/// thread is gone: no data.
pub async fn fetch_latest_patch_set(
    http: &Fetcher,
    thread_url: &str,
) -> Result<Option<LatestPatchSet>> {
    let html = match http.fetch_text(thread_url).await {
        Ok(html) => html,
        Err(err @ HttpError::Status { .. }) if err.is_not_found() => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Ok(latest_patch_set(&html))
}

/// Derive a local filename from an attachment URL: the percent-decoded
/// basename of the path.
pub fn filename_from_url(url: &str) -> String {
    let path = url.split('?').next().unwrap_or(url);
    let base = path.rsplit('/').next().unwrap_or(path);
    urlencoding::decode(base)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| base.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_line(id: &str) -> String {
        format!(r#"<td><a href="/message-id/{id}">{id}</a></td>"#)
    }

    fn attachment_line(path: &str) -> String {
        format!(r#"<a href="/message-id/attachment/{path}">{path}</a>"#)
    }

    #[test]
    fn test_last_message_with_attachments_wins() {
        let html = [
            message_line("m1"),
            attachment_line("1/old-v1.patch"),
            message_line("m2"),
            attachment_line("2/new-v2-0001.patch"),
            attachment_line("2/new-v2-0002.patch"),
            message_line("m3"),
        ]
        .join("\n");
        let selected = latest_patch_set(&html).unwrap();
        assert_eq!(selected.message_id, "m2");
        assert_eq!(
            selected.patch_urls,
            vec![
                "https://www.postgresql.org/message-id/attachment/2/new-v2-0001.patch",
                "https://www.postgresql.org/message-id/attachment/2/new-v2-0002.patch",
            ]
        );
    }

    #[test]
    fn test_compressed_patches_accepted() {
        let html = [
            message_line("m1"),
            attachment_line("1/big.patch.gz"),
            attachment_line("1/other.diff.bz2"),
        ]
        .join("\n");
        let selected = latest_patch_set(&html).unwrap();
        assert_eq!(selected.patch_urls.len(), 2);
    }

    #[test]
    fn test_unrelated_attachments_ignored() {
        let html = [
            message_line("m1"),
            attachment_line("1/real.patch"),
            message_line("m2"),
            attachment_line("2/screenshot.png"),
            attachment_line("2/results.txt"),
        ]
        .join("\n");
        // m2 has no acceptable attachments, so m1 is still selected
        let selected = latest_patch_set(&html).unwrap();
        assert_eq!(selected.message_id, "m1");
    }

    #[test]
    fn test_nocfbot_attachments_ignored() {
        let html = [
            message_line("m1"),
            attachment_line("1/good.patch"),
            message_line("m2"),
            r#"<a href="/message-id/attachment/nocfbot/2/skip.patch">skip.patch</a>"#.to_string(),
        ]
        .join("\n");
        let selected = latest_patch_set(&html).unwrap();
        assert_eq!(selected.message_id, "m1");
    }

    #[test]
    fn test_single_tarball_accepted() {
        let html = [message_line("m1"), attachment_line("1/patches.tar.gz")].join("\n");
        let selected = latest_patch_set(&html).unwrap();
        assert_eq!(selected.patch_urls.len(), 1);
    }

    #[test]
    fn test_multiple_tarballs_rejected() {
        let html = [
            message_line("m1"),
            attachment_line("1/okay.patch"),
            message_line("m2"),
            attachment_line("2/part1.tar.gz"),
            attachment_line("2/part2.tgz"),
        ]
        .join("\n");
        // the selected message (m2) is rejected outright; no fallback to m1
        assert!(latest_patch_set(&html).is_none());
    }

    #[test]
    fn test_mixed_patches_and_tarball_keeps_patches() {
        let html = [
            message_line("m1"),
            attachment_line("1/fix.patch"),
            attachment_line("1/benchmark.tar.gz"),
        ]
        .join("\n");
        let selected = latest_patch_set(&html).unwrap();
        assert_eq!(
            selected.patch_urls,
            vec!["https://www.postgresql.org/message-id/attachment/1/fix.patch"]
        );
    }

    #[test]
    fn test_empty_thread() {
        assert!(latest_patch_set("<html><body>no messages</body></html>").is_none());
        let html = message_line("m1");
        assert!(latest_patch_set(&html).is_none());
    }

    #[test]
    fn test_extension_rules() {
        assert!(is_plain_patch("x.patch"));
        assert!(is_plain_patch("x.diff"));
        assert!(is_plain_patch("x.patch.gz"));
        assert!(is_plain_patch("x.diff.bz2"));
        assert!(!is_plain_patch("x.txt"));
        assert!(is_archive("x.tar"));
        assert!(is_archive("x.tgz"));
        assert!(is_archive("x.tar.gz"));
        assert!(is_archive("x.tar.bz2"));
        assert!(is_archive("x.zip"));
        assert!(!is_archive("x.patch.gz"));
    }

    #[test]
    fn test_filename_from_url() {
        assert_eq!(
            filename_from_url("https://example.org/attachment/99/v7-0001-Fix%20thing.patch"),
            "v7-0001-Fix thing.patch"
        );
        assert_eq!(filename_from_url("plain.patch"), "plain.patch");
    }
}

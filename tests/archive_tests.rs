use cfbot_lib::archive::{latest_patch_set, parse_flat_thread, select_patch_urls};

/// A cut-down flat-thread page with the markup shapes the scanner keys on.
const FLAT_THREAD: &str = r#"
<html>
<body>
<table>
<tr><td>From</td><td>A. Hacker</td></tr>
<tr><td><a href="/message-id/first@example.com">first@example.com</a></td></tr>
</table>
<p>Here is my patch.</p>
<div class="attachments">
<a href="/message-id/attachment/100/v1-0001-feature.patch">v1-0001-feature.patch</a>
</div>
<table>
<tr><td><a href="/message-id/review@example.com">review@example.com</a></td></tr>
</table>
<p>Looks wrong, see attached results.</p>
<div class="attachments">
<a href="/message-id/attachment/101/results.txt">results.txt</a>
</div>
<table>
<tr><td><a href="/message-id/second@example.com">second@example.com</a></td></tr>
</table>
<p>Good catch, v2 attached.</p>
<div class="attachments">
<a href="/message-id/attachment/102/v2-0001-feature.patch">v2-0001-feature.patch</a>
<a href="/message-id/attachment/102/v2-0002-tests.patch">v2-0002-tests.patch</a>
</div>
</body>
</html>
"#;

#[test]
fn selects_last_message_with_patches() {
    let selected = latest_patch_set(FLAT_THREAD).unwrap();
    assert_eq!(selected.message_id, "second@example.com");
    assert_eq!(
        selected.patch_urls,
        vec![
            "https://www.postgresql.org/message-id/attachment/102/v2-0001-feature.patch",
            "https://www.postgresql.org/message-id/attachment/102/v2-0002-tests.patch",
        ]
    );
}

#[test]
fn messages_parse_in_arrival_order() {
    let messages = parse_flat_thread(FLAT_THREAD);
    let ids: Vec<&str> = messages.iter().map(|m| m.message_id.as_str()).collect();
    assert_eq!(
        ids,
        vec![
            "first@example.com",
            "review@example.com",
            "second@example.com"
        ]
    );
    // the reply's .txt attachment is not acceptable
    assert!(messages[1].attachment_urls.is_empty());
}

#[test]
fn tarball_disambiguation() {
    let urls = |names: &[&str]| -> Vec<String> {
        names.iter().map(|n| format!("https://x/{n}")).collect()
    };
    // plain patches pass through
    assert_eq!(
        select_patch_urls(&urls(&["a.patch", "b.diff"])).unwrap().len(),
        2
    );
    // a single tarball alone is accepted
    assert_eq!(
        select_patch_urls(&urls(&["bundle.tar.gz"])).unwrap().len(),
        1
    );
    // mixed: keep only the plain patches
    assert_eq!(
        select_patch_urls(&urls(&["a.patch", "bundle.tar.gz"])).unwrap(),
        vec!["https://x/a.patch".to_string()]
    );
    // multiple tarballs: reject
    assert!(select_patch_urls(&urls(&["a.tgz", "b.zip"])).is_none());
    // nothing acceptable
    assert!(select_patch_urls(&[]).is_none());
}

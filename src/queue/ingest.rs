//! Log and artifact ingestion: fetch command metadata and bodies from the
//! CI API, then pattern-match them into `highlight` and `test` rows.
//!
//! The scanners are pure functions over text; the queue handlers wrap them
//! with the fetch/store plumbing.  Re-ingesting a task first deletes its
//! prior highlights of the affected types, so the jobs are re-runnable.

use anyhow::Result;
use regex::Regex;
use sqlx::Row;
use std::collections::BTreeSet;
use std::sync::OnceLock;
use tracing::info;

use crate::cirrus;
use crate::db::{App, PgTx};
use crate::net::{binary_to_safe_utf8, HttpError};
use crate::queue;

/// Command statuses whose logs are not worth fetching.
const SKIPPED_COMMAND_STATUSES: &[&str] = &["SKIPPED", "UNDEFINED", "ABORTED"];

/// An extracted highlight: a typed excerpt from a log or artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Excerpt {
    pub kind: &'static str,
    pub text: String,
}

/// One structured test result parsed from a test-runner log line.
#[derive(Debug, Clone, PartialEq)]
pub struct TestResult {
    pub suite: String,
    pub name: String,
    pub result: String,
    pub duration: f64,
}

fn regexes(patterns: &[(&'static str, &'static str)]) -> Vec<(Regex, &'static str)> {
    patterns
        .iter()
        .map(|(pattern, kind)| (Regex::new(pattern).expect("static pattern"), *kind))
        .collect()
}

/// Patterns scanned over artifact bodies.
fn artifact_patterns() -> &'static Vec<(Regex, &'static str)> {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        regexes(&[
            (r"^SUMMARY: .*Sanitizer.*", "sanitizer"),
            (r"^.*TRAP: failed Assert.*", "assertion"),
            (r"^.*PANIC: .*", "panic"),
        ])
    })
}

/// Patterns for the "build" step.  MSVC warnings notably don't fail the
/// build, so this may be the only chance to notice them.
fn build_patterns() -> &'static Vec<(Regex, &'static str)> {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| regexes(&[(r"^.*: (warning|error) [^:]+: .*", "compiler")]))
}

/// Patterns for the "*_warning" steps: GCC and Clang diagnostics.
fn warning_patterns() -> &'static Vec<(Regex, &'static str)> {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        regexes(&[
            (r"^.*:[0-9]+: (error|warning): .*", "compiler"),
            (r"^.*: undefined reference to .*", "linker"),
        ])
    })
}

fn scan_lines(patterns: &[(Regex, &'static str)], text: &str) -> Vec<Excerpt> {
    let mut excerpts = Vec::new();
    for line in text.lines() {
        for (pattern, kind) in patterns {
            if pattern.is_match(line) {
                excerpts.push(Excerpt {
                    kind,
                    text: line.to_string(),
                });
                break;
            }
        }
    }
    excerpts
}

pub fn scan_build_log(log: &str) -> Vec<Excerpt> {
    scan_lines(build_patterns(), log)
}

pub fn scan_warning_log(log: &str) -> Vec<Excerpt> {
    scan_lines(warning_patterns(), log)
}

pub fn scan_artifact_body(body: &str) -> Vec<Excerpt> {
    scan_lines(artifact_patterns(), body)
}

/// Generic backtrace extraction: `start` begins a new backtrace, `frame`
/// matches its stack frames.  At most 10 frames are kept per core.
fn extract_backtraces(text: &str, start: &Regex, frame: &Regex) -> Vec<String> {
    let mut backtraces = Vec::new();
    let mut collected: Vec<&str> = Vec::new();
    let mut in_backtrace = false;
    for line in text.lines() {
        if start.is_match(line) {
            if in_backtrace && !collected.is_empty() {
                backtraces.push(collected.join("\n"));
                collected.clear();
            }
            in_backtrace = true;
            continue;
        }
        if in_backtrace && frame.is_match(line) {
            if collected.len() < 10 {
                collected.push(line);
            } else {
                backtraces.push(collected.join("\n"));
                collected.clear();
                in_backtrace = false;
            }
        }
    }
    if in_backtrace && !collected.is_empty() {
        backtraces.push(collected.join("\n"));
    }
    backtraces
}

/// Backtraces from the "cores" command log.  GDB (Linux, FreeBSD) starts
/// with "Thread N", LLDB (macOS) with "thread #N"; frames look like " #N ".
pub fn scan_cores_log(log: &str) -> Vec<Excerpt> {
    static START: OnceLock<Regex> = OnceLock::new();
    static FRAME: OnceLock<Regex> = OnceLock::new();
    let start = START.get_or_init(|| Regex::new(r".* [Tt]hread #?[0-9]+ ?.*").unwrap());
    let frame = FRAME.get_or_init(|| Regex::new(r".* #[0-9]+[: ].*").unwrap());
    extract_backtraces(log, start, frame)
        .into_iter()
        .map(|text| Excerpt { kind: "core", text })
        .collect()
}

/// Backtraces from Windows crash logs, which arrive as artifacts.
pub fn scan_crashlog(body: &str) -> Vec<Excerpt> {
    static START: OnceLock<Regex> = OnceLock::new();
    static FRAME: OnceLock<Regex> = OnceLock::new();
    let start = START.get_or_init(|| Regex::new(r"^Child-SP.*").unwrap());
    let frame = FRAME.get_or_init(|| Regex::new(r"^[0-9a-fA-F]{8}`.*").unwrap());
    extract_backtraces(body, start, frame)
        .into_iter()
        .map(|text| Excerpt { kind: "core", text })
        .collect()
}

/// Parse a test-runner log: structured per-test results (including
/// successes, which drive the selective artifact download) plus a "test"
/// highlight holding the summary-of-failures section.
pub fn scan_test_log(log: &str) -> (Vec<TestResult>, Vec<Excerpt>) {
    static RESULT: OnceLock<Regex> = OnceLock::new();
    static SUMMARY_LINE: OnceLock<Regex> = OnceLock::new();
    let result_re = RESULT.get_or_init(|| {
        Regex::new(r".* [^ ]*:[^ ]+ / ([^ /]+)/([^ ]+) +([A-Z]+) +([0-9.]+)s.*").unwrap()
    });
    let summary_line_re =
        SUMMARY_LINE.get_or_init(|| Regex::new(r".* [^ ]*:[^ ]+ / [^ ]+ .*").unwrap());

    let mut results = Vec::new();
    let mut excerpts = Vec::new();
    let mut collected: Vec<&str> = Vec::new();
    let mut in_summary = false;

    let dump = |collected: &mut Vec<&str>, excerpts: &mut Vec<Excerpt>| {
        if !collected.is_empty() {
            excerpts.push(Excerpt {
                kind: "test",
                text: collected.join("\n"),
            });
            collected.clear();
        }
    };

    for line in log.lines() {
        if let Some(captures) = result_re.captures(line) {
            if let Ok(duration) = captures[4].parse() {
                results.push(TestResult {
                    suite: captures[1].to_string(),
                    name: captures[2].to_string(),
                    result: captures[3].to_string(),
                    duration,
                });
            }
        }

        if line.contains("Summary of Failures:") {
            dump(&mut collected, &mut excerpts);
            in_summary = true;
            continue;
        }
        if in_summary && summary_line_re.is_match(line) {
            if !line.contains(" SKIP ") {
                collected.push(line);
            }
        } else if line.contains("Expected Fail:") {
            dump(&mut collected, &mut excerpts);
            in_summary = false;
        }
    }
    dump(&mut collected, &mut excerpts);
    (results, excerpts)
}

/// The first 20 lines of a non-empty regression.diffs artifact.
pub fn regress_diffs_excerpt(body: &str) -> Option<String> {
    if body.trim().is_empty() {
        return None;
    }
    let lines: Vec<&str> = body.lines().collect();
    let mut excerpt = lines[..lines.len().min(20)].join("\n");
    if lines.len() > 20 {
        excerpt.push_str("\n...\n");
    }
    Some(excerpt)
}

/// TAP noise worth surfacing from a regress_log_* artifact: bail-outs,
/// timeouts and genuine failures (not TODO/SKIP).
pub fn regress_log_tap_lines(body: &str) -> Option<String> {
    static BAIL: OnceLock<Regex> = OnceLock::new();
    static NOT_OK: OnceLock<Regex> = OnceLock::new();
    static TODO_SKIP: OnceLock<Regex> = OnceLock::new();
    let bail = BAIL.get_or_init(|| Regex::new(r".*(Bail out!|timed out).*").unwrap());
    let not_ok = NOT_OK.get_or_init(|| Regex::new(r".* not ok .*").unwrap());
    let todo_skip = TODO_SKIP.get_or_init(|| Regex::new(r".* (TODO|SKIP).*").unwrap());

    let collected: Vec<&str> = body
        .lines()
        .filter(|line| {
            bail.is_match(line) || (not_ok.is_match(line) && !todo_skip.is_match(line))
        })
        .collect();
    if collected.is_empty() {
        None
    } else {
        Some(collected.join("\n"))
    }
}

async fn lock_task(tx: &mut PgTx, task_id: &str) -> Result<()> {
    sqlx::query("select from task where task_id = $1 for update")
        .bind(task_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn insert_highlight(
    tx: &mut PgTx,
    task_id: &str,
    excerpt: &Excerpt,
    source: &str,
    touched: &mut BTreeSet<&'static str>,
) -> Result<()> {
    touched.insert(excerpt.kind);
    sqlx::query("insert into highlight (task_id, type, source, excerpt) values ($1, $2, $3, $4)")
        .bind(task_id)
        .bind(excerpt.kind)
        .bind(source)
        .bind(&excerpt.text)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Rebuild the pages for every touched highlight type, plus the combined
/// page.
async fn refresh_touched_pages(tx: &mut PgTx, touched: &BTreeSet<&'static str>) -> Result<()> {
    if touched.is_empty() {
        return Ok(());
    }
    queue::enqueue(tx, "refresh-highlight-pages", "all").await?;
    for kind in touched {
        queue::enqueue(tx, "refresh-highlight-pages", kind).await?;
    }
    Ok(())
}

/// Queue handler: pull a finished task's command and artifact metadata.
pub async fn fetch_task_commands(app: &App, tx: &mut PgTx, task_id: &str) -> Result<()> {
    let Some(detail) = cirrus::get_task(&app.http, task_id).await? else {
        info!(task_id, "CI service does not know this task, nothing to fetch");
        return Ok(());
    };
    for command in &detail.commands {
        sqlx::query(
            "insert into task_command (task_id, name, type, status, duration)
             values ($1, $2, $3, $4, $5)
             on conflict (task_id, name) do update
                set type = excluded.type,
                    status = excluded.status,
                    duration = excluded.duration",
        )
        .bind(task_id)
        .bind(&command.name)
        .bind(&command.command_type)
        .bind(&command.status)
        .bind(command.duration_in_seconds)
        .execute(&mut **tx)
        .await?;
    }
    for group in &detail.artifacts {
        for file in &group.files {
            sqlx::query(
                "insert into artifact (task_id, name, path, size)
                 values ($1, $2, $3, $4)
                 on conflict (task_id, name, path) do nothing",
            )
            .bind(task_id)
            .bind(&group.name)
            .bind(&file.path)
            .bind(file.size)
            .execute(&mut **tx)
            .await?;
        }
    }
    queue::enqueue(tx, "fetch-task-logs", task_id).await?;
    Ok(())
}

/// Queue handler: download the log body of every command that actually ran.
pub async fn fetch_task_logs(app: &App, tx: &mut PgTx, task_id: &str) -> Result<()> {
    let rows = sqlx::query(
        "select name from task_command where task_id = $1 and status <> all($2)",
    )
    .bind(task_id)
    .bind(
        SKIPPED_COMMAND_STATUSES
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>(),
    )
    .fetch_all(&mut **tx)
    .await?;
    for row in rows {
        let command: String = row.get("name");
        let url = cirrus::task_log_url(task_id, &command);
        let body = match app.http.fetch_binary(&url).await {
            Ok(body) => body,
            Err(err @ HttpError::Status { .. }) if err.is_not_found() => continue,
            Err(err) => return Err(err.into()),
        };
        sqlx::query("update task_command set log = $3 where task_id = $1 and name = $2")
            .bind(task_id)
            .bind(&command)
            .bind(binary_to_safe_utf8(&body))
            .execute(&mut **tx)
            .await?;
    }
    // defer ingestion until a later step
    queue::enqueue(tx, "ingest-task-logs", task_id).await?;
    Ok(())
}

/// Commands whose logs carry test-runner output.
const TEST_COMMANDS: &[&str] = &["test_world", "test_world_32", "test_running", "check_world"];

/// Queue handler: scan the downloaded command logs into highlights and
/// structured test rows.
pub async fn ingest_task_logs(tx: &mut PgTx, task_id: &str) -> Result<()> {
    let mut touched: BTreeSet<&'static str> = BTreeSet::new();
    lock_task(tx, task_id).await?;
    sqlx::query(
        "delete from highlight
          where task_id = $1
            and (type in ('compiler', 'linker', 'regress', 'test') or
                 (type = 'core' and exists (select from task_command
                                             where task_id = $1
                                               and name = 'cores')))",
    )
    .bind(task_id)
    .execute(&mut **tx)
    .await?;
    sqlx::query("delete from test where task_id = $1 and type = 'tap'")
        .bind(task_id)
        .execute(&mut **tx)
        .await?;

    let rows = sqlx::query(
        "select name, log
           from task_command
          where task_id = $1
            and (name = any($2) or name = 'build' or name = 'build_32'
                 or name = 'cores' or name like '%_warning')
            and log is not null",
    )
    .bind(task_id)
    .bind(
        TEST_COMMANDS
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>(),
    )
    .fetch_all(&mut **tx)
    .await?;

    for row in rows {
        let name: String = row.get("name");
        let log: String = row.get("log");
        let source = format!("command:{name}");

        if name == "build" || name == "build_32" {
            for excerpt in scan_build_log(&log) {
                insert_highlight(tx, task_id, &excerpt, &source, &mut touched).await?;
            }
        } else if name.ends_with("_warning") {
            for excerpt in scan_warning_log(&log) {
                insert_highlight(tx, task_id, &excerpt, &source, &mut touched).await?;
            }
        } else if TEST_COMMANDS.contains(&name.as_str()) {
            let (results, excerpts) = scan_test_log(&log);
            for test in &results {
                sqlx::query(
                    "insert into test (task_id, command, type, suite, name, result, duration)
                     values ($1, $2, 'tap', $3, $4, $5, $6)
                     on conflict do nothing",
                )
                .bind(task_id)
                .bind(&name)
                .bind(&test.suite)
                .bind(&test.name)
                .bind(&test.result)
                .bind(test.duration)
                .execute(&mut **tx)
                .await?;
            }
            for excerpt in excerpts {
                insert_highlight(tx, task_id, &excerpt, &source, &mut touched).await?;
            }
        } else if name == "cores" {
            for excerpt in scan_cores_log(&log) {
                insert_highlight(tx, task_id, &excerpt, &source, &mut touched).await?;
            }
        }
    }

    // now that the list of failed tests is known, the artifact download can
    // exclude subtrees belonging to tests that passed
    queue::enqueue(tx, "fetch-task-artifacts", task_id).await?;
    refresh_touched_pages(tx, &touched).await?;
    Ok(())
}

/// Queue handler: download artifact bodies, skipping testrun subtrees whose
/// tests passed.
pub async fn fetch_task_artifacts(app: &App, tx: &mut PgTx, task_id: &str) -> Result<()> {
    let mut to_fetch = sqlx::query(
        "select name, path
           from artifact
          where task_id = $1
            and body is null
            and (name = 'crashlog' or
                 (name = 'testrun' and
                  (task_id, coalesce(substring(path from '^[^/]+/testrun/[^/]+/[^/]+'), '')) not in
                   (select task_id,
                           case command
                             when 'test_world_32' then 'build-32/testrun/'
                             else 'build/testrun/'
                           end || suite || '/' || name
                      from test
                     where task_id = $1
                       and result in ('OK', 'SKIP'))))",
    )
    .bind(task_id)
    .fetch_all(&mut **tx)
    .await?;
    if to_fetch.is_empty() {
        // no test rows were parseable (an autoconf build, perhaps); the
        // artifacts only exist because something failed, so take the lot
        to_fetch = sqlx::query(
            "select name, path from artifact where task_id = $1 and body is null and name = 'log'",
        )
        .bind(task_id)
        .fetch_all(&mut **tx)
        .await?;
    }

    for row in &to_fetch {
        let name: String = row.get("name");
        let path: String = row.get("path");
        let url = cirrus::artifact_url(task_id, &name, &path);
        let body = match app.http.fetch_binary(&url).await {
            Ok(body) => body,
            Err(err @ HttpError::Status { .. }) if err.is_not_found() => continue,
            Err(err) => return Err(err.into()),
        };
        sqlx::query(
            "update artifact set body = $4 where task_id = $1 and name = $2 and path = $3",
        )
        .bind(task_id)
        .bind(&name)
        .bind(&path)
        .bind(binary_to_safe_utf8(&body))
        .execute(&mut **tx)
        .await?;
    }

    queue::enqueue(tx, "ingest-task-artifacts", task_id).await?;
    Ok(())
}

/// Queue handler: scan downloaded artifact bodies into highlights.
pub async fn ingest_task_artifacts(tx: &mut PgTx, task_id: &str) -> Result<()> {
    let mut touched: BTreeSet<&'static str> = BTreeSet::new();
    lock_task(tx, task_id).await?;
    sqlx::query(
        "delete from highlight
          where task_id = $1
            and (type in ('sanitizer', 'assertion', 'panic', 'regress', 'tap') or
                 (type = 'core' and not exists (select from task_command
                                                 where task_id = $1
                                                   and name = 'cores')))",
    )
    .bind(task_id)
    .execute(&mut **tx)
    .await?;

    let rows = sqlx::query(
        "select name, path, body from artifact where task_id = $1 and body is not null",
    )
    .bind(task_id)
    .fetch_all(&mut **tx)
    .await?;

    for row in rows {
        let name: String = row.get("name");
        let path: String = row.get("path");
        let body: String = row.get("body");
        let source = format!("artifact:{name}/{path}");

        if name == "crashlog" {
            // Windows crash logs arrive as artifacts (Unix backtraces come
            // from the "cores" command log instead)
            for excerpt in scan_crashlog(&body) {
                insert_highlight(tx, task_id, &excerpt, &source, &mut touched).await?;
            }
            continue;
        }
        if path.ends_with("/regression.diffs") {
            if let Some(text) = regress_diffs_excerpt(&body) {
                let excerpt = Excerpt {
                    kind: "regress",
                    text,
                };
                insert_highlight(tx, task_id, &excerpt, &source, &mut touched).await?;
            }
            continue;
        }
        if path.contains("/regress_log_") {
            if let Some(text) = regress_log_tap_lines(&body) {
                let excerpt = Excerpt { kind: "tap", text };
                insert_highlight(tx, task_id, &excerpt, &source, &mut touched).await?;
            }
        }
        for excerpt in scan_artifact_body(&body) {
            insert_highlight(tx, task_id, &excerpt, &source, &mut touched).await?;
        }
    }

    refresh_touched_pages(tx, &touched).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_patterns_msvc() {
        let log = "foo.c(12): warning C4101: 'x': unreferenced local variable\nall good here\n";
        let excerpts = scan_build_log(log);
        // the MSVC format has the code after "warning"
        assert_eq!(excerpts.len(), 1);
        assert_eq!(excerpts[0].kind, "compiler");
    }

    #[test]
    fn test_warning_patterns_gcc_and_linker() {
        let log = "\
foo.c:12: warning: unused variable 'x'
bar.o: undefined reference to `missing_symbol'
plain line
";
        let excerpts = scan_warning_log(log);
        assert_eq!(excerpts.len(), 2);
        assert_eq!(excerpts[0].kind, "compiler");
        assert_eq!(excerpts[1].kind, "linker");
    }

    #[test]
    fn test_artifact_patterns() {
        let body = "\
SUMMARY: AddressSanitizer: heap-use-after-free somewhere
2024-01-01 TRAP: failed Assert(\"x > 0\"), File: \"foo.c\"
2024-01-01 PANIC: could not write
nothing interesting
";
        let excerpts = scan_artifact_body(body);
        let kinds: Vec<_> = excerpts.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec!["sanitizer", "assertion", "panic"]);
    }

    #[test]
    fn test_scan_test_log_results() {
        let log = "\
  1/100 myproj:regress / regress/boolean  OK  1.23s
  2/100 myproj:tap / recovery/001_basic  FAIL  45.60s
 noise
";
        let (results, _excerpts) = scan_test_log(log);
        assert_eq!(results.len(), 2);
        assert_eq!(
            results[0],
            TestResult {
                suite: "regress".into(),
                name: "boolean".into(),
                result: "OK".into(),
                duration: 1.23,
            }
        );
        assert_eq!(results[1].result, "FAIL");
    }

    #[test]
    fn test_scan_test_log_summary_section() {
        let log = "\
  1/2 myproj:regress / regress/boolean  OK  1.00s
Summary of Failures:
 33/300 myproj:tap / recovery/001_basic ERROR 12s
 34/300 myproj:tap / recovery/002_other SKIP 0s
Expected Fail: 0
";
        let (_results, excerpts) = scan_test_log(log);
        assert_eq!(excerpts.len(), 1);
        assert_eq!(excerpts[0].kind, "test");
        assert!(excerpts[0].text.contains("001_basic"));
        assert!(!excerpts[0].text.contains("002_other")); // SKIP filtered
    }

    #[test]
    fn test_cores_backtraces_gdb() {
        let log = "\
Core was generated by `postgres'.
Thread 1 (Thread 0x7f. (LWP 123)):
 #0  0x0000 in raise () from /lib/libc.so
 #1  0x0001 in abort () from /lib/libc.so
Thread 2 (Thread 0x7e. (LWP 124)):
 #0  0x0002 in poll () from /lib/libc.so
";
        let excerpts = scan_cores_log(log);
        assert_eq!(excerpts.len(), 2);
        assert!(excerpts[0].text.contains("raise"));
        assert!(excerpts[1].text.contains("poll"));
    }

    #[test]
    fn test_cores_backtraces_frame_cap() {
        let mut log = String::from(" Thread 1 (LWP 1):\n");
        for i in 0..15 {
            log.push_str(&format!(" #{i}  0x0 in frame{i} ()\n"));
        }
        let excerpts = scan_cores_log(&log);
        assert_eq!(excerpts.len(), 1);
        assert_eq!(excerpts[0].text.lines().count(), 10);
    }

    #[test]
    fn test_crashlog_backtraces() {
        let body = "\
Child-SP          RetAddr           Call Site
00000012`3456789a 00000000`00000000 postgres!ExceptionalCondition
00000012`3456789b 00000000`00000001 postgres!heap_insert
";
        let excerpts = scan_crashlog(body);
        assert_eq!(excerpts.len(), 1);
        assert_eq!(excerpts[0].kind, "core");
        assert_eq!(excerpts[0].text.lines().count(), 2);
    }

    #[test]
    fn test_regress_diffs_excerpt() {
        assert_eq!(regress_diffs_excerpt("   \n"), None);
        let short = "line1\nline2";
        assert_eq!(regress_diffs_excerpt(short).unwrap(), "line1\nline2");
        let long: String = (0..30).map(|i| format!("line{i}\n")).collect();
        let excerpt = regress_diffs_excerpt(&long).unwrap();
        assert!(excerpt.contains("line19"));
        assert!(!excerpt.contains("line20"));
        assert!(excerpt.ends_with("...\n"));
    }

    #[test]
    fn test_regress_log_tap_lines() {
        let body = "\
ok 1 - setup
not ok 2 - insert works
not ok 3 - cleanup # TODO known breakage
Bail out! database crashed
";
        let text = regress_log_tap_lines(body).unwrap();
        assert!(text.contains("not ok 2"));
        assert!(!text.contains("not ok 3")); // TODO filtered
        assert!(text.contains("Bail out!"));
        assert_eq!(regress_log_tap_lines("ok 1\nok 2\n"), None);
    }
}

use cfbot_lib::queue::ingest::{
    regress_diffs_excerpt, regress_log_tap_lines, scan_cores_log, scan_crashlog, scan_test_log,
    scan_warning_log,
};

/// A realistic meson test log fragment: results for every test, then a
/// failure summary section.
const TEST_LOG: &str = "\
ninja: Entering directory `/tmp/cirrus-ci-build/build'
  1/300 proj:regress / regress/boolean        OK     0.53s
  2/300 proj:regress / regress/char           OK     0.21s
  3/300 proj:tap / recovery/001_stream        FAIL   32.10s   exit status 1
  4/300 proj:tap / recovery/002_archiving     SKIP   0.01s
ERROR: 1 test failed

Summary of Failures:

  3/300 proj:tap / recovery/001_stream FAIL 32.10s
Expected Fail:      0
";

#[test]
fn test_log_produces_results_and_summary_highlight() {
    let (results, excerpts) = scan_test_log(TEST_LOG);
    assert_eq!(results.len(), 5); // 4 result lines + the summary repeat
    assert_eq!(results[0].suite, "regress");
    assert_eq!(results[0].name, "boolean");
    assert_eq!(results[0].result, "OK");
    assert_eq!(results[2].result, "FAIL");
    assert!((results[2].duration - 32.10).abs() < 1e-9);

    assert_eq!(excerpts.len(), 1);
    assert!(excerpts[0].text.contains("001_stream"));
    assert!(!excerpts[0].text.contains("002_archiving"));
}

#[test]
fn warning_log_finds_gcc_and_linker_noise() {
    let log = "\
[123/456] cc -o foo.o foo.c
foo.c:812: warning: 'x' may be used uninitialized
ld: bar.o: undefined reference to `forgotten_function'
";
    let excerpts = scan_warning_log(log);
    assert_eq!(excerpts.len(), 2);
    assert_eq!(excerpts[0].kind, "compiler");
    assert_eq!(excerpts[1].kind, "linker");
}

#[test]
fn gdb_and_lldb_backtraces_extracted() {
    let gdb = "\
[New LWP 12345]
Thread 1 (Thread 0x7f8 (LWP 12345)):
 #0  0x00007f8 in raise () from /lib/libc.so.7
 #1  0x00007f8 in abort () from /lib/libc.so.7
 #2  0x0000562 in ExceptionalCondition ()
";
    let excerpts = scan_cores_log(gdb);
    assert_eq!(excerpts.len(), 1);
    assert_eq!(excerpts[0].text.lines().count(), 3);

    let lldb = "\
* thread #1, stop reason = signal SIGABRT
  frame #0: libsystem_kernel.dylib`__pthread_kill
  frame #1: libsystem_c.dylib`abort
";
    let excerpts = scan_cores_log(lldb);
    assert_eq!(excerpts.len(), 1);
    assert!(excerpts[0].text.contains("__pthread_kill"));
}

#[test]
fn windows_crashlog_backtraces_extracted() {
    let body = "\
OS Version: Windows 10
Child-SP          RetAddr           Call Site
00000049`2f1ff0a0 00007ff7`1c8e1234 postgres!ExceptionalCondition+0x8e
00000049`2f1ff0e0 00007ff7`1c8e5678 postgres!heap_insert+0x123
";
    let excerpts = scan_crashlog(body);
    assert_eq!(excerpts.len(), 1);
    assert!(excerpts[0].text.contains("ExceptionalCondition"));
}

#[test]
fn regress_artifacts() {
    let diffs = "--- expected\n+++ results\n@@ -1 +1 @@\n-t\n+f\n";
    assert!(regress_diffs_excerpt(diffs).unwrap().contains("+++ results"));
    assert!(regress_diffs_excerpt("\n \n").is_none());

    let tap = "\
ok 1 - first
not ok 2 - second
# command timed out
Bail out!
";
    let lines = regress_log_tap_lines(tap).unwrap();
    assert!(lines.contains("not ok 2"));
    assert!(lines.contains("timed out"));
}

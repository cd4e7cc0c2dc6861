//! CLI Argument Parsing Tests for zkmirror
//!
//! These tests verify that command-line arguments are parsed correctly and
//! maintain backward compatibility. The focus is on argument values, aliases
//! and formats; none of them touch a coordination service.

use assert_cmd::Command;

#[test]
fn test_help_runs() {
    Command::cargo_bin("zkmirror")
        .unwrap()
        .arg("--help")
        .assert()
        .success();
}

#[test]
fn test_version_runs() {
    Command::cargo_bin("zkmirror")
        .unwrap()
        .arg("--version")
        .assert()
        .success();
}

// ============================================================================
// Role Flag Tests
// ============================================================================

#[test]
fn test_source_short_flag() {
    Command::cargo_bin("zkmirror")
        .unwrap()
        .args(["-S", "--help"])
        .assert()
        .success();
}

#[test]
fn test_destination_short_flag() {
    Command::cargo_bin("zkmirror")
        .unwrap()
        .args(["-D", "--help"])
        .assert()
        .success();
}

#[test]
fn test_missing_role_is_an_error() {
    Command::cargo_bin("zkmirror")
        .unwrap()
        .args(["-q", "--servers", "localhost:2181", "-p", "/tmp"])
        .assert()
        .failure();
}

#[test]
fn test_conflicting_roles_are_an_error() {
    Command::cargo_bin("zkmirror")
        .unwrap()
        .args(["--source", "--destination", "-p", "/tmp"])
        .assert()
        .failure()
        .stderr(predicates::str::contains(
            "either a source or a destination",
        ));
}

// ============================================================================
// Connection Argument Tests
// ============================================================================

#[test]
fn test_servers_comma_list() {
    Command::cargo_bin("zkmirror")
        .unwrap()
        .args(["--servers", "zk1:2181,zk2:2181,zk3:2181", "--help"])
        .assert()
        .success();
}

#[test]
fn test_session_short_flag() {
    Command::cargo_bin("zkmirror")
        .unwrap()
        .args(["-N", "nightly", "--help"])
        .assert()
        .success();
}

#[test]
fn test_credentials_value() {
    Command::cargo_bin("zkmirror")
        .unwrap()
        .args(["--credentials", "admin:secret", "--help"])
        .assert()
        .success();
}

#[test]
fn test_paths_only_ignores_credentials() {
    // credentials are only validated when connecting; paths-only never does
    Command::cargo_bin("zkmirror")
        .unwrap()
        .args(["--paths-only", "--credentials", "nopassword", "-p", "/tmp"])
        .assert()
        .success();
}

// ============================================================================
// Source Option Tests
// ============================================================================

#[test]
fn test_depth_numeric() {
    Command::cargo_bin("zkmirror")
        .unwrap()
        .args(["--depth", "2", "--help"])
        .assert()
        .success();
}

#[test]
fn test_depth_non_numeric_rejected() {
    Command::cargo_bin("zkmirror")
        .unwrap()
        .args(["--depth", "deep", "--help"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("invalid value 'deep'"));
}

#[test]
fn test_exclude_re_value() {
    Command::cargo_bin("zkmirror")
        .unwrap()
        .args(["--exclude-re", r"/\.snapshots(/.*|$)", "--help"])
        .assert()
        .success();
}

#[test]
fn test_subpath_repeatable() {
    Command::cargo_bin("zkmirror")
        .unwrap()
        .args(["--subpath", "2_a1", "--subpath", "3_a1/ab2", "--help"])
        .assert()
        .success();
}

#[test]
fn test_done_file_value() {
    Command::cargo_bin("zkmirror")
        .unwrap()
        .args(["--done-file", "/tmp/zkmirror-done.json", "--help"])
        .assert()
        .success();
}

// ============================================================================
// Rsync Option Tests
// ============================================================================

#[test]
fn test_dry_run_short_flag() {
    Command::cargo_bin("zkmirror")
        .unwrap()
        .args(["-n", "--help"])
        .assert()
        .success();
}

#[test]
fn test_rsync_flags() {
    Command::cargo_bin("zkmirror")
        .unwrap()
        .args([
            "--delete",
            "--checksum",
            "--hard-links",
            "--rsync-verbose",
            "--drop-cache",
            "--help",
        ])
        .assert()
        .success();
}

#[test]
fn test_rsync_timeout_numeric() {
    Command::cargo_bin("zkmirror")
        .unwrap()
        .args(["--rsync-timeout", "300", "--help"])
        .assert()
        .success();
}

#[test]
fn test_rsync_opt_repeatable() {
    Command::cargo_bin("zkmirror")
        .unwrap()
        .args(["--rsync-opt", "bwlimit:1000", "--rsync-opt", "compress", "--help"])
        .assert()
        .success();
}

// ============================================================================
// Destination Option Tests
// ============================================================================

#[test]
fn test_port_numeric() {
    Command::cargo_bin("zkmirror")
        .unwrap()
        .args(["--port", "4444", "--help"])
        .assert()
        .success();
}

#[test]
fn test_port_out_of_range_rejected() {
    Command::cargo_bin("zkmirror")
        .unwrap()
        .args(["--port", "70000", "--help"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("invalid value '70000'"));
}

#[test]
fn test_start_port_numeric() {
    Command::cargo_bin("zkmirror")
        .unwrap()
        .args(["--start-port", "5000", "--help"])
        .assert()
        .success();
}

// ============================================================================
// Output Flag Tests
// ============================================================================

#[test]
fn test_quiet_short_flag() {
    Command::cargo_bin("zkmirror")
        .unwrap()
        .args(["-q", "--help"])
        .assert()
        .success();
}

#[test]
fn test_verbose_triple() {
    Command::cargo_bin("zkmirror")
        .unwrap()
        .args(["-vvv", "--help"])
        .assert()
        .success();
}

// ============================================================================
// Paths-Only Mode Tests
// ============================================================================

#[test]
fn test_paths_only_partitions_a_tree() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir(tmp.path().join("a1")).unwrap();
    std::fs::create_dir(tmp.path().join("b1")).unwrap();
    Command::cargo_bin("zkmirror")
        .unwrap()
        .args(["--paths-only", "--depth", "1"])
        .args(["-p", tmp.path().to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicates::str::contains("1_"))
        .stdout(predicates::str::contains("into 3 units"));
}

#[test]
fn test_paths_only_requires_a_path() {
    Command::cargo_bin("zkmirror")
        .unwrap()
        .args(["-q", "--paths-only"])
        .assert()
        .failure();
}

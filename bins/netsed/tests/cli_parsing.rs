//! CLI argument parsing and exit-code tests for the netsed command.
//!
//! These tests verify the invocation surface without binding sockets or
//! requiring redirected traffic: usage errors exit 1, bad rules and bad
//! endpoints exit 2.

use assert_cmd::Command;
use predicates::prelude::*;

fn netsed_cmd() -> Command {
    Command::new(env!("CARGO_BIN_EXE_netsed"))
}

mod usage {
    use super::*;

    #[test]
    fn test_help() {
        netsed_cmd()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("replacement rules"));
    }

    #[test]
    fn test_version() {
        netsed_cmd()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("netsed"));
    }

    #[test]
    fn test_no_args_is_usage_error() {
        netsed_cmd()
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("Usage"));
    }

    #[test]
    fn test_missing_rules_is_usage_error() {
        netsed_cmd()
            .args(["tcp", "10101", "0", "0"])
            .assert()
            .failure()
            .code(1);
    }

    #[test]
    fn test_unknown_protocol_is_usage_error() {
        netsed_cmd()
            .args(["icmp", "10101", "0", "0", "s/a/b"])
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("icmp"));
    }
}

mod startup_errors {
    use super::*;

    #[test]
    fn test_bad_rule_exits_2() {
        netsed_cmd()
            .args(["tcp", "0", "127.0.0.1", "9", "nonsense"])
            .assert()
            .failure()
            .code(2)
            .stderr(predicate::str::contains("bad rule"));
    }

    #[test]
    fn test_truncated_escape_exits_2() {
        netsed_cmd()
            .args(["udp", "0", "127.0.0.1", "9", "s/a%/b"])
            .assert()
            .failure()
            .code(2)
            .stderr(predicate::str::contains("truncated"));
    }

    #[test]
    fn test_empty_pattern_exits_2() {
        netsed_cmd()
            .args(["tcp", "0", "127.0.0.1", "9", "s//b"])
            .assert()
            .failure()
            .code(2);
    }

    #[test]
    fn test_unresolvable_listen_port_exits_2() {
        netsed_cmd()
            .args(["tcp", "notaport", "127.0.0.1", "9", "s/a/b"])
            .assert()
            .failure()
            .code(2)
            .stderr(predicate::str::contains("cannot resolve"));
    }

    #[test]
    fn test_rules_parse_in_command_line_order() {
        // The first bad rule is reported, not a later one.
        netsed_cmd()
            .args(["tcp", "0", "127.0.0.1", "9", "s/ok/fine", "s/bad%", "s//x"])
            .assert()
            .failure()
            .code(2)
            .stderr(predicate::str::contains("s/bad%"));
    }
}

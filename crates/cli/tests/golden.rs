//! Golden tests for verifying JSON output format stability
//!
//! These tests run the `sx` binary against an isolated configuration
//! directory. None of them reach the network: they cover configuration
//! commands and argument errors that are rejected before connecting.
//!
//! Run with: `cargo test -p sx-cli --features golden`

#![cfg(feature = "golden")]

use std::process::{Command, Output};

use tempfile::TempDir;

/// Run `sx` with `SX_CONFIG_DIR` pointed at `config_dir`
fn sx(config_dir: &TempDir, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_sx"))
        .args(args)
        .env("SX_CONFIG_DIR", config_dir.path())
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute sx")
}

fn stdout_json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(&stdout).expect("stdout should be valid JSON")
}

fn stderr_json(output: &Output) -> serde_json::Value {
    let stderr = String::from_utf8_lossy(&output.stderr);
    serde_json::from_str(&stderr).expect("stderr should be valid JSON")
}

mod config_tests {
    use super::*;

    #[test]
    fn test_config_show_defaults_json() {
        let temp_dir = TempDir::new().unwrap();
        let output = sx(&temp_dir, &["config", "show", "--json"]);
        assert!(output.status.success(), "Command should succeed");

        let json = stdout_json(&output);
        assert_eq!(json["page_size"], 1000);
        assert_eq!(json["max_pages"], 20);
        assert_eq!(json["max_retries"], 5);
        assert_eq!(json["max_concurrent_operations"], 5);
        assert_eq!(json["completed_operation_ttl"], 5);
        assert_eq!(json["delete_batch_size"], 1000);
        assert_eq!(json["exponential_backoff"], true);
        assert!(
            json["retryable_error_codes"]
                .as_array()
                .unwrap()
                .contains(&serde_json::json!("SlowDown"))
        );
        assert!(json["backend"].is_object());
    }

    #[test]
    fn test_config_path_before_and_after_init() {
        let temp_dir = TempDir::new().unwrap();

        let before = stdout_json(&sx(&temp_dir, &["config", "path", "--json"]));
        assert_eq!(before["exists"], false);
        assert!(before["path"].as_str().unwrap().ends_with("config.toml"));

        let init = sx(&temp_dir, &["config", "init", "--json"]);
        assert!(init.status.success());
        assert_eq!(stdout_json(&init)["exists"], true);
        assert!(temp_dir.path().join("config.toml").exists());

        let after = stdout_json(&sx(&temp_dir, &["config", "path", "--json"]));
        assert_eq!(after["exists"], true);
    }

    #[test]
    fn test_config_init_refuses_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        assert!(sx(&temp_dir, &["config", "init"]).status.success());

        let again = sx(&temp_dir, &["config", "init", "--json"]);
        assert_eq!(again.status.code(), Some(6));
        assert!(stderr_json(&again)["error"].is_string());

        let forced = sx(&temp_dir, &["config", "init", "--force"]);
        assert!(forced.status.success());
    }

    #[test]
    fn test_config_show_redacts_secret() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join("config.toml"),
            "[backend]\naccess_key = \"AKIDEXAMPLE\"\nsecret_key = \"top-secret\"\n",
        )
        .unwrap();

        let output = sx(&temp_dir, &["config", "show", "--json"]);
        assert!(output.status.success());
        let json = stdout_json(&output);
        assert_eq!(json["backend"]["access_key"], "AKIDEXAMPLE");
        assert_eq!(json["backend"]["secret_key"], "********");
    }
}

mod usage_tests {
    use super::*;

    #[test]
    fn test_share_requires_object_key() {
        let temp_dir = TempDir::new().unwrap();
        let output = sx(&temp_dir, &["share", "photos", "--json"]);
        assert_eq!(output.status.code(), Some(2));
        insta::assert_json_snapshot!("share_missing_key", stderr_json(&output));
    }

    #[test]
    fn test_share_rejects_long_expiry() {
        let temp_dir = TempDir::new().unwrap();
        let output = sx(
            &temp_dir,
            &["share", "photos/cat.jpg", "--expire", "8d", "--json"],
        );
        assert_eq!(output.status.code(), Some(2));
        insta::assert_json_snapshot!("share_expiry_too_long", stderr_json(&output));
    }

    #[test]
    fn test_recursive_rm_refuses_whole_bucket() {
        let temp_dir = TempDir::new().unwrap();
        let output = sx(&temp_dir, &["rm", "--recursive", "photos", "--json"]);
        assert_eq!(output.status.code(), Some(2));
        insta::assert_json_snapshot!("rm_whole_bucket", stderr_json(&output));
    }
}

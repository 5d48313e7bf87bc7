//! share command - Generate presigned URLs
//!
//! Creates time-limited download URLs for sharing objects without credentials.

use clap::Args;
use serde::Serialize;
use sx_core::transfer::MAX_PRESIGN_EXPIRY_SECS;
use sx_core::{OperationOutput, OperationRequest};

use super::{connect, parse_object, run_operation};
use crate::exit_code::ExitCode;
use crate::output::{Formatter, OutputConfig};

/// Generate presigned URLs for sharing objects
#[derive(Args, Debug)]
pub struct ShareArgs {
    /// Path to the object (bucket/key)
    pub path: String,

    /// Expiration time (e.g., 1h, 1d, 7d). Default: 7d
    #[arg(short, long, default_value = "7d")]
    pub expire: String,
}

#[derive(Debug, Serialize)]
struct ShareOutput {
    url: String,
    path: String,
    expires_in: String,
    expires_secs: u64,
}

/// Execute the share command
pub async fn execute(args: ShareArgs, output_config: OutputConfig) -> ExitCode {
    let formatter = Formatter::new(output_config);

    let remote = match parse_object(&args.path) {
        Ok(r) => r,
        Err(e) => {
            formatter.error(&e);
            return ExitCode::UsageError;
        }
    };

    let expires_secs = match parse_expiration(&args.expire) {
        Ok(secs) => secs,
        Err(e) => {
            formatter.error(&e);
            return ExitCode::UsageError;
        }
    };

    if expires_secs == 0 || expires_secs > MAX_PRESIGN_EXPIRY_SECS {
        formatter.error(&format!(
            "Expiration must be between 1 second and 7 days ({MAX_PRESIGN_EXPIRY_SECS} seconds)"
        ));
        return ExitCode::UsageError;
    }

    let manager = match connect(&formatter).await {
        Ok(engine) => engine,
        Err(code) => return code,
    };

    let request = OperationRequest::Presign {
        bucket: remote.bucket.clone(),
        key: remote.key.clone(),
        expiry_secs: expires_secs,
    };
    let op = match run_operation(&manager, request, &formatter, None).await {
        Ok(op) => op,
        Err(code) => return code,
    };

    let Some(OperationOutput::Url { url }) = op.output else {
        formatter.error("Presign returned no URL");
        return ExitCode::GeneralError;
    };

    let expires_human = format_duration(expires_secs);

    if formatter.is_json() {
        formatter.json(&ShareOutput {
            url,
            path: remote.to_string(),
            expires_in: expires_human,
            expires_secs,
        });
    } else {
        formatter.println("Share URL:");
        formatter.println(&formatter.style_url(&url));
        formatter.println("");
        formatter.println(&format!("Expires in: {expires_human}"));
    }

    ExitCode::Success
}

/// Parse expiration string (e.g., "1h", "1d", "7d")
fn parse_expiration(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Expiration cannot be empty".to_string());
    }

    let (num_str, suffix) = if s.ends_with(|c: char| c.is_ascii_alphabetic()) {
        let idx = s.len() - 1;
        (&s[..idx], &s[idx..])
    } else {
        (s, "s")
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| format!("Invalid expiration number: {num_str}"))?;

    let unit = match suffix.to_lowercase().as_str() {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        "w" => 604800,
        _ => return Err(format!("Unknown expiration suffix: {suffix}")),
    };

    num.checked_mul(unit)
        .ok_or_else(|| format!("Expiration too large: {s}"))
}

/// Format duration in human-readable form
fn format_duration(secs: u64) -> String {
    if secs >= 86400 {
        let days = secs / 86400;
        let hours = (secs % 86400) / 3600;
        if hours > 0 {
            format!("{days}d {hours}h")
        } else {
            format!("{days} day(s)")
        }
    } else if secs >= 3600 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        if mins > 0 {
            format!("{hours}h {mins}m")
        } else {
            format!("{hours} hour(s)")
        }
    } else if secs >= 60 {
        format!("{} minute(s)", secs / 60)
    } else {
        format!("{secs} second(s)")
    }
}

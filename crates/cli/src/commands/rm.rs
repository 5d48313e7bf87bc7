//! rm command - Delete objects or everything below a prefix

use clap::Args;
use serde::Serialize;
use sx_core::{OperationOutput, OperationRequest};

use super::{RemotePath, batch_exit_code, connect, parse_object, parse_remote, run_all};
use crate::exit_code::ExitCode;
use crate::output::{Formatter, OutputConfig};

/// Remove objects
#[derive(Args, Debug)]
pub struct RmArgs {
    /// Objects to remove (bucket/key); prefixes with --recursive
    #[arg(required = true)]
    pub paths: Vec<String>,

    /// Remove every object below each prefix in batches
    #[arg(short, long)]
    pub recursive: bool,
}

#[derive(Debug, Serialize)]
struct RmOutput {
    path: String,
    deleted: usize,
}

/// Execute the rm command
pub async fn execute(args: RmArgs, output_config: OutputConfig) -> ExitCode {
    let formatter = Formatter::new(output_config);

    let mut remotes = Vec::with_capacity(args.paths.len());
    for path in &args.paths {
        match parse_target(path, args.recursive) {
            Ok(remote) => remotes.push(remote),
            Err(e) => {
                formatter.error(&e);
                return ExitCode::UsageError;
            }
        }
    }

    let manager = match connect(&formatter).await {
        Ok(engine) => engine,
        Err(code) => return code,
    };

    let requests = remotes
        .iter()
        .map(|remote| build_request(remote, args.recursive))
        .collect();
    let results = run_all(&manager, requests, &formatter).await;

    let mut outputs = Vec::with_capacity(results.len());
    for (remote, result) in remotes.iter().zip(&results) {
        let Ok(op) = result else {
            continue;
        };
        let deleted = match &op.output {
            Some(OperationOutput::Aggregate(agg)) => agg.completed_files,
            _ => 1,
        };
        if args.recursive {
            formatter.success(&format!("Removed {deleted} object(s) below {remote}"));
        } else {
            formatter.success(&format!("Removed {remote}"));
        }
        outputs.push(RmOutput {
            path: remote.to_string(),
            deleted,
        });
    }

    if formatter.is_json() {
        formatter.json(&outputs);
    }

    batch_exit_code(&results)
}

fn parse_target(path: &str, recursive: bool) -> Result<RemotePath, String> {
    if !recursive {
        return parse_object(path);
    }
    let remote = parse_remote(path)?;
    if remote.key.is_empty() {
        return Err(format!(
            "Refusing to remove every object in bucket '{}'; name a prefix",
            remote.bucket
        ));
    }
    Ok(remote)
}

fn build_request(remote: &RemotePath, recursive: bool) -> OperationRequest {
    if recursive {
        OperationRequest::DeleteDir {
            bucket: remote.bucket.clone(),
            prefix: remote.dir_prefix(),
        }
    } else {
        OperationRequest::Delete {
            bucket: remote.bucket.clone(),
            key: remote.key.clone(),
        }
    }
}

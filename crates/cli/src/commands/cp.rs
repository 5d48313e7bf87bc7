//! cp command - Server-side copy between remote locations

use clap::Args;
use serde::Serialize;
use sx_core::OperationRequest;

use super::{RemotePath, connect, parse_object, parse_remote, run_operation};
use crate::exit_code::ExitCode;
use crate::output::{Formatter, OutputConfig};

/// Copy an object without downloading it
#[derive(Args, Debug)]
pub struct CpArgs {
    /// Source object (bucket/key)
    pub source: String,

    /// Destination object or prefix (bucket[/key])
    pub target: String,
}

#[derive(Debug, Serialize)]
struct CpOutput {
    source: String,
    target: String,
}

/// Execute the cp command
pub async fn execute(args: CpArgs, output_config: OutputConfig) -> ExitCode {
    let formatter = Formatter::new(output_config);

    let source = match parse_object(&args.source) {
        Ok(s) => s,
        Err(e) => {
            formatter.error(&e);
            return ExitCode::UsageError;
        }
    };
    let target = match parse_remote(&args.target).and_then(|t| resolve_target(&source, t)) {
        Ok(t) => t,
        Err(e) => {
            formatter.error(&e);
            return ExitCode::UsageError;
        }
    };

    if source == target {
        formatter.error("Source and destination are the same object");
        return ExitCode::UsageError;
    }

    let manager = match connect(&formatter).await {
        Ok(engine) => engine,
        Err(code) => return code,
    };

    let request = OperationRequest::Copy {
        source: source.object_ref(),
        dest: target.object_ref(),
    };
    if let Err(code) = run_operation(&manager, request, &formatter, None).await {
        return code;
    }

    if formatter.is_json() {
        formatter.json(&CpOutput {
            source: source.to_string(),
            target: target.to_string(),
        });
    } else {
        formatter.success(&format!("Copied {source} -> {target}"));
    }

    ExitCode::Success
}

/// A prefix destination receives the source's file name
fn resolve_target(source: &RemotePath, target: RemotePath) -> Result<RemotePath, String> {
    if !target.key.is_empty() && !target.key.ends_with('/') {
        return Ok(target);
    }
    let name = source
        .file_name()
        .ok_or_else(|| format!("Cannot derive a key from '{source}'"))?;
    Ok(RemotePath {
        key: format!("{}{name}", target.dir_prefix()),
        bucket: target.bucket,
    })
}

//! get command - Download objects or prefixes to the local filesystem

use std::path::{Path, PathBuf};

use clap::Args;
use serde::Serialize;
use sx_core::{OperationOutput, OperationRequest};

use super::{RemotePath, batch_exit_code, connect, parse_object, parse_remote, run_all};
use crate::exit_code::ExitCode;
use crate::output::{Formatter, OutputConfig, format_size};

/// Download objects
#[derive(Args, Debug)]
pub struct GetArgs {
    /// Objects to download (bucket/key); prefixes with --recursive
    #[arg(required = true)]
    pub sources: Vec<String>,

    /// Destination file or directory (default: current directory)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Download every object below each prefix, recreating the tree
    #[arg(short, long)]
    pub recursive: bool,
}

#[derive(Debug, Serialize)]
struct GetOutput {
    source: String,
    target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<OperationOutput>,
}

/// Execute the get command
pub async fn execute(args: GetArgs, output_config: OutputConfig) -> ExitCode {
    let formatter = Formatter::new(output_config);

    let mut remotes = Vec::with_capacity(args.sources.len());
    for source in &args.sources {
        let parsed = if args.recursive {
            parse_remote(source)
        } else {
            parse_object(source)
        };
        match parsed {
            Ok(remote) => remotes.push(remote),
            Err(e) => {
                formatter.error(&e);
                return ExitCode::UsageError;
            }
        }
    }

    let requests = match plan_requests(&remotes, args.output.as_deref(), args.recursive) {
        Ok(requests) => requests,
        Err(e) => {
            formatter.error(&e);
            return ExitCode::UsageError;
        }
    };

    let manager = match connect(&formatter).await {
        Ok(engine) => engine,
        Err(code) => return code,
    };

    let targets: Vec<String> = requests.iter().map(target_of).collect();
    let results = run_all(&manager, requests, &formatter).await;

    let mut outputs = Vec::with_capacity(results.len());
    for ((remote, target), result) in remotes.iter().zip(targets).zip(&results) {
        let Ok(op) = result else {
            continue;
        };
        match &op.output {
            Some(OperationOutput::Bytes { bytes }) => formatter.success(&format!(
                "Downloaded {remote} -> {target} ({})",
                format_size(*bytes)
            )),
            Some(OperationOutput::Aggregate(agg)) => formatter.success(&format!(
                "Downloaded {} file(s) from {remote} -> {target} ({})",
                agg.completed_files,
                format_size(agg.transferred_bytes)
            )),
            _ => formatter.success(&format!("Downloaded {remote} -> {target}")),
        }
        outputs.push(GetOutput {
            source: remote.to_string(),
            target,
            result: op.output.clone(),
        });
    }

    if formatter.is_json() {
        formatter.json(&outputs);
    }

    batch_exit_code(&results)
}

/// Build one request per source
///
/// A single object goes to `output` as a file unless `output` is an existing
/// directory. Several objects always land inside `output` by file name.
fn plan_requests(
    remotes: &[RemotePath],
    output: Option<&Path>,
    recursive: bool,
) -> Result<Vec<OperationRequest>, String> {
    let base = output.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));

    if recursive {
        return Ok(remotes
            .iter()
            .map(|remote| OperationRequest::DownloadDir {
                bucket: remote.bucket.clone(),
                prefix: remote.dir_prefix(),
                local: base.clone(),
            })
            .collect());
    }

    let into_dir = remotes.len() > 1 || output.is_none() || base.is_dir();
    if remotes.len() > 1 && base.exists() && !base.is_dir() {
        return Err(format!(
            "Destination '{}' must be a directory when downloading several objects",
            base.display()
        ));
    }

    remotes
        .iter()
        .map(|remote| {
            let local = if into_dir {
                let name = remote
                    .file_name()
                    .ok_or_else(|| format!("Cannot derive a file name from '{remote}'"))?;
                base.join(name)
            } else {
                base.clone()
            };
            Ok(OperationRequest::Download {
                bucket: remote.bucket.clone(),
                key: remote.key.clone(),
                local,
            })
        })
        .collect()
}

fn target_of(request: &OperationRequest) -> String {
    match request {
        OperationRequest::Download { local, .. } | OperationRequest::DownloadDir { local, .. } => {
            local.display().to_string()
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn remote(path: &str) -> RemotePath {
        parse_remote(path).unwrap()
    }

    #[test]
    fn test_single_object_defaults_to_current_dir() {
        let requests = plan_requests(&[remote("b/2024/cat.jpg")], None, false).unwrap();
        assert_eq!(
            requests,
            vec![OperationRequest::Download {
                bucket: "b".into(),
                key: "2024/cat.jpg".into(),
                local: PathBuf::from("./cat.jpg"),
            }]
        );
    }

    #[test]
    fn test_single_object_to_explicit_file() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("renamed.jpg");
        let requests = plan_requests(&[remote("b/cat.jpg")], Some(&target), false).unwrap();
        assert_eq!(target_of(&requests[0]), target.display().to_string());
    }

    #[test]
    fn test_several_objects_land_in_directory() {
        let temp = TempDir::new().unwrap();
        let requests = plan_requests(
            &[remote("b/a.txt"), remote("b/nested/b.txt")],
            Some(temp.path()),
            false,
        )
        .unwrap();
        assert_eq!(
            target_of(&requests[1]),
            temp.path().join("b.txt").display().to_string()
        );
    }

    #[test]
    fn test_several_objects_reject_file_destination() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("exists.txt");
        std::fs::write(&file, b"x").unwrap();
        assert!(plan_requests(&[remote("b/a"), remote("b/c")], Some(&file), false).is_err());
    }

    #[test]
    fn test_recursive_uses_directory_prefix() {
        let requests = plan_requests(&[remote("b/logs")], Some(Path::new("out")), true).unwrap();
        assert_eq!(
            requests,
            vec![OperationRequest::DownloadDir {
                bucket: "b".into(),
                prefix: "logs/".into(),
                local: PathBuf::from("out"),
            }]
        );
    }
}

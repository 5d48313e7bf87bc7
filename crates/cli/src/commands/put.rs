//! put command - Upload files or directory trees

use std::path::{Path, PathBuf};

use clap::Args;
use serde::Serialize;
use sx_core::{OperationOutput, OperationRequest};

use super::{RemotePath, batch_exit_code, connect, parse_remote, run_all};
use crate::exit_code::ExitCode;
use crate::output::{Formatter, OutputConfig, format_size};

/// Upload files
#[derive(Args, Debug)]
pub struct PutArgs {
    /// Local files followed by the destination (FILE... bucket[/key])
    #[arg(required = true, num_args = 2..)]
    pub paths: Vec<String>,

    /// Upload directories, recreating empty folders as markers
    #[arg(short, long)]
    pub recursive: bool,
}

#[derive(Debug, Serialize)]
struct PutOutput {
    source: String,
    target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<OperationOutput>,
}

/// Execute the put command
pub async fn execute(args: PutArgs, output_config: OutputConfig) -> ExitCode {
    let formatter = Formatter::new(output_config);

    let Some((dest, sources)) = args.paths.split_last() else {
        formatter.error("A source and a destination are required");
        return ExitCode::UsageError;
    };

    let dest = match parse_remote(dest) {
        Ok(d) => d,
        Err(e) => {
            formatter.error(&e);
            return ExitCode::UsageError;
        }
    };

    let sources: Vec<PathBuf> = sources.iter().map(PathBuf::from).collect();
    let requests = match plan_requests(&sources, &dest, args.recursive) {
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
    for ((source, target), result) in sources.iter().zip(targets).zip(&results) {
        let Ok(op) = result else {
            continue;
        };
        let source = source.display().to_string();
        match &op.output {
            Some(OperationOutput::Bytes { bytes }) => formatter.success(&format!(
                "Uploaded {source} -> {target} ({})",
                format_size(*bytes)
            )),
            Some(OperationOutput::Aggregate(agg)) => formatter.success(&format!(
                "Uploaded {} file(s) from {source} -> {target} ({})",
                agg.completed_files,
                format_size(agg.transferred_bytes)
            )),
            _ => formatter.success(&format!("Uploaded {source} -> {target}")),
        }
        outputs.push(PutOutput {
            source,
            target,
            result: op.output.clone(),
        });
    }

    if formatter.is_json() {
        formatter.json(&outputs);
    }

    batch_exit_code(&results)
}

/// Build one request per local source
///
/// A file keeps the destination key as given unless the destination looks
/// like a prefix (empty or trailing `/`) or several sources were named, in
/// which case the file name is appended to the prefix.
fn plan_requests(
    sources: &[PathBuf],
    dest: &RemotePath,
    recursive: bool,
) -> Result<Vec<OperationRequest>, String> {
    let as_prefix = sources.len() > 1 || dest.key.is_empty() || dest.key.ends_with('/');

    sources
        .iter()
        .map(|source| {
            if source.is_dir() {
                if !recursive {
                    return Err(format!(
                        "'{}' is a directory (use --recursive)",
                        source.display()
                    ));
                }
                return Ok(OperationRequest::UploadDir {
                    local: source.clone(),
                    bucket: dest.bucket.clone(),
                    prefix: dest.dir_prefix(),
                });
            }

            if !source.is_file() {
                return Err(format!("'{}' does not exist", source.display()));
            }

            let key = if as_prefix {
                format!("{}{}", dest.dir_prefix(), file_name(source)?)
            } else {
                dest.key.clone()
            };
            Ok(OperationRequest::Upload {
                local: source.clone(),
                bucket: dest.bucket.clone(),
                key,
            })
        })
        .collect()
}

fn file_name(path: &Path) -> Result<&str, String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| format!("'{}' has no usable file name", path.display()))
}

fn target_of(request: &OperationRequest) -> String {
    match request {
        OperationRequest::Upload { bucket, key, .. } => format!("{bucket}/{key}"),
        OperationRequest::UploadDir { bucket, prefix, .. } => format!("{bucket}/{prefix}"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, PathBuf, PathBuf) {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("report.csv");
        std::fs::write(&file, b"a,b\n").unwrap();
        let dir = temp.path().join("site");
        std::fs::create_dir(&dir).unwrap();
        (temp, file, dir)
    }

    #[test]
    fn test_file_to_explicit_key() {
        let (_temp, file, _) = fixture();
        let dest = parse_remote("b/archive/2024.csv").unwrap();
        let requests = plan_requests(std::slice::from_ref(&file), &dest, false).unwrap();
        assert_eq!(target_of(&requests[0]), "b/archive/2024.csv");
    }

    #[test]
    fn test_file_to_prefix_appends_name() {
        let (_temp, file, _) = fixture();
        let dest = parse_remote("b/archive/").unwrap();
        let requests = plan_requests(std::slice::from_ref(&file), &dest, false).unwrap();
        assert_eq!(target_of(&requests[0]), "b/archive/report.csv");

        let bucket_only = parse_remote("b").unwrap();
        let requests = plan_requests(std::slice::from_ref(&file), &bucket_only, false).unwrap();
        assert_eq!(target_of(&requests[0]), "b/report.csv");
    }

    #[test]
    fn test_directory_requires_recursive() {
        let (_temp, _, dir) = fixture();
        let dest = parse_remote("b/www").unwrap();
        assert!(plan_requests(std::slice::from_ref(&dir), &dest, false).is_err());

        let requests = plan_requests(std::slice::from_ref(&dir), &dest, true).unwrap();
        assert_eq!(
            requests,
            vec![OperationRequest::UploadDir {
                local: dir,
                bucket: "b".into(),
                prefix: "www/".into(),
            }]
        );
    }

    #[test]
    fn test_missing_source_is_rejected() {
        let dest = parse_remote("b/x").unwrap();
        let missing = PathBuf::from("/definitely/not/here.bin");
        assert!(plan_requests(&[missing], &dest, false).is_err());
    }
}

//! ls command - List buckets, objects and common prefixes
//!
//! Without a path, lists the caller's buckets. With one, lists one level below
//! the prefix by default, or every key with `--recursive`.

use clap::Args;
use comfy_table::presets::NOTHING;
use comfy_table::{Cell, CellAlignment, Color, ContentArrangement, Table};
use sx_core::{BucketSummary, Listing, OperationOutput, OperationRequest};

use super::{connect, parse_remote, run_operation};
use crate::exit_code::ExitCode;
use crate::output::{Formatter, OutputConfig, format_size};

/// List buckets, or objects in a bucket
#[derive(Args, Debug)]
pub struct LsArgs {
    /// Bucket and optional prefix (bucket[/prefix]); omit to list buckets
    pub path: Option<String>,

    /// List every key below the prefix instead of one level
    #[arg(short, long)]
    pub recursive: bool,

    /// Print only the totals
    #[arg(long)]
    pub summarize: bool,
}

/// Execute the ls command
pub async fn execute(args: LsArgs, output_config: OutputConfig) -> ExitCode {
    let formatter = Formatter::new(output_config);

    let Some(path) = args.path.as_deref() else {
        return list_buckets(&formatter).await;
    };

    let remote = match parse_remote(path) {
        Ok(r) => r,
        Err(e) => {
            formatter.error(&e);
            return ExitCode::UsageError;
        }
    };

    let manager = match connect(&formatter).await {
        Ok(engine) => engine,
        Err(code) => return code,
    };

    let request = OperationRequest::List {
        bucket: remote.bucket,
        prefix: remote.key,
        delimiter: (!args.recursive).then(|| "/".to_string()),
    };

    let op = match run_operation(&manager, request, &formatter, None).await {
        Ok(op) => op,
        Err(code) => return code,
    };

    let Some(OperationOutput::Listing(listing)) = op.output else {
        formatter.error("Listing returned no result");
        return ExitCode::GeneralError;
    };

    if listing.truncated {
        formatter.warning(&format!(
            "Listing stopped after {} page(s); results are incomplete",
            listing.pages
        ));
    }

    if formatter.is_json() {
        formatter.json(&listing);
    } else if args.summarize {
        formatter.println(&summary_line(&listing));
    } else {
        if !listing.objects.is_empty() || !listing.prefixes.is_empty() {
            formatter.println(&render_table(&listing, &formatter).to_string());
        }
        formatter.println(&summary_line(&listing));
    }

    ExitCode::Success
}

async fn list_buckets(formatter: &Formatter) -> ExitCode {
    let manager = match connect(formatter).await {
        Ok(engine) => engine,
        Err(code) => return code,
    };

    let op = match run_operation(&manager, OperationRequest::ListBuckets, formatter, None).await {
        Ok(op) => op,
        Err(code) => return code,
    };

    let Some(OperationOutput::Buckets { buckets }) = op.output else {
        formatter.error("Bucket listing returned no result");
        return ExitCode::GeneralError;
    };

    if formatter.is_json() {
        formatter.json(&buckets);
    } else if !buckets.is_empty() {
        formatter.println(&render_buckets(&buckets, formatter).to_string());
    }

    ExitCode::Success
}

fn render_buckets(buckets: &[BucketSummary], formatter: &Formatter) -> Table {
    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic);
    if !formatter.colors_enabled() {
        table.force_no_tty();
    }

    for bucket in buckets {
        let created = bucket
            .created
            .map(|ts| ts.strftime("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let mut name = Cell::new(format!("{}/", bucket.name));
        if formatter.colors_enabled() {
            name = name.fg(Color::Blue);
        }
        table.add_row(vec![Cell::new(created), name]);
    }

    table
}

fn render_table(listing: &Listing, formatter: &Formatter) -> Table {
    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic);
    if !formatter.colors_enabled() {
        table.force_no_tty();
    }

    for dir in &listing.prefixes {
        let mut name = Cell::new(&dir.prefix);
        if formatter.colors_enabled() {
            name = name.fg(Color::Blue);
        }
        table.add_row(vec![
            Cell::new(""),
            Cell::new("PRE").set_alignment(CellAlignment::Right),
            name,
        ]);
    }

    for object in &listing.objects {
        let modified = object
            .last_modified
            .map(|ts| ts.strftime("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        table.add_row(vec![
            Cell::new(modified),
            Cell::new(format_size(object.size)).set_alignment(CellAlignment::Right),
            Cell::new(&object.key),
        ]);
    }

    table
}

fn summary_line(listing: &Listing) -> String {
    let mut line = format!(
        "{} object(s), {}",
        listing.objects.len(),
        format_size(listing.total_bytes())
    );
    if !listing.prefixes.is_empty() {
        line.push_str(&format!(", {} prefix(es)", listing.prefixes.len()));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use sx_core::{DirectorySummary, ObjectSummary};

    fn listing() -> Listing {
        Listing {
            bucket: "photos".into(),
            prefix: "".into(),
            objects: vec![ObjectSummary::new("a.jpg", 1024), ObjectSummary::new("b.jpg", 1024)],
            prefixes: vec![DirectorySummary {
                prefix: "2024/".into(),
            }],
            pages: 1,
            truncated: false,
        }
    }

    #[test]
    fn test_render_buckets() {
        let formatter = Formatter::new(OutputConfig {
            no_color: true,
            ..Default::default()
        });
        let buckets = vec![
            BucketSummary {
                name: "archive".into(),
                created: Some("2024-03-01T12:30:00Z".parse().unwrap()),
            },
            BucketSummary {
                name: "photos".into(),
                created: None,
            },
        ];

        let rendered = render_buckets(&buckets, &formatter).to_string();
        assert!(rendered.contains("2024-03-01 12:30:00"));
        assert!(rendered.contains("archive/"));
        assert!(rendered.find("archive/").unwrap() < rendered.find("photos/").unwrap());
    }

    #[test]
    fn test_summary_line() {
        assert_eq!(summary_line(&listing()), "2 object(s), 2 KiB, 1 prefix(es)");
    }

    #[test]
    fn test_render_table_lists_prefixes_first() {
        let formatter = Formatter::new(OutputConfig {
            no_color: true,
            ..Default::default()
        });
        let rendered = render_table(&listing(), &formatter).to_string();
        let pre = rendered.find("2024/").unwrap();
        let object = rendered.find("a.jpg").unwrap();
        assert!(pre < object);
        assert!(rendered.contains("PRE"));
        assert!(rendered.contains("1 KiB"));
    }
}

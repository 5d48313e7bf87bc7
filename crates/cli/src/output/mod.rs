//! Output rendering
//!
//! Human output goes to stdout with optional color; `--json` switches every
//! command to a single pretty-printed JSON document. Diagnostics and progress
//! bars go to stderr.

mod formatter;
mod progress;

pub use formatter::Formatter;
pub use progress::OperationProgress;

/// Global output switches shared by all commands
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    pub json: bool,
    pub no_color: bool,
    pub quiet: bool,
}

/// Binary (KiB/MiB) size used in every human-readable column
pub fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

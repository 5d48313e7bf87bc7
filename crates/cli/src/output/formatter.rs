//! Output formatter for human-readable and JSON output
//!
//! Every command writes through a [`Formatter`] so quiet, color and JSON
//! switches behave the same everywhere.

use console::Style;
use serde::Serialize;
use sx_core::ErrorDetail;

use super::OutputConfig;

/// Color theme for styled output
#[derive(Debug, Clone)]
struct Theme {
    /// URLs - cyan + underline
    url: Style,
    success: Style,
    error: Style,
    warning: Style,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            url: Style::new().cyan().underlined(),
            success: Style::new().green(),
            error: Style::new().red(),
            warning: Style::new().yellow(),
        }
    }
}

impl Theme {
    /// Returns a theme with no styling (for no-color mode)
    fn plain() -> Self {
        Self {
            url: Style::new(),
            success: Style::new(),
            error: Style::new(),
            warning: Style::new(),
        }
    }
}

/// Formatter for CLI output
///
/// When JSON mode is enabled, stdout carries strict JSON only: no colors,
/// no progress and no success lines.
#[derive(Debug, Clone)]
pub struct Formatter {
    config: OutputConfig,
    theme: Theme,
}

impl Formatter {
    pub fn new(config: OutputConfig) -> Self {
        let theme = if config.no_color || config.json {
            Theme::plain()
        } else {
            Theme::default()
        };
        Self { config, theme }
    }

    pub fn is_json(&self) -> bool {
        self.config.json
    }

    pub fn colors_enabled(&self) -> bool {
        !self.config.no_color && !self.config.json
    }

    /// Whether interactive progress bars should be drawn
    pub fn shows_progress(&self) -> bool {
        !self.config.quiet && !self.config.json
    }

    pub fn style_url(&self, text: &str) -> String {
        self.theme.url.apply_to(text).to_string()
    }

    /// Output a success message; silent in quiet and JSON mode
    pub fn success(&self, message: &str) {
        if self.config.quiet || self.config.json {
            return;
        }
        let checkmark = self.theme.success.apply_to("✓");
        println!("{checkmark} {message}");
    }

    /// Output an error message
    ///
    /// Errors are always printed, even in quiet mode.
    pub fn error(&self, message: &str) {
        if self.config.json {
            let error = serde_json::json!({ "error": message });
            eprintln!(
                "{}",
                serde_json::to_string_pretty(&error).unwrap_or_else(|_| message.to_string())
            );
        } else {
            let cross = self.theme.error.apply_to("✗");
            eprintln!("{cross} {message}");
        }
    }

    /// Output a failed operation's detail
    ///
    /// JSON mode emits the whole detail object so scripts can read the code,
    /// attempt count and failing item.
    pub fn error_detail(&self, context: &str, detail: &ErrorDetail) {
        if self.config.json {
            let error = serde_json::json!({ "error": detail });
            eprintln!(
                "{}",
                serde_json::to_string_pretty(&error).unwrap_or_else(|_| detail.message.clone())
            );
            return;
        }

        let cross = self.theme.error.apply_to("✗");
        eprintln!("{cross} {context}: {} ({})", detail.message, detail.code);
        if let Some(attempts) = detail.attempts.filter(|a| *a > 1) {
            eprintln!("  gave up after {attempts} attempts");
        }
    }

    /// Output a warning message
    pub fn warning(&self, message: &str) {
        if self.config.quiet || self.config.json {
            return;
        }
        let warn_icon = self.theme.warning.apply_to("⚠");
        eprintln!("{warn_icon} {message}");
    }

    /// Output a value as pretty JSON
    pub fn json<T: Serialize>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("Error serializing output: {e}"),
        }
    }

    /// Print a line of text (respects quiet mode)
    pub fn println(&self, message: &str) {
        if self.config.quiet {
            return;
        }
        println!("{message}");
    }
}

impl Default for Formatter {
    fn default() -> Self {
        Self::new(OutputConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formatter_default() {
        let formatter = Formatter::default();
        assert!(!formatter.is_json());
        assert!(formatter.colors_enabled());
        assert!(formatter.shows_progress());
    }

    #[test]
    fn test_formatter_json_mode() {
        let config = OutputConfig {
            json: true,
            ..Default::default()
        };
        let formatter = Formatter::new(config);
        assert!(formatter.is_json());
        assert!(!formatter.colors_enabled());
        assert!(!formatter.shows_progress());
    }

    #[test]
    fn test_formatter_no_color_styles_are_plain() {
        let config = OutputConfig {
            no_color: true,
            ..Default::default()
        };
        let formatter = Formatter::new(config);
        assert!(!formatter.colors_enabled());
        assert_eq!(formatter.style_url("https://x/y"), "https://x/y");
    }

    #[test]
    fn test_quiet_hides_progress() {
        let config = OutputConfig {
            quiet: true,
            ..Default::default()
        };
        assert!(!Formatter::new(config).shows_progress());
    }
}

pub mod completions;
pub mod deps;
pub mod describe;
pub mod destroy;
pub mod images;
pub mod ls;
pub mod pause;
pub mod ports;
pub mod resume;
pub mod up;

use envd_core::{CoreError, ErrorKind};
use envd_schema::PortBinding;
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_NOT_FOUND: u8 = 2;
pub const EXIT_CONFLICT: u8 = 3;
pub const EXIT_TIMEOUT: u8 = 4;

/// A failed command: the message for stderr and the process exit code.
#[derive(Debug)]
pub struct CommandError {
    pub code: u8,
    pub message: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

pub fn exit_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::NotFound => EXIT_NOT_FOUND,
        ErrorKind::Conflict => EXIT_CONFLICT,
        ErrorKind::Timeout => EXIT_TIMEOUT,
        ErrorKind::ResourceExhausted
        | ErrorKind::Unsupported
        | ErrorKind::Invalid
        | ErrorKind::Transport => EXIT_FAILURE,
    }
}

impl From<CoreError> for CommandError {
    fn from(e: CoreError) -> Self {
        Self {
            code: exit_code(e.kind()),
            message: e.to_string(),
        }
    }
}

impl From<String> for CommandError {
    fn from(message: String) -> Self {
        Self {
            code: EXIT_FAILURE,
            message,
        }
    }
}

pub type CommandResult = Result<u8, CommandError>;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn finish(pb: &ProgressBar, msg: String) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(msg);
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✗ {msg}"));
}

pub fn colorize_status(status: &str) -> String {
    use console::Style;
    match status {
        "running" => Style::new().green().bold().apply_to(status).to_string(),
        "paused" => Style::new().yellow().apply_to(status).to_string(),
        "created" | "restarting" => Style::new().cyan().apply_to(status).to_string(),
        "exited" | "dead" => Style::new().red().apply_to(status).to_string(),
        "removing" => Style::new().dim().apply_to(status).to_string(),
        other => other.to_owned(),
    }
}

pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

pub fn print_port_table(bindings: &[PortBinding]) {
    println!(
        "{:<12} {:<10} {:<8} {:<16} HOST_PORT",
        "NAME", "PORT", "PROTO", "HOST_IP"
    );
    for b in bindings {
        println!(
            "{:<12} {:<10} {:<8} {:<16} {}",
            b.name, b.port, b.protocol, b.host_ip, b.host_port
        );
    }
}

/// Empty optional fields render as a dash in tables.
pub fn or_dash(value: Option<&str>) -> &str {
    value.filter(|v| !v.is_empty()).unwrap_or("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_pretty_serializes_object() {
        let val = serde_json::json!({"name": "mnist"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"name\""));
        assert!(result.contains("\"mnist\""));
    }

    #[test]
    fn exit_codes_follow_error_kind() {
        assert_eq!(exit_code(ErrorKind::NotFound), EXIT_NOT_FOUND);
        assert_eq!(exit_code(ErrorKind::Conflict), EXIT_CONFLICT);
        assert_eq!(exit_code(ErrorKind::Timeout), EXIT_TIMEOUT);
        assert_eq!(exit_code(ErrorKind::Transport), EXIT_FAILURE);

        let err = CommandError::from(CoreError::EnvNotFound("mnist".into()));
        assert_eq!(err.code, EXIT_NOT_FOUND);
        assert!(err.message.contains("mnist"));
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            EXIT_SUCCESS,
            EXIT_FAILURE,
            EXIT_NOT_FOUND,
            EXIT_CONFLICT,
            EXIT_TIMEOUT,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn colorize_keeps_the_text() {
        for status in ["running", "paused", "created", "exited"] {
            assert!(colorize_status(status).contains(status));
        }
        assert_eq!(colorize_status("unknown"), "unknown");
    }

    #[test]
    fn sizes() {
        assert_eq!(human_size(512), "512B");
        assert_eq!(human_size(1_500), "1.5KB");
        assert_eq!(human_size(2_300_000_000), "2.3GB");
    }

    #[test]
    fn dash_for_empty() {
        assert_eq!(or_dash(None), "-");
        assert_eq!(or_dash(Some("")), "-");
        assert_eq!(or_dash(Some("11.8")), "11.8");
    }

    #[test]
    fn spinner_finishes() {
        let pb = spinner("starting...");
        spin_ok(&pb, "done");
        let pb = spinner("starting...");
        spin_fail(&pb, "failed");
    }
}

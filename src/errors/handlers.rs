// Operator-facing marker lines on stderr. Structured logs go through tracing;
// these are the short bracketed lines people grep for in cron mail.

use colored::Colorize;

use super::ClusterError;

pub fn err_marker(msg: &str) -> String {
    format!("###> {msg} <###")
}

pub fn warn_marker(msg: &str) -> String {
    format!("##!> {msg} <!##")
}

/// Print a fatal marker line and hand back the exit code for `main`.
pub fn report_fatal(error: &ClusterError) -> i32 {
    eprintln!("{}", err_marker(&error.to_string()).red().bold());
    tracing::error!(error = %error, code = error.exit_code(), "invocation failed");
    error.exit_code()
}

/// Print a non-fatal marker line; processing carries on.
pub fn report_warning(msg: &str) {
    eprintln!("{}", warn_marker(msg).yellow());
    tracing::warn!("{msg}");
}

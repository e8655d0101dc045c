/// Terminal rendering for the `opguard` binary
pub mod console;

pub use console::{error_lines, format_elapsed, severity_label, state_label, ConsoleSink};

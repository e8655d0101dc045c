use crate::cancellation::{OperationProgress, OperationState};
use crate::error::{ErrorResponse, ErrorSeverity};
use crate::notification::NotificationSink;
use colored::{ColoredString, Colorize};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const BAR_TEMPLATE: &str = "{spinner:.cyan} {prefix:.bold} [{bar:30.green/white}] {pos:>3}% {msg}";

/// Renders progress bars and error summaries on the terminal
///
/// One bar per operation, created on its first progress event and finished
/// when the operation reaches a terminal state.
pub struct ConsoleSink {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
    style: ProgressStyle,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr())
    }

    /// Sink drawing nowhere; events are still tracked
    pub fn hidden() -> Self {
        Self::with_target(ProgressDrawTarget::hidden())
    }

    fn with_target(target: ProgressDrawTarget) -> Self {
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░");
        Self {
            multi: MultiProgress::with_draw_target(target),
            bars: Mutex::new(HashMap::new()),
            style,
        }
    }

    /// Operations with a bar still on screen
    pub fn active_bars(&self) -> usize {
        self.lock_bars().len()
    }

    fn bar_for(&self, progress: &OperationProgress) -> ProgressBar {
        self.lock_bars()
            .entry(progress.operation_id.clone())
            .or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new(100));
                bar.set_style(self.style.clone());
                bar.set_prefix(short(&progress.operation_id).to_string());
                bar.enable_steady_tick(Duration::from_millis(120));
                bar
            })
            .clone()
    }

    fn lock_bars(&self) -> MutexGuard<'_, HashMap<String, ProgressBar>> {
        self.bars.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationSink for ConsoleSink {
    fn on_progress(&self, progress: &OperationProgress) {
        let bar = self.bar_for(progress);
        bar.set_position(progress.percentage.round().clamp(0.0, 100.0) as u64);

        let step = if progress.current_step.is_empty() {
            String::new()
        } else {
            format!(" {}", progress.current_step)
        };
        bar.set_message(format!("{}{}", state_label(progress.state), step));

        if progress.state.is_terminal() {
            let summary = match &progress.message {
                Some(message) => format!("{} {}", state_label(progress.state), message.dimmed()),
                None => format!(
                    "{} in {}",
                    state_label(progress.state),
                    format_elapsed(progress.elapsed())
                ),
            };
            bar.finish_with_message(summary);
            self.lock_bars().remove(&progress.operation_id);
        }
    }

    fn on_error(&self, response: &ErrorResponse) {
        for line in error_lines(response) {
            // println on the multi keeps the bars intact
            let _ = self.multi.println(line);
        }
    }
}

/// Colored one-word label for a state
pub fn state_label(state: OperationState) -> ColoredString {
    let text = state.as_str();
    match state {
        OperationState::Completed => text.green().bold(),
        OperationState::Error => text.red().bold(),
        OperationState::Timeout => text.magenta().bold(),
        OperationState::Cancelled | OperationState::Cancelling => text.yellow(),
        _ => text.cyan(),
    }
}

/// Colored severity tag
pub fn severity_label(severity: ErrorSeverity) -> ColoredString {
    let text = severity.as_str().to_uppercase();
    match severity {
        ErrorSeverity::Critical => text.white().on_red().bold(),
        ErrorSeverity::High => text.red().bold(),
        ErrorSeverity::Medium => text.yellow(),
        ErrorSeverity::Low => text.blue(),
        ErrorSeverity::Info => text.dimmed(),
    }
}

/// Terminal rendering of an error response
pub fn error_lines(response: &ErrorResponse) -> Vec<String> {
    let mut lines = vec![format!(
        "{} {} {}",
        severity_label(response.severity),
        format!("[{}]", response.category).dimmed(),
        response.user_message
    )];

    for action in &response.suggested_actions {
        lines.push(format!("  {} {}", "→".cyan(), action));
    }

    let mut flags = Vec::new();
    if response.retry_allowed {
        flags.push("retry allowed".green().to_string());
    }
    if response.fallback_available {
        flags.push("fallback available".green().to_string());
    }
    if response.rolled_back {
        flags.push("rolled back".yellow().to_string());
    }
    if let Some(eta) = response.estimated_recovery_time {
        flags.push(format!("recovery in ~{}", format_elapsed(eta)));
    }
    if !flags.is_empty() {
        lines.push(format!("  {}", flags.join(", ")));
    }

    if let Some(reference) = &response.support_reference {
        lines.push(format!(
            "  {} {}",
            "Escalated, support reference:".red(),
            reference.bold()
        ));
    }
    lines
}

/// Format a duration as H:MM:SS or M:SS, sub-second as milliseconds
pub fn format_elapsed(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        return format!("{}ms", duration.as_millis());
    }
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{}:{:02}", m, s)
    }
}

fn short(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}

use crate::build::{BuildRecord, BuildStatus, BuildStep};
use crate::ui::icons::{CHECK, CLOCK, CROSS, HAMMER, STOP, WARN};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

/// Terminal UI for a foreground build, rendered via `indicatif` progress bars.
///
/// Two bars are stacked vertically:
/// - Progress bar: overall percentage, with the current step as prefix
/// - Status spinner: the latest status message from the build procedure
///
/// New log lines are printed above the bars through `MultiProgress`.
pub struct BuildProgressUI {
    multi: MultiProgress,
    progress_bar: ProgressBar,
    status_bar: ProgressBar,
    last_step: Option<BuildStep>,
    verbose: bool,
}

impl BuildProgressUI {
    /// Create the UI for `build_id` and start the spinner.
    pub fn new(build_id: &str, environment: &str, verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let progress_style = ProgressStyle::default_bar()
            .template("{prefix:>9.bold.dim} [{bar:40.cyan/blue}] {pos:>3}% {elapsed_precise}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");

        let progress_bar = multi.add(ProgressBar::new(100));
        progress_bar.set_style(progress_style);
        progress_bar.set_prefix(BuildStep::Init.as_str());

        let status_style = ProgressStyle::default_spinner()
            .template("{prefix:>9.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");

        let status_bar = multi.add(ProgressBar::new_spinner());
        status_bar.set_style(status_style);
        status_bar.set_prefix("status");
        status_bar.set_message("Build queued");
        status_bar.enable_steady_tick(Duration::from_millis(100));

        let ui = Self {
            multi,
            progress_bar,
            status_bar,
            last_step: None,
            verbose,
        };
        ui.print_line(format!(
            "{}Build {} for {}",
            HAMMER,
            style(build_id).cyan(),
            style(environment).yellow()
        ));
        ui
    }

    /// Print a line via `MultiProgress`, falling back to `eprintln!` if the rich UI fails.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    /// Reflect the latest record: step prefix, percentage, and status message.
    pub fn update(&mut self, record: &BuildRecord) {
        if self.last_step != Some(record.current_step) {
            if self.last_step.is_some() {
                self.print_line(format!(
                    "  {} {}",
                    style("→").dim(),
                    record.current_step.description()
                ));
            }
            self.last_step = Some(record.current_step);
            self.progress_bar.set_prefix(record.current_step.as_str());
        }
        self.progress_bar.set_position(u64::from(record.progress));
        self.status_bar.set_message(record.message.clone());
    }

    /// Echo build output above the bars (verbose mode only).
    pub fn show_log_lines(&self, lines: &[String]) {
        if !self.verbose {
            return;
        }
        for line in lines {
            self.print_line(format!("    {}", style(line).dim()));
        }
    }

    /// Flag a build that has not reported for longer than its threshold.
    pub fn show_stalled(&self, idle_secs: i64) {
        self.status_bar.set_message(format!(
            "{}{} (no progress for {}s)",
            WARN,
            style("possibly stalled").yellow(),
            idle_secs
        ));
    }

    /// Stop both bars and print the outcome.
    pub fn finish(&self, record: &BuildRecord) {
        let duration = record
            .duration_seconds
            .map(|secs| format!(" {}{:.1}s", CLOCK, secs))
            .unwrap_or_default();
        self.status_bar.finish_and_clear();
        match record.status {
            BuildStatus::Success => {
                self.progress_bar.finish();
                self.print_line(format!(
                    "{}{}{}",
                    CHECK,
                    style("Build succeeded").green().bold(),
                    duration
                ));
            }
            BuildStatus::Killed => {
                self.progress_bar.abandon();
                self.print_line(format!(
                    "{}{}{}",
                    STOP,
                    style("Build killed").yellow().bold(),
                    duration
                ));
            }
            _ => {
                self.progress_bar.abandon();
                let kind = record
                    .error_type
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "BUILD_ERROR".to_string());
                self.print_line(format!(
                    "{}{} [{}] {}{}",
                    CROSS,
                    style("Build failed").red().bold(),
                    style(kind).red(),
                    record.message,
                    duration
                ));
            }
        }
    }
}

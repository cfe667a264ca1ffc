use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Structured log events for the test-fix cycle.
///
/// Iterations are 1-based and count evaluated test runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LogEvent {
    CycleStarted {
        session_id: String,
        working_dir: PathBuf,
        max_iterations: u32,
        queued_tasks: usize,
    },
    CycleResumed {
        session_id: String,
        completed_iterations: u32,
    },
    TaskDispatched {
        iteration: u32,
        task_id: String,
        kind: String,
        attempt: u32,
    },
    TaskCompleted {
        iteration: u32,
        task_id: String,
        kind: String,
        duration_secs: f64,
    },
    DispatchRetried {
        iteration: u32,
        task_id: String,
        error: String,
    },
    TestsEvaluated {
        iteration: u32,
        total: u32,
        passed: u32,
        pass_rate: f64,
        critical_failures: usize,
    },
    DecisionMade {
        iteration: u32,
        decision: String,
    },
    TaskSynthesized {
        iteration: u32,
        task_id: String,
        strategy: String,
    },
    SynthesisDegraded {
        iteration: u32,
        task_id: String,
        reason: String,
    },
    RollbackPerformed {
        iteration: u32,
        files: usize,
        success: bool,
    },
    CycleFinished {
        outcome: String,
        iterations: u32,
        duration_secs: f64,
    },
}

impl LogEvent {
    /// Add a timestamp to serialize with the event
    fn with_timestamp(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "timestamp".to_string(),
                serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
            );
        }
        value
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format with colors and visual structure
    #[default]
    Pretty,
    /// JSON lines format for machine consumption
    Json,
    /// Compact single-line format
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            _ => Err(format!("Unknown log format: {}", s)),
        }
    }
}

const RULE: &str = "─────────────────────────────────────────────────────────────────────";

/// Logger for cycle events - handles both console output and file logging
pub struct Logger {
    format: LogFormat,
    quiet: bool,
    file_writer: Option<Mutex<File>>,
}

impl Logger {
    pub fn new(format: LogFormat) -> Self {
        Self {
            format,
            quiet: false,
            file_writer: None,
        }
    }

    /// A logger that writes nothing to the console
    pub fn quiet() -> Self {
        Self {
            quiet: true,
            ..Self::new(LogFormat::Compact)
        }
    }

    /// Create a logger with file output in addition to console
    pub fn with_file(format: LogFormat, log_path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        Ok(Self {
            format,
            quiet: false,
            file_writer: Some(Mutex::new(file)),
        })
    }

    pub fn log(&self, event: &LogEvent) {
        // File output is always JSON
        if let Some(ref writer) = self.file_writer {
            if let Ok(mut file) = writer.lock() {
                let json = event.with_timestamp();
                let _ = writeln!(file, "{}", json);
            }
        }

        if self.quiet {
            return;
        }

        match self.format {
            LogFormat::Json => self.log_json(event),
            LogFormat::Pretty => self.log_pretty(event),
            LogFormat::Compact => self.log_compact(event),
        }
    }

    fn log_json(&self, event: &LogEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(std::io::stderr(), "{}", json);
        }
    }

    fn log_pretty(&self, event: &LogEvent) {
        let mut stderr = std::io::stderr();
        match event {
            LogEvent::CycleStarted {
                session_id,
                working_dir,
                max_iterations,
                queued_tasks,
            } => {
                let _ = writeln!(stderr);
                let _ = writeln!(stderr, "{}", format!("╭{}╮", RULE).bright_blue());
                let _ = writeln!(
                    stderr,
                    "{}  {}{}",
                    "│".bright_blue(),
                    "testcycle".bold().bright_white(),
                    " ".repeat(58) + &"│".bright_blue().to_string()
                );
                let _ = writeln!(
                    stderr,
                    "{}  {} {}",
                    "│".bright_blue(),
                    "Session:".dimmed(),
                    Self::truncate_with_padding(session_id, 56, 66).dimmed()
                );
                let _ = writeln!(
                    stderr,
                    "{}  {} {}",
                    "│".bright_blue(),
                    "Dir:".dimmed(),
                    Self::truncate_with_padding(&working_dir.display().to_string(), 60, 70)
                        .dimmed()
                );
                let budget = format!("{} tasks, at most {} iterations", queued_tasks, max_iterations);
                let _ = writeln!(
                    stderr,
                    "{}  {} {}",
                    "│".bright_blue(),
                    "Plan:".dimmed(),
                    Self::truncate_with_padding(&budget, 59, 69).dimmed()
                );
                let _ = writeln!(stderr, "{}", format!("╰{}╯", RULE).bright_blue());
                let _ = writeln!(stderr);
            }
            LogEvent::CycleResumed {
                completed_iterations,
                ..
            } => {
                let _ = writeln!(
                    stderr,
                    "{} Resuming after {} recorded iteration{}",
                    "↻".bright_cyan(),
                    completed_iterations,
                    if *completed_iterations == 1 { "" } else { "s" }
                );
                let _ = writeln!(stderr);
            }
            LogEvent::TaskDispatched {
                task_id,
                kind,
                attempt,
                ..
            } => {
                let retry = if *attempt > 1 {
                    format!(" (attempt {})", attempt)
                } else {
                    String::new()
                };
                let _ = writeln!(
                    stderr,
                    "  {} {} {}{}",
                    "▶".bright_cyan(),
                    kind.to_uppercase().bright_cyan().bold(),
                    task_id.dimmed(),
                    retry.bright_yellow()
                );
            }
            LogEvent::TaskCompleted { duration_secs, .. } => {
                let _ = writeln!(
                    stderr,
                    "    {} Done ({:.1}s)",
                    "✓".bright_green(),
                    duration_secs
                );
            }
            LogEvent::DispatchRetried { error, .. } => {
                let _ = writeln!(
                    stderr,
                    "    {} {} {}",
                    "⚠".bright_yellow(),
                    "Retrying:".bright_yellow(),
                    error
                );
            }
            LogEvent::TestsEvaluated {
                iteration,
                total,
                passed,
                pass_rate,
                critical_failures,
            } => {
                let header = format!("─ Iteration {} ", iteration);
                let padding = "─".repeat(67usize.saturating_sub(header.chars().count()));
                let _ = writeln!(stderr);
                let _ = writeln!(
                    stderr,
                    "{}{}{}",
                    "┌".bright_blue(),
                    header.bright_blue().bold(),
                    padding.bright_blue()
                );
                let rate = format!("{:.1}%", pass_rate);
                let rate = if passed == total {
                    rate.bright_green()
                } else {
                    rate.bright_yellow()
                };
                let _ = writeln!(
                    stderr,
                    "    {}/{} passed ({}), {} critical failure{}",
                    passed,
                    total,
                    rate,
                    critical_failures,
                    if *critical_failures == 1 { "" } else { "s" }
                );
            }
            LogEvent::DecisionMade { decision, .. } => {
                let styled = match decision.as_str() {
                    "SUCCESS" | "PARTIAL_SUCCESS" => {
                        format!("✓ Decision: {}", decision).bright_green().to_string()
                    }
                    "ABORT" | "REGRESSION" | "STUCK" => {
                        format!("✗ Decision: {}", decision).bright_red().to_string()
                    }
                    _ => format!("→ Decision: {}", decision)
                        .bright_yellow()
                        .to_string(),
                };
                let _ = writeln!(stderr, "    {}", styled);
                let _ = writeln!(stderr, "{}", format!("└{}┘", RULE).bright_blue());
                let _ = writeln!(stderr);
            }
            LogEvent::TaskSynthesized {
                task_id, strategy, ..
            } => {
                let _ = writeln!(
                    stderr,
                    "  {} Queued {} ({})",
                    "+".bright_magenta(),
                    task_id.bright_magenta(),
                    strategy
                );
            }
            LogEvent::SynthesisDegraded {
                task_id, reason, ..
            } => {
                let _ = writeln!(
                    stderr,
                    "  {} Analyzer unavailable, queued fallback {}: {}",
                    "⚠".bright_yellow(),
                    task_id.bright_yellow(),
                    reason.dimmed()
                );
            }
            LogEvent::RollbackPerformed { files, success, .. } => {
                if *success {
                    let _ = writeln!(
                        stderr,
                        "  {} Rolled back {} file{}",
                        "↺".bright_yellow(),
                        files,
                        if *files == 1 { "" } else { "s" }
                    );
                } else {
                    let _ = writeln!(stderr, "  {} Rollback failed", "✗".bright_red());
                }
            }
            LogEvent::CycleFinished { .. } => {
                // Rendered by the binary's outcome summary
            }
        }
    }

    fn log_compact(&self, event: &LogEvent) {
        let _ = writeln!(std::io::stderr(), "{}", Self::compact_line(event));
    }

    fn compact_line(event: &LogEvent) -> String {
        let timestamp = chrono::Utc::now().format("%H:%M:%S");
        match event {
            LogEvent::CycleStarted {
                session_id,
                queued_tasks,
                ..
            } => format!("[{}] cycle:start {} tasks={}", timestamp, session_id, queued_tasks),
            LogEvent::CycleResumed {
                completed_iterations,
                ..
            } => format!("[{}] cycle:resume:{}", timestamp, completed_iterations),
            LogEvent::TaskDispatched {
                iteration,
                task_id,
                kind,
                attempt,
            } => format!(
                "[{}] {}:start:{} {} attempt={}",
                timestamp, kind, iteration, task_id, attempt
            ),
            LogEvent::TaskCompleted {
                iteration,
                task_id,
                kind,
                duration_secs,
            } => format!(
                "[{}] {}:done:{} {} {:.1}s",
                timestamp, kind, iteration, task_id, duration_secs
            ),
            LogEvent::DispatchRetried {
                iteration,
                task_id,
                error,
            } => format!("[{}] retry:{} {} {}", timestamp, iteration, task_id, error),
            LogEvent::TestsEvaluated {
                iteration,
                total,
                passed,
                pass_rate,
                critical_failures,
            } => format!(
                "[{}] tests:{} {}/{} {:.1}% critical={}",
                timestamp, iteration, passed, total, pass_rate, critical_failures
            ),
            LogEvent::DecisionMade {
                iteration,
                decision,
            } => format!("[{}] decision:{} {}", timestamp, iteration, decision),
            LogEvent::TaskSynthesized {
                iteration,
                task_id,
                strategy,
            } => format!(
                "[{}] synth:{} {} {}",
                timestamp, iteration, task_id, strategy
            ),
            LogEvent::SynthesisDegraded {
                iteration,
                task_id,
                reason,
            } => format!(
                "[{}] synth:degraded:{} {} {}",
                timestamp, iteration, task_id, reason
            ),
            LogEvent::RollbackPerformed {
                iteration,
                files,
                success,
            } => format!(
                "[{}] rollback:{} files={} ok={}",
                timestamp, iteration, files, success
            ),
            LogEvent::CycleFinished {
                outcome,
                iterations,
                duration_secs,
            } => format!(
                "[{}] cycle:done:{} {} {:.1}s",
                timestamp, iterations, outcome, duration_secs
            ),
        }
    }

    /// Truncate a string and pad to exact width
    fn truncate_with_padding(s: &str, max_len: usize, total_width: usize) -> String {
        let truncated = if s.chars().count() > max_len {
            let head: String = s.chars().take(max_len - 3).collect();
            format!("{}...", head)
        } else {
            s.to_string()
        };

        let padding_needed = total_width.saturating_sub(truncated.chars().count() + 1);
        format!("{}{}│", truncated, " ".repeat(padding_needed))
    }
}

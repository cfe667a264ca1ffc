use std::path::Path;

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;

use testcycle_policy::Decision;
use testcycle_store::{Session, SessionCatalog, SessionSummary};

#[derive(Subcommand, Debug)]
pub enum SessionsAction {
    /// List all sessions
    List {
        /// Filter by outcome (succeeded, partially_succeeded, blocked, active)
        #[arg(long)]
        outcome: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show detailed session info
    Show {
        /// Session ID
        id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

pub fn handle_sessions_command(catalog: &SessionCatalog, action: SessionsAction) -> Result<()> {
    match action {
        SessionsAction::List { outcome, json } => {
            let summaries: Vec<_> = catalog
                .list()?
                .into_iter()
                .filter(|s| match outcome.as_deref() {
                    Some("active") => s.outcome.is_none(),
                    Some(wanted) => s.outcome.as_deref() == Some(wanted),
                    None => true,
                })
                .collect();

            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else if summaries.is_empty() {
                println!("{}", "No sessions found.".dimmed());
            } else {
                print_sessions_table(&summaries);
            }
        }
        SessionsAction::Show { id, json } => {
            let session = catalog.get(&id)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&session)?);
            } else {
                print_session_detail(&session);
            }
        }
    }

    Ok(())
}

/// Print the iteration table of a session, by default the latest one recorded
/// for the working directory
pub fn handle_history_command(
    catalog: &SessionCatalog,
    working_dir: &Path,
    id: Option<String>,
    json: bool,
) -> Result<()> {
    let id = match id {
        Some(id) => id,
        None => match latest_for(catalog, working_dir)? {
            Some(id) => id,
            None => anyhow::bail!("No sessions found for {}", working_dir.display()),
        },
    };
    let session = catalog.get(&id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&session.iterations)?);
    } else {
        print_iterations(&session);
    }
    Ok(())
}

/// Most recent session started in `working_dir`
pub fn latest_for(catalog: &SessionCatalog, working_dir: &Path) -> Result<Option<String>> {
    Ok(catalog
        .list()?
        .into_iter()
        .find(|s| s.working_dir.as_deref() == Some(working_dir))
        .map(|s| s.id))
}

fn print_sessions_table(summaries: &[SessionSummary]) {
    println!(
        "{:<30} {:<20} {:<20} {:<6} {:<8} {}",
        "ID".dimmed(),
        "STARTED".dimmed(),
        "OUTCOME".dimmed(),
        "ITERS".dimmed(),
        "PASS".dimmed(),
        "DIRECTORY".dimmed(),
    );

    for s in summaries {
        let started = s
            .started_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        let outcome = s.outcome.as_deref().unwrap_or("active");
        let pass = s
            .last_pass_rate
            .map(|p| format!("{:.1}%", p))
            .unwrap_or_else(|| "-".to_string());
        let dir = s
            .working_dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_default();

        println!(
            "{:<30} {:<20} {:<20} {:<6} {:<8} {}",
            s.id,
            started,
            color_outcome(outcome),
            s.iterations,
            pass,
            dir
        );
    }
}

fn print_session_detail(session: &Session) {
    println!("{}", "=== Session Detail ===".bright_blue().bold());
    println!("{}  {}", "ID:".dimmed(), session.id);
    if let Some(ref start) = session.start {
        println!(
            "{}  {}",
            "Started:".dimmed(),
            start.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        );
        println!("{}  {}", "Working Dir:".dimmed(), start.working_dir.display());
        println!("{}  {}", "Max Iterations:".dimmed(), start.max_iterations);
    }

    match session.end {
        Some(ref end) => {
            println!("{}  {}", "Outcome:".dimmed(), color_outcome(&end.outcome));
            if let Some(ref reason) = end.reason {
                println!("{}  {}", "Reason:".dimmed(), reason);
            }
            println!(
                "{}  {}",
                "Duration:".dimmed(),
                format_duration(end.duration_secs)
            );
        }
        None => println!("{}  {}", "Status:".dimmed(), "ACTIVE".bright_cyan()),
    }

    println!();
    print_iterations(session);
}

fn print_iterations(session: &Session) {
    if session.iterations.is_empty() {
        println!("{}", "No iterations recorded.".dimmed());
        return;
    }

    println!(
        "{}",
        format!("--- Iterations ({}) ---", session.iterations.len()).dimmed()
    );
    println!(
        "{:<5} {:<9} {:<9} {:<9} {:<16} {}",
        "#".dimmed(),
        "PASS".dimmed(),
        "FAILING".dimmed(),
        "CRITICAL".dimmed(),
        "DECISION".dimmed(),
        "NEXT FIX".dimmed(),
    );
    for record in &session.iterations {
        println!(
            "{:<5} {:<9} {:<9} {:<9} {:<16} {}",
            record.iteration,
            format!("{:.1}%", record.pass_rate),
            record.failures.len(),
            record.critical_failures,
            color_decision(record.decision),
            record.synthesized_task_id.as_deref().unwrap_or("-")
        );
    }
}

fn color_outcome(outcome: &str) -> String {
    match outcome {
        "succeeded" => outcome.bright_green().to_string(),
        "partially_succeeded" => outcome.bright_yellow().to_string(),
        "blocked" => outcome.bright_red().to_string(),
        _ => outcome.bright_cyan().to_string(),
    }
}

fn color_decision(decision: Decision) -> String {
    let label = decision.as_str();
    match decision {
        Decision::Success => label.bright_green().to_string(),
        Decision::PartialSuccess | Decision::Continue => label.bright_yellow().to_string(),
        Decision::Regression | Decision::Stuck | Decision::Abort => label.bright_red().to_string(),
    }
}

fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        format!("{:.0}s", secs)
    } else {
        let mins = (secs / 60.0).floor() as u64;
        let remaining_secs = (secs % 60.0) as u64;
        format!("{}m {}s", mins, remaining_secs)
    }
}

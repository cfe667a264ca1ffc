use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::StoreError;
use crate::types::{Session, SessionLine};

/// Parse a session JSONL file.
///
/// An unparsable final line is a write torn by a crash and is skipped; any
/// other unparsable line is corruption.
pub fn parse_session(path: &Path) -> Result<Session, StoreError> {
    let id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string();

    let file = File::open(path)?;
    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .collect::<Result<_, _>>()?;
    let last_content = lines.iter().rposition(|l| !l.trim().is_empty());

    let mut session = Session {
        id,
        start: None,
        iterations: Vec::new(),
        completed_tasks: Vec::new(),
        end: None,
    };

    for (index, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        let parsed = match serde_json::from_str::<SessionLine>(line) {
            Ok(parsed) => parsed,
            Err(e) if Some(index) == last_content => {
                tracing::warn!(
                    path = %path.display(),
                    line = index + 1,
                    error = %e,
                    "Ignoring torn trailing line in session file"
                );
                break;
            }
            Err(e) => {
                return Err(StoreError::Corrupt {
                    path: path.to_path_buf(),
                    line: index + 1,
                    message: e.to_string(),
                });
            }
        };

        match parsed {
            SessionLine::SessionStart(s) => {
                if session.start.is_none() {
                    session.start = Some(s);
                } else {
                    // Resumed: the earlier end no longer describes the session
                    session.end = None;
                }
            }
            SessionLine::Iteration(record) => {
                // Only strictly increasing iterations count; duplicates from a
                // replayed append are dropped.
                let next = session.iterations.last().map_or(1, |r| r.iteration + 1);
                if record.iteration == next {
                    session.iterations.push(record);
                }
            }
            SessionLine::TaskCompleted(done) => {
                if !session.completed_tasks.contains(&done.task_id) {
                    session.completed_tasks.push(done.task_id);
                }
            }
            SessionLine::SessionEnd(e) => session.end = Some(e),
        }
    }

    Ok(session)
}

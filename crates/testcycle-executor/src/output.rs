use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Output captured from a collaborator process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

impl CommandOutput {
    pub fn new(stdout: String, stderr: String, exit_code: i32, duration: Duration) -> Self {
        Self {
            stdout,
            stderr,
            exit_code,
            duration,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last JSON object printed on stdout.
    ///
    /// Test runners tend to print progress before the report, so lines are
    /// scanned from the end and the first one that parses wins. Falls back to
    /// the whole stdout for pretty-printed reports.
    pub fn parse_json<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        self.stdout
            .lines()
            .rev()
            .map(str::trim)
            .filter(|l| l.starts_with('{'))
            .find_map(|l| serde_json::from_str(l).ok())
            .or_else(|| serde_json::from_str(self.stdout.trim()).ok())
    }

    /// Short tail of stderr for diagnostics
    pub fn stderr_tail(&self, max_lines: usize) -> String {
        let lines: Vec<&str> = self.stderr.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

//! Probe backed by an external speed-test executable

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{Probe, ProbeError};
use crate::config::TestMode;
use crate::result::ProbeSample;

/// CSV delimiter requested from the tool
const CSV_DELIMITER: &str = ";";

/// Zero-based CSV columns holding ping, download and upload
const PING_FIELD: usize = 5;
const DOWNLOAD_FIELD: usize = 6;
const UPLOAD_FIELD: usize = 7;

/// Runs `<command> --csv --csv-delimiter ; [--server ID]` per sample
#[derive(Debug, Clone)]
pub struct CommandProbe {
    command: String,
}

impl CommandProbe {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn build(&self, target: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(["--csv", "--csv-delimiter", CSV_DELIMITER]);
        if let Some(server) = target {
            cmd.args(["--server", server]);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the future on timeout must take the child with it
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Probe for CommandProbe {
    async fn run(&self, mode: TestMode, target: Option<&str>) -> Result<ProbeSample, ProbeError> {
        debug!(command = %self.command, %mode, ?target, "CommandProbe::run: called");
        if mode == TestMode::DryRun {
            return Ok(ProbeSample::default());
        }

        let output = self
            .build(target)
            .output()
            .await
            .map_err(|source| ProbeError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProbeError::Failed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| ProbeError::Malformed("empty output".to_string()))?;
        parse_csv_line(line)
    }

    fn name(&self) -> &str {
        &self.command
    }
}

/// Extract ping, download and upload from one CSV result line
pub fn parse_csv_line(line: &str) -> Result<ProbeSample, ProbeError> {
    let fields: Vec<&str> = line.trim().split(CSV_DELIMITER).collect();
    let field = |index: usize, name: &str| -> Result<f64, ProbeError> {
        let raw = fields
            .get(index)
            .ok_or_else(|| ProbeError::Malformed(format!("missing {} field in {:?}", name, line)))?;
        let value: f64 = raw
            .trim()
            .trim_matches('"')
            .parse()
            .map_err(|_| ProbeError::Malformed(format!("{} is not a number: {:?}", name, raw)))?;
        if !value.is_finite() || value < 0.0 {
            return Err(ProbeError::Malformed(format!("{} out of range: {}", name, value)));
        }
        Ok(value)
    };

    Ok(ProbeSample {
        latency: field(PING_FIELD, "ping")?,
        download_bps: field(DOWNLOAD_FIELD, "download")?,
        upload_bps: field(UPLOAD_FIELD, "upload")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    const SAMPLE_LINE: &str =
        "6421;Example ISP;Springfield;2024-03-09T07:05:03.123456Z;12.5;5.5;55000000.0;11000000.0;;203.0.113.9";

    fn fake_tool(dir: &TempDir, body: &str) -> String {
        let path = dir.path().join("fake-speedtest");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_parse_csv_line() {
        let sample = parse_csv_line(SAMPLE_LINE).unwrap();
        assert_eq!(sample.latency, 5.5);
        assert_eq!(sample.download_bps, 55_000_000.0);
        assert_eq!(sample.upload_bps, 11_000_000.0);
    }

    #[test]
    fn test_parse_csv_line_missing_fields() {
        let err = parse_csv_line("6421;Example ISP;Springfield").unwrap_err();
        assert!(matches!(err, ProbeError::Malformed(_)));
    }

    #[test]
    fn test_parse_csv_line_rejects_non_numbers() {
        let err = parse_csv_line("1;2;3;4;5;fast;7;8").unwrap_err();
        assert!(err.to_string().contains("ping"));
    }

    #[test]
    fn test_parse_csv_line_rejects_negative() {
        assert!(parse_csv_line("1;2;3;4;5;-1;7;8").is_err());
    }

    #[tokio::test]
    async fn test_dry_run_spawns_nothing() {
        let probe = CommandProbe::new("/nonexistent/speedtest");
        let sample = probe.run(TestMode::DryRun, None).await.unwrap();
        assert_eq!(sample, ProbeSample::default());
    }

    #[tokio::test]
    async fn test_missing_command_is_spawn_error() {
        let probe = CommandProbe::new("/nonexistent/speedtest");
        let err = probe.run(TestMode::Quick, None).await.unwrap_err();
        assert!(matches!(err, ProbeError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_runs_tool_and_parses_output() {
        let dir = TempDir::new().unwrap();
        let tool = fake_tool(&dir, &format!("echo '{}'", SAMPLE_LINE));

        let probe = CommandProbe::new(tool);
        let sample = probe.run(TestMode::Quick, Some("6421")).await.unwrap();
        assert_eq!(sample.download_bps, 55_000_000.0);
    }

    #[tokio::test]
    async fn test_passes_server_argument() {
        let dir = TempDir::new().unwrap();
        // Echo the server id back in the ping column
        let tool = fake_tool(&dir, "echo \"1;2;3;4;5;$5;7;8\"");

        let probe = CommandProbe::new(tool);
        let sample = probe.run(TestMode::Quick, Some("42")).await.unwrap();
        assert_eq!(sample.latency, 42.0);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failure() {
        let dir = TempDir::new().unwrap();
        let tool = fake_tool(&dir, "echo boom >&2; exit 3");

        let probe = CommandProbe::new(tool);
        let err = probe.run(TestMode::Full, None).await.unwrap_err();
        match err {
            ProbeError::Failed { code, stderr } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

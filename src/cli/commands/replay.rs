//! Replay command - drive a coordinator from a JSON-lines script.
//!
//! Runs against a manual clock and a recording transport, so the output is a
//! deterministic function of the script and the configuration.

use crate::cli::args::ReplayArgs;
use crate::config::Config;
use crate::session::{RecordingTransport, RecoveryCoordinator, TransportEvent};
use crate::time::ManualClock;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ScriptStep {
    Event { event: TransportEvent },
    Advance { ms: u64 },
    Tick,
    Publish {
        topic: String,
        payload: Value,
        #[serde(default)]
        priority: Option<i32>,
    },
}

pub async fn run_replay(args: ReplayArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.validate()?;
    let steps = load_script(&args.script)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    replay(config, steps, args.summary, &mut out).await
}

/// Parse a script, skipping blank lines and `#` comments.
pub fn parse_script(text: &str) -> Result<Vec<ScriptStep>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("script line {}", n + 1))
        })
        .collect()
}

fn load_script(path: &Path) -> Result<Vec<ScriptStep>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("unable to read script {}", path.display()))?;
    parse_script(&text)
}

/// Run `steps` and write every emitted event as one JSON line.
pub async fn replay<W: Write>(
    config: Config,
    steps: Vec<ScriptStep>,
    summary: bool,
    out: &mut W,
) -> Result<()> {
    let clock = ManualClock::new();
    let transport = Arc::new(RecordingTransport::new());
    let coordinator = RecoveryCoordinator::new(config, clock.clone(), transport.clone());

    for (index, step) in steps.into_iter().enumerate() {
        match step {
            ScriptStep::Event { event } => {
                if let Err(err) = coordinator.handle(event).await {
                    let line = json!({
                        "step": index,
                        "rejected": err.kind(),
                        "details": err.to_string(),
                    });
                    writeln!(out, "{line}")?;
                }
            }
            ScriptStep::Advance { ms } => clock.advance(Duration::from_millis(ms)),
            ScriptStep::Tick => coordinator.tick().await,
            ScriptStep::Publish {
                topic,
                payload,
                priority,
            } => {
                coordinator.publish(topic, payload, priority).await;
            }
        }
        for (connection, event) in transport.take() {
            let line = json!({
                "step": index,
                "atMs": clock.elapsed().as_millis() as u64,
                "connection": connection,
                "event": event,
            });
            writeln!(out, "{line}")?;
        }
    }

    if summary {
        let line = json!({
            "sessions": coordinator.snapshots().await,
            "metrics": coordinator.metrics(),
        });
        writeln!(out, "{line}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_script_skips_comments() {
        let steps = parse_script(
            r#"
# connect a fresh client
{"op":"event","event":{"type":"connected","connection":1}}
{"op":"advance","ms":250}
{"op":"tick"}
"#,
        )
        .unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[1], ScriptStep::Advance { ms: 250 });
    }

    #[test]
    fn test_parse_script_reports_line() {
        let err = parse_script("{\"op\":\"tick\"}\n{\"op\":\"bogus\"}").unwrap_err();
        assert!(format!("{err:#}").contains("script line 2"));
    }

    #[tokio::test]
    async fn test_replay_emits_json_lines() {
        let steps = parse_script(
            r#"{"op":"event","event":{"type":"connected","connection":1}}
{"op":"event","event":{"type":"message","connection":1,"message":{"event":"subscribe","topics":["news"]}}}
{"op":"publish","topic":"news","payload":{"headline":"hi"}}"#,
        )
        .unwrap();
        let mut buf = Vec::new();
        replay(Config::default(), steps, true, &mut buf).await.unwrap();
        let lines: Vec<Value> = String::from_utf8(buf)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines[0]["event"]["event"], "connectionState");
        assert_eq!(lines[1]["event"]["event"], "subscriptionUpdated");
        assert_eq!(lines[2]["event"]["event"], "message");
        assert_eq!(lines[2]["event"]["sequence"], 1);
        assert_eq!(lines[3]["metrics"]["messages_sent"], 1);
    }
}

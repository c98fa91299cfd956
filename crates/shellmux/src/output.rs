use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use shellmux::session::{
    ExecutionOutcome, OutputEvent, OutputSource, SessionEvent, SessionEventKind,
};
use shellmux::ControllerEvent;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Pretty
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize, Debug, PartialEq, Eq)]
struct EventOutput {
    event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<String>,
    detail: String,
    timestamp: String,
}

fn describe(event: &ControllerEvent) -> EventOutput {
    let (event, session, detail) = match event {
        ControllerEvent::Session(SessionEvent { session, kind }) => {
            let (name, detail) = match kind {
                SessionEventKind::StatusChanged { status, reason } => (
                    "status",
                    match reason {
                        Some(reason) => format!("{status}: {reason}"),
                        None => status.to_string(),
                    },
                ),
                SessionEventKind::Identified { interpreter, .. } => {
                    ("identified", interpreter.clone())
                }
                SessionEventKind::Output(output) => ("output", text_preview(&output.data)),
                SessionEventKind::Introspected { method, reply } => {
                    ("introspected", format!("{method} = {reply}"))
                }
            };
            (name, Some(session.to_string()), detail)
        }
        ControllerEvent::OpenFile(path) => ("open_file", None, path.display().to_string()),
        ControllerEvent::Focus => ("focus", None, String::new()),
        ControllerEvent::ShellStarted { id, program } => {
            ("shell_started", Some(id.to_string()), program.clone())
        }
        ControllerEvent::ShellFailed { program, reason } => {
            ("shell_failed", None, format!("{program}: {reason}"))
        }
    };
    EventOutput {
        event,
        session,
        detail,
        timestamp: now_unix_seconds(),
    }
}

pub fn print_event(event: &ControllerEvent, format: OutputFormat) {
    if let (OutputFormat::Raw, ControllerEvent::Session(SessionEvent {
        kind: SessionEventKind::Output(output),
        ..
    })) = (format, event)
    {
        print_raw(output);
        return;
    }

    let out = describe(event);
    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["EVENT", "SESSION", "DETAIL"])
                .add_row(vec![
                    out.event.to_string(),
                    out.session.unwrap_or_default(),
                    out.detail,
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => match out.session {
            Some(session) => println!("[{session}] {} {}", out.event, out.detail),
            None => println!("{} {}", out.event, out.detail),
        },
        OutputFormat::Raw => println!("{}", out.detail),
    }
}

#[derive(Serialize)]
struct StreamOutput<'a> {
    stream: &'a str,
    data: String,
}

/// One chunk of an execution's output.
pub fn print_output(output: &OutputEvent, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&StreamOutput {
            stream: source_name(output.source),
            data: text_preview(&output.data),
        }),
        _ => print_raw(output),
    }
}

#[derive(Serialize)]
struct OutcomeOutput<'a> {
    code: &'a str,
    outcome: String,
}

pub fn print_outcome(code: &str, outcome: &ExecutionOutcome, format: OutputFormat) {
    let outcome = match outcome {
        ExecutionOutcome::Completed => "completed".to_string(),
        ExecutionOutcome::Interrupted => "interrupted".to_string(),
        ExecutionOutcome::Aborted(reason) => format!("aborted: {reason}"),
    };
    match format {
        OutputFormat::Json => print_json(&OutcomeOutput { code, outcome }),
        OutputFormat::Table | OutputFormat::Pretty => eprintln!("[{code}] {outcome}"),
        OutputFormat::Raw => {}
    }
}

/// Result of `shellmux probe`.
#[derive(Serialize, Debug, Default)]
pub struct ProbeOutput {
    pub running: bool,
    pub app: String,
    pub rendezvous: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn print_probe(out: &ProbeOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"])
                .add_row(vec!["running".to_string(), out.running.to_string()])
                .add_row(vec!["app".to_string(), out.app.clone()])
                .add_row(vec!["rendezvous".to_string(), out.rendezvous.clone()]);
            if let Some(pid) = out.pid {
                table.add_row(vec!["pid".to_string(), pid.to_string()]);
            }
            if let Some(version) = &out.version {
                table.add_row(vec!["version".to_string(), version.clone()]);
            }
            if let Some(error) = &out.error {
                table.add_row(vec!["error".to_string(), error.clone()]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            if out.running {
                println!(
                    "{} is running (pid {}, version {}) at {}",
                    out.app,
                    out.pid.map_or_else(|| "?".to_string(), |pid| pid.to_string()),
                    out.version.as_deref().unwrap_or("?"),
                    out.rendezvous
                );
            } else {
                println!("{} is not running at {}", out.app, out.rendezvous);
            }
        }
    }
}

/// A launch handed its arguments to the running instance.
#[derive(Serialize, Debug)]
pub struct ForwardOutput<'a> {
    pub forwarded: bool,
    pub argv: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_pid: Option<u32>,
}

pub fn print_forwarded(out: &ForwardOutput<'_>, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        _ => match out.server_pid {
            Some(pid) => println!("forwarded to running instance (pid {pid})"),
            None => println!("forwarded to running instance"),
        },
    }
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn print_raw(output: &OutputEvent) {
    let _ = match output.source {
        OutputSource::Stdout => write_flush(&mut std::io::stdout(), &output.data),
        OutputSource::Stderr => write_flush(&mut std::io::stderr(), &output.data),
    };
}

fn write_flush(out: &mut impl Write, data: &[u8]) -> std::io::Result<()> {
    out.write_all(data)?;
    out.flush()
}

fn source_name(source: OutputSource) -> &'static str {
    match source {
        OutputSource::Stdout => "stdout",
        OutputSource::Stderr => "stderr",
    }
}

fn text_preview(data: &[u8]) -> String {
    match std::str::from_utf8(data) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", data.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use shellmux::session::{SessionId, SessionStatus};

    use super::*;

    #[test]
    fn describes_status_changes_with_reason() {
        let out = describe(&ControllerEvent::Session(SessionEvent {
            session: SessionId(2),
            kind: SessionEventKind::StatusChanged {
                status: SessionStatus::Crashed,
                reason: Some("peer disconnected".into()),
            },
        }));
        assert_eq!(out.event, "status");
        assert_eq!(out.session.as_deref(), Some("shell-2"));
        assert_eq!(out.detail, "crashed: peer disconnected");
    }

    #[test]
    fn describes_open_file_without_session() {
        let out = describe(&ControllerEvent::OpenFile(PathBuf::from("/work/a.rs")));
        assert_eq!(out.event, "open_file");
        assert_eq!(out.session, None);
        assert_eq!(out.detail, "/work/a.rs");

        let json = serde_json::to_value(&out).unwrap();
        assert!(json.get("session").is_none());
        assert_eq!(json["event"], "open_file");
    }

    #[test]
    fn binary_output_is_summarized() {
        assert_eq!(text_preview(&[0xff, 0xfe]), "<binary 2 bytes>");
        assert_eq!(text_preview(b"ok\n"), "ok\n");
    }
}

//! A toy interpreter that speaks the session protocol.
//!
//! It echoes each submitted line back on stdout. A few prefixes change that:
//!
//! - `err:<text>` writes `<text>` to stderr
//! - `env:<NAME>` prints the value of an environment entry
//! - `sleep:<ms>` runs for that long; an interrupt cuts it short
//! - `exit` says goodbye and disconnects
//!
//! The `shellmux-peer` binary runs it against the controller's socket; the
//! tests run it over in-memory pipes.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use serde_json::{json, Value};
use shellmux_session::protocol::ExecuteRequest;
use shellmux_session::{ControlMessage, IntrospectReply, IntrospectRequest, PeerEndpoint, PeerEvent};
use tracing::debug;

/// Identity announced in the hello.
pub const INTERPRETER: &str = concat!("shellmux-echo ", env!("CARGO_PKG_VERSION"));

/// Names offered by the `complete` introspection method.
const VOCABULARY: &[&str] = &["echo", "env", "err", "exit", "sleep"];

enum Flow {
    Continue,
    Stop,
}

/// The echo interpreter bound to one controller connection.
pub struct EchoPeer {
    peer: PeerEndpoint,
    env: BTreeMap<String, String>,
    backlog: VecDeque<PeerEvent>,
}

impl EchoPeer {
    pub fn new(peer: PeerEndpoint) -> Self {
        Self {
            peer,
            env: BTreeMap::new(),
            backlog: VecDeque::new(),
        }
    }

    /// Entries visible to `env:<NAME>`.
    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    /// Handshake, then serve requests until the controller goes away or
    /// asks us to stop.
    pub async fn run(mut self) -> shellmux_session::Result<()> {
        let info = json!({
            "pid": std::process::id(),
            "controller_pid": self.env.get(crate::CONTROLLER_PID_ENV),
        });
        self.peer.hello(INTERPRETER, info).await?;

        while let Some(event) = self.next().await {
            if let Flow::Stop = self.handle(event).await? {
                break;
            }
        }
        self.peer.shutdown().await;
        Ok(())
    }

    async fn next(&mut self) -> Option<PeerEvent> {
        while let Some(event) = self.backlog.pop_front() {
            match event {
                PeerEvent::Execute(request) if self.peer.is_interrupted(request.id) => {
                    debug!(exec = request.id, "skipping interrupted execution");
                }
                event => return Some(event),
            }
        }
        self.peer.next_event().await
    }

    async fn handle(&mut self, event: PeerEvent) -> shellmux_session::Result<Flow> {
        match event {
            PeerEvent::Execute(request) => self.execute(request).await,
            PeerEvent::Control(control) => self.control(control).await,
            PeerEvent::Introspect { request, body } => {
                let reply = introspect(&body, &self.env);
                self.peer.reply_introspect(&request, &reply).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn control(&mut self, control: ControlMessage) -> shellmux_session::Result<Flow> {
        match control {
            ControlMessage::Interrupt { .. } => {
                // Nothing running: acknowledge so the controller is not left waiting.
                self.peer.ack_interrupt().await?;
                Ok(Flow::Continue)
            }
            ControlMessage::Ping { nonce } => {
                self.peer.pong(nonce).await?;
                Ok(Flow::Continue)
            }
            ControlMessage::Terminate => {
                self.peer.bye().await?;
                Ok(Flow::Stop)
            }
        }
    }

    async fn execute(&mut self, request: ExecuteRequest) -> shellmux_session::Result<Flow> {
        let code = request.code.trim_end_matches(['\r', '\n']);
        debug!(exec = request.id, code, "executing");

        if code.trim() == "exit" {
            self.peer.bye().await?;
            return Ok(Flow::Stop);
        }
        if let Some(text) = code.strip_prefix("err:") {
            self.peer.write_stderr(format!("{text}\n")).await?;
        } else if let Some(name) = code.strip_prefix("env:") {
            let value = self
                .env
                .get(name.trim())
                .map_or("<unset>", String::as_str);
            self.peer.write_stdout(format!("{value}\n")).await?;
        } else if let Some(ms) = code.strip_prefix("sleep:") {
            let ms = ms.trim().parse::<u64>().unwrap_or(0);
            return self.sleep(request.id, Duration::from_millis(ms)).await;
        } else {
            self.peer.write_stdout(format!("{code}\n")).await?;
        }
        self.peer.complete(request.id).await?;
        Ok(Flow::Continue)
    }

    /// Busy for `duration` while staying responsive to control messages.
    async fn sleep(&mut self, exec: u64, duration: Duration) -> shellmux_session::Result<Flow> {
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        loop {
            let event = tokio::select! {
                _ = &mut deadline => break,
                event = self.peer.next_event() => event,
            };
            match event {
                None => return Ok(Flow::Stop),
                Some(PeerEvent::Control(ControlMessage::Interrupt { .. })) => {
                    if !self.peer.is_interrupted(exec) {
                        self.peer.ack_interrupt().await?;
                        continue;
                    }
                    // Queued executions the interrupt covers are skipped by `next`.
                    self.peer.write_stderr("interrupted\n").await?;
                    self.peer.ack_interrupt().await?;
                    return Ok(Flow::Continue);
                }
                Some(PeerEvent::Control(ControlMessage::Ping { nonce })) => {
                    self.peer.pong(nonce).await?;
                }
                Some(PeerEvent::Control(ControlMessage::Terminate)) => {
                    self.peer.bye().await?;
                    return Ok(Flow::Stop);
                }
                Some(other) => self.backlog.push_back(other),
            }
        }
        self.peer.write_stdout(format!("slept {}ms\n", duration.as_millis())).await?;
        self.peer.complete(exec).await?;
        Ok(Flow::Continue)
    }
}

fn introspect(request: &IntrospectRequest, env: &BTreeMap<String, String>) -> IntrospectReply {
    match request.method.as_str() {
        "complete" => {
            let prefix = request
                .params
                .get("prefix")
                .and_then(Value::as_str)
                .unwrap_or("");
            let matches: Vec<&str> = VOCABULARY
                .iter()
                .copied()
                .filter(|word| word.starts_with(prefix))
                .collect();
            IntrospectReply::Ok(json!(matches))
        }
        "calltip" => IntrospectReply::Ok(json!("echo(text) -> text")),
        "inspect" => {
            let name = request.params.get("name").and_then(Value::as_str).unwrap_or("");
            match env.get(name) {
                Some(value) => IntrospectReply::Ok(json!({ "name": name, "value": value })),
                None => IntrospectReply::Error(format!("name '{name}' is not defined")),
            }
        }
        other => IntrospectReply::Error(format!("unknown method '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, params: Value) -> IntrospectRequest {
        IntrospectRequest {
            method: method.to_string(),
            params,
        }
    }

    #[test]
    fn completes_by_prefix() {
        let reply = introspect(&request("complete", json!({"prefix": "e"})), &BTreeMap::new());
        assert_eq!(reply, IntrospectReply::Ok(json!(["echo", "env", "err", "exit"])));

        let reply = introspect(&request("complete", json!({"prefix": "zz"})), &BTreeMap::new());
        assert_eq!(reply, IntrospectReply::Ok(json!([])));
    }

    #[test]
    fn inspect_reads_the_environment() {
        let env = BTreeMap::from([("HOME".to_string(), "/home/me".to_string())]);
        let reply = introspect(&request("inspect", json!({"name": "HOME"})), &env);
        assert_eq!(
            reply,
            IntrospectReply::Ok(json!({"name": "HOME", "value": "/home/me"}))
        );
        assert!(matches!(
            introspect(&request("inspect", json!({"name": "NOPE"})), &env),
            IntrospectReply::Error(_)
        ));
    }

    #[test]
    fn unknown_method_is_an_error() {
        assert_eq!(
            introspect(&request("frobnicate", Value::Null), &BTreeMap::new()),
            IntrospectReply::Error("unknown method 'frobnicate'".to_string())
        );
    }
}

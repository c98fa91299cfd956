use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use shellmux::instance::InstanceConfig;
use shellmux::session::SessionConfig;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod probe;
pub mod run;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Report whether an instance is running.
    Probe,
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(
    command: Option<Command>,
    instance: InstanceArgs,
    launch: RunArgs,
    format: OutputFormat,
) -> CliResult<i32> {
    match command {
        None => run::run(launch, &instance, format),
        Some(Command::Probe) => probe::run(&instance, format),
        Some(Command::Version(args)) => version::run(args),
    }
}

/// Where launches meet the running instance.
#[derive(Args, Debug)]
pub struct InstanceArgs {
    /// Application name; part of the rendezvous path.
    #[arg(long, env = "SHELLMUX_APP", default_value = "shellmux", global = true)]
    pub app: String,

    /// Rendezvous socket path. Default: <runtime dir>/<app>-<uid>.sock.
    #[arg(long, env = "SHELLMUX_RENDEZVOUS", value_name = "PATH", global = true)]
    pub rendezvous: Option<PathBuf>,

    /// How long a probe may take (e.g. 500ms, 2s).
    #[arg(long, env = "SHELLMUX_PROBE_TIMEOUT", default_value = "500ms", global = true)]
    pub probe_timeout: String,

    /// How long forwarding to the running instance may take.
    #[arg(long, env = "SHELLMUX_FORWARD_TIMEOUT", default_value = "2s", global = true)]
    pub forward_timeout: String,
}

impl InstanceArgs {
    pub fn config(&self) -> CliResult<InstanceConfig> {
        if self.app.is_empty() || self.app.contains('/') {
            return Err(CliError::new(
                USAGE,
                format!("invalid app name '{}'", self.app),
            ));
        }
        let mut config = InstanceConfig::new(&self.app)
            .with_probe_timeout(parse_duration(&self.probe_timeout)?)
            .with_forward_timeout(parse_duration(&self.forward_timeout)?);
        if let Some(path) = &self.rendezvous {
            config = config.with_rendezvous(path);
        }
        Ok(config)
    }
}

/// The default command: forward to the running instance or become it.
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Start a shell session running PROGRAM (may include arguments).
    #[arg(long, value_name = "PROGRAM")]
    pub shell: Option<String>,

    /// Files to open.
    #[arg(value_name = "FILE")]
    pub files: Vec<String>,

    /// Code to run in the started shell, in order. Only when this launch
    /// becomes the instance.
    #[arg(long, value_name = "CODE")]
    pub exec: Vec<String>,

    /// Exit after handling this launch's own arguments instead of serving
    /// until Ctrl-C.
    #[arg(long)]
    pub once: bool,

    /// Extra environment marker for spawned interpreters.
    #[arg(long = "marker", value_name = "KEY=VALUE")]
    pub markers: Vec<String>,

    /// How long an interpreter has to connect after launch.
    #[arg(long, env = "SHELLMUX_ACCEPT_TIMEOUT", default_value = "10s")]
    pub accept_timeout: String,

    /// How long an interpreter has to complete its handshake.
    #[arg(long, env = "SHELLMUX_HANDSHAKE_TIMEOUT", default_value = "10s")]
    pub handshake_timeout: String,

    /// How long an interrupted interpreter has to acknowledge.
    #[arg(long, env = "SHELLMUX_INTERRUPT_GRACE", default_value = "3s")]
    pub interrupt_grace: String,

    /// How long a terminated interpreter has to exit before it is killed.
    #[arg(long, env = "SHELLMUX_TERMINATE_GRACE", default_value = "2s")]
    pub terminate_grace: String,
}

impl RunArgs {
    pub fn session_config(&self) -> CliResult<SessionConfig> {
        let mut config = SessionConfig::default()
            .with_handshake_timeout(parse_duration(&self.handshake_timeout)?)
            .with_interrupt_grace(parse_duration(&self.interrupt_grace)?)
            .with_terminate_grace(parse_duration(&self.terminate_grace)?);
        for marker in &self.markers {
            let (key, value) = marker
                .split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .ok_or_else(|| {
                    CliError::new(USAGE, format!("marker must be KEY=VALUE, got '{marker}'"))
                })?;
            config = config.with_marker(key, value);
        }
        Ok(config)
    }

    pub fn accept_timeout(&self) -> CliResult<Duration> {
        parse_duration(&self.accept_timeout)
    }

    /// The command line handed to the argument handler, here or remotely.
    pub fn forwarded_argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.files.len() + 2);
        if let Some(shell) = &self.shell {
            argv.push(format!("--shell={shell}"));
        }
        if self.files.iter().any(|file| file.starts_with('-')) {
            argv.push("--".to_string());
        }
        argv.extend(self.files.iter().cloned());
        argv
    }
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `500ms`, `5s` or a bare number of seconds. Zero is rejected.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn parse_duration_millis() {
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
    }

    #[test]
    fn parse_duration_invalid() {
        assert_eq!(parse_duration("0s").unwrap_err().code, USAGE);
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn forwarded_argv_puts_the_shell_first() {
        let args = RunArgs {
            shell: Some("python3 -i".into()),
            files: vec!["a.py".into(), "-odd".into()],
            ..RunArgs::default()
        };
        assert_eq!(
            args.forwarded_argv(),
            vec!["--shell=python3 -i", "--", "a.py", "-odd"]
        );
        assert!(RunArgs::default().forwarded_argv().is_empty());
    }

    #[test]
    fn markers_must_be_key_value() {
        let args = RunArgs {
            markers: vec!["PROJECT=demo".into()],
            ..with_default_timeouts()
        };
        let config = args.session_config().unwrap();
        assert_eq!(config.markers.get("PROJECT").map(String::as_str), Some("demo"));

        for bad in ["novalue", "=x"] {
            let args = RunArgs {
                markers: vec![bad.into()],
                ..with_default_timeouts()
            };
            assert_eq!(args.session_config().unwrap_err().code, USAGE);
        }
    }

    fn with_default_timeouts() -> RunArgs {
        RunArgs {
            accept_timeout: "10s".into(),
            handshake_timeout: "10s".into(),
            interrupt_grace: "3s".into(),
            terminate_grace: "2s".into(),
            ..RunArgs::default()
        }
    }
}

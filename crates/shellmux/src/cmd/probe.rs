use shellmux::instance::{probe, InstanceError};

use crate::cmd::InstanceArgs;
use crate::exit::{instance_error, CliResult, FAILURE, SUCCESS};
use crate::output::{print_probe, OutputFormat, ProbeOutput};

/// Exit 0 when an instance answers, 1 when nothing listens, and the mapped
/// error code when something listens but the probe fails.
pub fn run(instance: &InstanceArgs, format: OutputFormat) -> CliResult<i32> {
    let config = instance.config()?;
    let mut out = ProbeOutput {
        app: config.app_name.clone(),
        rendezvous: config.rendezvous.display().to_string(),
        ..ProbeOutput::default()
    };

    let code = match probe(&config) {
        Ok(greeting) => {
            out.running = true;
            out.pid = Some(greeting.pid);
            out.version = Some(greeting.version);
            SUCCESS
        }
        Err(InstanceError::NotRunning(_)) => FAILURE,
        Err(err) => {
            out.error = Some(err.to_string());
            instance_error("probe", err).code
        }
    };
    print_probe(&out, format);
    Ok(code)
}

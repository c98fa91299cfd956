use std::sync::Arc;

use shellmux::instance::{
    handle_cmd_args, CommandServer, ForwardedCommand, InstanceConfig, LocalResult,
};
use shellmux::session::{ExecutionOutcome, ProcessSpawner, SessionConfig};
use shellmux::{Controller, ControllerEvent, ControllerHandle, DefaultArgsHandler};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cmd::{InstanceArgs, RunArgs};
use crate::exit::{
    controller_error, instance_error, io_error, CliError, CliResult, FAILURE, INTERNAL, SUCCESS,
};
use crate::output::{
    print_event, print_forwarded, print_outcome, print_output, ForwardOutput, OutputFormat,
};

pub fn run(args: RunArgs, instance: &InstanceArgs, format: OutputFormat) -> CliResult<i32> {
    let config = instance.config()?;
    // Validate everything before touching the rendezvous.
    let session_config = args.session_config()?;
    let argv = args.forwarded_argv();

    match handle_cmd_args(&config, &argv) {
        LocalResult::HandledRemotely { server_pid } => {
            if !args.exec.is_empty() {
                warn!("--exec only applies when this launch becomes the instance");
            }
            print_forwarded(
                &ForwardOutput {
                    forwarded: true,
                    argv: &argv,
                    server_pid,
                },
                format,
            );
            Ok(SUCCESS)
        }
        LocalResult::BecomeServer { stale } => {
            if stale {
                warn!(rendezvous = ?config.rendezvous, "running instance did not answer; taking over");
            }
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| io_error("failed to start runtime", err))?;
            runtime.block_on(serve(config, session_config, args, argv, format))
        }
    }
}

async fn serve(
    config: InstanceConfig,
    session_config: SessionConfig,
    args: RunArgs,
    argv: Vec<String>,
    format: OutputFormat,
) -> CliResult<i32> {
    let mut server = CommandServer::bind(config)
        .map_err(|err| instance_error("failed to become the instance", err))?;
    let commands = server
        .take_commands()
        .ok_or_else(|| CliError::new(INTERNAL, "command queue already taken"))?;
    info!(path = ?server.path(), "serving as the instance");

    let cancel = CancellationToken::new();
    let serving = tokio::spawn(server.serve(cancel.clone()));

    let spawner = ProcessSpawner::new().with_accept_timeout(args.accept_timeout()?);
    let (controller, handle, mut events) =
        Controller::new(Arc::new(spawner), session_config, DefaultArgsHandler);
    let coordinating = tokio::spawn(controller.with_commands(commands).run(cancel.clone()));

    let code = drive(&handle, &mut events, &args, argv, format).await;

    handle.shutdown();
    cancel.cancel();
    if coordinating.await.is_err() {
        warn!("controller task panicked");
    }
    match serving.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "command server failed"),
        Err(_) => warn!("command server task panicked"),
    }
    code
}

/// This launch's own work: its arguments, its `--exec` code, then serving
/// until Ctrl-C unless `--once`.
async fn drive(
    handle: &ControllerHandle<ProcessSpawner>,
    events: &mut mpsc::UnboundedReceiver<ControllerEvent>,
    args: &RunArgs,
    argv: Vec<String>,
    format: OutputFormat,
) -> CliResult<i32> {
    handle
        .dispatch(ForwardedCommand::from_here(argv))
        .await
        .map_err(|err| controller_error("failed to handle arguments", err))?;
    drain(events, format);

    let mut code = SUCCESS;
    for snippet in &args.exec {
        if !execute(handle, events, snippet, format).await? {
            code = FAILURE;
        }
    }

    if args.once {
        drain(events, format);
        return Ok(code);
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted; shutting down");
                break;
            }
            event = events.recv() => match event {
                Some(event) => print_event(&event, format),
                None => break,
            },
        }
    }
    Ok(code)
}

/// Run one snippet in the current shell. True when it completed.
///
/// Ctrl-C while it runs interrupts the interpreter rather than the instance.
async fn execute(
    handle: &ControllerHandle<ProcessSpawner>,
    events: &mut mpsc::UnboundedReceiver<ControllerEvent>,
    snippet: &str,
    format: OutputFormat,
) -> CliResult<bool> {
    let mut execution = handle
        .execute(snippet)
        .await
        .map_err(|err| controller_error("execute failed", err))?;

    loop {
        tokio::select! {
            output = execution.next() => match output {
                Some(output) => print_output(&output, format),
                None => break,
            },
            Some(event) = events.recv() => print_event(&event, format),
            _ = tokio::signal::ctrl_c() => {
                if let Err(err) = handle.interrupt().await {
                    warn!(error = %err, "interrupt failed");
                }
            }
        }
    }

    let outcome = execution
        .outcome()
        .unwrap_or_else(|| ExecutionOutcome::Aborted("no outcome".into()));
    print_outcome(snippet, &outcome, format);
    Ok(outcome == ExecutionOutcome::Completed)
}

fn drain(events: &mut mpsc::UnboundedReceiver<ControllerEvent>, format: OutputFormat) {
    while let Ok(event) = events.try_recv() {
        print_event(&event, format);
    }
}

//! One encode: start a worker for the job and steer it until it exits.

use anyhow::{Context, Result};
use common::{Command, JobDescription, StateSnapshot};
use std::process::{ExitCode, ExitStatus};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{interval, MissedTickBehavior};
use transcoder_server::{ServerConfig, Supervisor};

pub fn encode(config: &ServerConfig, job: JobDescription, json: bool) -> Result<ExitCode> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    let mut supervisor = Supervisor::init(config)?;
    let pid = supervisor.start_worker(&job)?;
    let result = runtime.block_on(drive(&mut supervisor, pid, config, json));

    supervisor.shutdown();
    // Stdin is read on a blocking thread that would otherwise hold us.
    runtime.shutdown_background();

    let (status, last) = result?;
    log::info!("Worker {} exited ({})", pid, status);
    let succeeded = status.success() && last.map_or(false, |state| state.is_done() && state.error == 0);
    Ok(if succeeded { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn drive(
    supervisor: &mut Supervisor,
    pid: u32,
    config: &ServerConfig,
    json: bool,
) -> Result<(ExitStatus, Option<StateSnapshot>)> {
    let mut accept = interval(config.accept_interval());
    accept.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut status = interval(config.state_interval());
    status.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut input_open = true;
    let mut last: Option<StateSnapshot> = None;

    loop {
        tokio::select! {
            _ = accept.tick() => {
                supervisor.accept_pending();
            }
            _ = status.tick() => {
                // Exit first: a worker's final report is on the socket
                // before its process ends.
                let exited = supervisor.worker_exit_status(pid);
                if let Some(state) = supervisor.worker_state(pid) {
                    if last != Some(state) {
                        report(&state, json)?;
                        last = Some(state);
                    }
                }
                if let Some(exit) = exited {
                    return Ok((exit, last));
                }
            }
            line = input.next_line(), if input_open => match line {
                Ok(Some(line)) => match parse_input(&line) {
                    Some(command) => send(supervisor, pid, command),
                    None if line.trim().is_empty() => {}
                    None => log::warn!("Unknown input {:?} (p = pause, r = resume, s = stop)", line.trim()),
                },
                Ok(None) => input_open = false,
                Err(e) => {
                    log::warn!("Could not read stdin: {}", e);
                    input_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, stopping job");
                if !supervisor.is_connected(pid) {
                    anyhow::bail!("Interrupted before worker {} connected", pid);
                }
                send(supervisor, pid, Command::Stop);
            }
        }
    }
}

/// `p`, `r` and `s` (or the full words) steer the job.
fn parse_input(line: &str) -> Option<Command> {
    match line.trim() {
        "p" | "pause" => Some(Command::Pause),
        "r" | "resume" => Some(Command::Resume),
        "s" | "stop" => Some(Command::Stop),
        _ => None,
    }
}

fn send(supervisor: &mut Supervisor, pid: u32, command: Command) {
    let result = match command {
        Command::Pause => supervisor.pause_job(pid),
        Command::Resume => supervisor.resume_job(pid),
        Command::Stop => supervisor.stop_job(pid),
        Command::None | Command::Start => return,
    };
    if let Err(e) = result {
        log::warn!("{} not sent: {}", command, e);
    }
}

fn report(state: &StateSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(state)?);
    } else {
        println!("{}", state);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input("p\n"), Some(Command::Pause));
        assert_eq!(parse_input(" resume "), Some(Command::Resume));
        assert_eq!(parse_input("s"), Some(Command::Stop));
        assert_eq!(parse_input("start"), None);
        assert_eq!(parse_input(""), None);
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::env;
use std::process::ExitCode;

use memoato_vault::config::EngineConfig;
use memoato_vault::error::EngineResult;
use memoato_vault::state::VaultState;
use memoato_vault::telemetry::init_tracing;

const USAGE: &str = "usage: memoato-vault <health | export <user_id>>";

enum Command {
    Health,
    Export(String),
}

fn parse_command(args: &[String]) -> Option<Command> {
    match args {
        [cmd] if cmd == "health" => Some(Command::Health),
        [cmd, user_id] if cmd == "export" && !user_id.trim().is_empty() => {
            Some(Command::Export(user_id.trim().to_string()))
        }
        _ => None,
    }
}

fn run(state: &VaultState, command: Command) -> EngineResult<()> {
    match command {
        Command::Health => {
            state.local.health_check()?;
            println!(
                "{}",
                serde_json::json!({
                    "status": "ok",
                    "dataDir": state.config.data_dir.display().to_string(),
                })
            );
        }
        Command::Export(user_id) => {
            let snapshot = state.local.export(&user_id)?;
            tracing::info!(
                user_id = %user_id,
                categories = snapshot.categories.len(),
                events = snapshot.events.len(),
                "Exported local data"
            );
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = parse_command(&args) else {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    };

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return ExitCode::from(2);
        }
    };
    init_tracing(&config);

    let state = match VaultState::open(config) {
        Ok(state) => state,
        Err(err) => {
            tracing::error!(error = %err, "Failed to open vault state");
            return ExitCode::FAILURE;
        }
    };

    match run(&state, command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "Command failed");
            eprintln!("{}", err.user_message());
            ExitCode::FAILURE
        }
    }
}

#![allow(clippy::result_large_err)]

use anyhow::{anyhow, Context};
use vtn::config::VtnConfig;
use vtn::telemetry;

enum CliCommand {
    Run { config_path: Option<String> },
    Validate { configs: Vec<String> },
    Help,
    ValidateHelp,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing().context("failed to initialise telemetry")?;

    match parse_cli_args()? {
        CliCommand::Run { config_path } => {
            let config = match config_path {
                Some(path) => VtnConfig::load_from(&path)
                    .with_context(|| format!("failed to load configuration from {path}"))?,
                None => VtnConfig::load().context("failed to load configuration")?,
            };

            let app = vtn::app::VtnApp::initialise(config)
                .await
                .context("failed to construct application")?;

            app.run().await.context("application runtime error")
        }
        CliCommand::Validate { configs } => run_validate_command(configs),
        CliCommand::Help => {
            print_help();
            Ok(())
        }
        CliCommand::ValidateHelp => {
            print_validate_help();
            Ok(())
        }
    }
}

fn parse_cli_args() -> anyhow::Result<CliCommand> {
    let mut args = std::env::args().skip(1);
    let Some(first) = args.next() else {
        return Ok(CliCommand::Run { config_path: None });
    };

    if first == "validate" {
        return parse_validate_args(args);
    }

    let mut config_path = None;
    let mut pending = if first == "run" { None } else { Some(first) };

    loop {
        let arg = match pending.take() {
            Some(value) => value,
            None => match args.next() {
                Some(value) => value,
                None => break,
            },
        };

        match arg.as_str() {
            "-c" | "--config" => {
                if config_path.is_some() {
                    anyhow::bail!("config path specified multiple times");
                }
                let value = args
                    .next()
                    .ok_or_else(|| anyhow!("expected path after {arg}"))?;
                config_path = Some(value);
            }
            "-h" | "--help" => return Ok(CliCommand::Help),
            other => anyhow::bail!("unrecognised argument `{other}`"),
        }
    }

    Ok(CliCommand::Run { config_path })
}

fn parse_validate_args<I>(args: I) -> anyhow::Result<CliCommand>
where
    I: IntoIterator<Item = String>,
{
    let mut configs = Vec::new();

    for arg in args {
        match arg.as_str() {
            "-h" | "--help" => return Ok(CliCommand::ValidateHelp),
            other if other.starts_with('-') => {
                anyhow::bail!("unrecognised validate option `{other}`")
            }
            _ => configs.push(arg),
        }
    }

    if configs.is_empty() {
        anyhow::bail!("validate expects at least one config path");
    }

    Ok(CliCommand::Validate { configs })
}

fn print_help() {
    println!(
        "\
Usage: vtn [run] [OPTIONS]
       vtn validate <CONFIG>...

Options:
  -c, --config <PATH>    Load configuration from PATH instead of config/vtn.*
  -h, --help             Print this help message

Environment variables prefixed with VTN__ override file values,
e.g. VTN__PROTOCOL__PORT=8082.
"
    );
}

fn print_validate_help() {
    println!(
        "\
Usage: vtn validate <CONFIG>...

Parses and validates each configuration file without starting listeners.

Options:
  -h, --help             Print this help message
"
    );
}

fn run_validate_command(configs: Vec<String>) -> anyhow::Result<()> {
    let mut had_error = false;

    for path in configs {
        match VtnConfig::load_from(&path) {
            Ok(config) => println!(
                "validated {path} (vtn_id={}, mode={:?}, preregistered={})",
                config.vtn_id,
                config.mode,
                config.preregistration.len()
            ),
            Err(err) => {
                eprintln!("{path}: {err}");
                had_error = true;
            }
        }
    }

    if had_error {
        Err(anyhow!("one or more configs failed validation"))
    } else {
        Ok(())
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use custodian::core::report::CommandFailure;
use custodian::io::config::{self, Config};
use custodian::io::verify::{CommandVerifier, Verifier};
use custodian::{driver, exit_codes, logging};

#[derive(Debug, Parser)]
#[command(name = "custodian", version, about = "Automated repository custodian")]
struct Cli {
    /// Repository working directory.
    #[arg(short = 'C', long = "workdir", global = true, default_value = ".")]
    workdir: PathBuf,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Execute one full custodial run: plan, apply, verify, commit.
    Run,
    /// Run the verification commands only and print the report as JSON.
    Verify,
    /// Print the persisted run state.
    Status,
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("custodian: {err:#}");
        std::process::exit(exit_codes::for_error(&err));
    }
}

fn run(cli: Cli) -> Result<()> {
    let cfg = config::load_config(&cli.workdir.join(config::CONFIG_RELATIVE_PATH))?;
    logging::init(&cfg.logging)?;

    match cli.command {
        CliCommand::Run => {
            let outcome = driver::run_with_config(&cli.workdir, &cfg)?;
            info!(changed = outcome.changed, summary = %outcome.summary, "run finished");
            Ok(())
        }
        CliCommand::Verify => verify(&cli.workdir, &cfg),
        CliCommand::Status => status(&cli.workdir, &cfg),
    }
}

fn verify(workdir: &Path, cfg: &Config) -> Result<()> {
    let verifier = CommandVerifier::new(workdir, cfg.commands.clone(), cfg.output_limit_bytes);
    let report = verifier.verify()?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serialize report")?
    );
    if let Some(failure) = report.first_failure() {
        return Err(anyhow::Error::new(CommandFailure {
            result: failure.clone(),
        }));
    }
    Ok(())
}

fn status(workdir: &Path, cfg: &Config) -> Result<()> {
    let path = workdir.join(&cfg.reliability.state_file);
    match fs::read_to_string(&path) {
        Ok(contents) => print!("{contents}"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => println!("{{}}"),
        Err(err) => {
            return Err(err).with_context(|| format!("read run state {}", path.display()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_subcommands_and_workdir() {
        let cli = Cli::try_parse_from(["custodian", "-C", "/tmp/repo", "run"]).expect("parse");
        assert_eq!(cli.workdir, PathBuf::from("/tmp/repo"));
        assert!(matches!(cli.command, CliCommand::Run));

        let cli = Cli::try_parse_from(["custodian", "verify"]).expect("parse");
        assert_eq!(cli.workdir, PathBuf::from("."));
        assert!(matches!(cli.command, CliCommand::Verify));

        let cli =
            Cli::try_parse_from(["custodian", "status", "--workdir", "/repo"]).expect("parse");
        assert!(matches!(cli.command, CliCommand::Status));
        assert_eq!(cli.workdir, PathBuf::from("/repo"));
    }

    #[test]
    fn cli_requires_a_subcommand() {
        assert!(Cli::try_parse_from(["custodian"]).is_err());
    }
}

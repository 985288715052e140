mod broker;
mod command;
mod config;
mod error;
mod format;
mod protocol;

use crate::broker::KafkaCluster;
use crate::command::{Command, ConsumeCommand, ProduceCommand};
use crate::config::{ConnectionArgs, ConsumeArgs, ProduceArgs, Settings};
use crate::error::CliError;
use clap::{Parser, Subcommand};
use log::debug;
use std::io;
use std::process::ExitCode;

/// kafka-cli is a console util tool to access kafka cluster
#[derive(Debug, Parser)]
#[command(name = "kafka-cli", version, about = "kafka-cli utility")]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(subcommand)]
    command: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// consume topic from kafka
    Consume(ConsumeArgs),
    /// produce message
    Produce(ProduceArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.connection.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if !e.already_reported() {
                eprintln!("ERROR: {}", e);
            }
            ExitCode::from(255)
        }
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .target(env_logger::Target::Stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let Cli {
        connection,
        command,
    } = cli;

    let (settings, command): (Settings, Box<dyn Command>) = match command {
        Action::Consume(args) => {
            let settings = Settings::load(&connection, Some(args.tuning.clone()))?;
            let command = ConsumeCommand::from_args(args, settings.buffer_size)?;
            (settings, Box::new(command))
        }
        Action::Produce(args) => {
            let settings = Settings::load(&connection, None)?;
            (settings, Box::new(ProduceCommand::from(args)))
        }
    };
    debug!("Resolved settings: {:?}", settings);

    if connection.log_auth_msg {
        println!("{}", settings.auth_log());
    }

    let cluster = KafkaCluster::connect(settings).await?;
    let result = command.execute(&cluster, &mut io::stdout()).await;
    cluster.close();
    result
}

mod cli;
mod commands;
mod output;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            bind,
            port,
            ephemeral,
            store_path,
            rotate_token,
            dev,
            no_auto_reconcile,
        } => {
            commands::serve(
                bind,
                port,
                ephemeral,
                store_path,
                rotate_token,
                dev,
                no_auto_reconcile,
            )
            .await
        }
        Command::Create {
            name,
            manifest,
            deployment,
            now,
        } => commands::create(&cli.url, cli.token, name, manifest, deployment, now).await,
        Command::Reconcile { id } => commands::reconcile(&cli.url, cli.token, id).await,
        Command::List => commands::list(&cli.url, cli.token).await,
        Command::Status => commands::status(&cli.url, cli.token).await,
        Command::Drift { id } => commands::drift(&cli.url, cli.token, id).await,
        Command::Stop { id } => commands::stop(&cli.url, cli.token, id).await,
        Command::Restart { id } => commands::restart(&cli.url, cli.token, id).await,
        Command::Destroy { id } => commands::destroy(&cli.url, cli.token, id).await,
        Command::Logs { id, tail } => commands::logs(&cli.url, cli.token, id, tail).await,
        Command::Doctor { id } => commands::doctor(&cli.url, cli.token, id).await,
        Command::Events { instance, limit } => {
            commands::events(&cli.url, cli.token, instance, limit).await
        }
    }
}

use clap::Parser;
use eyre::Result;

use tiller::cli::{Cli, Commands};
use tiller::commands::{
    CheckpointsCommand, Command, EventsCommand, MessagesCommand, SessionsCommand,
};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // Level configured via RUST_LOG
    tiller_core::utils::tracing::init_tracing()?;

    let store = cli.store()?;
    let command: Box<dyn Command> = match cli.command {
        Commands::Sessions { limit } => Box::new(SessionsCommand { store, limit }),
        Commands::Events { branch, from, json } => Box::new(EventsCommand {
            store,
            branch,
            from,
            json,
        }),
        Commands::Messages { branch, history } => Box::new(MessagesCommand {
            store,
            branch,
            history,
        }),
        Commands::Checkpoints { branch } => Box::new(CheckpointsCommand { store, branch }),
    };

    command.execute(&mut std::io::stdout()).await
}

use clap::{Parser, Subcommand};
use colored::Colorize;

mod commands;

/// spfn - codegen and route tooling for spfn services
#[derive(Parser)]
#[command(name = "spfn")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all configured generators once
    Generate(commands::generate::GenerateArgs),
    /// Watch the route tree and regenerate on changes
    Watch(commands::watch::WatchArgs),
    /// List the contracts discovered in the route tree
    Routes(commands::routes::RoutesArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Generate(args) => commands::generate::execute(args).await,
        Commands::Watch(args) => commands::watch::execute(args).await,
        Commands::Routes(args) => commands::routes::execute(args).await,
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);

            if let Some(source) = e.source() {
                eprintln!("\n{} {}", "Caused by:".yellow(), source);
            }

            std::process::exit(1);
        }
    }
}

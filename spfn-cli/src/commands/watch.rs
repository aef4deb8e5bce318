use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use spfn_service::codegen::{load_codegen_config, GeneratorRegistry, Orchestrator};

#[derive(Args)]
pub struct WatchArgs {
    /// Project directory
    #[arg(long, default_value = ".")]
    pub project_root: PathBuf,
}

pub async fn execute(args: WatchArgs) -> Result<()> {
    let ctx = super::generator_context(&args.project_root)?;
    let config = load_codegen_config(&ctx.project_root);
    let registry = GeneratorRegistry::with_builtins();
    let orchestrator = Orchestrator::from_config(&config, &registry, ctx);

    let names = orchestrator.generator_names();
    if names.is_empty() {
        println!("{}", "No generators configured.".yellow());
        return Ok(());
    }

    println!(
        "{} {} {}",
        "Watching with generators:".bold(),
        names.join(", ").cyan(),
        "(Ctrl+C to stop)".dimmed()
    );

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            token.cancel();
        });
    }

    orchestrator.watch(token).await?;
    println!("{}", "Watcher stopped.".green());
    Ok(())
}

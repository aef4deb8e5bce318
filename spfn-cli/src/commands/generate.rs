use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use spfn_service::codegen::{load_codegen_config, GeneratorRegistry, Orchestrator};

#[derive(Args)]
pub struct GenerateArgs {
    /// Project directory
    #[arg(long, default_value = ".")]
    pub project_root: PathBuf,
}

pub async fn execute(args: GenerateArgs) -> Result<()> {
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
        "{} {}",
        "Running generators:".bold(),
        names.join(", ").cyan()
    );
    orchestrator.generate_all().await;
    println!("{}", "Done.".green().bold());
    Ok(())
}

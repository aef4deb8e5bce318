use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use spfn_service::scanner::{scan_contracts, ScanOptions};

#[derive(Args)]
pub struct RoutesArgs {
    /// Project directory
    #[arg(long, default_value = ".")]
    pub project_root: PathBuf,

    /// Emit JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: RoutesArgs) -> Result<()> {
    let ctx = super::generator_context(&args.project_root)?;
    let contracts = scan_contracts(&ScanOptions::new(&ctx.route_dir));

    if args.json {
        println!("{}", serde_json::to_string_pretty(&contracts)?);
        return Ok(());
    }

    if contracts.is_empty() {
        println!(
            "{} {}",
            "No contracts found under".yellow(),
            ctx.route_dir.display()
        );
        return Ok(());
    }

    let method_width = contracts.iter().map(|c| c.method.len()).max().unwrap_or(6);
    let path_width = contracts.iter().map(|c| c.path.len()).max().unwrap_or(4);

    println!(
        "{}  {}  {}",
        format!("{:<method_width$}", "METHOD").bold(),
        format!("{:<path_width$}", "PATH").bold(),
        "CONTRACT".bold(),
    );
    for contract in &contracts {
        println!(
            "{}  {:<path_width$}  {} {}",
            format!("{:<method_width$}", contract.method).green(),
            contract.path,
            contract.contract_name.cyan(),
            format!("({})", contract.import_path).dimmed(),
        );
    }
    println!("\n{} route(s)", contracts.len());
    Ok(())
}

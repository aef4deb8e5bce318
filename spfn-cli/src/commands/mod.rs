pub mod generate;
pub mod routes;
pub mod watch;

use std::path::{Path, PathBuf};

use spfn_service::codegen::GeneratorContext;

/// Resolve the generator context for a project directory
///
/// The route directory comes from `spfn.toml` when present, falling back to
/// the conventional `src/server/routes`.
pub fn generator_context(project_root: &Path) -> anyhow::Result<GeneratorContext> {
    let project_root = project_root
        .canonicalize()
        .unwrap_or_else(|_| project_root.to_path_buf());

    let config_path = project_root.join("spfn.toml");
    let routes_dir = if config_path.exists() {
        spfn_service::config::Config::load_from(
            config_path
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("project path is not valid UTF-8"))?,
        )?
        .routes
        .dir
    } else {
        PathBuf::from("src/server/routes")
    };

    Ok(GeneratorContext {
        route_dir: project_root.join(routes_dir),
        out_dir: project_root.join("src/generated"),
        project_root,
    })
}

//! Standalone binary to validate a router configuration directory.
//! Checks every model against the hardware profile, every provider record,
//! and every workflow file. Exits non-zero on any problem.

use anyhow::Context;
use llm_router::config::ConfigLoader;
use llm_router::providers::{build_provider, Provider};
use llm_router::registry::ModelRegistry;
use llm_router::workflow::WorkflowLoader;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let loader = match std::env::args().nth(1) {
        Some(dir) => ConfigLoader::new(PathBuf::from(dir)),
        None => ConfigLoader::from_env(),
    };
    println!("Using config directory: {}", loader.base_path().display());

    let config = match loader.load() {
        Ok(c) => c,
        Err(e) => {
            println!("❌ {}", e);
            std::process::exit(1);
        }
    };

    let mut errors = Vec::new();

    println!("\n=== Models ===");
    let mut registry = ModelRegistry::from_descriptors(config.models.clone())
        .context("model descriptors are inconsistent")?;
    let report = registry.validate_all(&config.profile);
    for id in report.usable() {
        println!("{}... ✅", id);
    }
    for (id, reason) in report.unusable() {
        println!("{}... ❌ {}", id, reason);
        errors.push(format!("  model {}: {}", id, reason));
    }

    println!("\n=== Providers ===");
    for p in &config.providers {
        print!("{}... ", p.name);
        match build_provider(p, &config.profile).and_then(|provider| provider.validate_config()) {
            Ok(()) => println!("✅"),
            Err(e) => {
                println!("❌");
                errors.push(format!("  provider {}: {}", p.name, e));
            }
        }
    }

    println!("\n=== Workflows ===");
    match &config.settings.workflows_dir {
        Some(dir) if dir.exists() => {
            let workflows = WorkflowLoader::open(dir)
                .await
                .with_context(|| format!("cannot open {}", dir.display()))?;
            for (path, outcome) in workflows.check_all().await? {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                match outcome {
                    Ok(_) => println!("{}... ✅", name),
                    Err(e) => {
                        println!("{}... ❌", name);
                        errors.push(format!("  workflow {}: {}", name, e));
                    }
                }
            }
        }
        Some(dir) => println!("{} not found, skipping workflow validation", dir.display()),
        None => println!("No workflows_dir configured, skipping workflow validation"),
    }

    println!("\n=== Summary ===");
    if errors.is_empty() {
        println!("✅ Configuration is valid");
        Ok(())
    } else {
        println!("❌ Found {} problem(s):\n", errors.len());
        for err in &errors {
            println!("{}", err);
        }
        std::process::exit(1);
    }
}

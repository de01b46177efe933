//! envbuild CLI
//!
//! Builds layered environment images from declarative recipes: a base
//! rootfs, package installs, verified remote installers and cleanups.
//!
//! # Usage
//!
//! ```bash
//! # Import a base rootfs (e.g. an extracted ubuntu:22.04 tarball)
//! envbuild base import ubuntu:22.04 ./ubuntu-rootfs
//!
//! # Check a recipe without running anything
//! envbuild validate recipes/rust-qemu-dev.toml
//!
//! # Host checks only
//! envbuild preflight recipes/rust-qemu-dev.toml
//!
//! # Build (skips if the tag is already up to date)
//! sudo envbuild build recipes/rust-qemu-dev.toml
//!
//! # Inspect results
//! envbuild list
//! envbuild inspect rust-qemu-dev
//! envbuild status
//! ```
//!
//! Diagnostics go to stderr through `tracing`; set `ENVBUILD_LOG=envbuild=debug`
//! to see every command the builder runs.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use envbuild::cancel::{self, cancel_on_ctrl_c};
use envbuild::config::BuilderConfig;
use envbuild::fetch::{Fetcher, HttpsFetcher};
use envbuild::image::{BaseImage, EnvironmentImage, ImageStore};
use envbuild::preflight::PreflightChecker;
use envbuild::recipe::Recipe;
use envbuild::step::EnvironmentBuilder;

const LOG_ENV: &str = "ENVBUILD_LOG";

#[derive(Parser)]
#[command(name = "envbuild")]
#[command(author, version, about = "Layered environment image builder", long_about = None)]
struct Cli {
    /// Image store directory (overrides config and ENVBUILD_STORE)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Config file (default: ./envbuild.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the image described by a recipe
    Build {
        recipe: PathBuf,
        /// Rebuild even if the tag already points at an up-to-date image
        #[arg(long)]
        force: bool,
        /// Do not run host checks before building
        #[arg(long)]
        skip_preflight: bool,
    },

    /// Validate a recipe and its steps without running anything
    Validate { recipe: PathBuf },

    /// Run host checks for a recipe
    Preflight { recipe: PathBuf },

    /// Manage base images
    Base {
        #[command(subcommand)]
        command: BaseCommand,
    },

    /// List built images
    List,

    /// Show metadata of an image (id or tag)
    Inspect { reference: String },

    /// Remove an image (id or tag) and the tags pointing at it
    Rm { reference: String },

    /// Show configuration and store status
    Status,
}

#[derive(Subcommand)]
enum BaseCommand {
    /// Import a rootfs directory as name:tag
    Import { reference: String, dir: PathBuf },
    /// List imported base images
    List,
    /// Remove an imported base image
    Rm { reference: String },
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let result = run(cli).await;

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("envbuild=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = BuilderConfig::resolve(cli.config.as_deref(), cli.store)?;

    match cli.command {
        Commands::Build {
            recipe,
            force,
            skip_preflight,
        } => cmd_build(config, &recipe, force, skip_preflight).await,
        Commands::Validate { recipe } => cmd_validate(&config, &recipe),
        Commands::Preflight { recipe } => cmd_preflight(&config, &recipe).await,
        Commands::Base { command } => match command {
            BaseCommand::Import { reference, dir } => cmd_base_import(&config, &reference, &dir),
            BaseCommand::List => cmd_base_list(&config),
            BaseCommand::Rm { reference } => cmd_base_rm(&config, &reference),
        },
        Commands::List => cmd_list(&config),
        Commands::Inspect { reference } => cmd_inspect(&config, &reference),
        Commands::Rm { reference } => cmd_rm(&config, &reference),
        Commands::Status => cmd_status(&config),
    }
}

async fn cmd_build(
    config: BuilderConfig,
    recipe_path: &Path,
    force: bool,
    skip_preflight: bool,
) -> Result<()> {
    let recipe = Recipe::load(recipe_path)?;
    // Malformed steps are rejected before preflight touches the network.
    recipe
        .validate_steps(config.require_pinned_versions)
        .with_context(|| format!("Invalid recipe {}", recipe_path.display()))?;

    let store = ImageStore::open(&config.store_dir)?;
    let fetcher: Arc<dyn Fetcher> =
        Arc::new(HttpsFetcher::new(&config).context("Failed to create HTTPS client")?);

    if skip_preflight {
        println!("[SKIP] Preflight checks (--skip-preflight)\n");
    } else {
        let report = PreflightChecker::new(&config, &store)
            .run_all(&recipe, fetcher.as_ref())
            .await;
        if !report.is_ok() {
            report.print_summary();
            bail!("Preflight checks failed; fix the issues above or pass --skip-preflight");
        }
        println!(
            "Preflight: {}/{} checks passed",
            report.passed_count(),
            report.total_count()
        );
    }

    let (handle, signal) = cancel::channel();
    cancel_on_ctrl_c(handle);

    let mut builder = EnvironmentBuilder::new(config, store, fetcher, signal);
    let image = builder
        .build(&recipe.build_request(force))
        .await
        .with_context(|| format!("Build of {} failed", recipe_path.display()))?;

    match &image.tag {
        Some(tag) => println!("{} -> {}", tag, image.id),
        None => println!("{}", image.id),
    }
    Ok(())
}

fn cmd_validate(config: &BuilderConfig, recipe_path: &Path) -> Result<()> {
    let recipe = Recipe::load(recipe_path)?;
    let steps = recipe
        .validate_steps(config.require_pinned_versions)
        .with_context(|| format!("Invalid recipe {}", recipe_path.display()))?;

    println!("Recipe: {}", recipe_path.display());
    println!("  Base: {}", recipe.base);
    if let Some(tag) = &recipe.image.tag {
        println!("  Tag:  {}", tag);
    }
    for step in &steps {
        println!("[OK] {}: {}", step.step_ref(), step.summary());
    }
    if !recipe.verify.is_empty() {
        println!(
            "[OK] verify: {} executable(s), {} empty dir(s)",
            recipe.verify.executables.len(),
            recipe.verify.empty_dirs.len()
        );
    }
    println!("\nRecipe is valid ({} steps)", steps.len());
    Ok(())
}

async fn cmd_preflight(config: &BuilderConfig, recipe_path: &Path) -> Result<()> {
    let recipe = Recipe::load(recipe_path)?;
    let store = ImageStore::open(&config.store_dir)?;
    let fetcher = HttpsFetcher::new(config).context("Failed to create HTTPS client")?;

    let report = PreflightChecker::new(config, &store)
        .run_all(&recipe, &fetcher)
        .await;
    report.print_summary();

    if !report.is_ok() {
        bail!("{} preflight check(s) failed", report.errors().len());
    }
    Ok(())
}

fn cmd_base_import(config: &BuilderConfig, reference: &str, dir: &Path) -> Result<()> {
    let base: BaseImage = reference.parse()?;
    let store = ImageStore::open(&config.store_dir)?;

    println!("Importing {} from {}...", base, dir.display());
    let record = store.import_base(&base, dir)?;
    println!("[OK] {} ({})", record.base, EnvironmentImage::short_id(&record.digest));
    Ok(())
}

fn cmd_base_list(config: &BuilderConfig) -> Result<()> {
    let store = ImageStore::open(&config.store_dir)?;
    let bases = store.list_bases()?;
    if bases.is_empty() {
        println!("No base images. Import one with 'envbuild base import <name:tag> <dir>'");
        return Ok(());
    }
    println!("{:<32} {:<14} IMPORTED", "BASE", "DIGEST");
    for record in bases {
        println!(
            "{:<32} {:<14} {}",
            record.base.to_string(),
            EnvironmentImage::short_id(&record.digest),
            record.imported_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

fn cmd_base_rm(config: &BuilderConfig, reference: &str) -> Result<()> {
    let base: BaseImage = reference.parse()?;
    let store = ImageStore::open(&config.store_dir)?;
    store.remove_base(&base)?;
    println!("Removed base {}", base);
    Ok(())
}

fn cmd_list(config: &BuilderConfig) -> Result<()> {
    let store = ImageStore::open(&config.store_dir)?;
    let images = store.list_images()?;
    if images.is_empty() {
        println!("No images.");
        return Ok(());
    }
    println!("{:<14} {:<20} {:<24} {:>6}  BUILT", "ID", "TAG", "BASE", "STEPS");
    for image in images {
        // A tag recorded at build time may since have moved to a newer image.
        let tag = image
            .tag
            .as_deref()
            .filter(|t| store.read_tag(t).ok().flatten().as_deref() == Some(image.id.as_str()))
            .unwrap_or("-");
        println!(
            "{:<14} {:<20} {:<24} {:>6}  {}",
            image.id,
            tag,
            image.base.to_string(),
            image.steps.len(),
            image.built_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

fn cmd_inspect(config: &BuilderConfig, reference: &str) -> Result<()> {
    let store = ImageStore::open(&config.store_dir)?;
    let image = store.resolve(reference)?;
    println!("{}", serde_json::to_string_pretty(&image)?);
    Ok(())
}

fn cmd_rm(config: &BuilderConfig, reference: &str) -> Result<()> {
    let store = ImageStore::open(&config.store_dir)?;
    let image = store.remove(reference)?;
    println!("Removed {}", image.id);
    Ok(())
}

fn cmd_status(config: &BuilderConfig) -> Result<()> {
    println!("envbuild Status");
    println!("===============");
    println!();
    println!("Configuration:");
    println!("  Store:          {}", config.store_dir.display());
    println!("  Isolation:      {}", config.isolation);
    println!("  Step timeout:   {}s", config.step_timeout_secs);
    println!("  Fetch timeout:  {}s", config.fetch_timeout_secs);
    println!("  Minimum TLS:    {}", config.min_tls);
    println!(
        "  Pinned versions: {}",
        if config.require_pinned_versions { "required" } else { "optional" }
    );
    println!();

    if !config.store_dir.exists() {
        println!("Store: NOT CREATED (run 'envbuild base import <name:tag> <dir>')");
        return Ok(());
    }

    let store = ImageStore::open(&config.store_dir)?;
    let bases = store.list_bases()?;
    let images = store.list_images()?;
    let stale = store.stale_work_dirs()?;

    println!("Store:");
    println!("  Base images:    {}", bases.len());
    println!("  Images:         {}", images.len());
    if let Some(latest) = images.first() {
        println!(
            "  Latest:         {} ({})",
            latest.id,
            latest.built_at.format("%Y-%m-%d %H:%M")
        );
    }
    if !stale.is_empty() {
        println!("  Stale work dirs: {} (left by interrupted builds)", stale.len());
        for dir in &stale {
            println!("    {}", dir.display());
        }
    }
    Ok(())
}

//! Entry point for the `portable` builder.
//!
//! Parses the command line, installs logging and hands explicit values to the
//! library. Failed trees are reported with their stage, log and the end of
//! the log. Error handling is done via `anyhow`.

use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::sync::Arc;

use portable::config::{Command, Config, ToolchainAction};
use portable::fetch::CurlFetcher;
use portable::pipeline::{Pipeline, StageError, LOG_TAIL};
use portable::process::SystemRunner;
use portable::record::file_manifest;
use portable::relocate::{Change, Relocator};
use portable::toolchain::ToolchainSource;
use portable::verify::Verifier;
use portable::{logging, Error};

fn main() -> Result<()> {
    let config = Config::parse();
    logging::init(&config.log_level);

    match &config.command {
        Command::Build(args) => {
            let request = args.request()?;
            let dirs = config.dirs()?;
            dirs.create().context("failed to create data directory")?;
            let catalog = args.catalog.catalog(request.platform, &dirs)?;
            let pipeline = Pipeline::new(
                dirs,
                request.platform,
                catalog,
                Arc::new(SystemRunner),
                Arc::new(CurlFetcher::default()),
            );

            let results = pipeline.build(&request);
            let total = results.len();
            let mut failed = 0;
            for result in results {
                match result {
                    Ok(outcome) => println!("{}", outcome.tree.root.display()),
                    Err(err) => {
                        failed += 1;
                        report(&err);
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{failed} of {total} trees failed");
            }
        }
        Command::Toolchain { action } => {
            let (args, from_recipe) = match action {
                ToolchainAction::Fetch(args) => (args, false),
                ToolchainAction::Build(args) => (args, true),
            };
            let platform = args.target.platform()?;
            let pairs = args.pairs(platform)?;
            let dirs = config.dirs()?;
            dirs.create().context("failed to create data directory")?;
            let catalog = args.catalog.catalog(platform, &dirs)?;
            for &pair in &pairs {
                let recipe = matches!(catalog.get(pair), Some(ToolchainSource::Recipe { .. }));
                if recipe != from_recipe {
                    return Err(Error::ToolchainUnavailable { pair }.into());
                }
            }
            let pipeline = Pipeline::new(
                dirs,
                platform,
                catalog,
                Arc::new(SystemRunner),
                Arc::new(CurlFetcher::default()),
            );
            for pair in pairs {
                let toolchain = pipeline
                    .toolchains()
                    .acquire(pair)
                    .with_context(|| format!("failed to acquire toolchain for {pair}"))?;
                println!("{pair}: {}", toolchain.root.display());
            }
        }
        Command::Relocate(args) => {
            let relocator = Relocator::new(&args.root, args.options()?)?;
            let summary = relocator
                .relocate_tree()
                .with_context(|| format!("failed to relocate {}", args.root.display()))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Fix(args) => {
            let options = args.options()?;
            for file in &args.files {
                let root = args.root_for(file)?;
                let change = Relocator::new(&root, options.clone())?
                    .fix(file)
                    .with_context(|| format!("failed to fix {}", file.display()))?;
                let state = match change {
                    Change::Changed => "changed",
                    Change::Unchanged => "unchanged",
                };
                println!("{state} {}", file.display());
            }
        }
        Command::Verify(args) => {
            let dirs = config.dirs()?;
            fs::create_dir_all(&dirs.logs).context("failed to create log directory")?;
            let report = Verifier::new(
                Arc::new(SystemRunner),
                args.options(),
                dirs.logs.join("verify.log"),
            )
            .verify(&args.root)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            report.into_result()?;
        }
        Command::Manifest { root } => {
            let files = file_manifest(root)
                .with_context(|| format!("failed to list {}", root.display()))?;
            println!("{}", serde_json::to_string_pretty(&files)?);
        }
    }
    Ok(())
}

fn report(err: &StageError) {
    eprintln!("error: {err}");
    if let Some(log) = &err.log {
        eprintln!("  log: {}", log.display());
    }
    if let Error::RelocationOverflow {
        path,
        required,
        available,
    } = &err.source
    {
        eprintln!(
            "  {} needs {required} bytes for its search path but only {available} are available; \
             rebuild under a longer prefix",
            path.display()
        );
    }
    if !err.tail.is_empty() {
        eprintln!("  last {LOG_TAIL} bytes of the log:");
        for line in err.tail.lines() {
            eprintln!("    {line}");
        }
    }
}

pub mod batching;
pub mod changelog;
pub mod config;
pub mod convert;
pub mod docs;
pub mod enrich;
pub mod error;
pub mod frontmatter;
pub mod gitops;
pub mod grouping;
pub mod llm;
pub mod load_config;
pub mod rate_limit;
pub mod redirects;
pub mod sitemap;
pub mod tokens;
pub mod validate;
pub mod versioning;

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::convert::{ChatdocClient, ConvertOptions};
use crate::gitops::GitRepo;
use crate::llm::GeminiClient;
use crate::load_config::load_config;

/// CLI for qmd-pipeline: build and maintain a QMD documentation corpus.
#[derive(Parser)]
#[clap(
    name = "qmd-pipeline",
    version,
    about = "Group, enrich, version and publish a QMD documentation corpus"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Regroup the source tree into the publish tree by frontmatter category
    Group {
        /// Path to the YAML config file
        #[clap(long)]
        config: Option<PathBuf>,
    },
    /// Validate frontmatter and categories across the publish tree
    Validate {
        #[clap(long)]
        config: Option<PathBuf>,
        /// Tree to validate instead of the configured publish tree
        #[clap(long)]
        source: Option<PathBuf>,
    },
    /// Generate introductions and keywords for changed documents
    Enrich {
        #[clap(long)]
        config: Option<PathBuf>,
        /// File listing document paths that must be re-generated (one per line)
        #[clap(long)]
        modified_list: Option<PathBuf>,
    },
    /// Update semantic versions and changelogs from git history
    Version {
        #[clap(long)]
        config: Option<PathBuf>,
        /// Plan batches and log decisions without calling the API or writing
        #[clap(long)]
        dry_run: bool,
    },
    /// Append rendered Change Log sections to published documents
    InjectChangelog {
        #[clap(long)]
        config: Option<PathBuf>,
    },
    /// Refresh URL mappings and emit redirect pages
    Redirects {
        #[clap(long)]
        config: Option<PathBuf>,
    },
    /// Remove non-browsable entries from a sitemap
    Sitemap {
        /// Path to sitemap.xml
        path: PathBuf,
        /// URL fragment marking entries to remove
        #[clap(long)]
        marker: Option<String>,
    },
    /// Convert PDFs to QMD through the parsing API
    Convert {
        /// PDF files to convert
        #[clap(required = true)]
        pdfs: Vec<PathBuf>,
        /// Re-upload and overwrite existing QMD files
        #[clap(long)]
        force: bool,
        #[clap(long)]
        config: Option<PathBuf>,
    },
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Group { config } => {
            let config = load_config(config.as_deref())?;
            println!("Grouping starting...");
            let report = grouping::run(&config)?;
            println!("Grouping complete.\nReport:\n{report:#?}");
            Ok(())
        }
        Commands::Validate { config, source } => {
            let config = load_config(config.as_deref())?;
            let docs_dir = source.unwrap_or_else(|| config.paths.docs_dir.clone());
            let report = validate::run(
                &docs_dir,
                &config.grouping.excluded_dirs,
                &config.validate.allowed_categories,
            )?;
            if report.is_valid() {
                println!("All {} documents are valid", report.checked);
                Ok(())
            } else {
                for invalid in &report.invalid {
                    eprintln!("INVALID {} -> {}", invalid.path, invalid.failure);
                }
                Err(error::Error::Validation(report.invalid.len()).into())
            }
        }
        Commands::Enrich {
            config,
            modified_list,
        } => {
            let config = load_config(config.as_deref())?;
            let modified: HashSet<String> = match modified_list {
                Some(path) => std::fs::read_to_string(&path)?
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect(),
                None => HashSet::new(),
            };
            let model = GeminiClient::new_from_env(&config.enrich.model)?;
            println!("Enrichment starting...");
            let report = enrich::run(
                &model,
                &config.paths.docs_dir,
                &config.paths.cache_dir,
                &config.grouping.excluded_dirs,
                &modified,
                config.enrich.token_budget,
            )
            .await?;
            println!("Enrichment complete.\nReport:\n{report:#?}");
            Ok(())
        }
        Commands::Version { config, dry_run } => {
            let config = load_config(config.as_deref())?;
            let repo = GitRepo::open(".");
            println!("Version & changelog update starting...");
            let report = if dry_run {
                versioning::run(&repo, &llm::NoopModel, &config, true).await?
            } else {
                let model = GeminiClient::new_from_env(&config.versioning.model)?;
                versioning::run(&repo, &model, &config, false).await?
            };
            println!("Version & changelog update complete.\nReport:\n{report:#?}");
            Ok(())
        }
        Commands::InjectChangelog { config } => {
            let config = load_config(config.as_deref())?;
            let store = changelog::load_store(
                &config.paths.cache_dir.join(versioning::CHANGELOGS_FILE),
            )?;
            let mapping = changelog::load_path_mapping(
                &config.paths.cache_dir.join(&config.grouping.path_mapping_file),
            );
            let report = changelog::inject(
                &config.paths.docs_dir,
                &config.grouping.excluded_dirs,
                &store,
                &mapping,
            )?;
            println!("Changelog injection complete.\nReport:\n{report:#?}");
            Ok(())
        }
        Commands::Redirects { config } => {
            let config = load_config(config.as_deref())?;
            println!("Redirect update starting...");
            let report = redirects::run(&config)?;
            println!("Redirect update complete.\nReport:\n{report:#?}");
            Ok(())
        }
        Commands::Sitemap { path, marker } => {
            let removed = sitemap::strip_non_browsable(
                &path,
                marker.as_deref().unwrap_or(sitemap::DEFAULT_MARKER),
            )?;
            println!("Removed {removed} non-browsable URL(s) from sitemap");
            Ok(())
        }
        Commands::Convert {
            pdfs,
            force,
            config,
        } => {
            let config = load_config(config.as_deref())?;
            let client = ChatdocClient::new_from_env(&config.convert)?;
            let options = ConvertOptions::from_config(&config.convert, force);
            println!("Conversion starting...");
            let report = convert::convert_all(&client, &pdfs, &options).await;
            println!(
                "Conversion complete: {} converted, {} skipped, {} failed",
                report.converted.len(),
                report.skipped.len(),
                report.failed.len()
            );
            for (pdf, reason) in &report.failed {
                eprintln!("FAILED {}: {}", pdf.display(), reason);
            }
            if report.failed.is_empty() {
                Ok(())
            } else {
                Err(anyhow::anyhow!(
                    "{} conversion(s) failed",
                    report.failed.len()
                ))
            }
        }
    }
}

#![warn(clippy::all, rust_2018_idioms)]

use anyhow::{Context, Result};
use cdk_refactor::app::aws_client::AwsSdkProvider;
use cdk_refactor::app::cfn_resource_models::{
    NoResourceModels, ResourceModelLoader, SchemaDirectoryModels,
};
use cdk_refactor::app::cloud_assembly::read_local_stacks;
use cdk_refactor::app::refactor::exclusions::ExcludeList;
use cdk_refactor::app::refactor::mapping::MappingGroup;
use cdk_refactor::app::refactor::report::render_plan;
use cdk_refactor::app::refactor_config::RefactorConfig;
use cdk_refactor::{log_error, log_warn, plan_refactor, RefactorOptions};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;

const DEFAULT_LOG_FILTER: &str =
    "cdk_refactor=info,aws_config=warn,aws_sigv4=warn,aws_smithy_runtime=warn,aws_smithy_runtime_api=warn,hyper=warn";

/// Detect moved and renamed resources between CDK stacks.
#[derive(Parser)]
#[command(name = "cdk-refactor", version)]
#[command(about = "Plan CloudFormation stack refactors for CDK applications", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./cdk-refactor.json, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also log to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare the synthesized app with deployed stacks and print the refactor plan.
    Refactor {
        /// Stack name patterns to restrict the plan to (`*` wildcard)
        stacks: Vec<String>,

        /// Only show the plan. Required: executing a refactor is not supported yet.
        #[arg(long)]
        dry_run: bool,

        /// Synthesized cloud assembly directory
        #[arg(short, long)]
        assembly: Option<PathBuf>,

        /// JSON file with explicit resource mappings per environment
        #[arg(long)]
        mapping_file: Option<PathBuf>,

        /// Apply the mapping file in reverse
        #[arg(long)]
        revert: bool,

        /// File listing resources to keep out of the refactor, one per line
        #[arg(long)]
        exclude_file: Option<PathBuf>,

        /// Directory of CloudFormation registry schemas
        #[arg(long)]
        schema_dir: Option<PathBuf>,

        /// AWS profile
        #[arg(long)]
        profile: Option<String>,

        /// Region for stacks that do not pin one
        #[arg(long)]
        region: Option<String>,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(filter_directives: Option<&str>, verbose: bool) {
    let directives = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| filter_directives.map(str::to_string))
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    let filter = tracing_subscriber::EnvFilter::builder()
        .parse(&directives)
        .unwrap_or_else(|e| {
            eprintln!("Invalid log filter '{}': {}", directives, e);
            tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
        });

    let mut log_file = None;
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "", "cdk-refactor") {
        let log_dir = proj_dirs.data_dir().join("logs");
        let _ = std::fs::create_dir_all(&log_dir);
        let log_path = log_dir.join("cdk-refactor.log");

        match std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&log_path)
        {
            Ok(file) => {
                // Set restrictive permissions (owner read/write only)
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    if let Ok(metadata) = file.metadata() {
                        let mut perms = metadata.permissions();
                        perms.set_mode(0o600);
                        if let Err(e) = std::fs::set_permissions(&log_path, perms) {
                            eprintln!("[SECURITY] Failed to set log file permissions: {}", e);
                        }
                    }
                }
                log_file = Some((file, log_path));
            }
            Err(e) => eprintln!("Failed to open log file {:?}: {}", log_path, e),
        }
    }

    let log_path = log_file.as_ref().map(|(_, path)| path.clone());
    let file_layer = log_file.map(|(file, _)| {
        tracing_subscriber::fmt::layer()
            .with_writer(move || {
                file.try_clone()
                    .map(|f| Box::new(f) as Box<dyn std::io::Write>)
                    .unwrap_or_else(|_| Box::new(std::io::sink()))
            })
            .with_ansi(false) // No ANSI colors in file
    });
    let stderr_layer = verbose.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer);
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return;
    }

    // Bridge log crate events to tracing; must come after the subscriber is set
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("Failed to initialize log-to-tracing bridge: {}", e);
    }

    tracing::info!("Logging initialized to: {:?} ({})", log_path, directives);
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let (config, config_warning) = RefactorConfig::load(cli.config.as_deref());
    init_logging(config.log_filter.as_deref(), cli.verbose);
    if let Some(warning) = config_warning {
        log_warn!("{}", warning);
        if !cli.verbose {
            eprintln!("Warning: {}", warning);
        }
    }

    let result = match cli.command {
        Commands::Refactor {
            stacks,
            dry_run,
            assembly,
            mapping_file,
            revert,
            exclude_file,
            schema_dir,
            profile,
            region,
            json,
        } => {
            let args = RefactorArgs {
                stacks,
                dry_run,
                assembly: assembly.unwrap_or_else(|| config.assembly_dir.clone()),
                mapping_file,
                revert,
                exclude_file,
                schema_dir: schema_dir.or_else(|| config.schema_dir.clone()),
                profile: profile.or_else(|| config.profile.clone()),
                region: region.or_else(|| config.region.clone()),
                json,
            };
            run_refactor(args, &config).await
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            log_error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

struct RefactorArgs {
    stacks: Vec<String>,
    dry_run: bool,
    assembly: PathBuf,
    mapping_file: Option<PathBuf>,
    revert: bool,
    exclude_file: Option<PathBuf>,
    schema_dir: Option<PathBuf>,
    profile: Option<String>,
    region: Option<String>,
    json: bool,
}

async fn run_refactor(args: RefactorArgs, config: &RefactorConfig) -> Result<ExitCode> {
    let mut exclude = ExcludeList::new(&config.exclude);
    if let Some(path) = &args.exclude_file {
        exclude = exclude.merge(ExcludeList::load(path)?);
    }
    let mapping_groups = args
        .mapping_file
        .as_ref()
        .map(MappingGroup::load)
        .transpose()?;

    let options = RefactorOptions {
        dry_run: args.dry_run,
        stack_patterns: args.stacks,
        mapping_groups,
        revert: args.revert,
        exclude,
    };
    options.validate()?;

    let local_stacks = read_local_stacks(&args.assembly)
        .with_context(|| format!("Failed to read cloud assembly {:?}", args.assembly))?;

    let models: Box<dyn ResourceModelLoader> = match &args.schema_dir {
        Some(dir) => Box::new(SchemaDirectoryModels::new(dir)),
        None => Box::new(NoResourceModels),
    };
    let api = AwsSdkProvider::load(args.profile.as_deref(), args.region.as_deref()).await;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let plan = plan_refactor(&api, models.as_ref(), local_stacks, &options, &cancel).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print!("{}", render_plan(&plan));
    }

    Ok(if plan.errors.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

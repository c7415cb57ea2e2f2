//! bundle CLI entrypoint.
//!
//! This is the main entrypoint for the bundle command-line tool.

use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bundle_deploy::cli::{
    Cli, Commands, LogFormat, OutputFormatter, Prompter, StateCommands, TerminalPrompter,
};
use bundle_deploy::config::{
    BundleConfig, ConfigParser, ConfigValidator, StateBackend, find_config_file,
};
use bundle_deploy::error::{BundleError, ConfigError, Result};
use bundle_deploy::orchestrator::Orchestrator;
use bundle_deploy::provision::{
    DEFAULT_RESOURCE_TYPES, ProvisionerRegistry, ResourceProvisioner, RestProvisioner,
};
use bundle_deploy::state::{DeploymentOperation, FsRemoteStore, RemoteStore, S3RemoteStore};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Shared state directory of the fs backend when `state.path` is not set.
const DEFAULT_FS_STATE_DIR: &str = ".bundle-remote";

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` wins over `--verbose`. Logs always go to stderr so that
/// command output on stdout stays parseable.
fn init_logging(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let config_file = resolve_config_path(cli.config.as_ref())?;
    let bundle_dir = config_file
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    debug!("Loading configuration from: {}", config_file.display());
    let parser = ConfigParser::new().with_base_path(&bundle_dir);
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    if let Commands::Validate { warnings } = cli.command {
        return cmd_validate(&config, warnings, &formatter);
    }

    let validation = ConfigValidator::with_known_types(DEFAULT_RESOURCE_TYPES.iter().copied())
        .validate(&config)?;
    for warning in &validation.warnings {
        warn!("{warning}");
    }

    let target = choose_target(&config, cli.target.as_deref())?;
    let orchestrator = build_orchestrator(config, target.as_deref(), &bundle_dir).await?;

    match cli.command {
        Commands::Validate { .. } => Ok(()),
        Commands::Plan => cmd_plan(&orchestrator, &formatter).await,
        Commands::Deploy { yes } => cmd_deploy(&orchestrator, yes, &formatter).await,
        Commands::Destroy { yes } => cmd_destroy(&orchestrator, yes, &formatter).await,
        Commands::State { command } => cmd_state(&orchestrator, command, &formatter).await,
    }
}

/// Validate configuration.
fn cmd_validate(config: &BundleConfig, show_warnings: bool, formatter: &OutputFormatter) -> Result<()> {
    let validator = ConfigValidator::with_known_types(DEFAULT_RESOURCE_TYPES.iter().copied());
    let result = validator.check(config);

    emit(&formatter.format_validation(config, &result, show_warnings))?;

    if result.is_valid() {
        Ok(())
    } else {
        validator.validate(config).map(|_| ())
    }
}

/// Show what a deploy would change.
async fn cmd_plan(orchestrator: &Orchestrator, formatter: &OutputFormatter) -> Result<()> {
    let plan = orchestrator.preview(DeploymentOperation::Deploy).await?;
    emit(&formatter.format_plan(&plan))
}

/// Deploy the bundle.
async fn cmd_deploy(orchestrator: &Orchestrator, yes: bool, formatter: &OutputFormatter) -> Result<()> {
    let plan = orchestrator.preview(DeploymentOperation::Deploy).await?;
    if !plan.has_changes() {
        return emit(&formatter.format_plan(&plan));
    }

    if plan.delete_count() > 0 && !yes {
        emit(&formatter.format_plan(&plan))?;
        let message = format!(
            "This deploy deletes {} resource(s) from {}. Continue?",
            plan.delete_count(),
            orchestrator.target()
        );
        if !confirm(&message)? {
            eprintln!("Deploy cancelled.");
            return Ok(());
        }
    }

    let report = orchestrator.deploy().await?;
    emit(&formatter.format_report(&report))?;

    report.failure.map_or(Ok(()), Err)
}

/// Destroy everything deployed to the target.
async fn cmd_destroy(orchestrator: &Orchestrator, yes: bool, formatter: &OutputFormatter) -> Result<()> {
    let plan = orchestrator.preview(DeploymentOperation::Destroy).await?;

    if !yes {
        emit(&formatter.format_plan(&plan))?;
        let message = format!(
            "This destroys {} resource(s) and the deployment state of {}. Continue?",
            plan.delete_count(),
            orchestrator.target()
        );
        if !confirm(&message)? {
            eprintln!("Destroy cancelled.");
            return Ok(());
        }
    }

    let report = orchestrator.destroy().await?;
    emit(&formatter.format_report(&report))?;

    report.failure.map_or(Ok(()), Err)
}

/// State management commands.
async fn cmd_state(
    orchestrator: &Orchestrator,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    match command {
        StateCommands::Show => {
            let state = orchestrator.current_state().await?;
            emit(&formatter.format_state(&state))
        }
        StateCommands::Pull => match orchestrator.refresh().await? {
            Some(state) => emit(&formatter.format_state(&state)),
            None => {
                eprintln!("No remote state for {}.", orchestrator.target());
                Ok(())
            }
        },
        StateCommands::Unlock { force: false } => {
            let lock = orchestrator.lock_info().await?;
            emit(&formatter.format_lock(orchestrator.target(), lock.as_ref()))?;
            if lock.is_some() {
                eprintln!("Use --force to remove the lock.");
            }
            Ok(())
        }
        StateCommands::Unlock { force: true } => {
            match orchestrator.force_unlock().await? {
                Some(info) => warn!(
                    "Removed lock {} held by {} on {}",
                    info.lock_id,
                    info.holder,
                    orchestrator.target()
                ),
                None => info!("{} was not locked", orchestrator.target()),
            }
            Ok(())
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Writes command output to stdout.
fn emit(output: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{output}")?;
    Ok(())
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Asks for confirmation, refusing when there is no terminal to ask on.
fn confirm(message: &str) -> Result<bool> {
    if !std::io::stdin().is_terminal() {
        return Err(ConfigError::validation(
            "confirmation required but stdin is not a terminal; pass --yes",
            "--yes",
        )
        .into());
    }
    TerminalPrompter::stdio().confirm(message)
}

/// Picks the target: `--target`, then the configured default, then a prompt.
fn choose_target(config: &BundleConfig, requested: Option<&str>) -> Result<Option<String>> {
    match config.select_target(requested) {
        Ok((name, _)) => Ok(Some(name.to_string())),
        Err(BundleError::Config(ConfigError::NoTargetSelected)) if std::io::stdin().is_terminal() => {
            TerminalPrompter::stdio()
                .select_target(&config.target_names())?
                .map(Some)
                .ok_or_else(|| ConfigError::NoTargetSelected.into())
        }
        Err(e) => Err(e),
    }
}

/// Wires the remote store, provisioners and cancellation into an orchestrator.
async fn build_orchestrator(
    config: BundleConfig,
    target: Option<&str>,
    bundle_dir: &Path,
) -> Result<Orchestrator> {
    let (_, target_config) = config.select_target(target)?;
    let host = config
        .host_for(target_config)
        .ok_or_else(|| ConfigError::validation("workspace host is not configured", "workspace.host"))?
        .to_string();

    let store = build_store(&config, bundle_dir).await?;
    let registry = build_registry(&config, &host)?;

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; waiting for in-flight actions to finish");
            flag.store(true, Ordering::SeqCst);
        }
    });

    Ok(Orchestrator::new(config, target, store, registry, bundle_dir)?.with_cancel_flag(cancel))
}

/// Creates the remote store for the configured backend.
async fn build_store(config: &BundleConfig, bundle_dir: &Path) -> Result<Arc<dyn RemoteStore>> {
    match config.state.backend {
        StateBackend::Fs => {
            let root = config.state.path.as_deref().map_or_else(
                || bundle_dir.join(DEFAULT_FS_STATE_DIR),
                |path| bundle_dir.join(path),
            );
            debug!("Using fs state backend at {}", root.display());
            Ok(Arc::new(FsRemoteStore::new(root)))
        }
        StateBackend::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| ConfigError::validation("S3 bucket not configured", "state.bucket"))?;
            let store = S3RemoteStore::new(
                bucket,
                config.state.prefix.as_deref(),
                config.state.region.as_deref(),
            )
            .await?;
            Ok(Arc::new(store))
        }
    }
}

/// Registers the REST provisioner for the built-in types and every declared type.
fn build_registry(config: &BundleConfig, host: &str) -> Result<ProvisionerRegistry> {
    let token = ConfigParser::get_token()?;
    let provisioner: Arc<dyn ResourceProvisioner> = Arc::new(RestProvisioner::new(host, &token)?);

    let declared = config.resources.iter().map(|r| r.resource_type.as_str());
    Ok(ProvisionerRegistry::new()
        .register_all(DEFAULT_RESOURCE_TYPES.iter().copied().chain(declared), &provisioner))
}

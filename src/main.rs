//! nlq-deploy CLI entrypoint.
//!
//! This is the main entrypoint for the nlq-deploy command-line tool.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use nlq_deploy_stacks::cli::{Cli, Commands, LogFormat, OutputFormatter, StateCommands};
use nlq_deploy_stacks::config::{
    ConfigParser, ConfigValidator, DeployDescriptor, StateBackend, find_config_file,
};
use nlq_deploy_stacks::engine::Deployer;
use nlq_deploy_stacks::error::{ConfigError, DeployError, Result};
use nlq_deploy_stacks::graph::build_graph;
use nlq_deploy_stacks::hooks::{HandlerRegistry, HookDispatcher};
use nlq_deploy_stacks::provider::SimulatedProvider;
use nlq_deploy_stacks::state::{
    LocalStateStore, S3StateStore, STATE_DIR, StateStore, generate_holder_id,
};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_format);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. `RUST_LOG` wins over `--verbose`.
fn init_logging(verbose: bool, format: LogFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Main async entry point. Returns the process exit status.
async fn run(cli: Cli) -> Result<u8> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_ref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force).map(|()| 0),
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Graph => cmd_graph(config, &formatter).map(|()| 0),
        Commands::Plan { stacks, detailed } => {
            cmd_plan(config, &stacks, detailed, &formatter).await.map(|()| 0)
        }
        Commands::Apply {
            stacks,
            yes,
            continue_on_error,
            max_parallelism,
        } => {
            let overrides = ExecutionOverrides {
                continue_on_error,
                max_parallelism,
            };
            cmd_apply(config, &stacks, yes, overrides, &formatter).await
        }
        Commands::Destroy { stacks, yes } => cmd_destroy(config, &stacks, yes, &formatter).await,
        Commands::Outputs { stack } => {
            cmd_outputs(config, stack.as_deref(), &formatter).await.map(|()| 0)
        }
        Commands::State { command } => cmd_state(config, command, &formatter).await.map(|()| 0),
    }
}

/// Flags of `apply` that override the descriptor's execution section.
struct ExecutionOverrides {
    continue_on_error: bool,
    max_parallelism: Option<usize>,
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing NLQ deployment in: {}", path.display());

    let config_path = path.join("nlq.deploy.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    // Check if files exist
    if !force && config_path.exists() {
        eprintln!("Descriptor already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/nlq.deploy.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let has_env = existing.lines().any(|l| l.trim() == ".env");
        let has_state = existing.contains(STATE_DIR);
        if !has_env || !has_state {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# nlq-deploy")?;
            if !has_env {
                writeln!(file, ".env")?;
            }
            if !has_state {
                writeln!(file, "{state_entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit nlq.deploy.yaml to describe your stacks");
    eprintln!("  2. Run 'nlq-deploy validate' to check the descriptor");
    eprintln!("  3. Run 'nlq-deploy plan' to preview the changes");
    eprintln!("  4. Run 'nlq-deploy apply' to deploy the stacks");

    Ok(())
}

/// Validate the descriptor. Exits non-zero when it has errors.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating descriptor: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let descriptor = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().check(&descriptor);

    for error in &result.errors {
        eprintln!("{}", formatter.error(&error.to_string()));
    }
    if show_warnings {
        for warning in &result.warnings {
            eprintln!("{}", formatter.warning(warning));
        }
    }

    if !result.is_valid() {
        eprintln!("\n{} error(s) found.", result.error_count());
        return Ok(1);
    }

    eprintln!("{}", formatter.success("Descriptor is valid!"));
    if !show_warnings && result.warning_count() > 0 {
        eprintln!("{} warning(s), rerun with --warnings to list them.", result.warning_count());
    }

    eprintln!("\nDescriptor summary:");
    eprintln!("  Project: {}", descriptor.project.name);
    eprintln!("  Environment: {}", descriptor.project.environment);
    eprintln!("  Stacks: {}", descriptor.stacks.len());
    eprintln!(
        "  Resources: {}",
        descriptor.stacks.iter().map(|s| s.resources.len()).sum::<usize>()
    );

    Ok(0)
}

/// Show stack waves and node order.
fn cmd_graph(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<()> {
    let (descriptor, _) = load_descriptor(config_path)?;
    let stacks = descriptor.build_stacks()?;
    let order = nlq_deploy_stacks::planner::order_stacks(&stacks)?;

    let mut nodes = Vec::with_capacity(stacks.len());
    for stack in &stacks {
        let graph = build_graph(stack)?;
        let ids = graph.topological_order().into_iter().map(String::from).collect();
        nodes.push((stack.name().to_string(), ids));
    }

    print_stdout(&formatter.format_graph(&order, &nodes))
}

/// Show what apply would do.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    stacks: &[String],
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let deployer = create_deployer(config_path).await?;
    let plans = deployer.plan(stacks).await?;
    print_stdout(&formatter.format_plans(&plans, detailed))
}

/// Deploy stacks.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    stacks: &[String],
    auto_approve: bool,
    overrides: ExecutionOverrides,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let (mut descriptor, config_file) = load_descriptor(config_path)?;
    if overrides.continue_on_error {
        descriptor.execution.continue_on_error = true;
    }
    if let Some(max_parallelism) = overrides.max_parallelism {
        descriptor.execution.max_parallelism = max_parallelism.clamp(1, 64);
    }
    let deployer = build_deployer(descriptor, &config_file).await?;

    let plans = deployer.plan(stacks).await?;
    if plans.iter().all(|p| p.is_noop()) {
        eprintln!("{}", formatter.success("No changes to apply."));
        return Ok(0);
    }
    eprintln!("{}", formatter.format_plans(&plans, false));

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(0);
    }

    spawn_interrupt_handler(&deployer);
    let report = deployer.apply(stacks).await?;
    print_stdout(&formatter.format_report(&report))?;

    Ok(report.exit_code())
}

/// Tear stacks down.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    stacks: &[String],
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let deployer = create_deployer(config_path).await?;

    let plans = deployer.plan_destroy(stacks).await?;
    if plans.iter().all(|p| p.is_noop()) {
        eprintln!("Nothing to destroy.");
        return Ok(0);
    }
    eprintln!("{}", formatter.format_plans(&plans, false));

    if !auto_approve
        && !confirm(
            "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
            "destroy",
        )?
    {
        eprintln!("Destruction cancelled.");
        return Ok(0);
    }

    spawn_interrupt_handler(&deployer);
    let report = deployer.destroy(stacks).await?;
    print_stdout(&formatter.format_report(&report))?;

    Ok(report.exit_code())
}

/// Show published stack outputs.
async fn cmd_outputs(
    config_path: Option<&PathBuf>,
    stack: Option<&str>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let deployer = create_deployer(config_path).await?;
    let mut outputs = deployer.outputs().await?;

    if let Some(name) = stack {
        let values = outputs.remove(name).ok_or_else(|| {
            ConfigError::validation(format!("No outputs recorded for stack '{name}'"), "stack")
        })?;
        outputs = BTreeMap::from([(name.to_string(), values)]);
    }

    print_stdout(&formatter.format_outputs(&outputs))
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (descriptor, config_file) = load_descriptor(config_path)?;
    let store = create_state_store(&descriptor, &config_file).await?;

    match command {
        StateCommands::Show => {
            if let Some(state) = store.load().await? {
                print_stdout(&formatter.format_state(&state))?;
            } else {
                eprintln!("No state found.");
            }
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder, "manual").await?;
            eprintln!(
                "{}",
                formatter.success(&format!("State locked: {} (expires {})", lock.lock_id, lock.expires_at))
            );
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock) = store.get_lock_info().await? {
                    warn!(holder = %lock.holder, lock_id = %lock.lock_id, "Forcing unlock");
                }
                store.force_unlock().await?;
                eprintln!("{}", formatter.success("State forcefully unlocked."));
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("{}", formatter.success("State unlocked."));
            } else {
                eprintln!("Please provide --lock-id or use --force");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the descriptor path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Directory holding the descriptor.
fn config_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Loads `.env`, the descriptor with environment overrides, and validates it.
fn load_descriptor(config_path: Option<&PathBuf>) -> Result<(DeployDescriptor, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading descriptor from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let descriptor = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().validate(&descriptor)?;
    for warning in &result.warnings {
        warn!("{warning}");
    }

    Ok((descriptor, config_file))
}

/// Creates the state store the descriptor selects.
async fn create_state_store(
    descriptor: &DeployDescriptor,
    config_file: &Path,
) -> Result<Box<dyn StateStore>> {
    let state = &descriptor.state;
    let store: Box<dyn StateStore> = match state.backend {
        StateBackend::Local => {
            let dir = state
                .path
                .as_ref()
                .map_or_else(|| config_dir(config_file).join(STATE_DIR), PathBuf::from);
            Box::new(LocalStateStore::with_base_dir(dir))
        }
        StateBackend::S3 => {
            let bucket = state.bucket.as_deref().ok_or_else(|| {
                DeployError::from(ConfigError::validation(
                    "S3 bucket not configured",
                    "state.bucket",
                ))
            })?;
            Box::new(S3StateStore::new(bucket, state.prefix.as_deref(), state.region.as_deref()).await?)
        }
    };

    debug!(backend = store.backend_type(), "State store ready");
    Ok(store)
}

/// Loads the descriptor and wires a deployer around it.
async fn create_deployer(config_path: Option<&PathBuf>) -> Result<Deployer<Box<dyn StateStore>>> {
    let (descriptor, config_file) = load_descriptor(config_path)?;
    build_deployer(descriptor, &config_file).await
}

/// Wires state, provider and hooks for a descriptor.
async fn build_deployer(
    descriptor: DeployDescriptor,
    config_file: &Path,
) -> Result<Deployer<Box<dyn StateStore>>> {
    let store = create_state_store(&descriptor, config_file).await?;

    let region = descriptor.project.region.clone().unwrap_or_else(|| String::from("local"));
    let account = descriptor
        .project
        .account
        .clone()
        .unwrap_or_else(|| String::from("000000000000"));
    let provider = Arc::new(SimulatedProvider::new(region, account));

    let registry = HandlerRegistry::new().with_working_dir(config_dir(config_file));
    let hooks = Arc::new(HookDispatcher::new(registry));

    Deployer::new(descriptor, store, provider, hooks)
}

/// Cancels the running session on Ctrl-C. Operations in flight finish.
fn spawn_interrupt_handler<S: StateStore>(deployer: &Deployer<S>) {
    let cancel = deployer.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupt received, waiting for operations in flight...");
            cancel.cancel();
        }
    });
}

/// Prompts on stderr and compares the answer with `expected`.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Writes command output to stdout, keeping logs on stderr.
fn print_stdout(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", text.trim_end())?;
    Ok(())
}

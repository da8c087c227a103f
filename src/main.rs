//! Stackwright CLI entrypoint.
//!
//! This is the main entrypoint for the stackwright command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use stackwright::cli::{Cli, Commands, OutputFormatter, StateCommands, VarArgs};
use stackwright::config::{
    ConfigParser, ConfigValidator, StackDocument, StateBackend, VariableResolver, VariableValues,
    find_config_file,
};
use stackwright::error::Result;
use stackwright::graph::DependencyGraph;
use stackwright::planner::ExecutionResult;
use stackwright::provider::{HttpProvider, ProviderClient};
use stackwright::reconciler::Reconciler;
use stackwright::state::{STATE_DIR, StateStore, generate_holder_id, open_store};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

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
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. `RUST_LOG` takes precedence.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_ref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Graph { dot } => cmd_graph(config, dot, &formatter),
        Commands::Plan { vars, out } => cmd_plan(config, &vars, out.as_deref(), &formatter).await,
        Commands::Apply {
            yes,
            vars,
            fail_fast,
            max_concurrency,
        } => {
            let project = Project::load(config, &vars)?.with_settings(fail_fast, max_concurrency);
            cmd_apply(project, yes, &formatter).await
        }
        Commands::Destroy {
            yes,
            vars,
            max_concurrency,
        } => {
            let project = Project::load(config, &vars)?.with_settings(false, max_concurrency);
            cmd_destroy(project, yes, &formatter).await
        }
        Commands::Drift { vars } => cmd_drift(config, &vars, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Writes stdout output for commands whose result is data.
fn emit(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", text.trim_end())?;
    Ok(())
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new Stackwright project in: {}", path.display());

    let config_path = path.join("stackwright.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/stackwright.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let has_env = existing.lines().any(|l| l.trim() == ".env");
        let has_state = existing.lines().any(|l| l.trim() == state_entry);
        if !has_env || !has_state {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# Stackwright")?;
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
    eprintln!("  1. Copy .env.example to .env and set STACKWRIGHT_PROVIDER_TOKEN");
    eprintln!("  2. Declare your resources in stackwright.yaml");
    eprintln!("  3. Run 'stackwright validate' to check the configuration");
    eprintln!("  4. Run 'stackwright plan' to see what will change");
    eprintln!("  5. Run 'stackwright apply' to converge");

    Ok(())
}

/// Validate configuration, including the dependency graph.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (_, document) = load_document(config_path)?;
    let result = ConfigValidator::new().validate(&document)?;
    let graph = DependencyGraph::build(&document.desired)?;

    emit(&formatter.format_validation(&result, show_warnings))?;
    if !formatter.is_json() {
        eprintln!("\nConfiguration summary:");
        eprintln!("  Project: {}", document.config.project.name);
        eprintln!("  Environment: {}", document.config.project.environment);
        eprintln!("  Resources: {}", graph.len());
        eprintln!("  Dependencies: {}", graph.edges().len());
        eprintln!("  Variables: {}", document.desired.variables.len());
    }
    Ok(())
}

/// Print the dependency graph.
fn cmd_graph(config_path: Option<&PathBuf>, dot: bool, formatter: &OutputFormatter) -> Result<()> {
    let (_, document) = load_document(config_path)?;
    ConfigValidator::new().validate(&document)?;
    let graph = DependencyGraph::build(&document.desired)?;

    if dot {
        emit(&graph.to_dot())
    } else {
        emit(&formatter.format_graph(&graph))
    }
}

/// Show the plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    vars: &VarArgs,
    out: Option<&Path>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let reconciler = Project::load(config_path, vars)?
        .reconciler(CancellationToken::new())
        .await?;
    let plan = reconciler.plan().await?;

    emit(&formatter.format_plan(&plan))?;

    if let Some(path) = out {
        std::fs::write(path, plan.to_json()?)?;
        eprintln!("Plan written to {}", path.display());
    }
    Ok(())
}

/// Plan and apply.
async fn cmd_apply(project: Project, auto_approve: bool, formatter: &OutputFormatter) -> Result<()> {
    let cancel = cancel_on_ctrl_c();
    let reconciler = project.reconciler(cancel).await?;
    let plan = reconciler.plan().await?;

    if plan.is_empty() {
        eprintln!("No changes to apply.");
        return Ok(());
    }

    emit(&formatter.format_plan(&plan))?;

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(());
    }

    let result = reconciler.execute(&plan).await?;
    report(result, formatter)
}

/// Destroy every managed resource.
async fn cmd_destroy(
    project: Project,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let cancel = cancel_on_ctrl_c();
    let reconciler = project.reconciler(cancel).await?;
    let plan = reconciler.plan_destroy().await?;

    if plan.is_empty() {
        eprintln!("Nothing to destroy.");
        return Ok(());
    }

    emit(&formatter.format_plan(&plan))?;

    if !auto_approve
        && !confirm(
            "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
            "destroy",
        )?
    {
        eprintln!("Destroy cancelled.");
        return Ok(());
    }

    let result = reconciler.execute(&plan).await?;
    report(result, formatter)
}

/// Check for drift.
async fn cmd_drift(
    config_path: Option<&PathBuf>,
    vars: &VarArgs,
    formatter: &OutputFormatter,
) -> Result<()> {
    let reconciler = Project::load(config_path, vars)?
        .reconciler(CancellationToken::new())
        .await?;
    let report = reconciler.check_drift().await?;
    emit(&formatter.format_drift(&report))
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config_file, mut document) = load_document(config_path)?;
    default_state_path(&mut document, &config_file);
    let store = open_store(&document.config).await?;

    match command {
        StateCommands::Show => match store.load().await? {
            Some(state) => emit(&formatter.format_state(&state))?,
            None => eprintln!("No state found."),
        },
        StateCommands::List => match store.load().await? {
            Some(state) => emit(&formatter.format_resources(&state))?,
            None => eprintln!("No state found."),
        },
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder, "manual lock").await?;
            emit(&formatter.format_lock(&lock))?;
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                match store.force_unlock().await? {
                    Some(lock) => eprintln!("Removed lock {} held by {}.", lock.lock_id, lock.holder),
                    None => eprintln!("State is not locked."),
                }
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
            }
        }
        StateCommands::Rm { address } => {
            let provider: Arc<dyn ProviderClient> =
                Arc::new(HttpProvider::from_config(&document.config.provider)?);
            let reconciler =
                Reconciler::new(document, VariableValues::default(), provider, store)?;
            let record = reconciler.remove_from_state(&address).await?;
            eprintln!(
                "Removed {address} ({}) from state. The resource itself was not touched.",
                record.provider_id
            );
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// A loaded and validated document with its variable values.
struct Project {
    config_file: PathBuf,
    document: StackDocument,
    values: VariableValues,
}

impl Project {
    fn load(config_path: Option<&PathBuf>, vars: &VarArgs) -> Result<Self> {
        let (config_file, document) = load_document(config_path)?;
        ConfigValidator::new().validate(&document)?;

        let overrides = VariableResolver::parse_assignments(&vars.vars)?;
        let values = VariableResolver::new()
            .with_overrides(overrides)
            .resolve(&document.desired)?;
        debug!("Resolved {} variables", values.len());

        Ok(Self {
            config_file,
            document,
            values,
        })
    }

    fn with_settings(mut self, fail_fast: bool, max_concurrency: Option<usize>) -> Self {
        let settings = &mut self.document.config.settings;
        settings.fail_fast |= fail_fast;
        if let Some(limit) = max_concurrency {
            settings.max_concurrency = limit.max(1);
        }
        self
    }

    async fn reconciler(mut self, cancel: CancellationToken) -> Result<Reconciler> {
        default_state_path(&mut self.document, &self.config_file);
        let store = open_store(&self.document.config).await?;
        let provider: Arc<dyn ProviderClient> =
            Arc::new(HttpProvider::from_config(&self.document.config.provider)?);

        Ok(Reconciler::new(self.document, self.values, provider, store)?.with_cancellation(cancel))
    }
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Loads `.env` and the document with environment overrides.
fn load_document(config_path: Option<&PathBuf>) -> Result<(PathBuf, StackDocument)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let document = parser.load_with_env(&config_file)?;
    Ok((config_file, document))
}

fn config_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Keeps local state next to the configuration file unless a path is set.
fn default_state_path(document: &mut StackDocument, config_file: &Path) {
    let state = &mut document.config.state;
    if state.backend == StateBackend::Local && state.path.is_none() {
        let root = config_dir(config_file).join(STATE_DIR);
        state.path = Some(root.display().to_string());
    }
}

/// Cancels the returned token on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight changes");
            token.cancel();
        }
    });
    cancel
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Prints the apply report and turns an incomplete run into an error.
fn report(result: ExecutionResult, formatter: &OutputFormatter) -> Result<()> {
    emit(&formatter.format_execution(&result))?;
    result.into_result().map(|_| ())
}

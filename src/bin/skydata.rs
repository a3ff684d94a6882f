use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use skydata_manager::app::{App, FetchOptions, FetchResult};
use skydata_manager::config::{ConfigLoader, Settings};
use skydata_manager::coordinator::{AcquisitionCoordinator, AcquisitionOutcome};
use skydata_manager::dispatch::{ChannelDispatcher, Dispatcher, InlineDispatcher};
use skydata_manager::domain::DatasetKey;
use skydata_manager::error::SkyDataError;
use skydata_manager::output::{JsonOutput, LogListener, OutputMode};
use skydata_manager::transfer::HttpTransferClient;
use skydata_manager::tui::Tui;

#[derive(Parser)]
#[command(name = "skydata")]
#[command(about = "Download, verify and install sky-visualization datasets")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    /// Path to a skydata.json configuration file
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Show the dataset catalog with local status")]
    Catalog(CatalogArgs),
    #[command(about = "Download and install datasets (base data when no key is given)")]
    Fetch(FetchArgs),
    #[command(about = "List installed datasets")]
    List,
    #[command(about = "Show the status of one dataset")]
    Status(KeyArgs),
    #[command(about = "Delete an installed dataset")]
    Delete(KeyArgs),
}

#[derive(Args)]
struct CatalogArgs {
    #[arg(long)]
    filter: Option<String>,
}

#[derive(Args)]
struct FetchArgs {
    keys: Vec<String>,

    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct KeyArgs {
    key: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<SkyDataError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SkyDataError) -> u8 {
    match error {
        SkyDataError::UnknownDataset(_)
        | SkyDataError::InvalidKey(_)
        | SkyDataError::ConfigRead(_)
        | SkyDataError::ConfigParse(_) => 2,
        SkyDataError::Http(_)
        | SkyDataError::HttpStatus { .. }
        | SkyDataError::ManifestFetch { .. }
        | SkyDataError::Offline(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };
    let settings = ConfigLoader::resolve(cli.config.as_deref())?;

    let Some(command) = cli.command else {
        return Err(miette::Report::msg(
            "command required (try `skydata --help`)",
        ));
    };
    match command {
        Commands::Catalog(args) => run_catalog(args, settings, output_mode),
        Commands::Fetch(args) => run_fetch(args, settings, output_mode),
        Commands::List => run_list(settings, output_mode),
        Commands::Status(args) => run_status(args, settings, output_mode),
        Commands::Delete(args) => run_delete(args, settings, output_mode),
    }
}

fn build_app(
    settings: Settings,
    dispatcher: Arc<dyn Dispatcher>,
) -> Result<App<HttpTransferClient>, SkyDataError> {
    let transfer = Arc::new(HttpTransferClient::new(&settings)?);
    Ok(App::new(AcquisitionCoordinator::new(
        settings, transfer, dispatcher,
    )))
}

fn parse_key(value: &str) -> Result<DatasetKey, SkyDataError> {
    value.parse()
}

fn run_catalog(
    args: CatalogArgs,
    settings: Settings,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let app = build_app(settings, Arc::new(InlineDispatcher))?;
    let manifest = app.load_manifest()?;
    let result = app.catalog(&manifest, args.filter.as_deref())?;
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_catalog(&result).into_diagnostic(),
        OutputMode::Interactive => {
            println!("Catalog: {} ({} datasets)", result.source, result.datasets.len());
            for entry in &result.datasets {
                let installed = entry
                    .installed_version
                    .map(|version| format!(" (local v{version})"))
                    .unwrap_or_default();
                println!(
                    "  {:<32} v{:<4} {:<12} {:<10} {}{installed}",
                    entry.key.as_str(),
                    entry.version,
                    entry.status.to_string(),
                    entry.size.clone().unwrap_or_else(|| "?".to_string()),
                    entry.name
                );
            }
            Ok(())
        }
    }
}

fn run_fetch(args: FetchArgs, settings: Settings, output_mode: OutputMode) -> miette::Result<()> {
    let keys = args
        .keys
        .iter()
        .map(|key| parse_key(key))
        .collect::<Result<Vec<_>, _>>()?;
    let options = FetchOptions { force: args.force };

    let result = match output_mode {
        OutputMode::NonInteractive => {
            let app = build_app(settings, Arc::new(InlineDispatcher))?;
            let manifest = app.load_manifest()?;
            let result = app.fetch(&manifest, &keys, options, Arc::new(LogListener))?;
            JsonOutput::print_fetch(&result).into_diagnostic()?;
            result
        }
        OutputMode::Interactive => {
            let (dispatcher, jobs) = ChannelDispatcher::new();
            let app = build_app(settings, Arc::new(dispatcher))?;
            let manifest = app.load_manifest()?;
            let mut tui = Tui::new();
            let result = tui.run_fetch(&app, &manifest, &keys, options, &jobs)?;
            print_fetch_summary(&result);
            result
        }
    };

    let failed = result
        .items
        .iter()
        .filter(|item| matches!(item.outcome, Some(AcquisitionOutcome::Failed { .. })))
        .count();
    if failed > 0 {
        return Err(miette::Report::msg(format!("{failed} acquisition(s) failed")));
    }
    Ok(())
}

fn run_list(settings: Settings, output_mode: OutputMode) -> miette::Result<()> {
    let app = build_app(settings, Arc::new(InlineDispatcher))?;
    let result = app.list()?;
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_list(&result).into_diagnostic(),
        OutputMode::Interactive => {
            println!("Data root: {}", result.data_root);
            if result.datasets.is_empty() {
                println!("  no datasets installed");
            }
            for record in &result.datasets {
                println!(
                    "  {:<32} v{:<4} {} {}",
                    record.key.as_str(),
                    record.version,
                    if record.verified { "verified  " } else { "unverified" },
                    record.installed_at
                );
            }
            Ok(())
        }
    }
}

fn run_status(args: KeyArgs, settings: Settings, output_mode: OutputMode) -> miette::Result<()> {
    let key = parse_key(&args.key)?;
    let app = build_app(settings, Arc::new(InlineDispatcher))?;
    let manifest = app.load_manifest()?;
    let result = app.status(&manifest, &key)?;
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_status(&result).into_diagnostic(),
        OutputMode::Interactive => {
            println!("{}: {}", result.key, result.status);
            println!("  catalog version: {}", result.catalog_version);
            if let Some(version) = result.installed_version {
                println!("  installed version: {version}");
            }
            if let Some(record) = &result.record {
                println!(
                    "  installed at {} ({})",
                    record.installed_at,
                    if record.verified { "verified" } else { "unverified" }
                );
            }
            Ok(())
        }
    }
}

fn run_delete(args: KeyArgs, settings: Settings, output_mode: OutputMode) -> miette::Result<()> {
    let key = parse_key(&args.key)?;
    let app = build_app(settings, Arc::new(InlineDispatcher))?;
    let manifest = app.load_manifest()?;
    let result = app.delete(&manifest, &key)?;
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_delete(&result).into_diagnostic(),
        OutputMode::Interactive => {
            println!("Deleted {} ({} paths)", result.key, result.removed.len());
            for path in &result.removed {
                println!("  {path}");
            }
            Ok(())
        }
    }
}

fn print_fetch_summary(result: &FetchResult) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!("{cyan}skydata summary{reset}");
    for item in &result.items {
        match &item.outcome {
            None => println!("{green}= {} ({}){reset}", item.key, item.action),
            Some(AcquisitionOutcome::Installed { .. }) => {
                println!("{green}+ {} ({}){reset}", item.key, item.action)
            }
            Some(AcquisitionOutcome::Cancelled { .. }) => {
                println!("{yellow}- {} ({}){reset}", item.key, item.action)
            }
            Some(AcquisitionOutcome::Failed { reason, .. }) => {
                println!("{red}x {} ({}): {reason}{reset}", item.key, item.action)
            }
        }
    }
}

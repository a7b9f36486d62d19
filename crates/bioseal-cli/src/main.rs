mod cli;
mod config;
mod prompt;
mod storage;

use crate::cli::ConfigCommand;
use bioseal_auth::BiometricStorage;
use bioseal_core::{InitOptions, PromptInfo, StorageError};
use bioseal_storage::key_provider::KeyStore;
use clap::Parser;
use color_eyre::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const HEALTH_PROBE: &str = "bioseal-health-probe";

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    match cli.command.unwrap_or(cli::Command::Status) {
        cli::Command::Read { name } => {
            let engine = storage::engine_from_config(&config)?;
            match read_entry(&engine, &name, config.options_for(&name), &config.prompt).await? {
                Some(content) => println!("{content}"),
                None => info!(entry = %name, "nothing stored"),
            }
        }
        cli::Command::Write { name, content } => {
            let engine = storage::engine_from_config(&config)?;
            let options = config.options_for(&name);
            write_entry(&engine, &name, options, &content, &config.prompt).await?;
            println!("Stored {name}");
        }
        cli::Command::Delete { name } => {
            let engine = storage::engine_from_config(&config)?;
            let options = config.options_for(&name);
            if delete_entry(&engine, &name, options).await? {
                println!("Deleted {name}");
            } else {
                println!("Nothing stored under {name}");
            }
        }
        cli::Command::Status => print_status(&config)?,
        cli::Command::Health => run_health_check(&config).await?,
        cli::Command::Version => print_version(),
        cli::Command::Config(ConfigCommand::Init) => init_config(&config)?,
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info to avoid noisy stdout.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Carry the structured payload so scripts can match on the stable code.
fn report(err: StorageError) -> color_eyre::Report {
    match serde_json::to_string(&err.payload()) {
        Ok(json) => color_eyre::eyre::eyre!(json),
        Err(_) => color_eyre::eyre::eyre!(err.to_string()),
    }
}

async fn read_entry<K: KeyStore + 'static>(
    engine: &BiometricStorage<K>,
    name: &str,
    options: InitOptions,
    prompt: &PromptInfo,
) -> Result<Option<String>> {
    engine.init(name, options, false).map_err(report)?;
    engine.read(name, prompt).await.map_err(report)
}

async fn write_entry<K: KeyStore + 'static>(
    engine: &BiometricStorage<K>,
    name: &str,
    options: InitOptions,
    content: &str,
    prompt: &PromptInfo,
) -> Result<()> {
    engine.init(name, options, false).map_err(report)?;
    engine.write(name, content, prompt).await.map_err(report)?;
    Ok(())
}

async fn delete_entry<K: KeyStore + 'static>(
    engine: &BiometricStorage<K>,
    name: &str,
    options: InitOptions,
) -> Result<bool> {
    engine.init(name, options, false).map_err(report)?;
    engine.delete(name).await.map_err(report)
}

fn print_status(config: &config::Config) -> Result<()> {
    let engine = storage::engine_from_config(config)?;
    let can_authenticate = engine.can_authenticate().map_err(report)?;
    let has_mechanism = engine.has_auth_mechanism().map_err(report)?;
    println!("Data dir: {}", engine.config().root.display());
    println!("Biometric: {can_authenticate}");
    println!("Any auth mechanism: {has_mechanism}");
    Ok(())
}

fn print_version() {
    println!("bioseal-cli {}", env!("CARGO_PKG_VERSION"));
}

/// Round-trips a probe entry that never prompts.
async fn run_health_check(config: &config::Config) -> Result<()> {
    let engine = storage::engine_from_config(config)?;
    run_engine_health(&engine).await?;
    println!("Storage: ok");
    Ok(())
}

async fn run_engine_health<K: KeyStore + 'static>(engine: &BiometricStorage<K>) -> Result<()> {
    let options = InitOptions {
        authentication_required: false,
        ..InitOptions::default()
    };
    let prompt = PromptInfo::default();
    write_entry(engine, HEALTH_PROBE, options.clone(), "ok", &prompt).await?;
    let round_trip = read_entry(engine, HEALTH_PROBE, options.clone(), &prompt).await?;
    delete_entry(engine, HEALTH_PROBE, options).await?;

    if round_trip.as_deref() != Some("ok") {
        color_eyre::eyre::bail!("storage round-trip failed");
    }
    Ok(())
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}

//! PassForge - local password strengthener
//!
//! Command-line front end: picks a GGUF model, inspects it, and strengthens
//! passwords with it entirely on this machine.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use passforge::inference::{self, LlamaRuntime, ModelSession};
use passforge::storage::PreferenceStore;
use passforge::strengthen::{CandidateStore, ModelPathSource, Strengthener, ZxcvbnScorer};
use passforge::system::{cpu, CpuFeatures};

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "passforge", version, about = "Strengthen passwords with a local language model")]
struct Cli {
    /// Preferences file (defaults to the platform data directory)
    #[arg(long, global = true, env = "PASSFORGE_PREFS")]
    prefs: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Remember a GGUF model for later runs
    SetModel {
        /// Path to the .gguf file
        path: PathBuf,
    },

    /// Forget the remembered model
    ForgetModel,

    /// Print the metadata of a GGUF model
    Inspect {
        /// Path to the .gguf file
        path: PathBuf,
    },

    /// Print the runtime build selected for this CPU
    Cpu,

    /// Generate stronger versions of passwords
    Strengthen {
        /// Model to use instead of the remembered one
        #[arg(long)]
        model: Option<PathBuf>,

        /// Keep earlier passwords and replies in the conversation
        #[arg(long)]
        store_chats: bool,

        /// CPU threads used for generation
        #[arg(long)]
        threads: Option<u32>,

        /// Passwords to strengthen
        #[arg(required = true)]
        passwords: Vec<String>,
    },
}

fn open_preferences(path: Option<PathBuf>) -> Result<PreferenceStore, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(PreferenceStore::open(path)),
        None => Ok(PreferenceStore::open_default()?),
    }
}

fn set_model(prefs: &PreferenceStore, path: PathBuf) -> CliResult {
    let header = inference::validate_gguf(&path)?;
    let path = std::fs::canonicalize(&path)?;
    let saved = prefs.update(|p| p.set_model(&path))?;

    println!(
        "Model set: {} (GGUF v{}, {} tensors)",
        saved.model_file_name.as_deref().unwrap_or_default(),
        header.version,
        header.tensor_count
    );
    Ok(())
}

fn forget_model(prefs: &PreferenceStore) -> CliResult {
    prefs.update(|p| p.clear_model())?;
    println!("Model forgotten");
    Ok(())
}

fn inspect(path: PathBuf) -> CliResult {
    let header = inference::validate_gguf(&path)?;
    let metadata = inference::read_metadata(&path)?;

    println!("File:            {}", path.display());
    println!("GGUF version:    {}", header.version);
    println!("Tensors:         {}", header.tensor_count);
    println!("Metadata keys:   {}", header.metadata_kv_count);
    println!("Architecture:    {}", metadata.architecture.as_deref().unwrap_or("unknown"));
    match metadata.context_size {
        Some(size) => println!("Context length:  {size}"),
        None => println!("Context length:  not set (default {})", inference::DEFAULT_CONTEXT_SIZE),
    }
    match &metadata.chat_template {
        Some(template) => println!("Chat template:   {} bytes", template.len()),
        None => println!("Chat template:   not set (built-in ChatML)"),
    }
    Ok(())
}

fn show_cpu() -> CliResult {
    let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").unwrap_or_default();
    let features = cpu::cpuinfo_features(&cpuinfo).unwrap_or_default();

    println!("Runtime variant: {}", cpu::runtime_variant());
    println!("Features:        {:?}", CpuFeatures::parse(features));
    Ok(())
}

async fn strengthen(
    prefs: PreferenceStore,
    model: Option<PathBuf>,
    store_chats: bool,
    threads: Option<u32>,
    passwords: Vec<String>,
) -> CliResult {
    let current = prefs.get();
    let mut params = current.inference.clone();
    params.store_chats |= store_chats;
    if let Some(threads) = threads {
        params.num_threads = threads;
    }
    params.validate();

    let paths: Arc<dyn ModelPathSource> = match model {
        Some(path) => Arc::new(Some(path)),
        None => Arc::new(prefs),
    };
    if paths.model_path().is_none() {
        return Err("no model selected; pass --model or run `passforge set-model <PATH>`".into());
    }

    let session = Arc::new(ModelSession::new(Arc::new(LlamaRuntime::new())));
    let store = Arc::new(CandidateStore::new());
    store.set_initial(passwords);

    let strengthener = Strengthener::new(Arc::clone(&session), Arc::new(ZxcvbnScorer), paths, store)
        .with_params(params)
        .with_stop_words(current.stop_words);

    strengthener.score_all().await;
    let improved = strengthener.improve_all().await;
    session.terminate();
    let improved = improved?;

    for row in strengthener.store().rows() {
        let before = row.score.map_or_else(|| "?".to_string(), |s| s.to_string());
        match row.selected() {
            Some(candidate) => println!("{} [{}] -> {} [{}]", row.original, before, candidate.value, candidate.score),
            None => println!("{} [{}] -> (no candidate)", row.original, before),
        }
    }
    info!("Strengthened {} password(s)", improved);
    Ok(())
}

async fn run(cli: Cli) -> CliResult {
    match cli.command {
        Command::Cpu => show_cpu(),
        Command::Inspect { path } => inspect(path),
        Command::SetModel { path } => set_model(&open_preferences(cli.prefs)?, path),
        Command::ForgetModel => forget_model(&open_preferences(cli.prefs)?),
        Command::Strengthen {
            model,
            store_chats,
            threads,
            passwords,
        } => strengthen(open_preferences(cli.prefs)?, model, store_chats, threads, passwords).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing subscriber for logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("passforge=info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

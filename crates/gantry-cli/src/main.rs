//! Gantry CLI - local inference gateway.
//!
//! Examples:
//!   gantry run                          # start the HTTP server
//!   gantry models list                  # list gallery models
//!   gantry models install hf@llama-7b   # install with a progress bar
//!   gantry tts "hello" -m voice-en      # one-shot text to speech
//!   gantry transcript talk.wav -m base  # one-shot transcription

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use gantry_core::{
    gallery, startup, AppOptions, BackendConfig, Gallery, InstallJob,
};

#[derive(Parser)]
#[command(
    name = "gantry",
    about = "Local inference gateway with an OpenAI-compatible API",
    version,
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server (the default when no subcommand is given)
    Run(RunArgs),

    /// Manage models and galleries
    Models {
        #[command(subcommand)]
        command: ModelCommands,
    },

    /// One-shot text to speech
    Tts(TtsArgs),

    /// One-shot transcription
    Transcript(TranscriptArgs),
}

#[derive(Subcommand)]
enum ModelCommands {
    /// List gallery models; installed ones are marked with `*`
    List {
        #[command(flatten)]
        storage: StorageArgs,
    },

    /// Install a gallery model synchronously with a progress bar
    Install {
        /// Gallery-model reference, e.g. `huggingface@llama-7b`
        reference: String,

        /// Local model name override
        #[arg(long)]
        name: Option<String>,

        #[command(flatten)]
        storage: StorageArgs,
    },
}

#[derive(Args, Clone)]
struct StorageArgs {
    /// Root of model files and per-model YAML configs
    #[arg(long, env = "MODELS_PATH")]
    models_path: Option<PathBuf>,

    /// JSON list of gallery descriptors
    #[arg(long, env = "GALLERIES")]
    galleries: Option<String>,
}

#[derive(Parser, Clone)]
struct RunArgs {
    /// Model configuration URLs or gallery references applied at startup
    models: Vec<String>,

    #[arg(long, env = "MODELS_PATH")]
    models_path: Option<PathBuf>,

    /// Extraction target for backend worker binaries
    #[arg(long, env = "BACKEND_ASSETS_PATH")]
    backend_assets_path: Option<PathBuf>,

    /// Default threads per backend
    #[arg(short, long, env = "THREADS")]
    threads: Option<usize>,

    /// Default context window
    #[arg(long, env = "CONTEXT_SIZE")]
    context_size: Option<usize>,

    /// Hint backends to use half precision
    #[arg(long, env = "F16")]
    f16: bool,

    /// Enable in-flight parallelism per backend
    #[arg(long, env = "PARALLEL_REQUESTS")]
    parallel_requests: bool,

    /// Allow only one live backend at a time
    #[arg(long, env = "SINGLE_ACTIVE_BACKEND")]
    single_active_backend: bool,

    /// Run startup tasks, then exit before listening
    #[arg(long, env = "PRELOAD_BACKEND_ONLY")]
    preload_backend_only: bool,

    /// External workers as name:addr pairs
    #[arg(long, env = "EXTERNAL_GRPC_BACKENDS", value_delimiter = ',')]
    external_grpc_backends: Vec<String>,

    /// Enable the idle watchdog
    #[arg(long, env = "WATCHDOG_IDLE")]
    watchdog_idle: bool,

    /// Threshold beyond which an idle backend is stopped
    #[arg(long, env = "WATCHDOG_IDLE_TIMEOUT", default_value = "15m")]
    watchdog_idle_timeout: String,

    /// Enable the busy watchdog
    #[arg(long, env = "WATCHDOG_BUSY")]
    watchdog_busy: bool,

    /// Threshold beyond which a busy backend is stopped
    #[arg(long, env = "WATCHDOG_BUSY_TIMEOUT", default_value = "5m")]
    watchdog_busy_timeout: String,

    /// JSON list of gallery descriptors
    #[arg(long, env = "GALLERIES")]
    galleries: Option<String>,

    /// Install the preload references at startup
    #[arg(long, env = "AUTOLOAD_GALLERIES")]
    autoload_galleries: bool,

    /// Bearer tokens required on every request
    #[arg(long, env = "API_KEYS", value_delimiter = ',')]
    api_keys: Vec<String>,

    /// Replace all error responses with blank 500s
    #[arg(long, env = "OPAQUE_ERRORS")]
    opaque_errors: bool,

    /// Enable permissive CORS
    #[arg(long, env = "CORS")]
    cors: bool,

    /// Bind address for the API server
    #[arg(long, env = "ADDRESS")]
    address: Option<String>,
}

#[derive(Args, Clone)]
struct TtsArgs {
    /// Text to synthesize
    #[arg(required = true)]
    text: Vec<String>,

    /// Model name (a configured model or a model file)
    #[arg(short, long)]
    model: String,

    /// Backend implementation
    #[arg(short, long, default_value = "piper")]
    backend: String,

    /// Voice to use
    #[arg(short, long)]
    voice: Option<String>,

    /// Output file path
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long, env = "MODELS_PATH")]
    models_path: Option<PathBuf>,

    #[arg(long, env = "BACKEND_ASSETS_PATH")]
    backend_assets_path: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct TranscriptArgs {
    /// Audio file to transcribe
    file: PathBuf,

    /// Model name
    #[arg(short, long)]
    model: String,

    /// Backend implementation
    #[arg(short, long, default_value = "whisper")]
    backend: String,

    /// Language hint
    #[arg(short, long)]
    language: Option<String>,

    /// Worker threads
    #[arg(short, long)]
    threads: Option<usize>,

    #[arg(long, env = "MODELS_PATH")]
    models_path: Option<PathBuf>,

    #[arg(long, env = "BACKEND_ASSETS_PATH")]
    backend_assets_path: Option<PathBuf>,
}

/// Accepts `90s`, `15m`, `2h`, or plain seconds.
fn parse_duration(raw: &str) -> anyhow::Result<Duration> {
    let raw = raw.trim();
    let (digits, unit) = raw.split_at(raw.len() - raw.chars().last().map(|c| c.len_utf8()).unwrap_or(0));
    let parse = |s: &str| s.parse::<u64>().context("invalid duration");
    match unit {
        "s" => Ok(Duration::from_secs(parse(digits)?)),
        "m" => Ok(Duration::from_secs(parse(digits)? * 60)),
        "h" => Ok(Duration::from_secs(parse(digits)? * 3600)),
        _ => Ok(Duration::from_secs(parse(raw)?)),
    }
}

fn parse_galleries(raw: Option<&str>) -> anyhow::Result<Vec<Gallery>> {
    match raw {
        Some(json) if !json.trim().is_empty() => {
            serde_json::from_str(json).context("invalid --galleries JSON")
        }
        _ => Ok(Vec::new()),
    }
}

fn options_from(args: &RunArgs) -> anyhow::Result<AppOptions> {
    let mut opts = AppOptions::default();

    if let Some(path) = &args.models_path {
        opts.models_path = path.clone();
    }
    if let Some(path) = &args.backend_assets_path {
        opts.backend_assets_path = path.clone();
    }
    if let Some(threads) = args.threads {
        opts.threads = threads;
    }
    if let Some(context_size) = args.context_size {
        opts.context_size = context_size;
    }
    opts.f16 = args.f16;
    opts.parallel_requests = args.parallel_requests;
    opts.single_active_backend = args.single_active_backend;

    let mut external = HashMap::new();
    for pair in &args.external_grpc_backends {
        let Some((name, addr)) = pair.split_once(':') else {
            bail!("external backend '{pair}' is not name:addr");
        };
        external.insert(name.to_string(), addr.to_string());
    }
    opts.external_backends = external;

    if args.watchdog_idle {
        opts.watchdog_idle_timeout = Some(parse_duration(&args.watchdog_idle_timeout)?);
    }
    if args.watchdog_busy {
        opts.watchdog_busy_timeout = Some(parse_duration(&args.watchdog_busy_timeout)?);
    }

    opts.galleries = parse_galleries(args.galleries.as_deref())?;
    opts.autoload_galleries = args.autoload_galleries;
    if args.autoload_galleries {
        opts.preload_models = args.models.clone();
    }
    opts.api_keys = args.api_keys.clone();
    opts.opaque_errors = args.opaque_errors;
    opts.cors = args.cors;
    if let Some(address) = &args.address {
        opts.address = address.clone();
    }

    Ok(opts)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gantry_core=info,gantry_server=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli
        .command
        .unwrap_or_else(|| Commands::Run(RunArgs::parse_from(["gantry"])))
    {
        Commands::Run(args) => run(args).await,
        Commands::Models { command } => match command {
            ModelCommands::List { storage } => models_list(storage).await,
            ModelCommands::Install {
                reference,
                name,
                storage,
            } => models_install(reference, name, storage).await,
        },
        Commands::Tts(args) => tts(args).await,
        Commands::Transcript(args) => transcript(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let opts = options_from(&args)?;
    let app = Arc::new(startup(opts).await?);

    if args.preload_backend_only {
        app.shutdown().await;
        return Ok(());
    }

    gantry_server::serve(app).await?;
    Ok(())
}

async fn models_list(storage: StorageArgs) -> anyhow::Result<()> {
    let galleries = parse_galleries(storage.galleries.as_deref())?;
    if galleries.is_empty() {
        bail!("no galleries configured; pass --galleries or set GALLERIES");
    }
    let models_path = storage
        .models_path
        .unwrap_or_else(|| AppOptions::default().models_path);

    let client = reqwest::Client::new();
    let models = gallery::list_available(&client, &galleries, &models_path).await?;
    for model in models {
        let marker = if model.installed { "*" } else { " " };
        println!("{marker} {}@{}", model.gallery, model.name);
    }
    Ok(())
}

async fn models_install(
    reference: String,
    name: Option<String>,
    storage: StorageArgs,
) -> anyhow::Result<()> {
    let galleries = parse_galleries(storage.galleries.as_deref())?;
    if galleries.is_empty() {
        bail!("no galleries configured; pass --galleries or set GALLERIES");
    }
    let models_path = storage
        .models_path
        .unwrap_or_else(|| AppOptions::default().models_path);
    tokio::fs::create_dir_all(&models_path).await?;

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {bytes}/{total_bytes} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
    );

    let job = InstallJob {
        id: Uuid::new_v4(),
        model: reference.clone(),
        name,
        galleries,
        overlay: None,
    };
    let client = reqwest::Client::new();
    let progress_bar = bar.clone();
    gallery::apply_model(
        &client,
        &models_path,
        &job,
        &move |file: &str, downloaded: u64, total: u64, _pct: f64| {
            progress_bar.set_length(total);
            progress_bar.set_position(downloaded);
            progress_bar.set_message(file.to_string());
        },
        &CancellationToken::new(),
    )
    .await?;

    bar.finish_with_message(format!("{reference} installed"));
    Ok(())
}

/// Config for a one-shot CLI invocation: use the stored model config when it
/// exists, otherwise synthesize one from the flags.
fn one_shot_config(
    app: &gantry_core::Application,
    model: &str,
    backend: &str,
) -> BackendConfig {
    match app.store.get(model) {
        Some(cfg) => (*cfg).clone(),
        None => {
            let mut cfg = BackendConfig {
                name: model.to_string(),
                backend: backend.to_string(),
                model: model.to_string(),
                ..Default::default()
            };
            cfg.set_defaults(&app.opts);
            cfg
        }
    }
}

async fn tts(args: TtsArgs) -> anyhow::Result<()> {
    let mut opts = AppOptions::default();
    if let Some(path) = &args.models_path {
        opts.models_path = path.clone();
    }
    if let Some(path) = &args.backend_assets_path {
        opts.backend_assets_path = path.clone();
    }
    let app = startup(opts).await?;

    let cfg = one_shot_config(&app, &args.model, &args.backend);
    let text = args.text.join(" ");
    let destination = app.opts.audio_path.display().to_string();
    let path = app
        .loader
        .tts(
            &cfg,
            text,
            args.voice.clone(),
            Some(destination),
            &CancellationToken::new(),
        )
        .await?;

    let produced = PathBuf::from(path);
    let final_path = match &args.output {
        Some(output) => {
            tokio::fs::copy(&produced, output).await?;
            output.clone()
        }
        None => produced,
    };
    println!("{}", final_path.display());

    app.shutdown().await;
    Ok(())
}

async fn transcript(args: TranscriptArgs) -> anyhow::Result<()> {
    let mut opts = AppOptions::default();
    if let Some(path) = &args.models_path {
        opts.models_path = path.clone();
    }
    if let Some(path) = &args.backend_assets_path {
        opts.backend_assets_path = path.clone();
    }
    if let Some(threads) = args.threads {
        opts.threads = threads;
    }
    let app = startup(opts).await?;

    let cfg = one_shot_config(&app, &args.model, &args.backend);
    let segments = app
        .loader
        .transcribe(
            &cfg,
            args.file.display().to_string(),
            args.language.clone(),
            args.threads,
            &CancellationToken::new(),
        )
        .await?;

    for segment in &segments {
        println!("[{:>7.2}s -> {:>7.2}s] {}", segment.start, segment.end, segment.text);
    }

    app.shutdown().await;
    Ok(())
}

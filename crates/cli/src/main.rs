use clap::{Parser, Subcommand};
use lib::llm::{GeminiClient, ModelBackend};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Persona chat bot relay (LINE / Telegram → Gemini)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the webhook server (POST /callback for LINE, /telegram/webhook for Telegram).
    Serve {
        /// Config file path (default: RELAY_CONFIG_PATH or ~/.relay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Listen port (default from PORT, config, or 8080)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// List generation models the provider offers and show which one would be selected.
    Models {
        /// Config file path (default: RELAY_CONFIG_PATH or ~/.relay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Route text through the persona and model without a chat platform. Interactive when TEXT is omitted
    /// (`/reset` clears the sender's history, `/exit` quits).
    Ask {
        /// Config file path (default: RELAY_CONFIG_PATH or ~/.relay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Sender id used for conversation history.
        #[arg(long, default_value = "cli")]
        sender: String,

        /// Message to send.
        text: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("relay {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Serve { config, port }) => run_serve(config, port).await,
        Some(Commands::Models { config }) => run_models(config).await,
        Some(Commands::Ask {
            config,
            sender,
            text,
        }) => run_ask(config, sender, text).await,
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };
    if let Err(e) = result {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run_serve(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, path) = lib::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!(
        "starting gateway on {}:{} (config {})",
        config.gateway.bind,
        config.gateway.port,
        path.display()
    );
    lib::gateway::run_gateway(config).await
}

fn model_client(config: &lib::config::Config) -> anyhow::Result<GeminiClient> {
    let api_key = lib::config::resolve_model_api_key(config).ok_or_else(|| {
        anyhow::anyhow!("model API key not configured (set model.apiKey or GEMINI_API_KEY)")
    })?;
    let client = GeminiClient::new(
        api_key,
        config.model.base_url.clone(),
        Duration::from_secs(config.model.timeout_secs),
    )?;
    Ok(client)
}

async fn run_models(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, _) = lib::config::load_config(config_path)?;
    let client = model_client(&config)?;
    let probe = client.list_models().await;
    match &probe {
        Ok(list) => {
            for name in list {
                println!("{}", lib::selection::normalize_model_id(name));
            }
        }
        Err(e) => eprintln!("listing models failed: {}", e),
    }
    let selected = lib::selection::select_model(
        &config.model.preferred_models,
        probe,
        config.model.fallback_model.as_deref(),
    );
    println!("selected: {}", selected);
    Ok(())
}

async fn run_ask(
    config_path: Option<PathBuf>,
    sender: String,
    text: Option<String>,
) -> anyhow::Result<()> {
    use std::io::{self, Write};

    let (config, _) = lib::config::load_config(config_path)?;
    let backend: Arc<dyn ModelBackend> = Arc::new(model_client(&config)?);
    let model = lib::selection::resolve_model(
        backend.as_ref(),
        &config.model.preferred_models,
        config.model.fallback_model.as_deref(),
    )
    .await;
    let router = lib::router::Router::new(
        &config,
        model,
        backend,
        Arc::new(lib::channels::ChannelRegistry::new()),
    );

    if let Some(text) = text {
        println!("{}", router.route_text(&sender, &text).await.trim());
        return Ok(());
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }
        if input.eq_ignore_ascii_case("/reset") {
            router.conversations().remove(&sender).await;
            println!("(history cleared)");
            continue;
        }
        println!("< {}", router.route_text(&sender, input).await.trim());
    }
    Ok(())
}

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use lora_web::error::{Error, Result};
use lora_web::like_store::LikeStore;
use lora_web::llm::{train, ChatLlm};
use lora_web::routes::{self, AppState};
use lora_web::settings::Settings;

#[derive(Parser)]
#[command(name = "lora-web", about = "Adapter fine-tuning and chat serving")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the chat API (and the UI, when an asset directory is present)
    Serve,
    /// Fine-tune the adapter offline and write the artifact directory
    Train {
        /// Dataset file, a JSON array of {instruction, response} pairs
        #[arg(long)]
        data: Option<String>,
        /// Adapter output directory
        #[arg(long)]
        output: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let settings = Settings::new()?;

    match cli.command {
        Command::Train { data, output } => {
            let mut cfg = settings
                .train
                .ok_or_else(|| Error::msg("missing [train] section in the settings file"))?;
            if let Some(data) = data {
                cfg.data = data;
            }
            if let Some(output) = output {
                cfg.output_dir = output;
            }
            train::run(&settings.llm, &cfg)
        }
        Command::Serve => serve(settings).await,
    }
}

async fn serve(settings: Settings) -> Result<()> {
    // Load everything before binding: a half-initialized server never
    // accepts a request.
    let llm = ChatLlm::load(&settings.llm)?;
    let state = AppState {
        llm: Arc::new(Mutex::new(llm)),
        likes: Arc::new(LikeStore::new(&settings.server.like_store)),
    };

    let ui_dir = settings
        .server
        .ui_dir
        .as_ref()
        .map(PathBuf::from)
        .filter(|dir| dir.is_dir());
    if ui_dir.is_none() {
        tracing::info!("no UI asset directory, serving the API only");
    }

    let routes = routes::create_routes(state, ui_dir);
    let listener = tokio::net::TcpListener::bind(&settings.server.bind_addr).await?;
    tracing::info!(addr = %settings.server.bind_addr, "listening");
    axum::serve(listener, routes).await?;
    Ok(())
}

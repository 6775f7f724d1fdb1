use clap::Parser;
use std::path::PathBuf;
use streamgate::app_state::{AppConfig, AppState};
use streamgate::server;

#[derive(Parser, Debug)]
#[command(name = "streamgate")]
#[command(about = "Streaming upload and chat relay gateway")]
struct CliArgs {
    /// Host address to bind the gateway server
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port number to bind the gateway server
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Base URL of the OpenAI-compatible text-generation backend
    #[arg(long, default_value = "https://api.openai.com/v1")]
    backend_url: String,

    /// Bearer token for the backend, if it requires one
    #[arg(long)]
    api_key: Option<String>,

    /// Model identifier sent with every generation request
    #[arg(long, default_value = "gpt-3.5-turbo")]
    model: String,

    /// Timeout in seconds for backend requests
    #[arg(long, default_value_t = 600)]
    timeout: u64,

    /// Directory the object store keeps uploaded objects in
    #[arg(long, default_value = "./objects")]
    store_root: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let config = AppConfig {
        host: args.host,
        port: args.port,
        backend_url: args.backend_url,
        api_key: args.api_key,
        model: args.model,
        timeout: args.timeout,
        store_root: args.store_root,
    };

    actix_web::rt::System::new().block_on(async move {
        let state = AppState::new(&config).await?;
        server::startup(config, state).await?;
        Ok(())
    })
}

pub mod cli;
pub mod console;
pub mod dify;
pub mod format;
pub mod models;
pub mod server;
pub mod session;
pub mod stream;

use cli::Args;
use log::info;
use server::api::BotKeys;
use server::Server;
use std::error::Error;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    let keys = BotKeys::from_args(&args);

    info!("--- Core Configuration ---");
    info!("Mode: {}", args.mode);
    info!("Server Address: {}", args.server_addr);
    info!("Dify Base URL: {}", args.dify_base_url);
    info!("Request Timeout: {}s", args.request_timeout_secs);
    info!("TLS Enabled: {}", args.enable_tls);
    info!("Default Key Configured: {}", keys.default.is_some());
    info!(
        "Bot Keys Configured: yamamoto={} twitter={} facebook={} profile={}",
        keys.yamamoto.is_some(),
        keys.twitter.is_some(),
        keys.facebook.is_some(),
        keys.profile.is_some()
    );
    info!("-------------------------");

    match args.mode.as_str() {
        "chat" => console::run_chat(args).await,
        _ => {
            let addr = args.server_addr.clone();
            Server::new(addr, keys, args).run().await
        }
    }
}

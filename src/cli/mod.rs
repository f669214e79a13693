use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Run mode: "serve" starts the key relay, "chat" starts the terminal
    /// chat front-end.
    #[arg(long, env = "MODE", default_value = "serve")]
    pub mode: String,

    // --- Relay Server Args ---
    /// Host address and port for the relay server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    /// Optional path to the TLS certificate file (PEM format). Requires --tls-key-path.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format). Requires --tls-cert-path.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,

    // --- Dify API Args ---
    /// Base URL of the hosted Dify API.
    #[arg(long, env = "DIFY_BASE_URL", default_value = "https://api.dify.ai")]
    pub dify_base_url: String,

    /// Default Dify API key, used when no bot-specific key applies.
    #[arg(long, env = "DIFY_API_KEY", default_value = "")]
    pub dify_api_key: String,

    /// Dify API key for the "yamamoto" bot.
    #[arg(long, env = "DIFY_API_KEY_YAMAMOTO", default_value = "")]
    pub dify_api_key_yamamoto: String,

    /// Dify API key for the "twitter" bot.
    #[arg(long, env = "DIFY_API_KEY_TWITTER", default_value = "")]
    pub dify_api_key_twitter: String,

    /// Dify API key for the "facebook" bot.
    #[arg(long, env = "DIFY_API_KEY_FACEBOOK", default_value = "")]
    pub dify_api_key_facebook: String,

    /// Dify API key for the "profile" bot.
    #[arg(long, env = "DIFY_API_KEY_PROFILE", default_value = "")]
    pub dify_api_key_profile: String,

    /// Upstream request timeout in seconds. A stalled upstream connection
    /// is cut rather than left hanging.
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "30")]
    pub request_timeout_secs: u64,

    // --- Chat Front-End Args ---
    /// Relay /api/config URL the chat front-end fetches its key from when
    /// DIFY_API_KEY is unset (mirrors the widget's config lookup).
    #[arg(long, env = "CONFIG_URL")]
    pub config_url: Option<String>,
}

//! Terminal chat front-end, standing in for the browser widget.
//!
//! Reads one line per turn and streams the answer before reading the next,
//! so a single request is outstanding at any time (the widget disabled its
//! send button for the same reason).

use crate::cli::Args;
use crate::dify::DifyClient;
use crate::format::TextFormatter;
use crate::models::chat::Transcript;
use crate::session::ChatSession;
use crate::stream::{MessageSink, StreamConsumer};
use log::{info, warn};
use std::error::Error;
use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

const SEND_FAILED_MESSAGE: &str =
    "申し訳ございません。メッセージの送信に失敗しました。しばらく時間をおいてから再度お試しください。";

pub async fn run_chat(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    let api_key = resolve_api_key(&args).await?;
    let client = DifyClient::new(
        &api_key,
        &args.dify_base_url,
        Duration::from_secs(args.request_timeout_secs),
    )?;

    let mut session = ChatSession::new();
    let mut transcript = Transcript::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("Connected. Type a message, or /quit to exit.");
    print_prompt();
    while let Some(line) = lines.next_line().await? {
        let message = line.trim();
        if message.is_empty() {
            print_prompt();
            continue;
        }
        if message == "/quit" {
            break;
        }
        transcript.push_user(message);

        let mut sink = TerminalSink::new();
        match client
            .chat_stream(message, session.conversation_id(), session.user_id())
            .await
        {
            Ok(body) => {
                let mut consumer =
                    StreamConsumer::new(&mut session, &mut sink, TextFormatter::minimal());
                if let Err(e) = consumer.consume(body).await {
                    warn!("Stream ended abnormally: {}", e);
                }
            }
            Err(e) => {
                warn!("Chat request failed: {}", e);
                sink.report_error(SEND_FAILED_MESSAGE);
            }
        }

        let answer = sink.into_answer();
        if !answer.is_empty() {
            transcript.push_bot(answer);
        }
        print_prompt();
    }

    info!("Chat session closed ({} messages)", transcript.messages().len());
    Ok(())
}

/// Key lookup mirrors the widget: prefer the local key, otherwise ask a
/// relay's /api/config endpoint for it.
async fn resolve_api_key(args: &Args) -> Result<String, Box<dyn Error + Send + Sync>> {
    if !args.dify_api_key.is_empty() {
        return Ok(args.dify_api_key.clone());
    }
    if let Some(url) = &args.config_url {
        info!("Fetching API key from {}", url);
        let config: serde_json::Value = reqwest::get(url).await?.error_for_status()?.json().await?;
        if let Some(key) = config["DIFY_API_KEY"].as_str() {
            return Ok(key.to_string());
        }
        return Err("config endpoint returned no DIFY_API_KEY".into());
    }
    Err("no API key: set DIFY_API_KEY or --config-url".into())
}

fn print_prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

/// Renders formatted HTML snapshots onto the terminal. Updates normally
/// extend the previous render, so only the new suffix is printed; when a
/// revision is not an extension the whole message is reprinted.
struct TerminalSink {
    rendered: String,
    finalized: Option<String>,
}

impl TerminalSink {
    fn new() -> Self {
        Self {
            rendered: String::new(),
            finalized: None,
        }
    }

    /// The completed answer, or whatever was rendered when the stream
    /// stopped early.
    fn into_answer(self) -> String {
        self.finalized.unwrap_or(self.rendered)
    }
}

fn html_to_text(html: &str) -> String {
    html.replace("<br>", "\n")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

impl MessageSink for TerminalSink {
    fn open_message(&mut self) {
        self.rendered.clear();
        print!("Bot: ");
        let _ = std::io::stdout().flush();
    }

    fn update_message(&mut self, html: &str) {
        let text = html_to_text(html);
        match text.strip_prefix(self.rendered.as_str()) {
            Some(suffix) => print!("{}", suffix),
            None => print!("\n{}", text),
        }
        let _ = std::io::stdout().flush();
        self.rendered = text;
    }

    fn finalize_message(&mut self, _conversation_id: &str) {
        println!();
        self.finalized = Some(std::mem::take(&mut self.rendered));
    }

    fn report_error(&mut self, _message: &str) {
        println!();
        println!("{}", SEND_FAILED_MESSAGE);
        self.finalized = Some(SEND_FAILED_MESSAGE.to_string());
    }
}

use crate::cli::Args;
use crate::dify::{DifyClient, DifyError};
use crate::format::TextFormatter;
use crate::session::ChatSession;
use crate::stream::{MessageSink, StreamConsumer};
use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::StreamExt;
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

/// User-facing fallback strings, kept verbatim from the widget deployment.
/// Upstream failures never surface raw error detail.
const MISSING_KEY_MESSAGE: &str =
    "サービスの設定を確認中です。しばらくしてから再度お試しください。";
const UPSTREAM_BUSY_MESSAGE: &str =
    "ただいまサービスが混雑しています。少し時間をおいてから再度お試しください。";
const UNAVAILABLE_MESSAGE: &str =
    "申し訳ございません。一時的にサービスにアクセスできません。しばらくしてから再度お試しください。";

#[derive(Deserialize)]
pub struct RelayChatRequest {
    #[serde(default)]
    pub query: String,
    pub conversation_id: Option<String>,
    pub user: Option<String>,
    #[serde(rename = "botType")]
    pub bot_type: Option<String>,
    #[serde(default = "default_response_mode")]
    pub response_mode: String,
}

fn default_response_mode() -> String {
    "blocking".to_string()
}

/// Server-held API keys, one per bot plus the default. Empty env values
/// count as unset.
#[derive(Clone, Debug, Default)]
pub struct BotKeys {
    pub default: Option<String>,
    pub yamamoto: Option<String>,
    pub twitter: Option<String>,
    pub facebook: Option<String>,
    pub profile: Option<String>,
}

impl BotKeys {
    pub fn from_args(args: &Args) -> Self {
        fn non_empty(s: &str) -> Option<String> {
            if s.is_empty() {
                None
            } else {
                Some(s.to_string())
            }
        }
        Self {
            default: non_empty(&args.dify_api_key),
            yamamoto: non_empty(&args.dify_api_key_yamamoto),
            twitter: non_empty(&args.dify_api_key_twitter),
            facebook: non_empty(&args.dify_api_key_facebook),
            profile: non_empty(&args.dify_api_key_profile),
        }
    }

    /// Key for a bot identifier; unknown or unset identifiers fall back to
    /// the default key.
    pub fn select(&self, bot_type: Option<&str>) -> Option<&str> {
        let specific = match bot_type {
            Some("yamamoto") => self.yamamoto.as_deref(),
            Some("twitter") => self.twitter.as_deref(),
            Some("facebook") => self.facebook.as_deref(),
            Some("profile") => self.profile.as_deref(),
            _ => None,
        };
        specific.or(self.default.as_deref())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub keys: BotKeys,
    pub args: Args,
}

pub async fn start_http_server(
    addr: &str,
    keys: BotKeys,
    args: Args,
) -> Result<(), Box<dyn StdError + Send + Sync>> {
    let addr = addr.parse::<SocketAddr>()?;
    info!("Starting relay server on: http://{}", addr);

    let state = AppState {
        keys,
        args: args.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/config", get(get_config).fallback(method_not_allowed))
        .route("/api/chat", post(post_chat).fallback(method_not_allowed))
        .layer(cors)
        .with_state(state);

    if args.enable_tls && args.tls_cert_path.is_some() && args.tls_key_path.is_some() {
        let cert_path = args.tls_cert_path.as_ref().unwrap();
        let key_path = args.tls_key_path.as_ref().unwrap();

        let tls_config =
            axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_path, key_path).await?;

        info!("TLS enabled for relay server");
        axum_server::bind_rustls(addr, tls_config)
            .serve(app.into_make_service())
            .await?;
    } else {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(
                    "Failed to bind relay server to {}: {}. Try a different port.",
                    addr, e
                );
                return Err(Box::new(e));
            }
        };
        axum::serve(listener, app.into_make_service()).await?;
    }

    Ok(())
}

async fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({ "error": "Method not allowed" })),
    )
        .into_response()
}

/// GET /api/config — expose the default key to the widget. The relay's
/// streaming mode makes this unnecessary for new deployments; it is kept
/// for pages that still call the hosted API directly.
async fn get_config(State(state): State<AppState>) -> Response {
    match state.keys.default {
        Some(ref key) => Json(json!({ "DIFY_API_KEY": key })).into_response(),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "API key not configured" })),
        )
            .into_response(),
    }
}

/// POST /api/chat — forward a chat query upstream with a server-held key.
/// Upstream failures are normalized to a 200 apology payload so the client
/// never has to special-case transport errors.
async fn post_chat(State(state): State<AppState>, Json(req): Json<RelayChatRequest>) -> Response {
    if req.query.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Query is required" })),
        )
            .into_response();
    }

    let api_key = match state.keys.select(req.bot_type.as_deref()) {
        Some(key) => key.to_string(),
        None => {
            warn!("No API key configured for botType {:?}", req.bot_type);
            return fallback_response(MISSING_KEY_MESSAGE, req.conversation_id.as_deref());
        }
    };

    let timeout = Duration::from_secs(state.args.request_timeout_secs);
    let client = match DifyClient::new(&api_key, &state.args.dify_base_url, timeout) {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to build upstream client: {}", e);
            return fallback_response(UNAVAILABLE_MESSAGE, req.conversation_id.as_deref());
        }
    };

    if req.response_mode == "streaming" {
        relay_stream(client, req).await
    } else {
        relay_blocking(client, req).await
    }
}

async fn relay_blocking(client: DifyClient, req: RelayChatRequest) -> Response {
    let conversation_id = req.conversation_id.as_deref().unwrap_or("");
    let user = req
        .user
        .clone()
        .unwrap_or_else(|| format!("user-{}", Uuid::new_v4()));

    match client.chat_blocking(&req.query, conversation_id, &user).await {
        Ok(upstream) => Json(upstream).into_response(),
        Err(DifyError::BadStatus(status)) => {
            warn!("Upstream rejected blocking chat: {}", status);
            fallback_response(UPSTREAM_BUSY_MESSAGE, req.conversation_id.as_deref())
        }
        Err(e) => {
            error!("Blocking chat failed: {}", e);
            fallback_response(UNAVAILABLE_MESSAGE, req.conversation_id.as_deref())
        }
    }
}

/// Streaming relay: consumes the upstream SSE server-side and re-emits
/// Dify-shaped records where each `message` carries the full formatted HTML
/// snapshot (the overwrite-in-place contract for the rendering client).
async fn relay_stream(client: DifyClient, req: RelayChatRequest) -> Response {
    let conversation_id = req.conversation_id.clone().unwrap_or_default();
    let user = req
        .user
        .clone()
        .unwrap_or_else(|| format!("user-{}", Uuid::new_v4()));

    let body = match client.chat_stream(&req.query, &conversation_id, &user).await {
        Ok(body) => body,
        Err(DifyError::BadStatus(status)) => {
            warn!("Upstream rejected streaming chat: {}", status);
            return fallback_response(UPSTREAM_BUSY_MESSAGE, req.conversation_id.as_deref());
        }
        Err(e) => {
            error!("Streaming chat failed to start: {}", e);
            return fallback_response(UNAVAILABLE_MESSAGE, req.conversation_id.as_deref());
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let mut session = ChatSession::resume(conversation_id, user);
    tokio::spawn(async move {
        let mut sink = SseSink { tx };
        let mut consumer = StreamConsumer::new(&mut session, &mut sink, TextFormatter::full());
        if let Err(e) = consumer.consume(body).await {
            warn!("Relayed stream ended abnormally: {}", e);
        }
    });

    Sse::new(UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>))
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Sink that forwards render updates downstream as SSE records.
struct SseSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl SseSink {
    fn send(&self, payload: serde_json::Value) {
        // A closed channel means the downstream client went away; the
        // consumer keeps draining the upstream, which is harmless.
        let _ = self.tx.send(Event::default().data(payload.to_string()));
    }
}

impl MessageSink for SseSink {
    fn open_message(&mut self) {
        self.send(json!({ "event": "message_start" }));
    }

    fn update_message(&mut self, html: &str) {
        self.send(json!({ "event": "message", "answer": html }));
    }

    fn finalize_message(&mut self, conversation_id: &str) {
        self.send(json!({ "event": "message_end", "conversation_id": conversation_id }));
    }

    fn report_error(&mut self, _message: &str) {
        // Raw upstream detail stays server-side.
        self.send(json!({ "event": "error", "message": UNAVAILABLE_MESSAGE }));
    }
}

fn fallback_response(message: &str, conversation_id: Option<&str>) -> Response {
    let id = conversation_id
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("temp-{}", Utc::now().timestamp_millis()));
    Json(json!({ "answer": message, "conversation_id": id })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use clap::Parser;
    use tower::ServiceExt;

    fn test_args() -> Args {
        // Parse with no CLI input, then clear the key fields explicitly so
        // the tests are independent of the surrounding environment.
        let mut args = Args::parse_from(["dify-relay"]);
        args.dify_api_key = String::new();
        args.dify_api_key_yamamoto = String::new();
        args.dify_api_key_twitter = String::new();
        args.dify_api_key_facebook = String::new();
        args.dify_api_key_profile = String::new();
        args
    }

    fn state_with_keys(keys: BotKeys) -> AppState {
        AppState {
            keys,
            args: test_args(),
        }
    }

    fn router(state: AppState) -> Router {
        Router::new()
            .route("/api/config", get(get_config).fallback(method_not_allowed))
            .route("/api/chat", post(post_chat).fallback(method_not_allowed))
            .with_state(state)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn unknown_bot_type_falls_back_to_default_key() {
        let keys = BotKeys {
            default: Some("default-key".into()),
            yamamoto: Some("yamamoto-key".into()),
            ..BotKeys::default()
        };
        assert_eq!(keys.select(Some("yamamoto")), Some("yamamoto-key"));
        assert_eq!(keys.select(Some("instagram")), Some("default-key"));
        assert_eq!(keys.select(None), Some("default-key"));
        // A known bot with no key of its own also falls back.
        assert_eq!(keys.select(Some("twitter")), Some("default-key"));
    }

    #[test]
    fn empty_key_values_count_as_unset() {
        let keys = BotKeys::from_args(&test_args());
        assert_eq!(keys.select(Some("yamamoto")), None);
        assert_eq!(keys.select(None), None);
    }

    #[tokio::test]
    async fn config_returns_key_when_set() {
        let state = state_with_keys(BotKeys {
            default: Some("secret".into()),
            ..BotKeys::default()
        });
        let response = get_config(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["DIFY_API_KEY"], "secret");
    }

    #[tokio::test]
    async fn config_without_key_is_a_500() {
        let response = get_config(State(state_with_keys(BotKeys::default()))).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"], "API key not configured");
    }

    #[tokio::test]
    async fn blank_query_is_a_400() {
        let req = RelayChatRequest {
            query: "  ".into(),
            conversation_id: None,
            user: None,
            bot_type: None,
            response_mode: default_response_mode(),
        };
        let response = post_chat(State(state_with_keys(BotKeys::default())), Json(req)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Query is required");
    }

    #[tokio::test]
    async fn no_configured_key_yields_soft_fallback() {
        let req = RelayChatRequest {
            query: "hello".into(),
            conversation_id: None,
            user: None,
            bot_type: Some("instagram".into()),
            response_mode: default_response_mode(),
        };
        let response = post_chat(State(state_with_keys(BotKeys::default())), Json(req)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["answer"], MISSING_KEY_MESSAGE);
        assert!(body["conversation_id"]
            .as_str()
            .unwrap()
            .starts_with("temp-"));
    }

    #[tokio::test]
    async fn fallback_keeps_an_existing_conversation_id() {
        let req = RelayChatRequest {
            query: "hello".into(),
            conversation_id: Some("abc".into()),
            user: None,
            bot_type: None,
            response_mode: default_response_mode(),
        };
        let response = post_chat(State(state_with_keys(BotKeys::default())), Json(req)).await;
        let body = body_json(response).await;
        assert_eq!(body["conversation_id"], "abc");
    }

    #[tokio::test]
    async fn wrong_method_is_a_405_with_json_body() {
        let app = router(state_with_keys(BotKeys::default()));
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/config")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        let body = body_json(response.into_response()).await;
        assert_eq!(body["error"], "Method not allowed");
    }

    #[tokio::test]
    async fn get_on_chat_route_is_a_405() {
        let app = router(state_with_keys(BotKeys::default()));
        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/api/chat")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn sse_sink_emits_one_record_per_callback() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = SseSink { tx };
        sink.open_message();
        sink.update_message("こんにちは。<br>");
        sink.finalize_message("abc");
        drop(sink);

        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }
}

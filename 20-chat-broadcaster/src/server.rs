use std::{
    future::{Future, IntoFuture},
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{ConnectInfo, State, WebSocketUpgrade},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::JoinHandle,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    connection::{MAX_LINE_BYTES, StreamConnection},
    hub::{Hub, HubHandle},
    session::{SessionConfig, run_session},
    ws::WsConnection,
};

/// Placeholder in the landing page template replaced by the chat URL.
pub const CHAT_URL_PLACEHOLDER: &str = "{{chat_url}}";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address for HTTP and WebSocket clients.
    pub listen: String,
    /// Public WebSocket URL rendered into the landing page.
    pub chat_url: String,
    /// Optional second socket for raw newline-delimited TCP clients.
    pub tcp_listen: Option<String>,
    pub template: PathBuf,
    pub session: SessionConfig,
}

#[derive(Clone)]
struct AppState {
    hub: HubHandle,
    chat_url: Arc<str>,
    template: Arc<Path>,
    session: SessionConfig,
}

pub struct Server {
    http: TcpListener,
    tcp: Option<TcpListener>,
    state: AppState,
    hub_task: JoinHandle<()>,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let http = TcpListener::bind(&config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        let tcp = match &config.tcp_listen {
            Some(addr) => Some(
                TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("failed to bind {addr}"))?,
            ),
            None => None,
        };

        let (hub, hub_task) = Hub::spawn();
        Ok(Self {
            http,
            tcp,
            state: AppState::new(hub, &config),
            hub_task,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.http.local_addr()
    }

    pub fn tcp_addr(&self) -> Option<io::Result<SocketAddr>> {
        self.tcp.as_ref().map(TcpListener::local_addr)
    }

    pub fn hub(&self) -> HubHandle {
        self.state.hub.clone()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            http,
            tcp,
            state,
            hub_task,
        } = self;
        tokio::pin!(shutdown);

        let app = build_router(state.clone())
            .into_make_service_with_connect_info::<SocketAddr>();
        let serve = axum::serve(http, app).into_future();

        let result = select! {
            _ = &mut shutdown => {
                info!("server shutting down");
                Ok(())
            }
            served = serve => served.context("http server failed"),
            _ = accept_tcp(tcp, state.clone()) => Ok(()),
        };

        // Closing every outbound queue ends each writer, which in turn
        // ends its session.
        if state.hub.shutdown().is_err() {
            debug!("hub already stopped");
        }
        if let Err(err) = hub_task.await {
            warn!(error = ?err, "hub task failed");
        }

        result
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

impl AppState {
    fn new(hub: HubHandle, config: &ServerConfig) -> Self {
        Self {
            hub,
            chat_url: Arc::from(config.chat_url.as_str()),
            template: Arc::from(config.template.as_path()),
            session: config.session,
        }
    }
}

/// HTTP routes: the landing page at `/` and the WebSocket endpoint at `/chat`.
pub fn router(hub: HubHandle, config: &ServerConfig) -> Router {
    build_router(AppState::new(hub, config))
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(landing_page))
        .route("/chat", get(chat))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn landing_page(State(state): State<AppState>) -> Response {
    match render_landing_page(&state.template, &state.chat_url).await {
        Ok(page) => Html(page).into_response(),
        Err(err) => {
            warn!(
                template = %state.template.display(),
                error = ?err,
                "failed to load landing page"
            );
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

/// Reads the template and substitutes every chat URL placeholder.
///
/// The placeholder sits inside script string literals, so the URL is
/// escaped for a JavaScript string that is itself embedded in HTML.
pub async fn render_landing_page(template: &Path, chat_url: &str) -> io::Result<String> {
    let raw = tokio::fs::read_to_string(template).await?;
    Ok(raw.replace(CHAT_URL_PLACEHOLDER, &escape_script_string(chat_url)))
}

fn escape_script_string(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\u0022"),
            '\'' => escaped.push_str("\\u0027"),
            '<' => escaped.push_str("\\u003C"),
            '>' => escaped.push_str("\\u003E"),
            '&' => escaped.push_str("\\u0026"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\u{2028}' => escaped.push_str("\\u2028"),
            '\u{2029}' => escaped.push_str("\\u2029"),
            other => escaped.push(other),
        }
    }
    escaped
}

// Origin headers are not checked.
async fn chat(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    ws.max_message_size(MAX_LINE_BYTES)
        .on_upgrade(move |socket| async move {
            let departure =
                run_session(WsConnection::new(socket, peer), state.hub, state.session).await;
            debug!(%peer, ?departure, "websocket session finished");
        })
}

async fn accept_tcp(listener: Option<TcpListener>, state: AppState) {
    let Some(listener) = listener else {
        return std::future::pending().await;
    };
    loop {
        handle_accept_result(listener.accept().await, &state);
    }
}

fn handle_accept_result(result: io::Result<(TcpStream, SocketAddr)>, state: &AppState) {
    match result {
        Ok((stream, peer)) => spawn_tcp_session(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_tcp_session(stream: TcpStream, peer: SocketAddr, state: &AppState) {
    let hub = state.hub.clone();
    let config = state.session;
    tokio::spawn(async move {
        let connection = StreamConnection::new(stream, peer.to_string());
        let departure = run_session(connection, hub, config).await;
        debug!(%peer, ?departure, "tcp session finished");
    });
}

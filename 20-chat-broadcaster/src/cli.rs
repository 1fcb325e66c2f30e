use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::{server::ServerConfig, session::SessionConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Host and port on which to listen for HTTP and WebSocket requests.
    #[arg(default_value = "localhost:8083")]
    pub listen: String,

    /// WebSocket URL rendered into the landing page. Defaults to `<LISTEN>/chat`.
    pub chat_url: Option<String>,

    /// Also accept newline-delimited TCP clients on this address.
    #[arg(long)]
    pub tcp_listen: Option<String>,

    /// Seconds a client may stay silent before it is timed out.
    #[arg(long, default_value_t = 30 * 60)]
    pub idle_timeout: u64,

    /// Milliseconds a timed-out client gets to receive its notice.
    #[arg(long, default_value_t = 500)]
    pub timeout_grace: u64,

    /// Landing page template; `{{chat_url}}` is replaced on every request.
    #[arg(long, default_value = "index.html")]
    pub template: PathBuf,
}

impl Cli {
    pub fn into_config(self) -> ServerConfig {
        let chat_url = self
            .chat_url
            .unwrap_or_else(|| format!("{}/chat", self.listen));
        ServerConfig {
            listen: self.listen,
            chat_url,
            tcp_listen: self.tcp_listen,
            template: self.template,
            session: SessionConfig {
                idle_timeout: Duration::from_secs(self.idle_timeout),
                timeout_grace: Duration::from_millis(self.timeout_grace),
            },
        }
    }
}

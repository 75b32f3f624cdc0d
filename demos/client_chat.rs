use anyhow::{Context, Result};
use sphalerite::{
    async_trait, connect, ClientOptions, CloseCode, Connection, DataKind, Handler,
    KeepaliveOptions,
};
use std::sync::Arc;
use url::Url;

#[derive(argh::FromArgs)]
#[argh(description = "websocket chat client")]
struct Args {
    #[argh(option, description = "ws:// or wss:// URL to connect to")]
    url: String,

    #[argh(switch, description = "enable TCP keepalive probing")]
    keepalive: bool,
}

struct Printer;

#[async_trait]
impl Handler for Printer {
    async fn on_message(&self, _connection: &Arc<Connection>, kind: DataKind, data: Vec<u8>) {
        match kind {
            DataKind::Text => println!("text: {}", String::from_utf8_lossy(&data)),
            DataKind::Binary => println!("binary: {:02X?}", data),
        }
    }

    async fn on_close(&self, _connection: &Arc<Connection>) {
        println!("connection closed");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args: Args = argh::from_env();

    let url = Url::parse(&args.url).context("parse url")?;
    let mut options = ClientOptions::from_url(&url).context("client options")?;
    if args.keepalive {
        options.keepalive = Some(KeepaliveOptions::default());
    }

    let connection = connect(options, Printer).await.context("connect")?;
    connection
        .send(DataKind::Text, b"hello from sphalerite")
        .await
        .context("send")?;

    tokio::signal::ctrl_c().await.context("ctrl-c")?;
    if connection.is_connected() {
        connection.close(CloseCode::NORMAL).await.context("close")?;
    }
    Ok(())
}

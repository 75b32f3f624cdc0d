use anyhow::{Context, Result};
use sphalerite::{async_trait, Connection, DataKind, Handler, Server};
use std::sync::Arc;

#[derive(argh::FromArgs)]
#[argh(description = "websocket echo chat server")]
struct Args {
    #[argh(
        option,
        description = "address to bind to",
        default = "String::from(\"0.0.0.0\")"
    )]
    bind: String,

    #[argh(option, description = "port to listen on", default = "9001")]
    port: u16,
}

struct Chat;

#[async_trait]
impl Handler for Chat {
    async fn on_open(&self, connection: &Arc<Connection>) {
        println!("connection from {:?} open", connection.peer_addr());
        let _ = connection.set_user_data(Box::new(String::from("chatter")));
    }

    async fn on_message(&self, connection: &Arc<Connection>, kind: DataKind, data: Vec<u8>) {
        if kind == DataKind::Text {
            println!("received: {}", String::from_utf8_lossy(&data));
        } else {
            println!("received: {} bytes of binary", data.len());
        }
        let _ = connection.send(kind, &data).await;
    }

    async fn on_close(&self, connection: &Arc<Connection>) {
        let tag = connection
            .user_data()
            .and_then(|data| data.downcast_ref::<String>());
        println!("connection from {:?} closed ({:?})", connection.peer_addr(), tag);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args: Args = argh::from_env();

    let server = Server::open(&args.bind, args.port, Chat)
        .await
        .context("open server")?;
    println!("listening on {}", server.local_addr());

    tokio::signal::ctrl_c().await.context("ctrl-c")?;
    server.close().await;
    Ok(())
}

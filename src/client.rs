//! The dialing endpoint.

use std::io;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

use crate::connection::{Connection, Timeouts};
use crate::handshake;
use crate::transport::{self, KeepaliveOptions, Transport};
use crate::{Error, Handler};

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Address to dial, an IP or a resolvable name.
    pub address: String,
    pub port: u16,
    /// Value for the `Host` header. Defaults to the dial address.
    pub host: String,
    /// Resource to request, e.g. `/chat`.
    pub endpoint: String,
    /// Wrap the connection in TLS (needs the `tls` feature).
    pub secure: bool,
    /// TCP keepalive probing, off when `None`.
    pub keepalive: Option<KeepaliveOptions>,
    /// Handshake and reassembly timers.
    pub timeouts: Timeouts,
}

impl ClientOptions {
    pub fn new(address: impl Into<String>, port: u16) -> ClientOptions {
        let address = address.into();
        ClientOptions {
            host: address.clone(),
            address,
            port,
            endpoint: "/".into(),
            secure: false,
            keepalive: None,
            timeouts: Timeouts::default(),
        }
    }

    /// Reads address, port, resource and TLS mode from a `ws://` or `wss://`
    /// URL.
    pub fn from_url(url: &Url) -> Result<ClientOptions, Error> {
        let ("ws" | "wss") = url.scheme() else {
            return Err(Error::IncorrectScheme);
        };
        let secure = url.scheme() == "wss";
        let host = url.host_str().ok_or(Error::NoHost)?;
        let port = url.port().unwrap_or(if secure { 443 } else { 80 });
        let endpoint = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().into(),
        };
        Ok(ClientOptions {
            address: host.into(),
            port,
            host: host.into(),
            endpoint,
            secure,
            keepalive: None,
            timeouts: Timeouts::default(),
        })
    }
}

/// Dials the remote, performs the upgrade, and spawns the reader task.
/// Returns once `on_open` has fired; protocol events from then on arrive
/// through the handler. A dial or handshake failure fires `on_close` (there
/// is no `on_open`) and the error also comes back to the caller.
pub async fn connect(
    options: ClientOptions,
    handler: impl Handler,
) -> Result<Arc<Connection>, Error> {
    let handler: Arc<dyn Handler> = Arc::new(handler);
    let (connection, opening) = Connection::opening(handler.clone(), options.timeouts);

    match establish(&options).await {
        Ok((transport, leftover)) => {
            debug!(
                "connected to {}:{}{}",
                options.host, options.port, options.endpoint
            );
            let reader = opening.ready(transport, leftover).await;
            handler.on_open(&connection).await;
            tokio::spawn(reader.run());
            Ok(connection)
        }
        Err(err) => {
            debug!(
                "connecting to {}:{} failed: {}",
                options.address, options.port, err
            );
            opening.fail().await;
            Err(err)
        }
    }
}

async fn establish(options: &ClientOptions) -> Result<(Transport, BytesMut), Error> {
    let stream = TcpStream::connect((options.address.as_str(), options.port)).await?;
    if let Some(keepalive) = &options.keepalive {
        transport::set_keepalive(&stream, keepalive)?;
    }
    let mut transport = if options.secure {
        secure_transport(stream, &options.host).await?
    } else {
        Transport::Plain(stream)
    };

    let key = handshake::new_key()?;
    let request = handshake::request_for(&options.endpoint, &options.host, options.port, &key);
    let leftover = timeout(
        options.timeouts.handshake,
        drive_handshake(&mut transport, &request, &key),
    )
    .await
    .map_err(|_| Error::HandshakeTimeout)??;
    Ok((transport, leftover))
}

async fn drive_handshake(
    transport: &mut Transport,
    request: &str,
    key: &str,
) -> Result<BytesMut, Error> {
    transport.write_all(request.as_bytes()).await?;
    transport.flush().await?;

    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if let Some(consumed) = handshake::parse_response(&buf, key)? {
            buf.advance(consumed);
            return Ok(buf);
        }
        if transport.read_buf(&mut buf).await? == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
    }
}

#[cfg(feature = "tls")]
async fn secure_transport(stream: TcpStream, host: &str) -> Result<Transport, Error> {
    use tokio_rustls::rustls::{pki_types::ServerName, ClientConfig, RootCertStore};
    use tokio_rustls::TlsConnector;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let name = ServerName::try_from(host.to_owned()).map_err(|_| Error::InvalidServerName)?;
    let tls = connector.connect(name, stream).await?;
    Ok(Transport::Tls(Box::new(tls.into())))
}

#[cfg(not(feature = "tls"))]
async fn secure_transport(_stream: TcpStream, _host: &str) -> Result<Transport, Error> {
    Err(Error::TlsNotSupported)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn options_from_ws_url() {
        let url = Url::parse("ws://example.com:8000/chat?room=1").unwrap();
        let options = ClientOptions::from_url(&url).unwrap();
        assert_eq!(options.address, "example.com");
        assert_eq!(options.port, 8000);
        assert_eq!(options.endpoint, "/chat?room=1");
        assert!(!options.secure);
    }

    #[test]
    fn options_from_wss_url_defaults_to_443() {
        let url = Url::parse("wss://example.com/feed").unwrap();
        let options = ClientOptions::from_url(&url).unwrap();
        assert_eq!(options.port, 443);
        assert_eq!(options.endpoint, "/feed");
        assert!(options.secure);
    }

    #[test]
    fn options_reject_other_schemes() {
        let url = Url::parse("https://example.com/").unwrap();
        assert!(matches!(
            ClientOptions::from_url(&url),
            Err(Error::IncorrectScheme)
        ));
    }
}

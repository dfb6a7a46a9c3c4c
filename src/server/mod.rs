//! The bundled HTTP/1.1 engine.
//!
//! Accepts TCP connections and hands each parsed request to [`App::handle`].
//! Supports HTTP/1.1 persistent connections (keep-alive) out of the box, and
//! runs the application's startup and shutdown hooks around the accept loop.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::{
    app::App,
    http::{
        StatusCode,
        request::{Request, RequestError},
        response::Response,
    },
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("startup hook failed: {0}")]
    Startup(String),
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The blaze HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use blaze::{App, Context, Error, Server};
///
/// async fn hello(_ctx: Context) -> Result<&'static str, Error> {
///     Ok("Hello!")
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut app = App::new();
///     app.get("/", hello)?;
///
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.serve(Arc::new(app)).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves `app` until Ctrl-C.
    pub async fn serve(self, app: Arc<App>) -> Result<(), ServerError> {
        self.serve_with_shutdown(app, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serves `app` until `signal` resolves.
    ///
    /// Startup hooks run before the first connection is accepted; shutdown
    /// hooks run after the listener stops. Connections already accepted are
    /// left to finish on their own tasks.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Startup`] if a startup hook fails. Nothing is
    /// served in that case.
    pub async fn serve_with_shutdown(
        self,
        app: Arc<App>,
        signal: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        app.startup()
            .await
            .map_err(|e| ServerError::Startup(e.message()))?;
        info!(address = %self.local_addr, title = %app.config().title, "blaze listening");

        tokio::pin!(signal);
        loop {
            let (stream, peer_addr) = tokio::select! {
                () = &mut signal => {
                    info!("shutdown signal received");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
            };

            debug!(peer = %peer_addr, "connection accepted");
            let app = Arc::clone(&app);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, app).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }

        app.shutdown().await;
        Ok(())
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection or signals
/// `Connection: close`.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    app: Arc<App>,
) -> Result<(), std::io::Error> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let bytes_read = stream.read_buf(&mut buf).await?;

        if bytes_read == 0 {
            debug!(peer = %peer_addr, "connection closed by peer");
            break;
        }

        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large, sending 413");
            let response = Response::new(StatusCode::PayloadTooLarge)
                .body("Request entity too large")
                .keep_alive(false);
            stream.write_all(&response.into_bytes()).await?;
            break;
        }

        let (mut request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            // Headers not fully received yet.
            Err(RequestError::Incomplete) => continue,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                let response = Response::new(StatusCode::BadRequest)
                    .body(format!("Bad Request: {e}"))
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
        };

        let content_length = request.content_length().unwrap_or(0);
        let total_needed = body_offset + content_length;
        if buf.len() < total_needed {
            continue;
        }
        request.truncate_body(content_length);

        let keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let response = app.handle(request).await.keep_alive(keep_alive);
        stream.write_all(&response.into_bytes()).await?;
        stream.flush().await?;

        let _ = buf.split_to(total_needed);

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Context, Error, HttpError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    async fn echo(ctx: Context) -> Result<String, Error> {
        Ok(ctx.request().text())
    }

    async fn roundtrip(addr: SocketAddr, raw: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn serves_requests_and_runs_hooks() {
        let hooks = Arc::new(AtomicUsize::new(0));
        let (start, stop) = (Arc::clone(&hooks), Arc::clone(&hooks));

        let mut app = App::new();
        app.post("/echo", echo).unwrap();
        app.on_startup_sync(move || {
            start.fetch_add(1, Ordering::SeqCst);
        })
        .on_shutdown_sync(move || {
            stop.fetch_add(10, Ordering::SeqCst);
        });

        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        let (tx, rx) = oneshot::channel::<()>();
        let serving = tokio::spawn(server.serve_with_shutdown(Arc::new(app), async {
            let _ = rx.await;
        }));

        let response = roundtrip(
            addr,
            "POST /echo HTTP/1.1\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("hello"));

        let response = roundtrip(addr, "GET /missing HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 404"));
        assert!(response.contains(r#""error":"Not Found""#));
        assert!(response.contains(r#""detail":"No route found""#));

        tx.send(()).unwrap();
        serving.await.unwrap().unwrap();
        assert_eq!(hooks.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        let (tx, rx) = oneshot::channel::<()>();
        let serving = tokio::spawn(server.serve_with_shutdown(Arc::new(App::new()), async {
            let _ = rx.await;
        }));

        let response = roundtrip(addr, "NOT A REQUEST\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400"));

        tx.send(()).unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failed_startup_serves_nothing() {
        let mut app = App::new();
        app.on_startup_sync(|| Err::<(), _>(HttpError::bad_request("missing database url")));

        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let err = server
            .serve_with_shutdown(Arc::new(app), std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Startup(ref m) if m == "missing database url"));
    }
}

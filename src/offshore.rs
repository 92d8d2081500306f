/*!
 * # Offshore Module
 *
 * The shore-side peer. It accepts the ship's persistent uplink, reads frames
 * one at a time and either executes an outbound HTTP request or opens a
 * CONNECT tunnel to a TCP target. Because the dispatcher never reads ahead,
 * responses leave in the same order requests arrived, which is what lets the
 * wire protocol work without correlation ids.
 */

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::config::OffshoreConfig;
use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame, Frame, TUNNEL_CHUNK};
use crate::upstream::{HttpExecutor, OutboundRequest, ReqwestExecutor};

/// The offshore server
///
/// Generic over the outbound HTTP executor so tests can substitute a mock;
/// production uses [`ReqwestExecutor`].
pub struct OffshoreServer<E = ReqwestExecutor> {
    config: OffshoreConfig,
    executor: Arc<E>,
}

impl OffshoreServer<ReqwestExecutor> {
    pub fn new(config: OffshoreConfig) -> Result<Self> {
        let executor = ReqwestExecutor::new(config.get_request_timeout())?;
        Ok(OffshoreServer {
            config,
            executor: Arc::new(executor),
        })
    }
}

impl<E: HttpExecutor> OffshoreServer<E> {
    /// Build a server around a custom executor.
    pub fn with_executor(config: OffshoreConfig, executor: E) -> Self {
        OffshoreServer {
            config,
            executor: Arc::new(executor),
        }
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self) -> Result<()> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("offshore server listening on {}", addr);

        tokio::select! {
            result = self.serve(listener) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, stopping offshore server");
                Ok(())
            }
        }
    }

    /// Accept ship uplinks from the given listener
    ///
    /// Normally there is exactly one ship, but each accepted connection gets
    /// its own dispatcher task, so a reconnecting ship is picked up without
    /// a restart.
    ///
    /// # Arguments
    ///
    /// * `listener` - An already bound listener for the uplink port
    ///
    /// # Returns
    ///
    /// Only returns on an accept failure; otherwise it serves forever
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            info!("ship connected from {}", peer);
            let executor = Arc::clone(&self.executor);
            let dial_timeout = self.config.get_dial_timeout();
            tokio::spawn(async move {
                if let Err(e) = handle_ship(stream, executor, dial_timeout).await {
                    warn!("uplink from {} failed: {}", peer, e);
                }
                info!("ship {} disconnected", peer);
            });
        }
    }
}

/// Dispatch loop for one uplink: read a frame, act on it, repeat.
async fn handle_ship<E: HttpExecutor>(
    stream: TcpStream,
    executor: Arc<E>,
    dial_timeout: Option<Duration>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(Error::LinkClosed) => return Ok(()),
            Err(e) => return Err(e),
        };
        match frame {
            Frame::HttpRequest {
                method,
                url,
                headers,
                body,
            } => {
                let request = OutboundRequest {
                    method,
                    url,
                    headers,
                    body,
                };
                execute_request(&mut writer, executor.as_ref(), request).await?;
            }
            Frame::Connect { host, port } => {
                open_tunnel(&mut reader, &mut writer, host, port, dial_timeout).await?;
            }
            other => warn!("ignoring unexpected {} frame on the uplink", other.kind()),
        }
    }
}

/// Run one proxied HTTP request and put its response on the uplink.
///
/// Executor failures become the synthetic 502 the ship expects; only a
/// failure to write the response frame itself propagates.
async fn execute_request<E: HttpExecutor>(
    writer: &mut OwnedWriteHalf,
    executor: &E,
    request: OutboundRequest,
) -> Result<()> {
    debug!(
        "executing {} {} ({} body bytes)",
        request.method,
        request.url,
        request.body.len()
    );
    if !request.body.is_empty() {
        let snippet = &request.body[..request.body.len().min(100)];
        debug!("request body starts: {:?}", String::from_utf8_lossy(snippet));
    }

    let frame = match executor.execute(request).await {
        Ok(response) => {
            debug!(
                "upstream answered {} ({} body bytes)",
                response.status,
                response.body.len()
            );
            Frame::HttpResponse {
                status: response.status,
                headers: response.headers,
                body: response.body,
            }
        }
        Err(e) => {
            warn!("outbound request failed: {}", e);
            Frame::HttpResponse {
                status: 502,
                headers: HashMap::from([("Content-Length".to_string(), "11".to_string())]),
                body: b"Bad Gateway".to_vec(),
            }
        }
    };
    write_frame(writer, &frame).await
}

/// Dial the CONNECT target and bridge it with the uplink.
///
/// A dial failure is reported with an ERROR frame and the dispatch loop
/// resumes; only uplink failures propagate.
async fn open_tunnel(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    host: String,
    port: u16,
    dial_timeout: Option<Duration>,
) -> Result<()> {
    info!("opening tunnel to {}:{}", host, port);
    let dial = TcpStream::connect((host.as_str(), port));
    let target = match dial_timeout {
        Some(limit) => match timeout(limit, dial).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("timed out dialing {}:{}", host, port),
            )),
        },
        None => dial.await,
    };
    let target = match target {
        Ok(stream) => stream,
        Err(e) => {
            warn!("tunnel to {}:{} failed: {}", host, port, e);
            return write_frame(
                writer,
                &Frame::Error {
                    message: e.to_string(),
                },
            )
            .await;
        }
    };
    write_frame(writer, &Frame::ConnectOk).await?;

    let (mut target_rd, mut target_wr) = target.into_split();

    let uplink_to_target = async move {
        let mut target_alive = true;
        loop {
            match read_frame(reader).await? {
                Frame::Data(chunk) => {
                    if target_alive && !chunk.is_empty() {
                        if let Err(e) = target_wr.write_all(&chunk).await {
                            // Keep draining frames so the stream stays aligned.
                            warn!("target write failed mid-tunnel: {}", e);
                            target_alive = false;
                        }
                    }
                }
                Frame::DataEnd => {
                    debug!("ship finished sending, half-closing the target");
                    let _ = target_wr.shutdown().await;
                    return Ok::<(), Error>(());
                }
                other => {
                    let _ = target_wr.shutdown().await;
                    return Err(Error::Custom(format!(
                        "unexpected {} frame inside a tunnel",
                        other.kind()
                    )));
                }
            }
        }
    };

    let target_to_uplink = async move {
        let mut buf = [0u8; TUNNEL_CHUNK];
        loop {
            // A target read error ends this leg the same way EOF does.
            let n = target_rd.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                write_frame(writer, &Frame::DataEnd).await?;
                debug!("target stream ended, inbound tunnel leg closed");
                return Ok::<(), Error>(());
            }
            write_frame(writer, &Frame::Data(buf[..n].to_vec())).await?;
        }
    };

    let (inbound, outbound) = tokio::join!(uplink_to_target, target_to_uplink);
    inbound?;
    outbound?;
    info!("tunnel to {}:{} closed", host, port);
    Ok(())
}

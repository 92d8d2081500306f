/*!
 * # Ship Module
 *
 * The ship-side proxy. It accepts ordinary HTTP proxy clients on a local
 * port, parses one request per connection, and hands each request to a
 * single serializer task that owns the persistent uplink to the offshore
 * peer. Exactly one request or tunnel is in flight on the uplink at a time;
 * everything else waits in the queue.
 */

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;

use crate::config::ShipConfig;
use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame, Frame, TUNNEL_CHUNK};

const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 11\r\n\r\nBad Gateway";
const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 11\r\n\r\nBad Request";
const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// A client connection with its parse buffer. The buffer stays attached for
/// the connection's whole lifetime so bytes the client sent early (e.g. a
/// TLS hello right behind a CONNECT head) are never lost.
type Client = BufReader<TcpStream>;

/// One parsed client request waiting its turn on the uplink.
enum ProxyJob {
    Http {
        method: String,
        url: String,
        headers: HashMap<String, String>,
        body: Vec<u8>,
        client: Client,
    },
    Connect {
        host: String,
        port: u16,
        client: Client,
    },
}

impl ProxyJob {
    fn into_client(self) -> Client {
        match self {
            ProxyJob::Http { client, .. } | ProxyJob::Connect { client, .. } => client,
        }
    }
}

/// The ship-side proxy server
///
/// `run` binds the configured listen address and serves until ctrl-c;
/// `serve` takes an already bound listener, which is what tests use.
pub struct ShipProxy {
    config: ShipConfig,
}

impl ShipProxy {
    pub fn new(config: ShipConfig) -> Self {
        ShipProxy { config }
    }

    /// Bind the configured listen address and serve until shutdown
    pub async fn run(self) -> Result<()> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("ship proxy listening on {}", addr);

        tokio::select! {
            result = self.serve(listener) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, stopping ship proxy");
                Ok(())
            }
        }
    }

    /// Accept proxy clients from the given listener
    ///
    /// Spawns the serializer task that owns the uplink, then accepts client
    /// connections forever, parsing each into a job for the queue.
    ///
    /// # Arguments
    ///
    /// * `listener` - An already bound listener for the client-facing port
    ///
    /// # Returns
    ///
    /// Only returns on an accept failure; otherwise it serves forever
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let serializer = Serializer {
            offshore_addr: self.config.offshore_addr(),
            dial_timeout: self.config.get_dial_timeout(),
            uplink: None,
            jobs: jobs_rx,
        };
        tokio::spawn(serializer.run());

        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("accepted client connection from {}", peer);
            let jobs = jobs_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_client(stream, jobs).await {
                    warn!("error handling client {}: {}", peer, e);
                }
            });
        }
    }
}

/// Parse one proxy request from a freshly accepted client and enqueue it.
///
/// Malformed request heads close the socket silently; no uplink traffic
/// happens on this path.
async fn handle_client(stream: TcpStream, jobs: UnboundedSender<ProxyJob>) -> Result<()> {
    let mut client = BufReader::new(stream);

    let mut line = String::new();
    if client.read_line(&mut line).await? == 0 {
        return Ok(());
    }
    let request_line = line.trim_end_matches(['\r', '\n']).to_string();
    let mut parts = request_line.split_whitespace();
    let (method, target) = match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(_proto)) => (method.to_string(), target.to_string()),
        _ => {
            debug!("malformed request line {:?}, dropping client", request_line);
            return Ok(());
        }
    };
    debug!("client request: {}", request_line);

    // Header block: `Key: Value` lines up to the blank line. Casing is kept
    // as received; first value wins on duplicates.
    let mut headers: HashMap<String, String> = HashMap::new();
    loop {
        line.clear();
        if client.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers
                .entry(name.trim().to_string())
                .or_insert_with(|| value.trim().to_string());
        }
    }

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = match split_connect_target(&target) {
            Some(pair) => pair,
            None => {
                debug!("unparseable CONNECT target {:?}, dropping client", target);
                return Ok(());
            }
        };
        return enqueue(&jobs, ProxyJob::Connect { host, port, client });
    }

    if header_value(&headers, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
    {
        warn!("rejecting chunked request for {}", target);
        let _ = client.write_all(BAD_REQUEST).await;
        let _ = client.shutdown().await;
        return Ok(());
    }

    let content_length = header_value(&headers, "content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        client.read_exact(&mut body).await?;
    }
    debug!("read {} bytes of request body", body.len());

    enqueue(
        &jobs,
        ProxyJob::Http {
            method,
            url: target,
            headers,
            body,
            client,
        },
    )
}

fn enqueue(jobs: &UnboundedSender<ProxyJob>, job: ProxyJob) -> Result<()> {
    jobs.send(job)
        .map_err(|_| Error::Custom("request queue is gone".to_string()))
}

/// `host:port` from a CONNECT target; port defaults to 443.
fn split_connect_target(target: &str) -> Option<(String, u16)> {
    match target.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
        None => Some((target.to_string(), 443)),
    }
}

/// Case-insensitive header lookup over a casing-preserving map.
fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// The persistent connection to the offshore peer, split so a tunnel can
/// drive both directions at once.
struct Uplink {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

/// The single long-lived task with exclusive ownership of the uplink.
///
/// It drains the queue one job at a time, dialing the uplink lazily on the
/// first job and redialing on the next job after an uplink failure. Because
/// this task is the only one holding the handle, no two jobs can race the
/// dial and no two requests can interleave frames.
struct Serializer {
    offshore_addr: String,
    dial_timeout: Option<Duration>,
    uplink: Option<Uplink>,
    jobs: UnboundedReceiver<ProxyJob>,
}

impl Serializer {
    async fn run(mut self) {
        while let Some(job) = self.jobs.recv().await {
            debug!("serializer picked up a queued job");
            if let Err(e) = self.ensure_uplink().await {
                warn!("could not reach offshore at {}: {}", self.offshore_addr, e);
                refuse(job).await;
                continue;
            }
            let Some(uplink) = self.uplink.as_mut() else {
                continue;
            };
            let result = match job {
                ProxyJob::Http {
                    method,
                    url,
                    headers,
                    body,
                    client,
                } => handle_http(uplink, method, url, headers, body, client).await,
                ProxyJob::Connect { host, port, client } => {
                    handle_connect(uplink, host, port, client).await
                }
            };
            if let Err(e) = result {
                warn!("uplink failed mid-job, dropping it: {}", e);
                self.uplink = None;
            }
        }
    }

    /// Dial the offshore peer if the uplink is not already up.
    async fn ensure_uplink(&mut self) -> Result<()> {
        if self.uplink.is_some() {
            return Ok(());
        }
        info!("dialing offshore at {}", self.offshore_addr);
        let stream = match self.dial_timeout {
            Some(limit) => timeout(limit, TcpStream::connect(&self.offshore_addr))
                .await
                .map_err(|_| {
                    Error::Custom(format!(
                        "timed out dialing offshore at {}",
                        self.offshore_addr
                    ))
                })??,
            None => TcpStream::connect(&self.offshore_addr).await?,
        };
        let (reader, writer) = stream.into_split();
        self.uplink = Some(Uplink { reader, writer });
        info!("uplink to offshore established");
        Ok(())
    }
}

/// Tell a queued client the offshore peer is unreachable.
async fn refuse(job: ProxyJob) {
    let mut client = job.into_client();
    let _ = client.write_all(BAD_GATEWAY).await;
    let _ = client.shutdown().await;
}

/// Forward one buffered HTTP request over the uplink and relay the response.
///
/// Client-side failures are absorbed here; only uplink failures propagate,
/// and those make the serializer drop the connection and redial later.
async fn handle_http(
    uplink: &mut Uplink,
    method: String,
    url: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    mut client: Client,
) -> Result<()> {
    debug!("forwarding {} {} ({} body bytes)", method, url, body.len());
    let request = Frame::HttpRequest {
        method,
        url,
        headers,
        body,
    };
    if let Err(e) = write_frame(&mut uplink.writer, &request).await {
        let _ = client.write_all(BAD_GATEWAY).await;
        let _ = client.shutdown().await;
        return Err(e);
    }

    let reply = match read_frame(&mut uplink.reader).await {
        Ok(frame) => frame,
        Err(e) => {
            let _ = client.write_all(BAD_GATEWAY).await;
            let _ = client.shutdown().await;
            return Err(e);
        }
    };

    match reply {
        Frame::HttpResponse {
            status,
            headers,
            body,
        } => {
            debug!("relaying {} response ({} body bytes)", status, body.len());
            if let Err(e) = write_client_response(&mut client, status, &headers, &body).await {
                warn!("client went away before the response was written: {}", e);
            }
        }
        other => {
            warn!("expected HTTPResponse on the uplink, got {}", other.kind());
            let _ = client.write_all(BAD_GATEWAY).await;
        }
    }
    let _ = client.shutdown().await;
    Ok(())
}

/// Serialize an HTTPResponse frame back into an HTTP/1.1 response.
async fn write_client_response(
    client: &mut Client,
    status: u16,
    headers: &HashMap<String, String>,
    body: &[u8],
) -> std::io::Result<()> {
    // Static reason phrase; clients key off the code.
    let mut head = format!("HTTP/1.1 {} OK\r\n", status);
    for (name, value) in headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    client.write_all(head.as_bytes()).await?;
    if !body.is_empty() {
        client.write_all(body).await?;
    }
    client.flush().await
}

/// Ask the offshore peer for a tunnel and bridge it on success.
async fn handle_connect(
    uplink: &mut Uplink,
    host: String,
    port: u16,
    mut client: Client,
) -> Result<()> {
    debug!("requesting tunnel to {}:{}", host, port);
    if let Err(e) = write_frame(&mut uplink.writer, &Frame::Connect { host, port }).await {
        let _ = client.write_all(BAD_GATEWAY).await;
        let _ = client.shutdown().await;
        return Err(e);
    }

    let reply = match read_frame(&mut uplink.reader).await {
        Ok(frame) => frame,
        Err(e) => {
            let _ = client.write_all(BAD_GATEWAY).await;
            let _ = client.shutdown().await;
            return Err(e);
        }
    };

    match reply {
        Frame::ConnectOk => {}
        Frame::Error { message } => {
            warn!("offshore could not open the tunnel: {}", message);
            let _ = client.write_all(BAD_GATEWAY).await;
            let _ = client.shutdown().await;
            return Ok(());
        }
        other => {
            warn!("expected CONNECT_OK on the uplink, got {}", other.kind());
            let _ = client.write_all(BAD_GATEWAY).await;
            let _ = client.shutdown().await;
            return Ok(());
        }
    }

    // From here the offshore peer is in tunnel mode, so the bridge must run
    // even if the 200 line cannot be delivered; otherwise the frame stream
    // would fall out of alignment.
    if let Err(e) = client.write_all(CONNECTION_ESTABLISHED).await {
        debug!("client went away right after CONNECT: {}", e);
    }
    run_tunnel(uplink, client).await
}

/// Bridge an established tunnel: client bytes become DATA frames, DATA
/// frames become client bytes, and each direction ends on its own DATA_END.
/// The tunnel is over when both legs have finished.
async fn run_tunnel(uplink: &mut Uplink, client: Client) -> Result<()> {
    let Uplink { reader, writer } = uplink;
    let (mut client_rd, mut client_wr) = tokio::io::split(client);

    let client_to_uplink = async move {
        let mut buf = [0u8; TUNNEL_CHUNK];
        loop {
            // A client read error ends this leg the same way EOF does.
            let n = client_rd.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                write_frame(writer, &Frame::DataEnd).await?;
                debug!("client stream ended, outbound tunnel leg closed");
                return Ok::<(), Error>(());
            }
            write_frame(writer, &Frame::Data(buf[..n].to_vec())).await?;
        }
    };

    let uplink_to_client = async move {
        let mut client_alive = true;
        loop {
            match read_frame(reader).await? {
                Frame::Data(chunk) => {
                    if client_alive {
                        if let Err(e) = client_wr.write_all(&chunk).await {
                            // Keep draining frames so the stream stays aligned.
                            warn!("client write failed mid-tunnel: {}", e);
                            client_alive = false;
                        }
                    }
                }
                Frame::DataEnd => {
                    debug!("offshore stream ended, inbound tunnel leg closed");
                    let _ = client_wr.shutdown().await;
                    return Ok::<(), Error>(());
                }
                other => {
                    let _ = client_wr.shutdown().await;
                    return Err(Error::Custom(format!(
                        "unexpected {} frame inside a tunnel",
                        other.kind()
                    )));
                }
            }
        }
    };

    let (outbound, inbound) = tokio::join!(client_to_uplink, uplink_to_client);
    outbound?;
    inbound?;
    Ok(())
}

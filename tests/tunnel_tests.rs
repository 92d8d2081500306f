use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use shiplink::config::{OffshoreConfig, ShipConfig};
use shiplink::offshore::OffshoreServer;
use shiplink::ship::ShipProxy;
use shiplink::upstream::{HttpExecutor, OutboundRequest, OutboundResponse};

/// Executor that answers everything with 200 `hello`.
struct HelloExecutor;

impl HttpExecutor for HelloExecutor {
    async fn execute(&self, _request: OutboundRequest) -> shiplink::error::Result<OutboundResponse> {
        Ok(OutboundResponse {
            status: 200,
            headers: HashMap::from([("Content-Length".to_string(), "5".to_string())]),
            body: b"hello".to_vec(),
        })
    }
}

/// Boot a real offshore server and a real ship proxy wired to it; returns
/// the address proxy clients should connect to.
async fn start_stack<E: HttpExecutor>(executor: E) -> SocketAddr {
    let offshore_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let offshore_port = offshore_listener.local_addr().unwrap().port();
    let offshore_config = OffshoreConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        request_timeout_secs: None,
        dial_timeout_secs: None,
    };
    tokio::spawn(
        OffshoreServer::with_executor(offshore_config, executor).serve(offshore_listener),
    );

    let ship_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ship_addr = ship_listener.local_addr().unwrap();
    let ship_config = ShipConfig {
        offshore_host: "127.0.0.1".to_string(),
        offshore_port,
        listen_host: "127.0.0.1".to_string(),
        listen_port: 0,
        dial_timeout_secs: None,
    };
    tokio::spawn(ShipProxy::new(ship_config).serve(ship_listener));

    ship_addr
}

/// Read one HTTP response head, byte by byte, up to the blank line.
async fn read_head(client: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        timeout(Duration::from_secs(5), client.read_exact(&mut byte))
            .await
            .expect("read timed out")
            .unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

async fn read_to_end(client: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    timeout(Duration::from_secs(5), client.read_to_end(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    buf
}

// S3 end to end: CONNECT, tunnel two bytes to a mock target, get its reply
// back through both bridges, then confirm the uplink still serves requests.
#[tokio::test]
async fn test_connect_tunnel_end_to_end() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_port = target.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = target.accept().await.unwrap();
        let mut buf = [0u8; 2];
        socket.read_exact(&mut buf).await.unwrap();
        buf.reverse();
        socket.write_all(&buf).await.unwrap();
    });

    let ship = start_stack(HelloExecutor).await;

    let mut client = TcpStream::connect(ship).await.unwrap();
    client
        .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", target_port).as_bytes())
        .await
        .unwrap();

    let head = read_head(&mut client).await;
    assert!(
        head.starts_with("HTTP/1.1 200 Connection Established"),
        "{}",
        head
    );

    client.write_all(b"AB").await.unwrap();
    let mut echo = [0u8; 2];
    timeout(Duration::from_secs(5), client.read_exact(&mut echo))
        .await
        .expect("read timed out")
        .unwrap();
    assert_eq!(&echo, b"BA");

    // The target hung up, so the tunnel winds down and the client sees EOF.
    assert!(read_to_end(&mut client).await.is_empty());
    drop(client);

    // The serializer is free again: a plain request goes through.
    let mut client = TcpStream::connect(ship).await.unwrap();
    client
        .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();
    let response = String::from_utf8(read_to_end(&mut client).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
    assert!(response.ends_with("hello"));
}

// S4 end to end: a refused target turns into a plain 502 for the client.
#[tokio::test]
async fn test_connect_dial_failure_end_to_end() {
    let dead_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let ship = start_stack(HelloExecutor).await;

    let mut client = TcpStream::connect(ship).await.unwrap();
    client
        .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", dead_port).as_bytes())
        .await
        .unwrap();

    let response = String::from_utf8(read_to_end(&mut client).await).unwrap();
    assert_eq!(
        response,
        "HTTP/1.1 502 Bad Gateway\r\nContent-Length: 11\r\n\r\nBad Gateway"
    );
}

// Property 4: a larger transfer keeps order and content across the framed
// bridges in both directions.
#[tokio::test]
async fn test_tunnel_byte_fidelity_with_large_transfer() {
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_port = target.local_addr().unwrap().port();
    let payload_for_target = payload.clone();
    let target_task = tokio::spawn(async move {
        let (mut socket, _) = target.accept().await.unwrap();
        // Stream the payload out, then verify the same payload comes back.
        socket.write_all(&payload_for_target).await.unwrap();
        let mut received = vec![0u8; payload_for_target.len()];
        socket.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload_for_target);
    });

    let ship = start_stack(HelloExecutor).await;

    let mut client = TcpStream::connect(ship).await.unwrap();
    client
        .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", target_port).as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);

    let (mut rd, mut wr) = client.split();
    let send = async {
        wr.write_all(&payload).await.unwrap();
    };
    let receive = async {
        let mut received = vec![0u8; expected.len()];
        timeout(Duration::from_secs(10), rd.read_exact(&mut received))
            .await
            .expect("read timed out")
            .unwrap();
        received
    };
    let (_, received) = tokio::join!(send, receive);
    assert_eq!(received, expected);

    target_task.await.unwrap();
}

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::timeout;

use shiplink::error::Error;
use shiplink::frame::{read_frame, write_frame, Frame};

async fn encode(frame: &Frame) -> Vec<u8> {
    let mut buf = Vec::new();
    write_frame(&mut buf, frame).await.unwrap();
    buf
}

async fn decode(bytes: &[u8]) -> Frame {
    let mut slice = bytes;
    read_frame(&mut slice).await.unwrap()
}

fn sample_headers() -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert("Host".to_string(), "example.com".to_string());
    headers.insert("Accept".to_string(), "*/*".to_string());
    headers
}

#[tokio::test]
async fn test_round_trip_all_frame_types() {
    let frames = vec![
        Frame::HttpRequest {
            method: "POST".to_string(),
            url: "http://example.com/submit".to_string(),
            headers: sample_headers(),
            body: b"HELLO".to_vec(),
        },
        Frame::HttpResponse {
            status: 200,
            headers: sample_headers(),
            body: b"hello back".to_vec(),
        },
        Frame::Connect {
            host: "example.com".to_string(),
            port: 443,
        },
        Frame::ConnectOk,
        Frame::Data(b"tunnel bytes".to_vec()),
        Frame::DataEnd,
        Frame::Error {
            message: "no route to host".to_string(),
        },
    ];

    for frame in frames {
        let bytes = encode(&frame).await;
        assert_eq!(decode(&bytes).await, frame, "{} did not survive", frame.kind());
    }
}

#[tokio::test]
async fn test_round_trip_over_duplex_stream() {
    let (mut near, mut far) = tokio::io::duplex(64 * 1024);

    let frame = Frame::HttpRequest {
        method: "GET".to_string(),
        url: "http://example.com/".to_string(),
        headers: sample_headers(),
        body: Vec::new(),
    };
    write_frame(&mut near, &frame).await.unwrap();

    let decoded = timeout(Duration::from_secs(1), read_frame(&mut far))
        .await
        .expect("read timed out")
        .unwrap();
    assert_eq!(decoded, frame);
}

#[tokio::test]
async fn test_back_to_back_frames_stay_aligned() {
    let mut buf = Vec::new();
    write_frame(&mut buf, &Frame::Data(b"one".to_vec())).await.unwrap();
    write_frame(&mut buf, &Frame::DataEnd).await.unwrap();
    write_frame(&mut buf, &Frame::ConnectOk).await.unwrap();

    let mut slice = buf.as_slice();
    assert_eq!(
        read_frame(&mut slice).await.unwrap(),
        Frame::Data(b"one".to_vec())
    );
    assert_eq!(read_frame(&mut slice).await.unwrap(), Frame::DataEnd);
    assert_eq!(read_frame(&mut slice).await.unwrap(), Frame::ConnectOk);
    assert!(matches!(
        read_frame(&mut slice).await,
        Err(Error::LinkClosed)
    ));
}

#[tokio::test]
async fn test_wire_layout() {
    let bytes = encode(&Frame::Data(b"hi".to_vec())).await;

    let hlen = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let header: serde_json::Value = serde_json::from_slice(&bytes[4..4 + hlen]).unwrap();
    assert_eq!(header["type"], "DATA");
    assert_eq!(header["body_len"], 2);
    assert_eq!(&bytes[4 + hlen..], b"hi");
}

#[tokio::test]
async fn test_data_end_declares_zero_body_len() {
    let bytes = encode(&Frame::DataEnd).await;

    let hlen = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let header: serde_json::Value = serde_json::from_slice(&bytes[4..4 + hlen]).unwrap();
    assert_eq!(header["type"], "DATA_END");
    assert_eq!(header["body_len"], 0);
    assert_eq!(bytes.len(), 4 + hlen);
}

#[tokio::test]
async fn test_missing_body_len_means_empty_payload() {
    let header = br#"{"type":"DATA"}"#;
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&(header.len() as u32).to_be_bytes());
    bytes.extend_from_slice(header);

    let mut slice = bytes.as_slice();
    assert_eq!(read_frame(&mut slice).await.unwrap(), Frame::Data(Vec::new()));
}

#[tokio::test]
async fn test_truncated_header_is_link_closed() {
    let mut slice: &[u8] = &[0, 0, 0, 10, b'{', b'"'];
    assert!(matches!(
        read_frame(&mut slice).await,
        Err(Error::LinkClosed)
    ));
}

#[tokio::test]
async fn test_truncated_body_is_link_closed() {
    let full = encode(&Frame::Data(b"chunk".to_vec())).await;

    let mut slice = &full[..full.len() - 2];
    assert!(matches!(
        read_frame(&mut slice).await,
        Err(Error::LinkClosed)
    ));
}

#[tokio::test]
async fn test_garbage_header_is_malformed() {
    let header = b"not a json object";
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&(header.len() as u32).to_be_bytes());
    bytes.extend_from_slice(header);

    let mut slice = bytes.as_slice();
    assert!(matches!(
        read_frame(&mut slice).await,
        Err(Error::MalformedHeader(_))
    ));
}

#[tokio::test]
async fn test_unknown_frame_type_is_malformed() {
    let header = br#"{"type":"GREETING"}"#;
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&(header.len() as u32).to_be_bytes());
    bytes.extend_from_slice(header);

    let mut slice = bytes.as_slice();
    assert!(matches!(
        read_frame(&mut slice).await,
        Err(Error::MalformedHeader(_))
    ));
}

#[tokio::test]
async fn test_oversized_header_is_rejected() {
    let prefix = (2u32 * 1024 * 1024).to_be_bytes();

    let mut slice = prefix.as_slice();
    assert!(matches!(
        read_frame(&mut slice).await,
        Err(Error::OversizedHeader(_))
    ));
}

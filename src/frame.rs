/*!
 * # Wire Framing Module
 *
 * This module implements the framed envelope both peers speak on the uplink.
 * Every frame is a 4-byte big-endian length, that many bytes of UTF-8 JSON
 * header, then `body_len` bytes of opaque payload:
 *
 * ```text
 * frame := u32be(H) || H bytes of JSON header || body_len bytes of payload
 * ```
 *
 * The header carries a `type` discriminator plus type-dependent fields. A
 * missing `body_len` is equivalent to `0`. Reads are exact: a stream that
 * ends inside a frame yields [`Error::LinkClosed`], and a successful read of
 * frame N implies frame N-1 was fully consumed.
 */

use std::collections::HashMap;
use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result, MAX_HEADER_LEN};

/// Chunk size used by both tunnel bridges when slicing a socket into DATA
/// frames.
pub const TUNNEL_CHUNK: usize = 4096;

/// A decoded frame, payload attached.
///
/// The wire `body_len` field never appears here: it is derived from the
/// payload on encode and consumed on decode, so a `Frame` value cannot
/// declare a length that disagrees with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete proxied HTTP request, body included
    HttpRequest {
        method: String,
        url: String,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    },
    /// A complete upstream HTTP response, body included
    HttpResponse {
        status: u16,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    },
    /// Ask the offshore peer to dial a TCP target
    Connect { host: String, port: u16 },
    /// The target socket is open; tunnel mode begins
    ConnectOk,
    /// One chunk of tunneled bytes
    Data(Vec<u8>),
    /// One direction of the tunnel is finished
    DataEnd,
    /// The offshore peer could not satisfy a CONNECT
    Error { message: String },
}

impl Frame {
    /// Wire name of the frame type, as it appears in the header `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::HttpRequest { .. } => "HTTPRequest",
            Frame::HttpResponse { .. } => "HTTPResponse",
            Frame::Connect { .. } => "CONNECT",
            Frame::ConnectOk => "CONNECT_OK",
            Frame::Data(_) => "DATA",
            Frame::DataEnd => "DATA_END",
            Frame::Error { .. } => "ERROR",
        }
    }
}

/// The JSON header object as it travels on the wire.
///
/// Field order matters only cosmetically; the `type` tag is always first.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Header {
    #[serde(rename = "HTTPRequest")]
    HttpRequest {
        method: String,
        url: String,
        headers: HashMap<String, String>,
        #[serde(default)]
        body_len: usize,
    },
    #[serde(rename = "HTTPResponse")]
    HttpResponse {
        status_code: u16,
        headers: HashMap<String, String>,
        #[serde(default)]
        body_len: usize,
    },
    #[serde(rename = "CONNECT")]
    Connect { host: String, port: u16 },
    #[serde(rename = "CONNECT_OK")]
    ConnectOk,
    #[serde(rename = "DATA")]
    Data {
        #[serde(default)]
        body_len: usize,
    },
    #[serde(rename = "DATA_END")]
    DataEnd {
        #[serde(default)]
        body_len: usize,
    },
    #[serde(rename = "ERROR")]
    Error { message: String },
}

impl Header {
    fn body_len(&self) -> usize {
        match self {
            Header::HttpRequest { body_len, .. }
            | Header::HttpResponse { body_len, .. }
            | Header::Data { body_len }
            | Header::DataEnd { body_len } => *body_len,
            Header::Connect { .. } | Header::ConnectOk | Header::Error { .. } => 0,
        }
    }
}

/// Write one frame and flush
///
/// Serializes the header to JSON, prefixes it with the 4-byte big-endian
/// length, appends the payload and flushes the writer, so the frame is on
/// the wire before the call returns.
///
/// # Arguments
///
/// * `writer` - The byte stream to write the frame to
/// * `frame` - The frame to encode
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let empty: &[u8] = &[];
    let (header, body) = match frame {
        Frame::HttpRequest {
            method,
            url,
            headers,
            body,
        } => (
            Header::HttpRequest {
                method: method.clone(),
                url: url.clone(),
                headers: headers.clone(),
                body_len: body.len(),
            },
            body.as_slice(),
        ),
        Frame::HttpResponse {
            status,
            headers,
            body,
        } => (
            Header::HttpResponse {
                status_code: *status,
                headers: headers.clone(),
                body_len: body.len(),
            },
            body.as_slice(),
        ),
        Frame::Connect { host, port } => (
            Header::Connect {
                host: host.clone(),
                port: *port,
            },
            empty,
        ),
        Frame::ConnectOk => (Header::ConnectOk, empty),
        Frame::Data(body) => (
            Header::Data {
                body_len: body.len(),
            },
            body.as_slice(),
        ),
        Frame::DataEnd => (Header::DataEnd { body_len: 0 }, empty),
        Frame::Error { message } => (
            Header::Error {
                message: message.clone(),
            },
            empty,
        ),
    };

    let hbytes = serde_json::to_vec(&header)?;
    writer.write_all(&(hbytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&hbytes).await?;
    if !body.is_empty() {
        writer.write_all(body).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Read one complete frame
///
/// Reads the length prefix, the header and exactly `body_len` payload bytes.
///
/// # Errors
///
/// * [`Error::LinkClosed`] if the stream ends inside a frame
/// * [`Error::OversizedHeader`] if the declared header length exceeds the cap
/// * [`Error::MalformedHeader`] if the header bytes are not a valid header
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    read_exact_or_closed(reader, &mut len_buf).await?;
    let hlen = u32::from_be_bytes(len_buf);
    if hlen > MAX_HEADER_LEN {
        return Err(Error::OversizedHeader(hlen));
    }

    let mut hbytes = vec![0u8; hlen as usize];
    read_exact_or_closed(reader, &mut hbytes).await?;
    let header: Header = serde_json::from_slice(&hbytes)?;

    let mut body = vec![0u8; header.body_len()];
    if !body.is_empty() {
        read_exact_or_closed(reader, &mut body).await?;
    }

    Ok(match header {
        Header::HttpRequest {
            method,
            url,
            headers,
            ..
        } => Frame::HttpRequest {
            method,
            url,
            headers,
            body,
        },
        Header::HttpResponse {
            status_code,
            headers,
            ..
        } => Frame::HttpResponse {
            status: status_code,
            headers,
            body,
        },
        Header::Connect { host, port } => Frame::Connect { host, port },
        Header::ConnectOk => Frame::ConnectOk,
        Header::Data { .. } => Frame::Data(body),
        Header::DataEnd { .. } => Frame::DataEnd,
        Header::Error { message } => Frame::Error { message },
    })
}

/// Exact read that distinguishes a peer hang-up from other IO failures.
async fn read_exact_or_closed<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    reader.read_exact(buf).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::LinkClosed
        } else {
            Error::Io(e)
        }
    })?;
    Ok(())
}

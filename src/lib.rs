/*!
 * # Shiplink
 *
 * A two-process HTTP proxy tunnel for a high-latency, bandwidth-constrained
 * link. The ship peer accepts ordinary HTTP/HTTPS proxy clients and funnels
 * every request over a single persistent TCP uplink to the offshore peer,
 * which performs the real outbound traffic.
 *
 * ## Features
 *
 * - **Serialized uplink**: one request or tunnel in flight at a time, so
 *   frames never interleave and need no correlation ids
 * - **Framed wire protocol**: length-prefixed JSON headers with opaque
 *   payloads, shared by both peers
 * - **CONNECT tunneling**: transparent bidirectional bridging for HTTPS
 * - **Failure isolation**: a failed request answers its own client with a
 *   502 while the uplink is redialed for the next one
 * - **Async I/O**: built on Tokio throughout
 *
 * ## Modules
 *
 * - `config`: command line configuration for the two binaries
 * - `error`: the crate-wide error type
 * - `frame`: the length-prefixed frame codec both peers speak
 * - `ship`: client acceptor, request queue and uplink serializer
 * - `offshore`: uplink dispatcher, outbound execution and tunnel bridge
 * - `upstream`: the outbound HTTP executor seam
 */

/// Configuration module for command line arguments and settings
pub mod config;
/// Error handling module with the crate-wide error type
pub mod error;
/// Wire framing codec for the uplink
pub mod frame;
/// Offshore peer: dispatcher and tunnel bridge
pub mod offshore;
/// Ship peer: acceptor, queue and serializer
pub mod ship;
/// Outbound HTTP executor seam
pub mod upstream;

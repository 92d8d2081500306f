/*!
 * # Configuration Module
 *
 * This module handles the configuration for the two shiplink binaries,
 * including command line argument parsing, one struct per peer.
 */

use clap::Parser;
use std::time::Duration;

/// Ship-side proxy configuration
///
/// Populated from command line arguments using the `clap` crate.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct ShipConfig {
    /// Host of the offshore peer
    #[arg(long, default_value = "127.0.0.1")]
    pub offshore_host: String,

    /// Port of the offshore peer
    #[arg(long, default_value_t = 9000)]
    pub offshore_port: u16,

    /// Address to accept local proxy clients on
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_host: String,

    /// Port to accept local proxy clients on
    #[arg(long, default_value_t = 8080)]
    pub listen_port: u16,

    /// Seconds to wait when dialing the offshore peer (no limit if unset)
    #[arg(long)]
    pub dial_timeout_secs: Option<u64>,
}

impl ShipConfig {
    /// Parse command line arguments into a `ShipConfig`
    pub fn from_args() -> Self {
        ShipConfig::parse()
    }

    /// The `host:port` the uplink dials
    pub fn offshore_addr(&self) -> String {
        format!("{}:{}", self.offshore_host, self.offshore_port)
    }

    /// The `host:port` the client listener binds
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    /// Uplink dial timeout, if one was configured
    pub fn get_dial_timeout(&self) -> Option<Duration> {
        self.dial_timeout_secs.map(Duration::from_secs)
    }
}

/// Offshore-side server configuration
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct OffshoreConfig {
    /// Address to accept the ship uplink on
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to accept the ship uplink on
    #[arg(long, default_value_t = 9000)]
    pub port: u16,

    /// Seconds before an outbound HTTP request is abandoned (no limit if unset)
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,

    /// Seconds to wait when dialing a CONNECT target (no limit if unset)
    #[arg(long)]
    pub dial_timeout_secs: Option<u64>,
}

impl OffshoreConfig {
    /// Parse command line arguments into an `OffshoreConfig`
    pub fn from_args() -> Self {
        OffshoreConfig::parse()
    }

    /// The `host:port` the uplink listener binds
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Outbound HTTP request timeout, if one was configured
    pub fn get_request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    /// CONNECT target dial timeout, if one was configured
    pub fn get_dial_timeout(&self) -> Option<Duration> {
        self.dial_timeout_secs.map(Duration::from_secs)
    }
}

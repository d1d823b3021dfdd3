//! Configuration management for Mau.

use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::MAX_MTU;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Proxy socket configuration.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Channel impairment parameters.
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        self.proxy.validate()?;
        self.channel.validate()?;
        Ok(())
    }
}

/// UDP socket configuration for a proxy session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// UDP port to listen on for client traffic. 0 picks an ephemeral port.
    #[serde(default)]
    pub udp_listen_port: u16,

    /// Local address to bind. Defaults to the IPv4 wildcard.
    #[serde(default)]
    pub bind_address: Option<IpAddr>,

    /// Kernel send buffer size for the UDP socket.
    #[serde(default = "default_socket_buffer")]
    pub send_buffer_size: usize,

    /// Kernel receive buffer size for the UDP socket.
    #[serde(default = "default_socket_buffer")]
    pub recv_buffer_size: usize,

    /// Maximum bytes accepted per datagram.
    #[serde(default = "default_max_datagram")]
    pub max_datagram_bytes: usize,

    /// Number of read buffers in the fixed pool.
    #[serde(default = "default_pool_buffers")]
    pub pool_buffers: usize,
}

fn default_socket_buffer() -> usize { 64 * 1024 }
fn default_max_datagram() -> usize { MAX_MTU }
fn default_pool_buffers() -> usize { 1024 }

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            udp_listen_port: 0,
            bind_address: None,
            send_buffer_size: default_socket_buffer(),
            recv_buffer_size: default_socket_buffer(),
            max_datagram_bytes: default_max_datagram(),
            pool_buffers: default_pool_buffers(),
        }
    }
}

impl ProxyConfig {
    /// Validate the socket parameters.
    pub fn validate(&self) -> Result<()> {
        if self.max_datagram_bytes == 0 || self.max_datagram_bytes > 65507 {
            return Err(Error::InvalidConfig(format!(
                "max_datagram_bytes out of range: {}",
                self.max_datagram_bytes
            )));
        }
        if self.pool_buffers == 0 {
            return Err(Error::InvalidConfig("pool_buffers must be nonzero".into()));
        }
        Ok(())
    }
}

/// Impairment parameters for both delivery channels.
///
/// The snapshot may be replaced at runtime through [`crate::Proxy::configure`];
/// channels read the current snapshot on every impairment decision. The RNG is
/// seeded once at session creation and never reseeded on reconfigure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// One-way propagation delay in milliseconds.
    #[serde(default = "default_light_speed")]
    pub light_speed_msec: u32,

    /// Steady-state drop probability in [0, 1].
    #[serde(default = "default_loss_rate")]
    pub loss_rate: f32,

    /// Gilbert–Elliott recovery probability: the chance a datagram is
    /// delivered while the channel is in the loss state, in [0, 1].
    #[serde(default = "default_delivery_rate")]
    pub delivery_rate: f32,

    /// Bottleneck router bandwidth in megabits per second. 0 = unlimited.
    #[serde(default = "default_router_mbps")]
    pub router_mbps: f64,

    /// Maximum queueing delay the router tolerates before dropping, in
    /// milliseconds.
    #[serde(default = "default_router_queue")]
    pub router_queue_msec: u32,

    /// Enable Random Early Detection on the router queue.
    #[serde(default = "default_red_enable")]
    pub router_red_enable: bool,

    /// Probability in [0, 1] that a datagram is held back one slot to create
    /// an out-of-order delivery.
    #[serde(default)]
    pub reorder_rate: f32,

    /// Probability in [0, 1] that a datagram is duplicated.
    #[serde(default)]
    pub duplicate_rate: f32,

    /// Probability in [0, 1] that one byte of the payload has a bit flipped.
    #[serde(default)]
    pub corruption_rate: f32,

    /// Seed for the impairment PRNG. 0 picks a random seed.
    #[serde(default = "default_rng_seed")]
    pub rng_seed: u64,
}

fn default_light_speed() -> u32 { 20 }
fn default_loss_rate() -> f32 { 0.01 }
fn default_delivery_rate() -> f32 { 0.5 }
fn default_router_mbps() -> f64 { 1.0 }
fn default_router_queue() -> u32 { 100 }
fn default_red_enable() -> bool { true }
fn default_rng_seed() -> u64 { 1 }

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            light_speed_msec: default_light_speed(),
            loss_rate: default_loss_rate(),
            delivery_rate: default_delivery_rate(),
            router_mbps: default_router_mbps(),
            router_queue_msec: default_router_queue(),
            router_red_enable: default_red_enable(),
            reorder_rate: 0.0,
            duplicate_rate: 0.0,
            corruption_rate: 0.0,
            rng_seed: default_rng_seed(),
        }
    }
}

impl ChannelConfig {
    /// A transparent channel: no impairments, unlimited bandwidth, zero delay.
    pub fn transparent() -> Self {
        Self {
            light_speed_msec: 0,
            loss_rate: 0.0,
            delivery_rate: 1.0,
            router_mbps: 0.0,
            router_queue_msec: default_router_queue(),
            router_red_enable: false,
            reorder_rate: 0.0,
            duplicate_rate: 0.0,
            corruption_rate: 0.0,
            rng_seed: default_rng_seed(),
        }
    }

    /// Validate the impairment parameters.
    pub fn validate(&self) -> Result<()> {
        for (name, rate) in [
            ("loss_rate", self.loss_rate),
            ("delivery_rate", self.delivery_rate),
            ("reorder_rate", self.reorder_rate),
            ("duplicate_rate", self.duplicate_rate),
            ("corruption_rate", self.corruption_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) || rate.is_nan() {
                return Err(Error::InvalidConfig(format!(
                    "{name} out of range [0, 1]: {rate}"
                )));
            }
        }

        if self.router_mbps < 0.0 || self.router_mbps.is_nan() {
            return Err(Error::InvalidConfig(format!(
                "router_mbps must be non-negative: {}",
                self.router_mbps
            )));
        }

        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (overridden by `RUST_LOG`).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "text" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors in text output.
    #[serde(default = "default_log_color")]
    pub color: bool,
}

fn default_log_level() -> String { "info".into() }
fn default_log_format() -> String { "text".into() }
fn default_log_color() -> bool { true }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_log_color(),
        }
    }
}

/// Initialize the global tracing subscriber.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    }

    Ok(())
}

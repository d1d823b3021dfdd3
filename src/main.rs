//! Mau CLI - standalone UDP network-impairment proxy.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use colored::Colorize;
use tokio::signal;

use mau::config::{init_logging, Config, LoggingConfig};
use mau::{ChannelConfig, Proxy, VERSION};

#[derive(Parser, Debug)]
#[command(name = "mau", version, about = "UDP network-impairment proxy")]
struct Cli {
    /// Server to forward to, as host:port
    server: String,

    /// UDP port to listen on (0 = ephemeral)
    #[arg(short = 'p', long, default_value_t = 0)]
    listen_port: u16,

    /// Local address to bind
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Configuration file (TOML); CLI flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// One-way propagation delay in milliseconds
    #[arg(long)]
    latency_ms: Option<u32>,

    /// Steady-state packet loss rate [0, 1]
    #[arg(long)]
    loss_rate: Option<f32>,

    /// Delivery probability while in a loss burst [0, 1]
    #[arg(long)]
    delivery_rate: Option<f32>,

    /// Bottleneck bandwidth in Mbps (0 = unlimited)
    #[arg(long)]
    bandwidth_mbps: Option<f64>,

    /// Router queue depth in milliseconds
    #[arg(long)]
    queue_ms: Option<u32>,

    /// Disable Random Early Detection on the router queue
    #[arg(long)]
    no_red: bool,

    /// Reorder rate [0, 1]
    #[arg(long)]
    reorder_rate: Option<f32>,

    /// Duplication rate [0, 1]
    #[arg(long)]
    duplicate_rate: Option<f32>,

    /// Corruption rate [0, 1]
    #[arg(long)]
    corruption_rate: Option<f32>,

    /// RNG seed for reproducible impairment (0 = random)
    #[arg(long)]
    seed: Option<u64>,

    /// Print per-direction statistics every N seconds (0 = off)
    #[arg(long, default_value_t = 10)]
    stats_interval: u64,

    /// Log level filter
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,
}

impl Cli {
    /// Merge the config file (if any) with CLI overrides.
    fn resolve_config(&self) -> anyhow::Result<Config> {
        let mut config = if let Some(ref path) = self.config {
            Config::load(path).with_context(|| format!("loading {}", path.display()))?
        } else {
            Config {
                channel: ChannelConfig::transparent(),
                ..Config::default()
            }
        };

        if self.listen_port != 0 {
            config.proxy.udp_listen_port = self.listen_port;
        }
        if let Some(bind) = self.bind {
            config.proxy.bind_address = Some(bind);
        }

        let ch = &mut config.channel;
        if let Some(v) = self.latency_ms {
            ch.light_speed_msec = v;
        }
        if let Some(v) = self.loss_rate {
            ch.loss_rate = v;
        }
        if let Some(v) = self.delivery_rate {
            ch.delivery_rate = v;
        }
        if let Some(v) = self.bandwidth_mbps {
            ch.router_mbps = v;
        }
        if let Some(v) = self.queue_ms {
            ch.router_queue_msec = v;
        }
        if self.no_red {
            ch.router_red_enable = false;
        }
        if let Some(v) = self.reorder_rate {
            ch.reorder_rate = v;
        }
        if let Some(v) = self.duplicate_rate {
            ch.duplicate_rate = v;
        }
        if let Some(v) = self.corruption_rate {
            ch.corruption_rate = v;
        }
        if let Some(v) = self.seed {
            ch.rng_seed = v;
        }

        config.logging = LoggingConfig {
            level: self.log_level.clone(),
            format: if self.json_logs { "json".into() } else { "text".into() },
            color: !self.no_color,
        };

        config.validate()?;
        Ok(config)
    }
}

fn parse_server(server: &str) -> anyhow::Result<(String, u16)> {
    let Some((host, port)) = server.rsplit_once(':') else {
        bail!("server must be host:port, got {server:?}");
    };
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid server port {port:?}"))?;
    if host.is_empty() {
        bail!("server hostname is empty");
    }
    Ok((host.to_string(), port))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.resolve_config()?;

    init_logging(&config.logging)?;

    let (server_host, server_port) = parse_server(&cli.server)?;

    let proxy = Proxy::create(
        &config.proxy,
        config.channel.clone(),
        server_host.clone(),
        server_port,
    )?;

    println!("{} mau {} listening on {}", "●".green(), VERSION, proxy.local_addr());
    println!(
        "  {} {}:{}  delay={}ms loss={} bw={} queue={}ms",
        "→".cyan(),
        server_host,
        server_port,
        config.channel.light_speed_msec,
        config.channel.loss_rate,
        if config.channel.router_mbps > 0.0 {
            format!("{}Mbps", config.channel.router_mbps)
        } else {
            "unlimited".into()
        },
        config.channel.router_queue_msec,
    );
    println!("  Press Ctrl+C to stop.");

    if cli.stats_interval > 0 {
        let mut interval = tokio::time::interval(Duration::from_secs(cli.stats_interval));
        interval.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = proxy.stats();
                    println!("  c2s: {}", stats.c2s);
                    println!("  s2c: {}", stats.s2c);
                }
                _ = signal::ctrl_c() => break,
            }
        }
    } else {
        signal::ctrl_c().await?;
    }

    println!();
    println!("{} Shutting down...", "→".yellow());

    let stats = proxy.stats();
    proxy.destroy();

    println!("  c2s: {}", stats.c2s);
    println!("  s2c: {}", stats.s2c);

    let result = proxy.last_result();
    if result.is_success() {
        println!("{} Stopped.", "●".yellow());
        Ok(())
    } else {
        println!("{} Stopped with sticky failure: {}", "✗".red(), result);
        bail!("proxy reported {result}");
    }
}

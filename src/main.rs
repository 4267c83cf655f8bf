//! rust-tunnel: FakeTCP peer-to-peer tunnel
//!
//! This is the main entry point for both tunnel roles.
//!
//! # Usage
//!
//! ```bash
//! # Client: intercept a LAN and tunnel it to a server
//! sudo ./rust-tunnel --mode client -r 192.168.1.0/24 -s 203.0.113.1:19986 \
//!     --method aes-128-gcm --password secret
//!
//! # Server: accept tunnels on port 19986
//! sudo ./rust-tunnel --mode server -p 19986 --method aes-128-gcm --password secret
//!
//! # Run from a configuration file
//! sudo ./rust-tunnel -c /etc/rust-tunnel/config.json
//!
//! # Inspect the paired capture devices
//! ./rust-tunnel --list-devices
//! ```
//!
//! Raw capture needs elevated privileges (CAP_NET_RAW on Linux).

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rust_tunnel::config::{
    create_default_config, load_config_with_env, Config, Mode, DEFAULT_PORT,
};
use rust_tunnel::device::find_all_devices;
use rust_tunnel::tunnel::{ClientTunnel, ServerTunnel};

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: Option<PathBuf>,
    /// Tunnel role when no config file is given
    mode: Option<String>,
    /// Source CIDRs to intercept (client)
    sources: Vec<String>,
    /// Server address (client)
    server: Option<String>,
    /// Tunnel port
    port: Option<u16>,
    /// Client-side local port
    local_port: Option<u16>,
    /// Upstream device name
    upstream: Option<String>,
    /// Listen device names
    listen_devices: Vec<String>,
    /// Gateway address override
    gateway: Option<String>,
    /// Encryption method
    method: Option<String>,
    /// Pre-shared passphrase
    password: Option<String>,
    /// Debug logging
    verbose: bool,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
    /// Print the paired devices and exit
    list_devices: bool,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut args = std::env::args().skip(1);
        let mut parsed = Self {
            config_path: None,
            mode: None,
            sources: Vec::new(),
            server: None,
            port: None,
            local_port: None,
            upstream: None,
            listen_devices: Vec::new(),
            gateway: None,
            method: None,
            password: None,
            verbose: false,
            generate_config: false,
            check_config: false,
            list_devices: false,
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => parsed.config_path = Some(PathBuf::from(required(&mut args, &arg)?)),
                "-m" | "--mode" => parsed.mode = Some(required(&mut args, &arg)?),
                "-r" | "--sources" => parsed
                    .sources
                    .extend(required(&mut args, &arg)?.split(',').map(str::to_string)),
                "-s" | "--server" => parsed.server = Some(required(&mut args, &arg)?),
                "-p" | "--port" => {
                    parsed.port = Some(required(&mut args, &arg)?.parse().context("invalid port")?);
                }
                "--local-port" => {
                    parsed.local_port =
                        Some(required(&mut args, &arg)?.parse().context("invalid local port")?);
                }
                "-u" | "--upstream" => parsed.upstream = Some(required(&mut args, &arg)?),
                "-l" | "--listen" => parsed
                    .listen_devices
                    .extend(required(&mut args, &arg)?.split(',').map(str::to_string)),
                "-g" | "--gateway" => parsed.gateway = Some(required(&mut args, &arg)?),
                "--method" => parsed.method = Some(required(&mut args, &arg)?),
                "--password" => parsed.password = Some(required(&mut args, &arg)?),
                "-v" | "--verbose" => parsed.verbose = true,
                "--generate-config" => parsed.generate_config = true,
                "--check" => parsed.check_config = true,
                "--list-devices" => parsed.list_devices = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                other => bail!("Unknown argument: {other} (try --help)"),
            }
        }
        Ok(parsed)
    }
}

fn required(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
    args.next()
        .with_context(|| format!("{flag} requires a value"))
}

fn print_help() {
    println!(
        "rust-tunnel: FakeTCP peer-to-peer tunnel

USAGE:
    rust-tunnel [OPTIONS]

OPTIONS:
    -c, --config <path>       Configuration file (JSON)
    -m, --mode <role>         client or server
    -r, --sources <cidrs>     Source CIDRs to intercept, comma separated (client)
    -s, --server <addr>       Server address, e.g. 203.0.113.1:19986 (client)
    -p, --port <port>         Tunnel port (default {DEFAULT_PORT})
        --local-port <port>   Client-side FakeTCP port (default: random)
    -u, --upstream <device>   Upstream device name (default: auto)
    -l, --listen <devices>    Listen device names, comma separated (default: all)
    -g, --gateway <ip>        Gateway address (default: first host of the upstream subnet)
        --method <method>     plain | aes-128-gcm | aes-192-gcm | aes-256-gcm |
                              chacha20-poly1305 | xchacha20-poly1305
        --password <pass>     Pre-shared passphrase
    -v, --verbose             Debug logging
        --generate-config     Write rust-tunnel.json with defaults and exit
        --check               Validate configuration and exit
        --list-devices        Print the paired capture devices and exit
    -h, --help                Show this help"
    );
}

/// Merge CLI flags over the loaded (or minimal) configuration
fn build_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config_path {
        Some(path) => load_config_with_env(path)?,
        None => {
            let mode = match args.mode.as_deref() {
                Some("client") => Mode::Client,
                Some("server") => Mode::Server,
                Some(other) => bail!("Unknown mode: {other}"),
                None => bail!("Either --config or --mode is required (try --help)"),
            };
            Config::new(mode)
        }
    };

    for source in &args.sources {
        config
            .sources
            .push(source.parse().with_context(|| format!("invalid source CIDR {source}"))?);
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(server) = &args.server {
        // A bare address takes the tunnel port.
        let addr: SocketAddrV4 = match server.parse() {
            Ok(addr) => addr,
            Err(_) => {
                let ip: Ipv4Addr = server
                    .parse()
                    .with_context(|| format!("invalid server address {server}"))?;
                SocketAddrV4::new(ip, config.port)
            }
        };
        config.server = Some(addr);
    }
    if let Some(local_port) = args.local_port {
        config.local_port = Some(local_port);
    }
    if let Some(upstream) = &args.upstream {
        config.upstream = Some(upstream.clone());
    }
    config.listen_devices.extend(args.listen_devices.iter().cloned());
    if let Some(gateway) = &args.gateway {
        config.gateway = Some(
            gateway
                .parse()
                .with_context(|| format!("invalid gateway address {gateway}"))?,
        );
    }
    if let Some(method) = &args.method {
        config.crypto.method = method.clone();
    }
    if let Some(password) = &args.password {
        config.crypto.password = Some(password.clone());
    }
    if args.verbose {
        config.log.level = "debug".into();
    }

    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse()?;

    if args.generate_config {
        let path = args
            .config_path
            .unwrap_or_else(|| PathBuf::from("rust-tunnel.json"));
        create_default_config(&path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    if args.list_devices {
        for device in find_all_devices()?.devices {
            println!("{device}");
        }
        return Ok(());
    }

    let config = build_config(&args)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log.level.clone())),
        )
        .init();

    if args.check_config {
        println!("Configuration OK");
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))
        .context("register SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
        .context("register SIGTERM handler")?;

    match config.mode {
        Mode::Client => ClientTunnel::new(config, shutdown).run()?,
        Mode::Server => ServerTunnel::new(config, shutdown).run()?,
    }

    info!("Shutdown complete");
    Ok(())
}

//! ssrelay - CLI entry point
//!
//! Runs a Shadowsocks client (SOCKS5 front-end) by default, or a server
//! with `-S`. Configuration comes from a JSON file (`-c`) with individual
//! flags taking precedence.
//!
//! Exit codes: 0 normal, 1 configuration error, 2 startup error.

// Use mimalloc as global allocator for better p99 latency
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use ssrelay::crypto::{self, Encryptor, Method};
use ssrelay::relay::AddressTester;
use ssrelay::{Mode, Profile, Relay, VERSION};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ssrelay")]
#[command(version = VERSION)]
#[command(about = "Shadowsocks TCP/UDP relay with a SOCKS5 front-end")]
struct Args {
    /// JSON configuration file
    #[arg(short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Host name or IP address of the remote server
    #[arg(short = 's', value_name = "HOST")]
    server: Option<String>,

    /// Port number of the remote server
    #[arg(short = 'p', value_name = "PORT")]
    server_port: Option<u16>,

    /// Local address to bind (ignored in server mode)
    #[arg(short = 'b', value_name = "ADDR")]
    local_address: Option<String>,

    /// Local port to bind (ignored in server mode)
    #[arg(short = 'l', value_name = "PORT")]
    local_port: Option<u16>,

    /// Password of the remote server
    #[arg(short = 'k', value_name = "PASSWORD")]
    password: Option<String>,

    /// Encryption method
    #[arg(short = 'm', value_name = "METHOD")]
    method: Option<String>,

    /// Socket idle timeout in seconds
    #[arg(short = 't', value_name = "SECONDS")]
    timeout: Option<u64>,

    /// Run in HTTP(S) proxy mode (handled by the proxy glue, ignored in
    /// server mode)
    #[arg(short = 'H', long = "http-proxy")]
    http_proxy: bool,

    /// Run as a Shadowsocks server
    #[arg(short = 'S', long = "server-mode")]
    server_mode: bool,

    /// Test encrypt/decrypt speed and exit
    #[arg(short = 'T', long = "speed-test")]
    speed_test: bool,

    /// Logging level: debug, info, warn, error, fatal
    #[arg(short = 'L', value_name = "LEVEL", default_value = "info")]
    log_level: String,

    /// Automatically ban IPs that send malformed headers (server mode)
    #[arg(long = "autoban")]
    autoban: bool,
}

fn main() -> anyhow::Result<()> {
    // Tuned multi-thread runtime for proxy workloads
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .thread_name("ssrelay-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = normalize_log_level(&args.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("ssrelay={}", level))),
        )
        .init();

    info!("ssrelay v{}", VERSION);

    let mut profile = if let Some(ref path) = args.config {
        match Profile::load(path) {
            Ok(profile) => profile,
            Err(e) => {
                error!("failed to load {}: {}", path.display(), e);
                std::process::exit(1);
            }
        }
    } else {
        Profile::default()
    };

    // CLI flags override the config file
    if let Some(server) = args.server {
        profile.server = server;
    }
    if let Some(port) = args.server_port {
        profile.server_port = port;
    }
    if let Some(addr) = args.local_address {
        profile.local_address = addr;
    }
    if let Some(port) = args.local_port {
        profile.local_port = port;
    }
    if let Some(password) = args.password {
        profile.password = password;
    }
    if let Some(method) = args.method {
        profile.method = method;
    }
    if let Some(timeout) = args.timeout {
        profile.timeout = timeout;
    }
    if args.http_proxy {
        profile.http_proxy = true;
    }
    profile.debug = level == "debug";

    if args.speed_test {
        return run_speed_test(&profile.method);
    }

    let mode = if args.server_mode {
        Mode::Server
    } else {
        Mode::Client
    };

    let relay = match Relay::new(profile, mode, args.autoban) {
        Ok(relay) => relay,
        Err(e) => {
            error!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    if mode == Mode::Client {
        probe_server(&relay).await;
    }

    if let Err(e) = relay.run().await {
        error!("relay error: {}", e);
        std::process::exit(2);
    }

    Ok(())
}

/// `fatal` maps to `error`; tracing has no fatal level
fn normalize_log_level(level: &str) -> &'static str {
    match level.to_lowercase().as_str() {
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" | "fatal" => "error",
        other => {
            eprintln!("log level {} not recognised, defaulting to info", other);
            "info"
        }
    }
}

/// Non-fatal reachability report at client startup
async fn probe_server(relay: &Relay) {
    let profile = relay.profile();
    let tester = AddressTester::new(profile.server.clone(), profile.server_port);
    match tester.ping(relay.resolver(), Duration::from_secs(3)).await {
        Ok(latency) => info!(
            "server {}:{} reachable ({} ms)",
            profile.server,
            profile.server_port,
            latency.as_millis()
        ),
        Err(e) => warn!(
            "server {}:{} not reachable yet: {}",
            profile.server, profile.server_port, e
        ),
    }
}

const SPEED_TEST_BLOCK: usize = 32 * 1024;
const SPEED_TEST_MB: usize = 100;

/// Encrypt 100 MB in 32 KiB blocks and report the elapsed time, for one
/// method or for every method in the registry
fn run_speed_test(method_name: &str) -> anyhow::Result<()> {
    if method_name.is_empty() {
        println!("testing all encryption methods...");
        for name in crypto::supported_methods() {
            speed_test_method(name)?;
        }
    } else {
        speed_test_method(method_name)?;
    }
    Ok(())
}

fn speed_test_method(name: &str) -> anyhow::Result<()> {
    let method = match Method::from_name(name) {
        Ok(method) => method,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let mut encryptor = Encryptor::new(method, "barfoo!")?;
    let block = vec![b'#'; SPEED_TEST_BLOCK];
    let loops = SPEED_TEST_MB * 1024 * 1024 / SPEED_TEST_BLOCK;

    let start = Instant::now();
    for _ in 0..loops {
        encryptor.encrypt(&block)?;
    }
    let elapsed = start.elapsed();

    println!(
        "{:<24} {} MB encrypted in {} ms",
        name,
        SPEED_TEST_MB,
        elapsed.as_millis()
    );
    Ok(())
}

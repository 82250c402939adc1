//! # Relay Demo
//!
//! Runs a small relay deployment in one process and drives it.
//!
//! - `single`: one server, one client, a handful of concurrent `Foo.Sum` calls.
//! - `cluster`: a registry, several heartbeating servers, and an `XClient`
//!   that calls and broadcasts through registry discovery.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use relayrun::Registry;
use relayrun::RegistryConfig;
use relayrun::RegistryDiscovery;
use relayrun::SelectMode;
use relayrun::Server;
use relayrun::ServerConfig;
use relayrun::ServiceBuilder;
use relayrun::XClient;
use relayrun::registry;
use relaywire::CodecType;
use relaywire::CompressType;
use relaywire::Options;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "relaydemo")]
#[command(about = "Relay rpc demo: servers, registry and clients in one process")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Body serializer
    #[arg(long, value_enum, default_value_t = Codec::Msgpack, global = true)]
    codec: Codec,

    /// Body compressor
    #[arg(long, value_enum, default_value_t = Compress::None, global = true)]
    compress: Compress,

    /// Per-call timeout in milliseconds
    #[arg(long, default_value_t = 1000, global = true)]
    call_timeout_ms: u64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// One server and one client over raw TCP
    Single {
        /// Number of concurrent calls
        #[arg(short, long, default_value_t = 5)]
        calls: i64,

        /// Tunnel through HTTP CONNECT instead of raw TCP
        #[arg(long)]
        http: bool,
    },
    /// A registry plus several servers behind an XClient
    Cluster {
        /// Number of servers to start
        #[arg(short, long, default_value_t = 2)]
        servers: usize,

        /// Number of calls and broadcasts to issue
        #[arg(short, long, default_value_t = 5)]
        calls: i64,

        /// Address selection for unicast calls
        #[arg(long, value_enum, default_value_t = Mode::RoundRobin)]
        mode: Mode,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Codec {
    Msgpack,
    Json,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Compress {
    None,
    Gzip,
    Zstd,
    Zlib,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Random,
    RoundRobin,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Args {
    num1: i64,
    num2: i64,
}

struct Foo;

fn foo_service() -> anyhow::Result<relayrun::Service> {
    let service = ServiceBuilder::new("Foo", Foo)
        .method("Sum", |_: &Foo, args: Args, reply: &mut i64| -> Result<(), String> {
            *reply = args.num1 + args.num2;
            Ok(())
        })
        .async_method("Sleep", |_: Arc<Foo>, args: Args| async move {
            tokio::time::sleep(Duration::from_secs(args.num1.max(0) as u64)).await;
            Ok::<_, String>(args.num1 + args.num2)
        })
        .build()?;
    Ok(service)
}

impl Cli {
    fn options(&self) -> Options {
        let codec = match self.codec {
            Codec::Msgpack => CodecType::MsgPack,
            Codec::Json => CodecType::Json,
        };
        let compress = match self.compress {
            Compress::None => CompressType::Noop,
            Compress::Gzip => CompressType::Gzip,
            Compress::Zstd => CompressType::Zstd,
            Compress::Zlib => CompressType::Zlib,
        };
        Options::default().with_codec(codec).with_compress(compress)
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// A token that fires after `timeout`, like a deadline context.
fn deadline(timeout: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let fire = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        fire.cancel();
    });
    token
}

async fn start_server(http: bool) -> anyhow::Result<String> {
    let server = Server::new(ServerConfig::default());
    server.register(foo_service()?)?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    info!(%addr, http, "server started");

    tokio::spawn(async move {
        let served = if http {
            server.serve_http(listener).await
        } else {
            server.accept(listener).await
        };
        if let Err(e) = served {
            warn!("server stopped: {}", e);
        }
    });
    Ok(addr)
}

async fn single(cli: &Cli, calls: i64, http: bool) -> anyhow::Result<()> {
    let addr = start_server(http).await?;
    let rpc_addr = format!("{}@{}", if http { "http" } else { "tcp" }, addr);
    let client = relayrun::xdial(&rpc_addr, cli.options()).await?;

    let mut tasks = JoinSet::new();
    for i in 0..calls {
        let client = client.clone();
        let timeout = cli.call_timeout();
        tasks.spawn(async move {
            let args = Args { num1: i, num2: i * i };
            let ctx = deadline(timeout);
            match client.call::<_, i64>(&ctx, "Foo.Sum", &args).await {
                Ok(reply) => info!("{} + {} = {}", args.num1, args.num2, reply),
                Err(e) => warn!("call Foo.Sum error: {}", e),
            }
        });
    }
    while tasks.join_next().await.is_some() {}

    client.close().await?;
    Ok(())
}

async fn cluster(cli: &Cli, servers: usize, calls: i64, mode: Mode) -> anyhow::Result<()> {
    let config = RegistryConfig::default();
    let registry = Arc::new(Registry::new(config.clone()));
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let registry_url = format!("http://{}{}", listener.local_addr()?, config.path);
    tokio::spawn(registry.clone().serve(listener));

    let mut beats = Vec::new();
    for _ in 0..servers {
        let addr = start_server(false).await?;
        beats.push(registry::heartbeat(registry_url.clone(), format!("tcp@{}", addr), Duration::ZERO));
    }

    // let the first heartbeats land
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mode = match mode {
        Mode::Random => SelectMode::Random,
        Mode::RoundRobin => SelectMode::RoundRobin,
    };
    let discovery = Arc::new(RegistryDiscovery::new(registry_url, Duration::ZERO));
    let xc = XClient::new(discovery, mode, cli.options());

    let mut tasks = JoinSet::new();
    for i in 0..calls {
        let xc = xc.clone();
        let timeout = cli.call_timeout();
        tasks.spawn(async move {
            let args = Args { num1: i, num2: i * i };

            let ctx = deadline(timeout);
            match xc.call::<_, i64>(&ctx, "Foo.Sum", &args).await {
                Ok(reply) => info!("call Foo.Sum success: {} + {} = {}", args.num1, args.num2, reply),
                Err(e) => warn!("call Foo.Sum error: {}", e),
            }

            // Foo.Sleep sleeps num1 seconds; late legs hit the deadline
            let ctx = deadline(timeout);
            let mut reply = 0i64;
            match xc.broadcast(&ctx, "Foo.Sleep", &args, Some(&mut reply)).await {
                Ok(()) => info!("broadcast Foo.Sleep success: {} + {} = {}", args.num1, args.num2, reply),
                Err(e) => warn!("broadcast Foo.Sleep error: {}", e),
            }
        });
    }
    while tasks.join_next().await.is_some() {}

    xc.close().await;
    for beat in beats {
        beat.abort();
    }
    Ok(())
}

fn setup_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_tracing();

    match cli.command {
        Command::Single { calls, http } => single(&cli, calls, http).await,
        Command::Cluster { servers, calls, mode } => cluster(&cli, servers, calls, mode).await,
    }
}

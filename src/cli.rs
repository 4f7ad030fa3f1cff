//! Command line front end.
//!
//! A thin shell around [`Server`]: flag parsing, logging setup and the
//! application registry lookup. All protocol behavior lives in the core.
use std::time::Duration;

use clap::Parser;

use crate::access::AccessLogConfig;
use crate::asgi;
use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::proxy::ProxyConfig;
use crate::server::Server;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, Parser)]
#[command(name = "daphne", about = "Django HTTP/WebSocket server", disable_help_subcommand = true)]
pub struct Args {
    /// The application to dispatch to as path.to.module:instance.path
    pub application: String,

    /// The host/address to bind to
    #[arg(short = 'b', long = "bind")]
    pub bind: Option<String>,

    /// Port number to listen on
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Bind to a UNIX socket rather than a TCP host/port
    #[arg(short = 'u', long = "unix-socket")]
    pub unix_socket: Option<String>,

    /// Bind to a file descriptor rather than a TCP host/port
    #[arg(long = "fd")]
    pub file_descriptor: Option<i32>,

    /// Endpoint description string, repeatable
    #[arg(short = 'e', long = "endpoint")]
    pub endpoints: Vec<String>,

    /// The setting for the ASGI root_path variable
    #[arg(long = "root-path", env = "DAPHNE_ROOT_PATH", default_value = "")]
    pub root_path: String,

    /// The server header value to send back
    #[arg(long = "server-name", default_value = "daphne")]
    pub server_name: String,

    /// Disable the server header entirely
    #[arg(long = "no-server-name", conflicts_with = "server_name")]
    pub no_server_name: bool,

    /// Where to write the access log (- for stdout, the default for
    /// verbosity >= 1)
    #[arg(long = "access-log")]
    pub access_log: Option<String>,

    /// Log record format: full, compact or pretty
    #[arg(long = "log-fmt", default_value = "full")]
    pub log_fmt: String,

    /// How long to wait for a response before timing out HTTP requests
    #[arg(short = 't', long = "http-timeout")]
    pub http_timeout: Option<u64>,

    /// Maximum time to allow a websocket to be connected, -1 for infinite
    #[arg(long = "websocket-timeout", default_value_t = 86400, allow_negative_numbers = true)]
    pub websocket_timeout: i64,

    /// Maximum time to allow a websocket handshake, -1 for infinite
    #[arg(long = "websocket-connect-timeout", default_value_t = 5, allow_negative_numbers = true)]
    pub websocket_connect_timeout: i64,

    /// Seconds an application has to exit after client disconnect before
    /// it is killed
    #[arg(long = "application-close-timeout", default_value_t = 10)]
    pub application_close_timeout: u64,

    /// Seconds a WebSocket must be idle before a keepalive ping is sent
    #[arg(long = "ping-interval", default_value_t = 20)]
    pub ping_interval: u64,

    /// Seconds before a WebSocket is closed if no response to a keepalive
    /// ping
    #[arg(long = "ping-timeout", default_value_t = 30)]
    pub ping_timeout: u64,

    /// Enable parsing of proxy headers for the client address
    #[arg(long = "proxy-headers")]
    pub proxy_headers: bool,

    /// Header to take the client host from, implies --proxy-headers
    #[arg(long = "proxy-headers-host", requires = "proxy_headers")]
    pub proxy_headers_host: Option<String>,

    /// Header to take the client port from, implies --proxy-headers
    #[arg(long = "proxy-headers-port", requires = "proxy_headers")]
    pub proxy_headers_port: Option<String>,

    /// How verbose to make the output, 0 to 3
    #[arg(short = 'v', long = "verbosity", default_value_t = 1)]
    pub verbosity: u8,
}

/// Parses the process arguments and runs the server to completion.
///
/// Exit codes: 0 on normal shutdown, 1 on startup failure, 2 on invalid
/// arguments.
pub fn run() -> i32 {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = if err.use_stderr() { 2 } else { 0 };
            let _ = err.print();
            return code;
        }
    };
    run_args(args)
}

pub fn run_args(args: Args) -> i32 {
    init_logging(args.verbosity, &args.log_fmt);

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            return 1;
        }
    };

    let app = match asgi::load_application(&args.application) {
        Ok(app) => app,
        Err(err) => {
            eprintln!("{err}");
            return 1;
        }
    };

    let endpoints: Vec<String> = config.endpoints.iter().map(Endpoint::to_string).collect();
    log::info!("starting server at {}", endpoints.join(", "));

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            return 1;
        }
    };

    let server = match Server::new(config, app) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("failed to initialise server: {err}");
            return 1;
        }
    };

    match runtime.block_on(server.run()) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{err}");
            1
        }
    }
}

fn init_logging(verbosity: u8, log_fmt: &str) {
    use tracing_subscriber::EnvFilter;

    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    // RUST_LOG wins over the verbosity flag
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    // errors only when a global subscriber is already installed (tests)
    let result = match log_fmt {
        "compact" => builder.compact().try_init(),
        "pretty" => builder.pretty().try_init(),
        _ => builder.try_init(),
    };
    let _ = result;
}

fn build_config(args: &Args) -> Result<Config, String> {
    let mut endpoints = Vec::new();

    for descriptor in &args.endpoints {
        endpoints.push(
            Endpoint::parse(descriptor)
                .map_err(|err| format!("invalid endpoint {descriptor:?}: {err}"))?,
        );
    }
    if let Some(path) = &args.unix_socket {
        endpoints.push(Endpoint::unix(path));
    }
    if let Some(fd) = args.file_descriptor {
        endpoints.push(Endpoint::fd(fd));
    }
    match (&args.bind, args.port) {
        (Some(host), port) => endpoints.push(Endpoint::tcp(host.clone(), port.unwrap_or(DEFAULT_PORT))),
        (None, Some(port)) => endpoints.push(Endpoint::tcp(DEFAULT_HOST, port)),
        (None, None) => {
            if endpoints.is_empty() {
                endpoints.push(Endpoint::tcp(DEFAULT_HOST, DEFAULT_PORT));
            }
        }
    }

    let access_log = match args.access_log.as_deref() {
        Some("-") => AccessLogConfig::Stdout,
        Some(path) => AccessLogConfig::File(path.into()),
        None if args.verbosity >= 1 => AccessLogConfig::Stdout,
        None => AccessLogConfig::Disabled,
    };

    let proxy = if args.proxy_headers {
        Some(ProxyConfig::with_headers(
            args.proxy_headers_host.as_deref().unwrap_or("X-Forwarded-For"),
            Some(args.proxy_headers_port.as_deref().unwrap_or("X-Forwarded-Port")),
            Some("X-Forwarded-Proto"),
        ))
    } else {
        None
    };

    let optional_secs = |value: i64| {
        if value < 0 {
            None
        } else {
            Some(Duration::from_secs(value as u64))
        }
    };

    Ok(Config {
        endpoints,
        server_name: if args.no_server_name { String::new() } else { args.server_name.clone() },
        root_path: args.root_path.clone(),
        http_timeout: args.http_timeout.map(Duration::from_secs),
        websocket_timeout: optional_secs(args.websocket_timeout),
        websocket_connect_timeout: optional_secs(args.websocket_connect_timeout),
        application_close_timeout: Duration::from_secs(args.application_close_timeout),
        ping_interval: Duration::from_secs(args.ping_interval),
        ping_timeout: Duration::from_secs(args.ping_timeout),
        access_log,
        proxy,
        verbosity: args.verbosity,
        ..Config::default()
    })
}

// ===== Test =====

use crate::logging::{DiagnosticFormat, LoggingConfig};
use crate::plugins::{Plugin, PluginOptions};
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tlsplit::data_phase::DEFAULT_MESSAGE_SIZE_LIMIT;
use tlsplit::{Dialer, PortRange, Server, ServerConfig};

mod logging;
mod plugins;

/// Transparent SMTP proxy.
///
/// Connections redirected to this proxy are relayed to their original
/// destination, which is upgraded to TLS with STARTTLS while the client
/// side stays in plain text.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Opt {
    /// Address to listen on
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    ip: IpAddr,

    /// Port to listen on
    #[arg(long)]
    port: u16,

    /// Source address for connections to destinations
    #[arg(long)]
    outbound_ip: Option<IpAddr>,

    /// Source port range for connections to destinations, as START-END
    #[arg(long)]
    outbound_port_range: Option<PortRange>,

    /// Largest message, in bytes, that is held for filter hooks.
    /// Larger messages are refused with a 552 reply.
    #[arg(long, default_value_t = DEFAULT_MESSAGE_SIZE_LIMIT)]
    message_size_limit: usize,

    /// Give up on a connection when a single read or write takes longer
    /// than this. 0 waits forever.
    #[arg(long, default_value = "0")]
    io_timeout_seconds: u64,

    /// Log every communication and connection event
    #[arg(long)]
    verbose: bool,

    /// Built-in hook to enable. May be repeated.
    #[arg(long = "plugin")]
    plugins: Vec<Plugin>,

    /// Where the file plugin writes. Defaults to the FILE_PATH
    /// environment variable.
    #[arg(long)]
    file_path: Option<PathBuf>,

    /// How diagnostic logs render. full, compact and pretty are intended
    /// for human consumption. json outputs machine readable records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,
}

impl Opt {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen: SocketAddr::new(self.ip, self.port),
            dialer: Dialer {
                source_ip: self.outbound_ip,
                port_range: self.outbound_port_range,
            },
            message_size_limit: self.message_size_limit,
            io_timeout: (self.io_timeout_seconds > 0)
                .then(|| Duration::from_secs(self.io_timeout_seconds)),
            verbose: self.verbose,
        }
    }

    fn plugin_options(&self) -> PluginOptions {
        PluginOptions {
            file_path: self.file_path.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    LoggingConfig {
        filter_env_var: "TLSPLIT_LOG",
        default_filter: "tlsplit=info,tlsplit_proxy=info",
        diag_format: opts.diag_format,
    }
    .init()?;

    let hooks = plugins::load(&opts.plugins, &opts.plugin_options());
    let server = Server::new(opts.server_config(), hooks);

    tokio::select! {
        result = server.start() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            Ok(())
        }
    }
}

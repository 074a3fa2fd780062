use crate::conn_id::new_connection_id;
use crate::data_phase::DEFAULT_MESSAGE_SIZE_LIMIT;
use crate::dialer::Dialer;
use crate::dispatch::{DispatchHandle, HookDispatcher};
use crate::filter::FilterInvoker;
use crate::hook::{CommEvent, Direction, RegisteredHook};
use crate::pipe::{ConnectionInfo, ConnectionPipe, Mediator, PipeConfig, PipeHooks};
use crate::resolver::{DestinationResolver, OriginalDestination};
use crate::tls::build_destination_connector;
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub dialer: Dialer,
    pub message_size_limit: usize,
    pub io_timeout: Option<Duration>,
    /// Log every event through tracing as it is dispatched
    pub verbose: bool,
}

impl ServerConfig {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            dialer: Dialer::default(),
            message_size_limit: DEFAULT_MESSAGE_SIZE_LIMIT,
            io_timeout: None,
            verbose: false,
        }
    }

    fn pipe_config(&self) -> PipeConfig {
        PipeConfig {
            message_size_limit: self.message_size_limit,
            io_timeout: self.io_timeout,
        }
    }
}

pub struct Server {
    config: ServerConfig,
    hooks: Vec<RegisteredHook>,
    resolver: Arc<dyn DestinationResolver>,
}

/// What every connection task needs from the server
struct Shared {
    dialer: Dialer,
    pipe_config: PipeConfig,
    resolver: Arc<dyn DestinationResolver>,
    connector: TlsConnector,
    filters: FilterInvoker,
    dispatch: DispatchHandle,
}

impl Server {
    pub fn new(config: ServerConfig, hooks: Vec<RegisteredHook>) -> Self {
        Self {
            config,
            hooks,
            resolver: Arc::new(OriginalDestination),
        }
    }

    /// Replace the netfilter lookup used to find each connection's
    /// destination
    pub fn with_resolver(mut self, resolver: Arc<dyn DestinationResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Bind the configured listen address and serve until cancelled.
    pub async fn start(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.listen)
            .await
            .with_context(|| format!("failed to bind to {}", self.config.listen))?;
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener until the
    /// returned future is dropped.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let Self {
            config,
            hooks,
            resolver,
        } = self;

        for hook in &hooks {
            tracing::info!("use {} hook", hook.name());
            hook.after_init();
        }

        let filters = FilterInvoker::new(hooks.iter().filter_map(|h| h.as_filter()).collect());
        let dispatcher = HookDispatcher::start(Arc::new(hooks), config.verbose)
            .context("failed to start the hook dispatcher")?;
        let connector =
            build_destination_connector().context("failed to build the TLS client config")?;

        let shared = Arc::new(Shared {
            dialer: config.dialer.clone(),
            pipe_config: config.pipe_config(),
            resolver,
            connector,
            filters,
            dispatch: dispatcher.handle(),
        });

        let addr = listener.local_addr()?;
        tracing::info!("proxy listener on {addr:?}");

        loop {
            let (socket, peer_address) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::error!("accepting connection: {err:#}");
                    continue;
                }
            };
            let shared = Arc::clone(&shared);
            tokio::spawn(async move { handle_connection(shared, socket, peer_address).await });
        }
    }
}

async fn handle_connection(shared: Arc<Shared>, socket: TcpStream, peer_address: SocketAddr) {
    let conn_id = new_connection_id();
    if let Err(err) = relay(&shared, &conn_id, socket, peer_address).await {
        tracing::debug!("{conn_id} {err:#}");
        shared
            .dispatch
            .comm(CommEvent::new(&conn_id, format!("{err:#}").as_bytes(), Direction::Proxy));
    }
}

async fn relay(
    shared: &Shared,
    conn_id: &str,
    socket: TcpStream,
    peer_address: SocketAddr,
) -> anyhow::Result<()> {
    let destination = shared
        .resolver
        .resolve(&socket)
        .context("failed to determine the original destination")?;

    // A connection made straight to the listener resolves to the
    // listener itself
    let local = socket.local_addr()?;
    if destination == local {
        anyhow::bail!("refusing to connect to {destination}: that is this proxy");
    }

    shared.dispatch.comm(CommEvent::new(
        conn_id,
        format!("connecting to {destination}").as_bytes(),
        Direction::Proxy,
    ));

    let outbound = shared
        .dialer
        .connect(destination)
        .await
        .with_context(|| format!("failed to connect to {destination}"))?;
    socket.set_nodelay(true).ok();
    outbound.set_nodelay(true).ok();

    let comm = shared.dispatch.clone();
    let conn = shared.dispatch.clone();
    let hooks = PipeHooks::new(move |event| comm.comm(event), move |event| conn.conn(event))
        .with_filters(shared.filters.clone());

    let mediator = Mediator::new(
        ConnectionInfo {
            conn_id: conn_id.to_string(),
            destination,
            sender_ip: Some(peer_address.ip()),
        },
        shared.pipe_config.clone(),
        hooks,
        shared.connector.clone(),
    );

    // Errors have already been reported by the pipe
    ConnectionPipe::new(Box::new(socket), Box::new(outbound), mediator)
        .run()
        .await
        .ok();
    Ok(())
}

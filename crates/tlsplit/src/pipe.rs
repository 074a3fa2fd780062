//! The per-connection mediation engine.
//!
//! A [`ConnectionPipe`] owns the client connection and the destination
//! connection and runs one copy loop per direction. Every chunk passes
//! through the shared [`Mediator`], which decides what is written where.
//!
//! The STARTTLS upgrade of the destination leg needs both loops: the
//! upstream loop sends `STARTTLS` and then hands its write half of the
//! destination connection over to the downstream loop, which sees the
//! `220` reply, reunites the two halves, runs the TLS handshake and hands
//! the new write half back. The upstream loop holds the client's bytes
//! until then, so nothing reaches the destination mid-handshake.
use crate::address::{domain_of, extract_helo, extract_mail_from, extract_rcpt_to};
use crate::data_phase::{
    AfterOverflow, DataOutcome, DataPhaseBuffer, TerminatorScanner, DATA_TERMINATOR,
    DEFAULT_MESSAGE_SIZE_LIMIT,
};
use crate::filter::{FilterInvoker, FilterOutcome, FilterRequest};
use crate::hook::{CommEvent, ConnEvent, Direction, Elapse, UNKNOWN_ADDRESS};
use crate::response::{
    is_data_command, is_data_phase_entry, is_ehlo_response_with_starttls,
    is_ehlo_response_without_starttls, is_ready_for_starttls, split_first_reply, ReplyFramer,
    TransportState,
};
use crate::starttls::{remove_starttls, STARTTLS_COMMAND};
use crate::tls::server_name_for;
use crate::traits::BoxedAsyncReadAndWrite;
use parking_lot::Mutex;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

pub const SIZE_EXCEEDED_REPLY: &[u8] =
    b"552 5.3.4 Message size exceeds fixed maximum message size\r\n";

const READ_BUFFER_SIZE: usize = 32 * 1024;

type DestinationWriter = WriteHalf<BoxedAsyncReadAndWrite>;

#[derive(Error, Debug)]
pub enum PipeError {
    #[error("failed to {what}: {source}")]
    Io {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out after {duration:?} trying to {what}")]
    TimedOut {
        what: &'static str,
        duration: Duration,
    },
    #[error("STARTTLS upgrade of the destination connection was abandoned")]
    UpgradeAbandoned,
    #[error("destination closed the connection during the STARTTLS upgrade")]
    ClosedDuringUpgrade,
    #[error("filter hook failed: {0}")]
    Filter(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct PipeConfig {
    /// DATA phase buffer cap in bytes
    pub message_size_limit: usize,
    /// Deadline for each individual read or write; `None` waits forever
    pub io_timeout: Option<Duration>,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            message_size_limit: DEFAULT_MESSAGE_SIZE_LIMIT,
            io_timeout: None,
        }
    }
}

pub type CommCallback = Arc<dyn Fn(CommEvent) + Send + Sync>;
pub type ConnCallback = Arc<dyn Fn(ConnEvent) + Send + Sync>;

/// Where the pipe sends its events, and the filters it consults
#[derive(Clone)]
pub struct PipeHooks {
    pub after_comm: CommCallback,
    pub after_conn: ConnCallback,
    pub filters: FilterInvoker,
}

impl PipeHooks {
    pub fn new(
        after_comm: impl Fn(CommEvent) + Send + Sync + 'static,
        after_conn: impl Fn(ConnEvent) + Send + Sync + 'static,
    ) -> Self {
        Self {
            after_comm: Arc::new(after_comm),
            after_conn: Arc::new(after_conn),
            filters: FilterInvoker::default(),
        }
    }

    pub fn with_filters(mut self, filters: FilterInvoker) -> Self {
        self.filters = filters;
        self
    }
}

/// Identity of a connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub conn_id: String,
    /// Where the client was trying to go
    pub destination: SocketAddr,
    /// The client's address
    pub sender_ip: Option<IpAddr>,
}

#[derive(Debug, Default)]
struct Envelope {
    helo: Option<String>,
    mail_from: Option<String>,
    rcpt_to: Option<String>,
    rcpt_domain: Option<String>,
}

#[derive(Debug, Default)]
enum DataState {
    #[default]
    Idle,
    /// The client sent DATA; the destination has not answered yet
    CommandSent,
    /// No filters: the message passes through as it arrives
    Streaming {
        scanner: TerminatorScanner,
        headers_reported: bool,
    },
    /// The message is held for the filters
    Buffering(DataPhaseBuffer),
    /// The message was too large; drop input up to its terminator
    Discarding(TerminatorScanner),
}

#[derive(Debug, Default)]
struct SessionState {
    envelope: Envelope,
    transport: TransportState,
    /// STARTTLS was sent; waiting for the destination's answer
    tls_pending: bool,
    /// The rewritten EHLO response went out; upgrade on the next client write
    ready_for_tls: bool,
    upgrade_attempted: bool,
    data: DataState,
    /// Shown to the client in place of the destination's next reply
    pending_reply: Option<Vec<u8>>,
    connected_at: Option<Instant>,
    data_started_at: Option<Instant>,
}

/// What the upstream loop must do with a chunk from the client
#[derive(Debug, PartialEq, Eq)]
pub enum Upstream {
    Forward(Vec<u8>),
    /// Negotiate STARTTLS with the destination, then write these bytes
    StartTls(Vec<u8>),
    /// Nothing to write
    Hold,
    /// Run the filters, then write what they decide
    Filter(FilterRequest),
}

/// What the downstream loop must do with a reply from the destination
#[derive(Debug, PartialEq, Eq)]
pub enum Downstream {
    Forward(Vec<u8>),
    /// The destination is ready for the TLS handshake
    Upgrade,
    /// The destination refused STARTTLS; carry on in plain text
    DeclinedUpgrade,
}

/// The state shared by the two copy loops of a connection.
///
/// The mediation methods never perform I/O and never hold the state
/// lock across an await point.
pub struct Mediator {
    info: ConnectionInfo,
    config: PipeConfig,
    hooks: PipeHooks,
    connector: TlsConnector,
    state: Mutex<SessionState>,
    closed: AtomicBool,
}

impl Mediator {
    pub fn new(
        info: ConnectionInfo,
        config: PipeConfig,
        hooks: PipeHooks,
        connector: TlsConnector,
    ) -> Self {
        Self {
            info,
            config,
            hooks,
            connector,
            state: Mutex::new(SessionState {
                connected_at: Some(Instant::now()),
                ..SessionState::default()
            }),
            closed: AtomicBool::new(false),
        }
    }

    pub fn conn_id(&self) -> &str {
        &self.info.conn_id
    }

    pub fn emit(&self, direction: Direction, data: impl AsRef<[u8]>) {
        (self.hooks.after_comm)(CommEvent::new(&self.info.conn_id, data.as_ref(), direction));
    }

    fn emit_all(&self, events: Vec<CommEvent>) {
        for event in events {
            (self.hooks.after_comm)(event);
        }
    }

    fn event(&self, direction: Direction, data: impl AsRef<[u8]>) -> CommEvent {
        CommEvent::new(&self.info.conn_id, data.as_ref(), direction)
    }

    /// Decide what to do with a chunk read from the client.
    ///
    /// The second element holds input that must be mediated again once
    /// the action has been carried out: commands pipelined after the end
    /// of a message.
    pub fn mediate_upstream(&self, chunk: Vec<u8>) -> (Upstream, Option<Vec<u8>>) {
        let mut events = vec![];
        let result = {
            let mut state = self.state.lock();
            self.mediate_upstream_locked(&mut state, chunk, &mut events)
        };
        self.emit_all(events);
        result
    }

    fn mediate_upstream_locked(
        &self,
        state: &mut SessionState,
        mut chunk: Vec<u8>,
        events: &mut Vec<CommEvent>,
    ) -> (Upstream, Option<Vec<u8>>) {
        let tls = state.transport.tls;

        match std::mem::take(&mut state.data) {
            DataState::Idle | DataState::CommandSent => {}
            DataState::Buffering(mut buffer) => {
                return match buffer.push(&chunk) {
                    DataOutcome::Continue => {
                        state.data = DataState::Buffering(buffer);
                        (Upstream::Hold, None)
                    }
                    DataOutcome::Complete { message, trailing } => {
                        events.push(self.event(client_direction(tls), header_block(&message)));
                        let request = FilterRequest {
                            conn_id: self.info.conn_id.clone(),
                            mail_from: state.envelope.mail_from.clone(),
                            mail_to: state.envelope.rcpt_to.clone(),
                            helo: state.envelope.helo.clone(),
                            sender_ip: self.info.sender_ip,
                            message,
                        };
                        (Upstream::Filter(request), Some(trailing))
                    }
                    DataOutcome::Overflow(after) => {
                        events.push(self.event(
                            Direction::Proxy,
                            format!(
                                "message exceeds the size limit of {} bytes",
                                self.config.message_size_limit
                            ),
                        ));
                        state.pending_reply = Some(SIZE_EXCEEDED_REPLY.to_vec());
                        let terminator = Upstream::Forward(DATA_TERMINATOR.to_vec());
                        match after {
                            AfterOverflow::Trailing(trailing) => (terminator, Some(trailing)),
                            AfterOverflow::Discard(scanner) => {
                                state.data = DataState::Discarding(scanner);
                                (terminator, None)
                            }
                        }
                    }
                };
            }
            DataState::Discarding(mut scanner) => {
                return match scanner.feed(&chunk) {
                    Some(end) => (Upstream::Hold, Some(chunk.split_off(end))),
                    None => {
                        state.data = DataState::Discarding(scanner);
                        (Upstream::Hold, None)
                    }
                };
            }
            DataState::Streaming {
                mut scanner,
                headers_reported,
            } => {
                let end = scanner.feed(&chunk);
                if !headers_reported {
                    events.push(self.event(client_direction(tls), header_block(&chunk)));
                }
                return match end {
                    Some(end) => {
                        let trailing = chunk.split_off(end);
                        (Upstream::Forward(chunk), Some(trailing))
                    }
                    None => {
                        state.data = DataState::Streaming {
                            scanner,
                            headers_reported: true,
                        };
                        (Upstream::Forward(chunk), None)
                    }
                };
            }
        }

        if !tls || state.envelope.rcpt_to.is_none() {
            self.capture_envelope(&mut state.envelope, &chunk, events);
        }
        if is_data_command(&chunk) {
            state.data = DataState::CommandSent;
        }

        if !tls && state.ready_for_tls {
            state.ready_for_tls = false;
            state.transport.locked = true;
            state.tls_pending = true;
            events.push(self.event(Direction::SrcToPxy, &chunk));
            return (Upstream::StartTls(chunk), None);
        }

        events.push(self.event(client_direction(tls), &chunk));
        (Upstream::Forward(chunk), None)
    }

    fn capture_envelope(&self, envelope: &mut Envelope, chunk: &[u8], events: &mut Vec<CommEvent>) {
        if let Some(helo) = extract_helo(chunk) {
            envelope.helo = Some(String::from_utf8_lossy(helo).to_string());
        }

        if let Some(found) = extract_mail_from(chunk) {
            if found.rfc_violation {
                events.push(self.rfc_violation(found.line));
            }
            envelope.mail_from = Some(String::from_utf8_lossy(found.address).to_string());
        }

        if let Some(found) = extract_rcpt_to(chunk) {
            if found.rfc_violation {
                events.push(self.rfc_violation(found.line));
            }
            let rcpt_to = String::from_utf8_lossy(found.address).to_string();
            envelope.rcpt_domain = domain_of(&rcpt_to).map(str::to_string);
            envelope.rcpt_to = Some(rcpt_to);
        }
    }

    fn rfc_violation(&self, line: &[u8]) -> CommEvent {
        self.event(
            Direction::Proxy,
            format!(
                "RFC 5321 violation: whitespace in path argument: {}",
                String::from_utf8_lossy(line)
            ),
        )
    }

    /// Decide what to do with a framed reply read from the destination
    pub fn mediate_downstream(&self, frame: Vec<u8>) -> Downstream {
        let mut events = vec![];
        let result = {
            let mut state = self.state.lock();
            self.mediate_downstream_locked(&mut state, frame, &mut events)
        };
        self.emit_all(events);
        result
    }

    fn mediate_downstream_locked(
        &self,
        state: &mut SessionState,
        frame: Vec<u8>,
        events: &mut Vec<CommEvent>,
    ) -> Downstream {
        if state.tls_pending {
            events.push(self.event(Direction::DstToPxy, &frame));
            if is_ready_for_starttls(&frame, state.transport) {
                return Downstream::Upgrade;
            }
            state.tls_pending = false;
            state.transport.locked = false;
            events.push(self.event(
                Direction::Proxy,
                "destination refused STARTTLS, continuing in plain text",
            ));
            return Downstream::DeclinedUpgrade;
        }

        if is_ehlo_response_with_starttls(&frame, state.transport) {
            events.push(self.event(Direction::DstToPxy, &frame));
            let (rewritten, outcome) = remove_starttls(frame);
            if !outcome.removed() {
                events.push(self.event(
                    Direction::Proxy,
                    "failed to remove STARTTLS from the EHLO response",
                ));
            } else if !state.upgrade_attempted {
                state.ready_for_tls = true;
                state.upgrade_attempted = true;
            }
            events.push(self.event(Direction::PxyToSrc, &rewritten));
            return Downstream::Forward(rewritten);
        }

        // A plain EHLO response goes to the client as the destination
        // sent it
        let direction = if is_ehlo_response_without_starttls(&frame, state.transport) {
            tracing::debug!("{} destination does not offer STARTTLS", self.info.conn_id);
            Direction::DstToSrc
        } else {
            server_direction(state.transport.tls)
        };

        if is_data_phase_entry(&frame) {
            state.data_started_at.get_or_insert_with(Instant::now);
            if matches!(state.data, DataState::CommandSent) {
                state.data = if self.hooks.filters.is_empty() {
                    DataState::Streaming {
                        scanner: TerminatorScanner::default(),
                        headers_reported: false,
                    }
                } else {
                    DataState::Buffering(DataPhaseBuffer::new(self.config.message_size_limit))
                };
            }
        }

        events.push(self.event(direction, &frame));

        if let Some(mut reply) = state.pending_reply.take() {
            if let Some((_, rest)) = split_first_reply(&frame) {
                reply.extend_from_slice(rest);
            }
            events.push(self.event(Direction::PxyToSrc, &reply));
            return Downstream::Forward(reply);
        }

        Downstream::Forward(frame)
    }

    /// Record the effect of the filters and return the bytes for the
    /// destination.
    pub fn apply_filter_outcome(&self, outcome: FilterOutcome) -> Vec<u8> {
        if let Some(reply) = outcome.substitute_reply {
            self.emit(
                Direction::Proxy,
                format!(
                    "message rejected by filter: {}",
                    String::from_utf8_lossy(&reply).trim_end()
                ),
            );
            self.state.lock().pending_reply = Some(reply);
        }
        outcome.to_destination
    }

    /// SNI name and EHLO hostname for the upgraded connection
    fn upgrade_parameters(&self) -> (ServerName<'static>, String) {
        let state = self.state.lock();
        let server_name = server_name_for(
            state.envelope.rcpt_domain.as_deref(),
            self.info.destination.ip(),
        );
        let helo = state
            .envelope
            .helo
            .clone()
            .unwrap_or_else(|| "localhost".to_string());
        (server_name, helo)
    }

    fn complete_upgrade(&self) {
        let mut state = self.state.lock();
        state.transport.tls = true;
        state.transport.locked = false;
        state.tls_pending = false;
    }

    pub fn tls_active(&self) -> bool {
        self.state.lock().transport.tls
    }

    /// Run the TLS handshake on the destination connection and greet the
    /// server again over TLS.
    async fn upgrade(
        &self,
        stream: BoxedAsyncReadAndWrite,
    ) -> Result<BoxedAsyncReadAndWrite, PipeError> {
        let (server_name, helo) = self.upgrade_parameters();
        tracing::debug!(
            "{} starting TLS with {} as {server_name:?}",
            self.info.conn_id,
            self.info.destination
        );

        let mut stream = self
            .with_deadline(
                "complete the TLS handshake with the destination",
                self.connector.connect(server_name, stream),
            )
            .await?;

        let ehlo = format!("EHLO {helo}\r\n");
        self.with_deadline("send EHLO to the destination", stream.write_all(ehlo.as_bytes()))
            .await?;
        self.emit(Direction::PxyToDst, &ehlo);

        let mut framer = ReplyFramer::default();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let reply = loop {
            let size = self
                .with_deadline("read the EHLO reply from the destination", stream.read(&mut buf))
                .await?;
            if size == 0 {
                return Err(PipeError::ClosedDuringUpgrade);
            }
            if let Some(reply) = framer.push(&buf[0..size]) {
                break reply;
            }
        };
        self.emit(Direction::DstToPxy, &reply);

        self.complete_upgrade();
        Ok(Box::new(stream))
    }

    async fn with_deadline<T>(
        &self,
        what: &'static str,
        fut: impl Future<Output = std::io::Result<T>>,
    ) -> Result<T, PipeError> {
        let result = match self.config.io_timeout {
            Some(duration) => tokio::time::timeout(duration, fut)
                .await
                .map_err(|_| PipeError::TimedOut { what, duration })?,
            None => fut.await,
        };
        result.map_err(|source| PipeError::Io { what, source })
    }

    /// Emit the connection summary. Only the first call has any effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let event = {
            let state = self.state.lock();
            ConnEvent {
                conn_id: self.info.conn_id.clone(),
                occurred_at: chrono::Utc::now(),
                mail_from: state
                    .envelope
                    .mail_from
                    .clone()
                    .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string()),
                mail_to: state
                    .envelope
                    .rcpt_to
                    .clone()
                    .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string()),
                elapse: Elapse::between(state.connected_at, state.data_started_at),
            }
        };
        (self.hooks.after_conn)(event);
    }
}

fn client_direction(tls: bool) -> Direction {
    if tls {
        Direction::SrcToPxy
    } else {
        Direction::SrcToDst
    }
}

fn server_direction(tls: bool) -> Direction {
    if tls {
        Direction::DstToPxy
    } else {
        Direction::DstToSrc
    }
}

/// The part of a message chunk before its first blank line
fn header_block(chunk: &[u8]) -> &[u8] {
    match memchr::memmem::find(chunk, b"\r\n\r\n") {
        Some(idx) => &chunk[..idx + 2],
        None => chunk,
    }
}

/// A client connection joined to its destination connection
pub struct ConnectionPipe {
    source: BoxedAsyncReadAndWrite,
    destination: BoxedAsyncReadAndWrite,
    mediator: Mediator,
}

impl ConnectionPipe {
    pub fn new(
        source: BoxedAsyncReadAndWrite,
        destination: BoxedAsyncReadAndWrite,
        mediator: Mediator,
    ) -> Self {
        Self {
            source,
            destination,
            mediator,
        }
    }

    /// Relay traffic until either side closes or fails, then close both
    /// connections and emit the connection summary.
    pub async fn run(self) -> Result<(), PipeError> {
        let Self {
            source,
            destination,
            mediator,
        } = self;

        let (source_reader, source_writer) = tokio::io::split(source);
        let (destination_reader, destination_writer) = tokio::io::split(destination);
        let (handoff_tx, handoff_rx) = oneshot::channel();
        let (resume_tx, resume_rx) = oneshot::channel();

        // Whichever loop finishes first ends the connection. Dropping the
        // other loop releases its halves, and with them both sockets.
        let result = tokio::select! {
            result = upstream(&mediator, source_reader, destination_writer, handoff_tx, resume_rx) => result,
            result = downstream(&mediator, destination_reader, source_writer, handoff_rx, resume_tx) => result,
        };

        if let Err(err) = &result {
            tracing::debug!("{} {err:#}", mediator.conn_id());
            mediator.emit(Direction::Proxy, format!("{err}"));
        }
        mediator.close();
        result
    }
}

async fn write_all<W: AsyncWrite + Unpin>(
    mediator: &Mediator,
    writer: &mut W,
    what: &'static str,
    bytes: &[u8],
) -> Result<(), PipeError> {
    mediator.with_deadline(what, writer.write_all(bytes)).await
}

/// Client to destination
async fn upstream(
    mediator: &Mediator,
    mut source: ReadHalf<BoxedAsyncReadAndWrite>,
    mut destination: DestinationWriter,
    handoff: oneshot::Sender<DestinationWriter>,
    resume: oneshot::Receiver<DestinationWriter>,
) -> Result<(), PipeError> {
    let mut upgrade_channel = Some((handoff, resume));
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let size = mediator
            .with_deadline("read from the client", source.read(&mut buf))
            .await?;
        if size == 0 {
            // The client is done; ending this loop ends the connection
            destination.shutdown().await.ok();
            return Ok(());
        }

        let mut pending = Some(buf[0..size].to_vec());
        while let Some(chunk) = pending.take() {
            let (action, remainder) = mediator.mediate_upstream(chunk);
            match action {
                Upstream::Forward(bytes) => {
                    write_all(mediator, &mut destination, "write to the destination", &bytes)
                        .await?;
                }
                Upstream::Hold => {}
                Upstream::StartTls(held) => {
                    write_all(
                        mediator,
                        &mut destination,
                        "send STARTTLS to the destination",
                        STARTTLS_COMMAND,
                    )
                    .await?;
                    mediator.emit(Direction::PxyToDst, STARTTLS_COMMAND);

                    let (handoff, resume) =
                        upgrade_channel.take().ok_or(PipeError::UpgradeAbandoned)?;
                    handoff
                        .send(destination)
                        .map_err(|_| PipeError::UpgradeAbandoned)?;
                    destination = resume.await.map_err(|_| PipeError::UpgradeAbandoned)?;

                    write_all(mediator, &mut destination, "write to the destination", &held)
                        .await?;
                    mediator.emit(Direction::PxyToDst, &held);
                }
                Upstream::Filter(request) => {
                    let outcome = mediator.hooks.filters.invoke(request).await?;
                    let bytes = mediator.apply_filter_outcome(outcome);
                    write_all(mediator, &mut destination, "write to the destination", &bytes)
                        .await?;
                }
            }
            pending = remainder.filter(|rest| !rest.is_empty());
        }
    }
}

/// Destination to client
async fn downstream(
    mediator: &Mediator,
    mut destination: ReadHalf<BoxedAsyncReadAndWrite>,
    mut client: WriteHalf<BoxedAsyncReadAndWrite>,
    handoff: oneshot::Receiver<DestinationWriter>,
    resume: oneshot::Sender<DestinationWriter>,
) -> Result<(), PipeError> {
    let mut upgrade_channel = Some((handoff, resume));
    let mut framer = ReplyFramer::default();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let size = mediator
            .with_deadline("read from the destination", destination.read(&mut buf))
            .await?;
        if size == 0 {
            if let Some(partial) = framer.drain() {
                write_all(mediator, &mut client, "write to the client", &partial).await?;
            }
            client.shutdown().await.ok();
            return Ok(());
        }

        let Some(frame) = framer.push(&buf[0..size]) else {
            continue;
        };

        match mediator.mediate_downstream(frame) {
            Downstream::Forward(bytes) => {
                write_all(mediator, &mut client, "write to the client", &bytes).await?;
            }
            Downstream::Upgrade => {
                let (handoff, resume) = upgrade_channel.take().ok_or(PipeError::UpgradeAbandoned)?;
                let writer = handoff.await.map_err(|_| PipeError::UpgradeAbandoned)?;
                let stream = mediator.upgrade(destination.unsplit(writer)).await?;
                let (reader, writer) = tokio::io::split(stream);
                destination = reader;
                resume
                    .send(writer)
                    .map_err(|_| PipeError::UpgradeAbandoned)?;
            }
            Downstream::DeclinedUpgrade => {
                let (handoff, resume) = upgrade_channel.take().ok_or(PipeError::UpgradeAbandoned)?;
                let writer = handoff.await.map_err(|_| PipeError::UpgradeAbandoned)?;
                resume
                    .send(writer)
                    .map_err(|_| PipeError::UpgradeAbandoned)?;
            }
        }
    }
}

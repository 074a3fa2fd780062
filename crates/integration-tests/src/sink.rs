//! A small SMTP server that accepts everything and records what it was
//! sent, optionally offering STARTTLS with a self-signed certificate.
use anyhow::Context;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tlsplit::BoxedAsyncReadAndWrite;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::rustls::crypto::aws_lc_rs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

pub const HOSTNAME: &str = "sink.example.com";

/// A command line as the sink received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub line: String,
    pub tls: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    /// The message as received, without the terminating `.` line
    pub data: Vec<u8>,
    pub tls: bool,
}

#[derive(Default, Debug)]
struct Recorded {
    commands: Vec<Command>,
    deliveries: Vec<Delivery>,
}

pub struct SmtpSink {
    pub addr: SocketAddr,
    recorded: Arc<Mutex<Recorded>>,
    task: JoinHandle<()>,
}

impl Drop for SmtpSink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Next {
    Quit,
    StartTls(BoxedAsyncReadAndWrite),
}

impl SmtpSink {
    pub async fn start(offer_starttls: bool) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let acceptor = if offer_starttls {
            Some(make_acceptor()?)
        } else {
            None
        };
        let recorded = Arc::new(Mutex::new(Recorded::default()));

        let task = tokio::spawn({
            let recorded = Arc::clone(&recorded);
            async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let recorded = Arc::clone(&recorded);
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve(Box::new(socket), acceptor, recorded).await {
                            eprintln!("sink session: {err:#}");
                        }
                    });
                }
            }
        });

        Ok(Self {
            addr,
            recorded,
            task,
        })
    }

    pub fn commands(&self) -> Vec<Command> {
        self.recorded.lock().commands.clone()
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.recorded.lock().deliveries.clone()
    }

    pub async fn wait_for_deliveries(&self, count: usize) -> Vec<Delivery> {
        for _ in 0..500 {
            let deliveries = self.deliveries();
            if deliveries.len() >= count {
                return deliveries;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sink did not receive {count} deliveries");
    }
}

fn make_acceptor() -> anyhow::Result<TlsAcceptor> {
    let key = rcgen::generate_simple_self_signed(vec![HOSTNAME.to_string()])?;
    let certificates = vec![CertificateDer::from_slice(key.cert.der()).into_owned()];
    let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.key_pair.serialize_der()));

    let config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn serve(
    mut stream: BoxedAsyncReadAndWrite,
    acceptor: Option<TlsAcceptor>,
    recorded: Arc<Mutex<Recorded>>,
) -> anyhow::Result<()> {
    stream
        .write_all(format!("220 {HOSTNAME} ESMTP ready\r\n").as_bytes())
        .await?;

    match session(stream, acceptor.is_some(), false, &recorded).await? {
        Next::Quit => Ok(()),
        Next::StartTls(stream) => {
            let acceptor = acceptor.context("STARTTLS without an acceptor")?;
            let stream = acceptor.accept(stream).await.context("TLS accept")?;
            match session(Box::new(stream), false, true, &recorded).await? {
                Next::Quit => Ok(()),
                Next::StartTls(_) => anyhow::bail!("STARTTLS requested twice"),
            }
        }
    }
}

async fn session(
    stream: BoxedAsyncReadAndWrite,
    offer_starttls: bool,
    tls: bool,
    recorded: &Mutex<Recorded>,
) -> anyhow::Result<Next> {
    let mut stream = BufReader::new(stream);
    let mut mail_from = String::new();
    let mut rcpt_to = vec![];
    let mut line = vec![];

    loop {
        line.clear();
        if stream.read_until(b'\n', &mut line).await? == 0 {
            return Ok(Next::Quit);
        }
        let command = String::from_utf8_lossy(&line).trim_end().to_string();
        recorded.lock().commands.push(Command {
            line: command.clone(),
            tls,
        });
        let verb = command
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();

        let reply = match verb.as_str() {
            "EHLO" => {
                let mut reply = format!("250-{HOSTNAME}\r\n250-PIPELINING\r\n");
                if offer_starttls {
                    reply.push_str("250-STARTTLS\r\n");
                }
                reply.push_str("250 8BITMIME\r\n");
                reply
            }
            "HELO" => format!("250 {HOSTNAME}\r\n"),
            "STARTTLS" if offer_starttls => {
                stream
                    .get_mut()
                    .write_all(b"220 2.0.0 Ready to start TLS\r\n")
                    .await?;
                anyhow::ensure!(
                    stream.buffer().is_empty(),
                    "client sent data before the TLS handshake"
                );
                return Ok(Next::StartTls(stream.into_inner()));
            }
            "STARTTLS" => "454 4.7.0 TLS not available\r\n".to_string(),
            "MAIL" => {
                mail_from = path_of(&command);
                rcpt_to.clear();
                "250 2.1.0 Ok\r\n".to_string()
            }
            "RCPT" => {
                rcpt_to.push(path_of(&command));
                "250 2.1.5 Ok\r\n".to_string()
            }
            "DATA" => {
                stream
                    .get_mut()
                    .write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n")
                    .await?;
                let data = read_message(&mut stream).await?;
                recorded.lock().deliveries.push(Delivery {
                    mail_from: mail_from.clone(),
                    rcpt_to: rcpt_to.clone(),
                    data,
                    tls,
                });
                "250 2.0.0 Ok: queued\r\n".to_string()
            }
            "RSET" | "NOOP" => "250 2.0.0 Ok\r\n".to_string(),
            "QUIT" => {
                stream.get_mut().write_all(b"221 2.0.0 Bye\r\n").await?;
                return Ok(Next::Quit);
            }
            _ => "502 5.5.2 Command not recognized\r\n".to_string(),
        };
        stream.get_mut().write_all(reply.as_bytes()).await?;
    }
}

async fn read_message<R: AsyncBufRead + Unpin>(
    stream: &mut R,
) -> anyhow::Result<Vec<u8>> {
    let mut data = vec![];
    let mut line = vec![];
    loop {
        line.clear();
        if stream.read_until(b'\n', &mut line).await? == 0 {
            anyhow::bail!("connection closed during DATA");
        }
        if line == b".\r\n" {
            return Ok(data);
        }
        data.extend_from_slice(&line);
    }
}

/// The address between the angle brackets of MAIL FROM or RCPT TO
fn path_of(command: &str) -> String {
    match (command.find('<'), command.find('>')) {
        (Some(start), Some(end)) if start < end => command[start + 1..end].to_string(),
        _ => String::new(),
    }
}

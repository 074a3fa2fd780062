//! Runs a proxy in-process in front of a sink, and a line oriented
//! SMTP client to talk to it.
use anyhow::Context;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tlsplit::{
    CommEvent, ConnEvent, FixedDestination, Hook, RegisteredHook, Server, ServerConfig,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Keeps every event the proxy produced
#[derive(Default)]
pub struct Recorder {
    comm: Mutex<Vec<CommEvent>>,
    conn: Mutex<Vec<ConnEvent>>,
}

impl Hook for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn after_comm(&self, event: &CommEvent) {
        self.comm.lock().push(event.clone());
    }

    fn after_conn(&self, event: &ConnEvent) {
        self.conn.lock().push(event.clone());
    }
}

impl Recorder {
    pub fn comm_events(&self) -> Vec<CommEvent> {
        self.comm.lock().clone()
    }

    /// Wait for the summary of a closed connection
    pub async fn wait_for_conn(&self) -> ConnEvent {
        for _ in 0..500 {
            if let Some(event) = self.conn.lock().first() {
                return event.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no connection summary was emitted");
    }
}

pub struct ProxyUnderTest {
    pub addr: SocketAddr,
    pub recorder: Arc<Recorder>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Drop for ProxyUnderTest {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl ProxyUnderTest {
    /// Start a proxy that sends every connection to `destination`.
    /// A recorder is registered ahead of `hooks`.
    pub async fn start(
        destination: SocketAddr,
        hooks: Vec<RegisteredHook>,
        configure: impl FnOnce(&mut ServerConfig),
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let mut config = ServerConfig::new(addr);
        config.io_timeout = Some(Duration::from_secs(10));
        configure(&mut config);

        let recorder = Arc::new(Recorder::default());
        let mut all_hooks = vec![RegisteredHook::Observer(recorder.clone())];
        all_hooks.extend(hooks);

        let server = Server::new(config, all_hooks)
            .with_resolver(Arc::new(FixedDestination(destination)));
        let task = tokio::spawn(server.serve(listener));

        Ok(Self {
            addr,
            recorder,
            task,
        })
    }

    pub async fn connect(&self) -> anyhow::Result<SmtpClient> {
        SmtpClient::connect(self.addr).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

pub struct SmtpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl SmtpClient {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect to {addr}"))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Read one complete, possibly multi-line, reply
    pub async fn read_reply(&mut self) -> anyhow::Result<Reply> {
        let mut lines = vec![];
        loop {
            let mut line = String::new();
            let size = tokio::time::timeout(
                Duration::from_secs(10),
                self.reader.read_line(&mut line),
            )
            .await
            .context("timed out reading a reply")??;
            anyhow::ensure!(size > 0, "connection closed; got {lines:?} so far");
            let line = line.trim_end().to_string();
            anyhow::ensure!(line.len() >= 3, "short reply line {line:?}");
            let last = line.as_bytes().get(3) != Some(&b'-');
            lines.push(line);
            if last {
                break;
            }
        }
        let code = lines[0][0..3]
            .parse()
            .with_context(|| format!("bad reply code in {lines:?}"))?;
        Ok(Reply { code, lines })
    }

    pub async fn command(&mut self, command: &str) -> anyhow::Result<Reply> {
        self.writer
            .write_all(format!("{command}\r\n").as_bytes())
            .await?;
        self.read_reply().await
    }

    /// Send a message after a 354; `content` must end with CRLF
    pub async fn send_content(&mut self, content: &[u8]) -> anyhow::Result<Reply> {
        let mut bytes = content.to_vec();
        bytes.extend_from_slice(b".\r\n");
        self.writer.write_all(&bytes).await?;
        self.read_reply().await
    }

    /// Run a whole transaction, stopping at the first unexpected reply
    pub async fn send_mail(
        &mut self,
        mail_from: &str,
        rcpt_to: &str,
        content: &[u8],
    ) -> anyhow::Result<Reply> {
        let reply = self.command(&format!("MAIL FROM:<{mail_from}>")).await?;
        anyhow::ensure!(reply.code == 250, "MAIL FROM: {reply:?}");
        let reply = self.command(&format!("RCPT TO:<{rcpt_to}>")).await?;
        anyhow::ensure!(reply.code == 250, "RCPT TO: {reply:?}");
        let reply = self.command("DATA").await?;
        anyhow::ensure!(reply.code == 354, "DATA: {reply:?}");
        self.send_content(content).await
    }
}

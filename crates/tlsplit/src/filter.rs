//! Running filter hooks over a buffered message and turning their
//! decisions into bytes for each side of the connection.
use crate::data_phase::DATA_TERMINATOR;
use crate::hook::FilterHook;
use std::net::IpAddr;
use std::sync::Arc;

const DEFAULT_REJECT_REPLY: &str = "550 5.7.1 Message rejected";

/// Everything a filter gets to see about a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRequest {
    pub conn_id: String,
    pub mail_from: Option<String>,
    pub mail_to: Option<String>,
    pub helo: Option<String>,
    pub sender_ip: Option<IpAddr>,
    /// Headers and body, dot-stuffed as received, without the terminator
    pub message: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    /// Pass the message on unchanged
    Relay,
    /// Refuse the message; `reply` is the single line SMTP reply shown
    /// to the client, e.g. `550 5.7.1 Spam detected`.
    Reject { reply: String },
    /// Pass on `message` instead. It must be dot-stuffed and must not
    /// contain the terminator.
    AddHeader { message: Vec<u8> },
}

/// The effect of filtering on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterOutcome {
    /// Bytes to send to the destination, terminator included
    pub to_destination: Vec<u8>,
    /// A reply to show the client in place of the destination's
    /// acknowledgement of the message.
    pub substitute_reply: Option<Vec<u8>>,
}

/// The filter hooks of a server, run in registration order
#[derive(Clone, Default)]
pub struct FilterInvoker {
    filters: Vec<Arc<dyn FilterHook>>,
}

impl FilterInvoker {
    pub fn new(filters: Vec<Arc<dyn FilterHook>>) -> Self {
        Self { filters }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run the chain on a blocking thread.
    ///
    /// A message replaced by `AddHeader` is what later filters see; the
    /// first `Reject` ends the chain.
    pub async fn invoke(
        &self,
        request: FilterRequest,
    ) -> Result<FilterOutcome, tokio::task::JoinError> {
        let filters = self.filters.clone();
        tokio::task::spawn_blocking(move || run_chain(&filters, request)).await
    }
}

impl std::fmt::Debug for FilterInvoker {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_list()
            .entries(self.filters.iter().map(|filter| filter.name()))
            .finish()
    }
}

fn run_chain(filters: &[Arc<dyn FilterHook>], mut request: FilterRequest) -> FilterOutcome {
    for filter in filters {
        match filter.before_relay(&request) {
            FilterDecision::Relay => {}
            FilterDecision::AddHeader { message } => {
                tracing::debug!(
                    "{} {} replaced the message ({} -> {} bytes)",
                    request.conn_id,
                    filter.name(),
                    request.message.len(),
                    message.len()
                );
                request.message = message;
            }
            FilterDecision::Reject { reply } => {
                tracing::debug!("{} {} rejected the message", request.conn_id, filter.name());
                return FilterOutcome {
                    to_destination: DATA_TERMINATOR.to_vec(),
                    substitute_reply: Some(sanitize_reply(&reply)),
                };
            }
        }
    }

    let mut to_destination = request.message;
    to_destination.extend_from_slice(DATA_TERMINATOR);
    FilterOutcome {
        to_destination,
        substitute_reply: None,
    }
}

/// Strip any CR or LF from a filter supplied reply and terminate it
/// with a single CRLF.
pub fn sanitize_reply(reply: &str) -> Vec<u8> {
    let line: String = reply.chars().filter(|c| *c != '\r' && *c != '\n').collect();
    let line = line.trim();
    let line = if line.is_empty() {
        DEFAULT_REJECT_REPLY
    } else {
        line
    };
    format!("{line}\r\n").into_bytes()
}

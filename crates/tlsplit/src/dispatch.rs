//! Fan-out of events to the registered hooks.
//!
//! Connections hand their events to a channel and carry on; a dedicated
//! thread drains it and calls each hook in registration order, so the
//! relative order of events is preserved for every hook.
use crate::hook::{CommEvent, ConnEvent, RegisteredHook};
use flume::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Debug)]
pub enum HookCommand {
    Comm(CommEvent),
    Conn(ConnEvent),
    Terminate,
}

pub struct HookDispatcher {
    sender: Sender<HookCommand>,
    thread: Option<JoinHandle<()>>,
}

impl HookDispatcher {
    pub fn start(hooks: Arc<Vec<RegisteredHook>>, verbose: bool) -> std::io::Result<Self> {
        let (sender, receiver) = flume::unbounded();
        let thread = std::thread::Builder::new()
            .name("hook-dispatch".to_string())
            .spawn(move || dispatch_thread(&hooks, &receiver, verbose))?;
        Ok(Self {
            sender,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> DispatchHandle {
        DispatchHandle {
            sender: self.sender.clone(),
        }
    }

    /// Deliver everything queued so far, then stop the thread
    pub fn terminate(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.sender.send(HookCommand::Terminate).ok();
            if thread.join().is_err() {
                tracing::error!("hook dispatch thread panicked");
            }
        }
    }
}

impl Drop for HookDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A cheap handle for submitting events from connection tasks
#[derive(Clone, Debug)]
pub struct DispatchHandle {
    sender: Sender<HookCommand>,
}

impl DispatchHandle {
    pub fn comm(&self, event: CommEvent) {
        if self.sender.send(HookCommand::Comm(event)).is_err() {
            tracing::trace!("hook dispatcher has stopped; dropping comm event");
        }
    }

    pub fn conn(&self, event: ConnEvent) {
        if self.sender.send(HookCommand::Conn(event)).is_err() {
            tracing::trace!("hook dispatcher has stopped; dropping conn event");
        }
    }
}

fn dispatch_thread(hooks: &[RegisteredHook], receiver: &Receiver<HookCommand>, verbose: bool) {
    loop {
        let cmd = match receiver.recv() {
            Ok(cmd) => cmd,
            other => {
                tracing::debug!("hook channel closed {other:?}");
                return;
            }
        };
        match cmd {
            HookCommand::Terminate => {
                tracing::debug!("HookCommand::Terminate received. Stopping dispatch");
                return;
            }
            HookCommand::Comm(event) => {
                if verbose {
                    tracing::info!("{} {} {}", event.conn_id, event.direction, event.data);
                }
                for hook in hooks {
                    hook.after_comm(&event);
                }
            }
            HookCommand::Conn(event) => {
                if verbose {
                    tracing::info!(
                        "{} from:{} to:{} elapse:{}",
                        event.conn_id,
                        event.mail_from,
                        event.mail_to,
                        event.elapse
                    );
                }
                for hook in hooks {
                    hook.after_conn(&event);
                }
            }
        }
    }
}

//! TCP front-end of the daemon.
//!
//! Like the cache server, each connection has a reader loop handling commands
//! in order and a writer task. Subscribed connections additionally get a
//! forwarding task copying session events to the writer.

use super::auth::{AuthMethod, Authenticator, User};
use super::protocol::{Command, Event};
use super::session::DaemonSession;
use crate::error::{AppResult, IcsError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct DaemonServer {
    session: Arc<DaemonSession>,
    auth: Arc<Authenticator>,
    listener: TcpListener,
    shutdown: CancellationToken,
    connections: AtomicU64,
}

impl DaemonServer {
    pub async fn bind(address: &str, session: Arc<DaemonSession>, auth: Authenticator) -> AppResult<Self> {
        let listener = TcpListener::bind(address).await?;
        info!(address = %listener.local_addr()?, "daemon listening");
        Ok(Self {
            session,
            auth: Arc::new(auth),
            listener,
            shutdown: CancellationToken::new(),
            connections: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept clients until shut down.
    pub async fn run(self) -> AppResult<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("daemon server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let number = self.connections.fetch_add(1, Ordering::Relaxed);
                            let client = Client {
                                session: Arc::clone(&self.session),
                                auth: Arc::clone(&self.auth),
                                user: None,
                                forwarder: None,
                                number,
                            };
                            let shutdown = self.shutdown.child_token();
                            tokio::spawn(client.serve(stream, peer, shutdown));
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    }
                }
            }
        }
    }
}

struct Client {
    session: Arc<DaemonSession>,
    auth: Arc<Authenticator>,
    user: Option<User>,
    forwarder: Option<JoinHandle<()>>,
    number: u64,
}

impl Client {
    async fn serve(mut self, stream: TcpStream, peer: SocketAddr, shutdown: CancellationToken) {
        debug!(connection = self.number, %peer, "daemon client connected");
        if self.auth.method() == AuthMethod::None {
            self.user = self.auth.authenticate("", "").ok();
        }
        let (read_half, write_half) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            let mut writer = BufWriter::new(write_half);
            while let Some(line) = out_rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err()
                    || writer.write_all(b"\n").await.is_err()
                    || writer.flush().await.is_err()
                {
                    break;
                }
            }
        });

        let mut lines = BufReader::new(read_half).lines();
        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    debug!(connection = self.number, error = %err, "read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let (reply, quit) = match Command::decode(&line) {
                Ok(command) => {
                    let quit = command == Command::Quit;
                    (self.handle(command, &out_tx), quit)
                }
                Err(err) => (Event::error("unknown", &err), false),
            };
            if send(&out_tx, &reply).is_err() || quit {
                break;
            }
        }

        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        drop(out_tx);
        let _ = writer.await;
        debug!(connection = self.number, "daemon client disconnected");
    }

    fn user(&self) -> AppResult<&User> {
        self.user
            .as_ref()
            .ok_or_else(|| IcsError::Authentication("not logged in".into()))
    }

    fn handle(&mut self, command: Command, out: &mpsc::UnboundedSender<String>) -> Event {
        let name = command.name();
        match self.dispatch(command, out) {
            Ok(reply) => reply,
            Err(err) => {
                debug!(connection = self.number, command = name, error = %err, "command failed");
                Event::error(name, &err)
            }
        }
    }

    fn dispatch(&mut self, command: Command, out: &mpsc::UnboundedSender<String>) -> AppResult<Event> {
        let name = command.name();
        match command {
            Command::Authenticate { user, password } => {
                let user = self.auth.authenticate(&user, &password)?;
                info!(connection = self.number, user = %user.name, level = %user.level, "client logged in");
                let message = format!("logged in as {} ({})", user.name, user.level);
                self.user = Some(user);
                Ok(Event::ok(name, message))
            }
            Command::Run { code, name: script } => {
                let id = self.session.submit(self.user()?, code, script)?;
                Ok(with_id(Event::ok(name, "queued"), id))
            }
            Command::Simulate { code, devices } => {
                let id = self.session.simulate(self.user()?, code, devices)?;
                Ok(with_id(Event::ok(name, "simulating"), id))
            }
            Command::Stop { id } => {
                self.session.stop(self.user()?, id)?;
                Ok(Event::ok(name, "stop requested"))
            }
            Command::Pause => {
                self.session.pause(self.user()?)?;
                Ok(Event::ok(name, "paused"))
            }
            Command::Resume => {
                self.session.resume(self.user()?)?;
                Ok(Event::ok(name, "resumed"))
            }
            Command::SetMode { mode } => {
                self.session.set_mode(self.user()?, mode)?;
                Ok(Event::ok(name, format!("mode is now {}", mode)))
            }
            Command::Subscribe => {
                self.user()?;
                if self.forwarder.is_none() {
                    self.forwarder = Some(tokio::spawn(forward(
                        self.session.subscribe(),
                        out.clone(),
                        self.number,
                    )));
                }
                Ok(Event::ok(name, "subscribed"))
            }
            Command::Unsubscribe => {
                if let Some(forwarder) = self.forwarder.take() {
                    forwarder.abort();
                }
                Ok(Event::ok(name, "unsubscribed"))
            }
            Command::GetStatus => Ok(self.session.status_event()),
            Command::Help { topic } => Ok(self.session.help(topic.as_deref())),
            Command::Quit => Ok(Event::ok(name, "bye")),
        }
    }
}

fn with_id(event: Event, new_id: u64) -> Event {
    match event {
        Event::Reply {
            command,
            ok,
            message,
            ..
        } => Event::Reply {
            command,
            ok,
            message,
            id: Some(new_id),
        },
        other => other,
    }
}

fn send(out: &mpsc::UnboundedSender<String>, event: &Event) -> AppResult<()> {
    let line = event.encode()?;
    out.send(line)
        .map_err(|_| IcsError::Protocol("connection closed".into()))
}

async fn forward(mut events: broadcast::Receiver<Event>, out: mpsc::UnboundedSender<String>, number: u64) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if send(&out, &event).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(connection = number, skipped, "client too slow, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_id_sets_reply_id() {
        let event = with_id(Event::ok("run", "queued"), 7);
        assert!(matches!(event, Event::Reply { id: Some(7), .. }));
    }
}

//! TCP server exposing a [`CacheStore`] over the line protocol.
//!
//! Each connection gets a reader loop answering requests in order and a writer
//! task that also carries `upd` pushes for the connection's subscriptions.
//! Locks taken through a connection are released when it closes.

use super::wire::{self, Request, Response};
use super::{split_client_id, CacheStore, LockAttempt};
use crate::error::AppResult;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct CacheServer {
    store: Arc<CacheStore>,
    listener: TcpListener,
    shutdown: CancellationToken,
    connections: AtomicU64,
}

impl CacheServer {
    pub async fn bind(address: &str, store: Arc<CacheStore>) -> AppResult<Self> {
        let listener = TcpListener::bind(address).await?;
        info!(address = %listener.local_addr()?, "cache server listening");
        Ok(Self {
            store,
            listener,
            shutdown: CancellationToken::new(),
            connections: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Token that stops [`run`](Self::run) and all connection tasks.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Accept connections until shut down.
    pub async fn run(self) -> AppResult<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("cache server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let number = self.connections.fetch_add(1, Ordering::Relaxed);
                            let store = Arc::clone(&self.store);
                            let shutdown = self.shutdown.child_token();
                            tokio::spawn(async move {
                                handle_connection(stream, peer, store, shutdown, number).await;
                            });
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    store: Arc<CacheStore>,
    shutdown: CancellationToken,
    number: u64,
) {
    debug!(connection = number, %peer, "cache client connected");
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

    let subscriptions: Arc<Mutex<HashSet<String>>> = Arc::default();
    let mut updates = store.listen();
    let pusher = {
        let subscriptions = Arc::clone(&subscriptions);
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(entry) = updates.recv().await {
                if subscriptions.lock().contains(&entry.key)
                    && out_tx.send(wire::update_line(&entry)).is_err()
                {
                    break;
                }
            }
        })
    };

    let default_holder = format!("conn{}@{}", number, peer);
    let mut holders: HashSet<String> = HashSet::new();
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
                debug!(connection = number, error = %err, "read failed");
                break;
            }
        };
        if line.is_empty() {
            continue;
        }
        let response = match Request::decode(&line) {
            Ok(request) => handle_request(
                &store,
                request,
                &subscriptions,
                &default_holder,
                &mut holders,
            ),
            Err(err) => Response::Error(err.to_string()),
        };
        if out_tx.send(response.encode()).is_err() {
            break;
        }
    }

    pusher.abort();
    drop(out_tx);
    let _ = writer.await;
    for holder in holders {
        let released = store.release_locks_of(&holder);
        if released > 0 {
            warn!(%holder, released, "released locks of disconnected client");
        }
    }
    debug!(connection = number, "cache client disconnected");
}

fn handle_request(
    store: &CacheStore,
    request: Request,
    subscriptions: &Mutex<HashSet<String>>,
    default_holder: &str,
    holders: &mut HashSet<String>,
) -> Response {
    match request {
        Request::Get { key, mintime } => Response::Entry(store.get(&key, mintime)),
        Request::Put(entry) => {
            store.put(entry);
            Response::Ok
        }
        Request::Invalidate { key } => {
            store.invalidate(&key);
            Response::Ok
        }
        Request::History { key, from, to } => Response::Entries(store.history(&key, from, to)),
        Request::Subscribe { key } => {
            subscriptions.lock().insert(key);
            Response::Ok
        }
        Request::Unsubscribe { key } => {
            subscriptions.lock().remove(&key);
            Response::Ok
        }
        Request::Lock { name } => {
            let (name, client) = split_client_id(&name);
            let holder = client.unwrap_or(default_holder).to_string();
            holders.insert(holder.clone());
            match store.try_lock(name, &holder) {
                LockAttempt::Acquired => Response::Ok,
                LockAttempt::Held(other) => Response::Held(other),
            }
        }
        Request::Unlock { name } => {
            let (name, client) = split_client_id(&name);
            if !store.unlock(name, client.unwrap_or(default_holder)) {
                debug!(lock = %name, "unlock of a lock not held");
            }
            Response::Ok
        }
        Request::Rewrite { key, target } => match store.set_rewrite(&key, &target) {
            Ok(()) => Response::Ok,
            Err(err) => Response::Error(err.to_string()),
        },
        Request::Unrewrite { key } => {
            store.unset_rewrite(&key);
            Response::Ok
        }
        Request::Clear { prefix } => {
            store.clear(&prefix);
            Response::Ok
        }
        Request::Snapshot => Response::Entries(store.snapshot()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheEntry;
    use serde_json::json;

    #[test]
    fn test_lock_requests_track_holders() {
        let store = CacheStore::new();
        let subs = Mutex::new(HashSet::new());
        let mut holders = HashSet::new();
        let lock = |name: &str, holders: &mut HashSet<String>| {
            handle_request(
                &store,
                Request::Lock { name: name.into() },
                &subs,
                "conn0",
                holders,
            )
        };
        assert_eq!(lock("m1@a", &mut holders), Response::Ok);
        assert_eq!(lock("m1@b", &mut holders), Response::Held("a".into()));
        assert_eq!(lock("m2", &mut holders), Response::Ok);
        assert_eq!(store.lock_holder("m2").as_deref(), Some("conn0"));
        assert!(holders.contains("a") && holders.contains("conn0"));
    }

    #[test]
    fn test_subscribe_and_get() {
        let store = CacheStore::new();
        let subs = Mutex::new(HashSet::new());
        let mut holders = HashSet::new();
        handle_request(
            &store,
            Request::Subscribe { key: "m1/value".into() },
            &subs,
            "c",
            &mut holders,
        );
        assert!(subs.lock().contains("m1/value"));
        handle_request(
            &store,
            Request::Put(CacheEntry::new("m1/value", json!(1), crate::clock::now(), None)),
            &subs,
            "c",
            &mut holders,
        );
        let reply = handle_request(
            &store,
            Request::Get {
                key: "m1/value".into(),
                mintime: 0.0,
            },
            &subs,
            "c",
            &mut holders,
        );
        assert!(matches!(reply, Response::Entry(Some(ref e)) if e.value == json!(1)));
    }
}

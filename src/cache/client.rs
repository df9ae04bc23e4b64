//! TCP [`Cache`] front-end.
//!
//! Requests are serialised over one connection and answered in order; `upd`
//! pushes for subscribed keys are routed to callbacks by the reader task.
//!
//! While the server is unreachable the client degrades instead of failing:
//! writes are queued (bounded, oldest dropped first) and replayed in order on
//! reconnect, and reads are answered from the last known values with
//! [`CacheEntry::stale`] set. A background task reconnects and re-subscribes.

use super::wire::{self, Frame, Request, Response};
use super::{Cache, CacheEntry, CallbackId, CallbackRegistry, LockAttempt, UpdateCallback};
use crate::config::CacheConfig;
use crate::error::{AppResult, IcsError};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type Mirror = Arc<RwLock<HashMap<String, CacheEntry>>>;

struct Connection {
    writer: BufWriter<OwnedWriteHalf>,
    replies: mpsc::UnboundedReceiver<Response>,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl Connection {
    async fn roundtrip(&mut self, request: &Request, timeout: Duration) -> AppResult<Response> {
        let mut line = request.encode();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        match tokio::time::timeout(timeout, self.replies.recv()).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(IcsError::cache_comm("connection closed by cache server")),
            Err(_) => Err(IcsError::timeout(None, "no reply from cache server")),
        }
    }
}

struct ClientInner {
    id: String,
    address: String,
    request_timeout: Duration,
    reconnect_interval: Duration,
    write_limit: usize,
    conn: Mutex<Option<Connection>>,
    last_attempt: parking_lot::Mutex<Option<Instant>>,
    callbacks: Arc<CallbackRegistry>,
    mirror: Mirror,
    pending: parking_lot::Mutex<VecDeque<Request>>,
}

pub struct CacheClient {
    inner: Arc<ClientInner>,
    maintainer: JoinHandle<()>,
}

impl CacheClient {
    /// Connect to `address`. An unreachable server is not an error; the client
    /// starts disconnected and keeps trying in the background.
    pub async fn connect(address: impl Into<String>, name: &str, config: &CacheConfig) -> Self {
        let id = format!("{}-{}", name, &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let inner = Arc::new(ClientInner {
            id,
            address: address.into(),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            reconnect_interval: Duration::from_millis(config.reconnect_interval_ms.max(1)),
            write_limit: config.write_buffer_limit,
            conn: Mutex::new(None),
            last_attempt: parking_lot::Mutex::new(None),
            callbacks: Arc::new(CallbackRegistry::new()),
            mirror: Arc::default(),
            pending: parking_lot::Mutex::new(VecDeque::new()),
        });

        {
            let mut conn = inner.conn.lock().await;
            inner.try_connect(&mut conn).await;
        }

        let weak = Arc::downgrade(&inner);
        let interval = inner.reconnect_interval;
        let maintainer = tokio::spawn(maintain(weak, interval));
        Self { inner, maintainer }
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .conn
            .try_lock()
            .map(|conn| conn.as_ref().is_some_and(|c| c.alive.load(Ordering::SeqCst)))
            .unwrap_or(true)
    }

    /// Number of writes waiting for the server to come back.
    pub fn pending_writes(&self) -> usize {
        self.inner.pending.lock().len()
    }

    async fn write(&self, request: Request) -> AppResult<()> {
        match self.inner.transport(&request).await {
            Ok(response) => response.into_result().map(|_| ()),
            Err(err) => {
                debug!(error = %err, "buffering cache write");
                self.inner.buffer(request);
                Ok(())
            }
        }
    }

    fn remember(&self, entry: &CacheEntry) {
        let (key, _) = super::split_client_id(&entry.key);
        self.inner.mirror.write().insert(key.to_string(), entry.renamed(key));
    }

    fn stale_read(&self, key: &str, mintime: f64) -> Option<CacheEntry> {
        self.inner
            .mirror
            .read()
            .get(key)
            .filter(|entry| !entry.expired && entry.time >= mintime)
            .map(|entry| CacheEntry {
                stale: true,
                ..entry.clone()
            })
    }
}

impl Drop for CacheClient {
    fn drop(&mut self) {
        self.maintainer.abort();
    }
}

async fn maintain(inner: Weak<ClientInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut conn = inner.conn.lock().await;
        if conn
            .as_ref()
            .is_some_and(|c| !c.alive.load(Ordering::SeqCst))
        {
            warn!(address = %inner.address, "lost connection to cache server");
            *conn = None;
        }
        if conn.is_none() {
            inner.try_connect(&mut conn).await;
        }
    }
}

async fn read_loop(
    read_half: OwnedReadHalf,
    replies: mpsc::UnboundedSender<Response>,
    callbacks: Arc<CallbackRegistry>,
    mirror: Mirror,
    alive: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(read_half).lines();
    let mut list: Option<(usize, Vec<CacheEntry>)> = None;
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some((expected, entries)) = list.as_mut() {
            match wire::decode_entry(&line) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(error = %err, "bad entry in list reply"),
            }
            if entries.len() >= *expected {
                if let Some((_, entries)) = list.take() {
                    let _ = replies.send(Response::Entries(entries));
                }
            }
            continue;
        }
        match wire::decode_frame(&line) {
            Ok(Frame::Update(entry)) => {
                mirror.write().insert(entry.key.clone(), entry.clone());
                callbacks.dispatch(&entry);
            }
            Ok(Frame::ListHeader(0)) => {
                let _ = replies.send(Response::Entries(Vec::new()));
            }
            Ok(Frame::ListHeader(n)) => list = Some((n, Vec::with_capacity(n))),
            Ok(Frame::Reply(response)) => {
                let _ = replies.send(response);
            }
            Err(err) => warn!(error = %err, "unparseable line from cache server"),
        }
    }
    alive.store(false, Ordering::SeqCst);
}

impl ClientInner {
    /// Connect, re-subscribe and replay buffered writes. Attempts are spaced
    /// by the reconnect interval.
    async fn try_connect(&self, slot: &mut Option<Connection>) {
        {
            let mut last = self.last_attempt.lock();
            if last.is_some_and(|t| t.elapsed() < self.reconnect_interval) {
                return;
            }
            *last = Some(Instant::now());
        }

        let stream =
            match tokio::time::timeout(self.request_timeout, TcpStream::connect(&self.address)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    debug!(address = %self.address, error = %err, "cache server unreachable");
                    return;
                }
                Err(_) => {
                    debug!(address = %self.address, "cache connect timed out");
                    return;
                }
            };
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(
            read_half,
            tx,
            Arc::clone(&self.callbacks),
            Arc::clone(&self.mirror),
            Arc::clone(&alive),
        ));
        let mut conn = Connection {
            writer: BufWriter::new(write_half),
            replies: rx,
            alive,
            reader,
        };

        for key in self.callbacks.keys() {
            if let Err(err) = conn.roundtrip(&Request::Subscribe { key }, self.request_timeout).await {
                warn!(error = %err, "re-subscribing failed");
                return;
            }
        }

        let replay: Vec<Request> = self.pending.lock().drain(..).collect();
        let count = replay.len();
        for (i, request) in replay.iter().enumerate() {
            if let Err(err) = conn.roundtrip(request, self.request_timeout).await {
                warn!(error = %err, "replaying buffered writes failed");
                let mut pending = self.pending.lock();
                for request in replay[i..].iter().rev() {
                    pending.push_front(request.clone());
                }
                return;
            }
        }

        info!(address = %self.address, client = %self.id, replayed = count, "connected to cache server");
        *slot = Some(conn);
    }

    /// One request/reply exchange. Errors mean the transport failed; the
    /// connection is dropped so the next call reconnects.
    async fn transport(&self, request: &Request) -> AppResult<Response> {
        let mut slot = self.conn.lock().await;
        if slot.as_ref().is_some_and(|c| !c.alive.load(Ordering::SeqCst)) {
            *slot = None;
        }
        if slot.is_none() {
            self.try_connect(&mut slot).await;
        }
        let Some(conn) = slot.as_mut() else {
            return Err(IcsError::cache_comm(format!(
                "not connected to cache server at {}",
                self.address
            )));
        };
        match conn.roundtrip(request, self.request_timeout).await {
            Ok(response) => Ok(response),
            Err(err) => {
                warn!(address = %self.address, error = %err, "cache request failed, disconnecting");
                *slot = None;
                Err(err)
            }
        }
    }

    fn buffer(&self, request: Request) {
        let mut pending = self.pending.lock();
        if pending.len() >= self.write_limit {
            pending.pop_front();
            warn!(limit = self.write_limit, "cache write buffer full, dropping oldest write");
        }
        if self.write_limit > 0 {
            pending.push_back(request);
        }
    }

    fn tagged(&self, key: &str) -> String {
        format!("{}@{}", key, self.id)
    }
}

#[async_trait]
impl Cache for CacheClient {
    fn client_id(&self) -> &str {
        &self.inner.id
    }

    async fn get(&self, key: &str, mintime: f64) -> AppResult<Option<CacheEntry>> {
        let request = Request::Get {
            key: key.to_string(),
            mintime,
        };
        match self.inner.transport(&request).await {
            Ok(response) => match response.into_result()? {
                Response::Entry(Some(entry)) => {
                    self.remember(&entry);
                    Ok(Some(entry))
                }
                Response::Entry(None) => Ok(None),
                other => Err(IcsError::Protocol(format!("unexpected reply to get: {:?}", other))),
            },
            Err(_) => Ok(self.stale_read(key, mintime)),
        }
    }

    async fn put(&self, key: &str, value: Value, time: f64, ttl: Option<f64>) -> AppResult<()> {
        let entry = CacheEntry::new(self.inner.tagged(key), value, time, ttl);
        self.remember(&entry);
        self.write(Request::Put(entry)).await
    }

    async fn invalidate(&self, key: &str) -> AppResult<()> {
        if let Some(entry) = self.inner.mirror.write().get_mut(key) {
            entry.expired = true;
        }
        self.write(Request::Invalidate {
            key: key.to_string(),
        })
        .await
    }

    async fn history(&self, key: &str, from: f64, to: f64) -> AppResult<Vec<CacheEntry>> {
        let request = Request::History {
            key: key.to_string(),
            from,
            to,
        };
        match self.inner.transport(&request).await?.into_result()? {
            Response::Entries(entries) => Ok(entries),
            other => Err(IcsError::Protocol(format!("unexpected reply to hist: {:?}", other))),
        }
    }

    async fn add_callback(&self, key: &str, callback: UpdateCallback) -> AppResult<CallbackId> {
        let (id, first) = self.inner.callbacks.add(key, callback);
        if first {
            let request = Request::Subscribe {
                key: key.to_string(),
            };
            if let Err(err) = self.inner.transport(&request).await {
                debug!(%key, error = %err, "subscription deferred until reconnect");
            }
        }
        Ok(id)
    }

    async fn remove_callback(&self, id: CallbackId) -> AppResult<()> {
        if let Some((key, true)) = self.inner.callbacks.remove(id) {
            let _ = self.inner.transport(&Request::Unsubscribe { key }).await;
        }
        Ok(())
    }

    async fn try_lock(&self, name: &str) -> AppResult<LockAttempt> {
        let request = Request::Lock {
            name: self.inner.tagged(name),
        };
        match self.inner.transport(&request).await?.into_result()? {
            Response::Ok => Ok(LockAttempt::Acquired),
            Response::Held(holder) => Ok(LockAttempt::Held(holder)),
            other => Err(IcsError::Protocol(format!("unexpected reply to lock: {:?}", other))),
        }
    }

    async fn unlock(&self, name: &str) -> AppResult<()> {
        let request = Request::Unlock {
            name: self.inner.tagged(name),
        };
        self.inner.transport(&request).await?.into_result().map(|_| ())
    }

    async fn set_rewrite(&self, key: &str, target: &str) -> AppResult<()> {
        let request = Request::Rewrite {
            key: key.to_string(),
            target: target.to_string(),
        };
        self.inner.transport(&request).await?.into_result().map(|_| ())
    }

    async fn unset_rewrite(&self, key: &str) -> AppResult<()> {
        let request = Request::Unrewrite {
            key: key.to_string(),
        };
        self.inner.transport(&request).await?.into_result().map(|_| ())
    }

    async fn clear(&self, prefix: &str) -> AppResult<()> {
        let request = Request::Clear {
            prefix: prefix.to_string(),
        };
        self.inner.transport(&request).await?.into_result().map(|_| ())
    }

    async fn clear_all(&self) -> AppResult<()> {
        self.clear("").await
    }

    async fn snapshot(&self) -> AppResult<Vec<CacheEntry>> {
        match self.inner.transport(&Request::Snapshot).await {
            Ok(response) => match response.into_result()? {
                Response::Entries(entries) => Ok(entries),
                other => Err(IcsError::Protocol(format!("unexpected reply to snap: {:?}", other))),
            },
            Err(_) => {
                let mut entries: Vec<CacheEntry> = self
                    .inner
                    .mirror
                    .read()
                    .values()
                    .filter(|e| !e.expired)
                    .map(|e| CacheEntry {
                        stale: true,
                        ..e.clone()
                    })
                    .collect();
                entries.sort_by(|a, b| a.key.cmp(&b.key));
                Ok(entries)
            }
        }
    }
}

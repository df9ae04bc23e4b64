//! Line protocol spoken between [`CacheClient`](super::CacheClient) and
//! [`CacheServer`](super::CacheServer).
//!
//! An entry travels as one tab separated line:
//!
//! ```text
//! key<TAB>time<TAB>ttl-or-empty<TAB>(=|!)value
//! ```
//!
//! `=` marks a live value and `!` an expired or invalidated one. Values are
//! compact JSON, which never contains a raw tab or newline. Keys may carry an
//! `@clientid` suffix identifying the writer.
//!
//! Requests are `verb<TAB>args...` lines; the reply is a single line except for
//! `list`, which announces how many entry lines follow. Subscription pushes are
//! `upd<TAB><entry>` lines and may arrive between replies.

use super::entry::CacheEntry;
use crate::error::{AppResult, IcsError};

/// Encode an entry as a protocol line (without trailing newline).
pub fn encode_entry(entry: &CacheEntry) -> String {
    let ttl = entry.ttl.map(|ttl| ttl.to_string()).unwrap_or_default();
    let flag = if entry.expired { '!' } else { '=' };
    format!(
        "{}\t{}\t{}\t{}{}",
        entry.key, entry.time, ttl, flag, entry.value
    )
}

/// Parse an entry line.
pub fn decode_entry(line: &str) -> AppResult<CacheEntry> {
    let mut parts = line.splitn(4, '\t');
    let (Some(key), Some(time), Some(ttl), Some(rest)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(IcsError::Protocol(format!("malformed entry line: {:?}", line)));
    };
    if key.is_empty() {
        return Err(IcsError::Protocol("entry line without key".to_string()));
    }
    let time: f64 = time
        .parse()
        .map_err(|_| IcsError::Protocol(format!("bad timestamp {:?} for key {}", time, key)))?;
    let ttl = if ttl.is_empty() {
        None
    } else {
        Some(
            ttl.parse::<f64>()
                .map_err(|_| IcsError::Protocol(format!("bad ttl {:?} for key {}", ttl, key)))?,
        )
    };
    let (expired, raw) = match rest.chars().next() {
        Some('=') => (false, &rest[1..]),
        Some('!') => (true, &rest[1..]),
        _ => {
            return Err(IcsError::Protocol(format!(
                "entry for key {} lacks '=' or '!' marker",
                key
            )))
        }
    };
    let value = if raw.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_str(raw)?
    };
    Ok(CacheEntry {
        key: key.to_string(),
        time,
        ttl,
        expired,
        value,
        stale: false,
    })
}

/// Client to server requests.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Get { key: String, mintime: f64 },
    Put(CacheEntry),
    Invalidate { key: String },
    History { key: String, from: f64, to: f64 },
    Subscribe { key: String },
    Unsubscribe { key: String },
    /// `name@clientid`; the client id is the holder.
    Lock { name: String },
    Unlock { name: String },
    Rewrite { key: String, target: String },
    Unrewrite { key: String },
    /// Empty prefix clears everything.
    Clear { prefix: String },
    Snapshot,
}

impl Request {
    pub fn encode(&self) -> String {
        match self {
            Request::Get { key, mintime } => format!("get\t{}\t{}", key, mintime),
            Request::Put(entry) => format!("put\t{}", encode_entry(entry)),
            Request::Invalidate { key } => format!("inv\t{}", key),
            Request::History { key, from, to } => format!("hist\t{}\t{}\t{}", key, from, to),
            Request::Subscribe { key } => format!("sub\t{}", key),
            Request::Unsubscribe { key } => format!("unsub\t{}", key),
            Request::Lock { name } => format!("lock\t{}", name),
            Request::Unlock { name } => format!("unlock\t{}", name),
            Request::Rewrite { key, target } => format!("rw\t{}\t{}", key, target),
            Request::Unrewrite { key } => format!("unrw\t{}", key),
            Request::Clear { prefix } => format!("clear\t{}", prefix),
            Request::Snapshot => "snap".to_string(),
        }
    }

    pub fn decode(line: &str) -> AppResult<Self> {
        let (verb, rest) = line.split_once('\t').unwrap_or((line, ""));
        let args: Vec<&str> = rest.split('\t').collect();
        let arg = |i: usize| -> AppResult<String> {
            args.get(i)
                .filter(|a| !a.is_empty())
                .map(|a| a.to_string())
                .ok_or_else(|| IcsError::Protocol(format!("'{}' is missing argument {}", verb, i + 1)))
        };
        let number = |i: usize| -> AppResult<f64> {
            arg(i)?
                .parse()
                .map_err(|_| IcsError::Protocol(format!("'{}' argument {} is not a number", verb, i + 1)))
        };
        Ok(match verb {
            "get" => Request::Get {
                key: arg(0)?,
                mintime: number(1).unwrap_or(0.0),
            },
            "put" => Request::Put(decode_entry(rest)?),
            "inv" => Request::Invalidate { key: arg(0)? },
            "hist" => Request::History {
                key: arg(0)?,
                from: number(1)?,
                to: number(2)?,
            },
            "sub" => Request::Subscribe { key: arg(0)? },
            "unsub" => Request::Unsubscribe { key: arg(0)? },
            "lock" => Request::Lock { name: arg(0)? },
            "unlock" => Request::Unlock { name: arg(0)? },
            "rw" => Request::Rewrite {
                key: arg(0)?,
                target: arg(1)?,
            },
            "unrw" => Request::Unrewrite { key: arg(0)? },
            "clear" => Request::Clear {
                prefix: rest.to_string(),
            },
            "snap" => Request::Snapshot,
            other => return Err(IcsError::Protocol(format!("unknown verb '{}'", other))),
        })
    }

    /// Requests that change the store and may be replayed after reconnect.
    pub fn is_write(&self) -> bool {
        matches!(self, Request::Put(_) | Request::Invalidate { .. })
    }
}

/// Server replies.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok,
    Entry(Option<CacheEntry>),
    Entries(Vec<CacheEntry>),
    /// Lock held by the named client.
    Held(String),
    Error(String),
}

impl Response {
    /// Encode as one or more lines (joined by `\n`, no trailing newline).
    pub fn encode(&self) -> String {
        match self {
            Response::Ok => "ok".to_string(),
            Response::Entry(None) => "none".to_string(),
            Response::Entry(Some(entry)) => format!("ent\t{}", encode_entry(entry)),
            Response::Entries(entries) => {
                let mut out = format!("list\t{}", entries.len());
                for entry in entries {
                    out.push('\n');
                    out.push_str(&encode_entry(entry));
                }
                out
            }
            Response::Held(holder) => format!("held\t{}", holder),
            Response::Error(message) => format!("err\t{}", message.replace(['\t', '\n'], " ")),
        }
    }

    /// Convert an error reply into an [`IcsError`].
    pub fn into_result(self) -> AppResult<Self> {
        match self {
            Response::Error(message) => Err(IcsError::cache_comm(message)),
            other => Ok(other),
        }
    }
}

/// One line as seen by a client reader.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Reply(Response),
    /// `list` header; this many entry lines follow.
    ListHeader(usize),
    Update(CacheEntry),
}

pub fn update_line(entry: &CacheEntry) -> String {
    format!("upd\t{}", encode_entry(entry))
}

pub fn decode_frame(line: &str) -> AppResult<Frame> {
    let (head, rest) = line.split_once('\t').unwrap_or((line, ""));
    Ok(match head {
        "ok" => Frame::Reply(Response::Ok),
        "none" => Frame::Reply(Response::Entry(None)),
        "ent" => Frame::Reply(Response::Entry(Some(decode_entry(rest)?))),
        "list" => Frame::ListHeader(
            rest.parse()
                .map_err(|_| IcsError::Protocol(format!("bad list length {:?}", rest)))?,
        ),
        "held" => Frame::Reply(Response::Held(rest.to_string())),
        "err" => Frame::Reply(Response::Error(rest.to_string())),
        "upd" => Frame::Update(decode_entry(rest)?),
        other => return Err(IcsError::Protocol(format!("unexpected reply '{}'", other))),
    })
}

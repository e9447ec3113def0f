//! Bolt 4.4 sessions over any byte stream.
//!
//! A connection starts with a 20-byte handshake, then exchanges chunked
//! PackStream messages. Each request gets one or more responses; after a
//! `FAILURE` every request except `RESET` and `GOODBYE` is answered with
//! `IGNORED`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::auth::Authenticator;
use super::packstream::{self, PackValue};
use super::{blocking, ServerError};
use crate::db::{Database, Transaction};
use crate::query::{Params, QueryCursor, QueryStats, Value};

/// Handshake preamble.
pub const MAGIC: [u8; 4] = [0x60, 0x60, 0xB0, 0x17];
/// Negotiated protocol version `(major, minor)`.
pub const VERSION: (u8, u8) = (4, 4);

const MAX_CHUNK: usize = u16::MAX as usize;
const MAX_MESSAGE: usize = 64 * 1024 * 1024;

/// Request message tags.
pub mod request {
    /// Open a session.
    pub const HELLO: u8 = 0x01;
    /// Close the connection.
    pub const GOODBYE: u8 = 0x02;
    /// Clear failure state and any open transaction.
    pub const RESET: u8 = 0x0F;
    /// Run a statement.
    pub const RUN: u8 = 0x10;
    /// Open an explicit transaction.
    pub const BEGIN: u8 = 0x11;
    /// Commit the explicit transaction.
    pub const COMMIT: u8 = 0x12;
    /// Roll back the explicit transaction.
    pub const ROLLBACK: u8 = 0x13;
    /// Drop remaining records.
    pub const DISCARD: u8 = 0x2F;
    /// Fetch records.
    pub const PULL: u8 = 0x3F;
    /// Authenticate an open session.
    pub const LOGON: u8 = 0x6A;
    /// Drop the session's authentication.
    pub const LOGOFF: u8 = 0x6B;
}

/// Response message tags.
pub mod response {
    /// Request succeeded; carries metadata.
    pub const SUCCESS: u8 = 0x70;
    /// One result row.
    pub const RECORD: u8 = 0x71;
    /// Request skipped because the session is failed.
    pub const IGNORED: u8 = 0x7E;
    /// Request failed; carries `code` and `message`.
    pub const FAILURE: u8 = 0x7F;
}

static CONNECTIONS: AtomicU64 = AtomicU64::new(0);

/// Accepts Bolt connections until the listener fails.
pub async fn accept_loop(
    listener: TcpListener,
    db: Database,
    auth: Arc<dyn Authenticator>,
) -> Result<(), ServerError> {
    loop {
        let (socket, peer) = listener.accept().await?;
        if let Err(err) = socket.set_nodelay(true) {
            debug!(%peer, ?err, "bolt.nodelay_failed");
        }
        let db = db.clone();
        let auth = Arc::clone(&auth);
        tokio::spawn(async move {
            debug!(%peer, "bolt.connected");
            if let Err(err) = handle_connection(socket, db, auth).await {
                warn!(%peer, %err, "bolt.connection_error");
            }
            debug!(%peer, "bolt.disconnected");
        });
    }
}

/// Runs one Bolt connection to completion.
pub async fn handle_connection<S>(
    mut stream: S,
    db: Database,
    auth: Arc<dyn Authenticator>,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !handshake(&mut stream).await? {
        return Ok(());
    }
    let mut session = Session::new(db, auth);
    let outcome = serve_messages(&mut stream, &mut session).await;
    session.abandon().await;
    outcome
}

async fn serve_messages<S>(stream: &mut S, session: &mut Session) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(bytes) = read_message(stream).await? {
        let mut input = bytes.as_slice();
        let PackValue::Struct(tag, fields) = packstream::decode(&mut input)? else {
            return Err(ServerError::Protocol("message is not a structure".into()));
        };
        let reply = session.handle(tag, fields).await?;
        let mut out = BytesMut::new();
        for message in &reply.messages {
            write_chunked(message, &mut out);
        }
        stream.write_all(&out).await?;
        stream.flush().await?;
        if reply.close {
            break;
        }
    }
    Ok(())
}

/// Reads the preamble and answers with the chosen version. Returns false
/// when no proposal is supported.
async fn handshake<S>(stream: &mut S) -> Result<bool, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut preamble = [0u8; 20];
    stream.read_exact(&mut preamble).await?;
    if preamble[..4] != MAGIC {
        return Err(ServerError::Protocol("bad handshake magic".into()));
    }
    let supported = preamble[4..].chunks_exact(4).any(|proposal| {
        let (range, minor, major) = (proposal[1], proposal[2], proposal[3]);
        major == VERSION.0 && minor >= VERSION.1 && minor.saturating_sub(range) <= VERSION.1
    });
    let reply = if supported {
        [0, 0, VERSION.1, VERSION.0]
    } else {
        [0; 4]
    };
    stream.write_all(&reply).await?;
    stream.flush().await?;
    debug!(supported, "bolt.handshake");
    Ok(supported)
}

/// Reassembles one message from its chunks. `None` at a clean end of stream.
async fn read_message<R>(reader: &mut R) -> Result<Option<Vec<u8>>, ServerError>
where
    R: AsyncRead + Unpin,
{
    let mut message = Vec::new();
    loop {
        let mut header = [0u8; 2];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof && message.is_empty() => {
                return Ok(None)
            }
            Err(err) => return Err(err.into()),
        }
        let len = u16::from_be_bytes(header) as usize;
        if len == 0 {
            if message.is_empty() {
                // keep-alive
                continue;
            }
            return Ok(Some(message));
        }
        if message.len() + len > MAX_MESSAGE {
            return Err(ServerError::Protocol("message too large".into()));
        }
        let start = message.len();
        message.resize(start + len, 0);
        reader.read_exact(&mut message[start..]).await?;
    }
}

fn write_chunked(message: &PackValue, out: &mut BytesMut) {
    let mut body = BytesMut::new();
    packstream::encode(message, &mut body);
    for chunk in body.chunks(MAX_CHUNK) {
        out.put_u16(chunk.len() as u16);
        out.put_slice(chunk);
    }
    out.put_u16(0);
}

struct Reply {
    messages: Vec<PackValue>,
    close: bool,
}

impl Reply {
    fn one(message: PackValue) -> Self {
        Self {
            messages: vec![message],
            close: false,
        }
    }
}

fn success(metadata: Vec<(&str, PackValue)>) -> PackValue {
    PackValue::Struct(response::SUCCESS, vec![PackValue::map(metadata)])
}

fn failure(code: &str, message: &str) -> PackValue {
    PackValue::Struct(
        response::FAILURE,
        vec![PackValue::map([
            ("code", PackValue::from(code)),
            ("message", PackValue::from(message)),
        ])],
    )
}

fn record(row: &[Value]) -> PackValue {
    PackValue::Struct(
        response::RECORD,
        vec![PackValue::List(row.iter().map(packstream::from_value).collect())],
    )
}

fn stats_map(stats: &QueryStats) -> PackValue {
    let counters = [
        ("nodes-created", stats.nodes_created),
        ("nodes-deleted", stats.nodes_deleted),
        ("relationships-created", stats.relationships_created),
        ("relationships-deleted", stats.relationships_deleted),
        ("properties-set", stats.properties_set),
        ("labels-added", stats.labels_added),
        ("labels-removed", stats.labels_removed),
    ];
    PackValue::map(
        counters
            .into_iter()
            .filter(|(_, n)| *n > 0)
            .map(|(k, n)| (k, PackValue::Int(n as i64))),
    )
}

fn summary(stats: &QueryStats, bookmark: Option<String>) -> PackValue {
    let kind = if stats.contains_updates() { "rw" } else { "r" };
    let mut metadata = vec![("type", PackValue::from(kind)), ("t_last", PackValue::Int(0))];
    if stats.contains_updates() {
        metadata.push(("stats", stats_map(stats)));
    }
    if let Some(bookmark) = bookmark {
        metadata.push(("bookmark", PackValue::from(bookmark)));
    }
    metadata.push(("db", PackValue::from("neo4j")));
    success(metadata)
}

fn bookmark(commit: u64) -> String {
    format!("engramdb:{commit}")
}

/// Result waiting to be pulled.
enum Pending {
    /// Auto-commit result, already committed and buffered.
    Committed {
        rows: VecDeque<Vec<Value>>,
        stats: QueryStats,
        bookmark: String,
    },
    /// Statement inside an explicit transaction.
    Streaming(QueryCursor),
}

struct Session {
    db: Database,
    auth: Arc<dyn Authenticator>,
    connection_id: u64,
    authenticated: bool,
    failed: bool,
    tx: Option<Transaction>,
    pending: Option<Pending>,
}

impl Session {
    fn new(db: Database, auth: Arc<dyn Authenticator>) -> Self {
        Self {
            db,
            auth,
            connection_id: CONNECTIONS.fetch_add(1, Ordering::Relaxed) + 1,
            authenticated: false,
            failed: false,
            tx: None,
            pending: None,
        }
    }

    fn fail(&mut self, err: &ServerError) -> Reply {
        debug!(conn = self.connection_id, code = err.code(), %err, "bolt.failure");
        self.failed = true;
        self.pending = None;
        Reply::one(failure(err.code(), &err.client_message()))
    }

    async fn handle(&mut self, tag: u8, fields: Vec<PackValue>) -> Result<Reply, ServerError> {
        match tag {
            request::GOODBYE => {
                self.abandon().await;
                return Ok(Reply {
                    messages: Vec::new(),
                    close: true,
                });
            }
            request::RESET => {
                self.abandon().await;
                self.failed = false;
                return Ok(Reply::one(success(Vec::new())));
            }
            _ if self.failed => {
                return Ok(Reply::one(PackValue::Struct(response::IGNORED, Vec::new())));
            }
            request::HELLO | request::LOGON => return Ok(self.logon(tag, fields)),
            _ if !self.authenticated => {
                let reply = self.fail(&ServerError::Unauthorized);
                return Ok(Reply { close: true, ..reply });
            }
            _ => {}
        }

        let outcome = match tag {
            request::LOGOFF => {
                self.authenticated = false;
                Ok(Reply::one(success(Vec::new())))
            }
            request::BEGIN => self.begin().await,
            request::RUN => self.run(fields).await,
            request::PULL => self.pull(fields).await,
            request::DISCARD => {
                self.pending = None;
                Ok(Reply::one(success(vec![("has_more", PackValue::Bool(false))])))
            }
            request::COMMIT => self.commit().await,
            request::ROLLBACK => self.rollback().await,
            other => Err(ServerError::Protocol(format!("unknown message 0x{other:02X}"))),
        };
        match outcome {
            Ok(reply) => Ok(reply),
            Err(err @ (ServerError::Io(_) | ServerError::Join(_))) => Err(err),
            Err(err) => Ok(self.fail(&err)),
        }
    }

    fn logon(&mut self, tag: u8, fields: Vec<PackValue>) -> Reply {
        let extra = fields.into_iter().next().unwrap_or(PackValue::Map(Vec::new()));
        let principal = extra.get("principal").and_then(PackValue::as_str);
        let credentials = extra.get("credentials").and_then(PackValue::as_str);
        if let Err(err) = self.auth.authenticate(principal, credentials) {
            warn!(conn = self.connection_id, "bolt.auth_failed");
            let reply = self.fail(&err);
            return Reply { close: true, ..reply };
        }
        self.authenticated = true;
        info!(conn = self.connection_id, user = principal.unwrap_or(""), "bolt.session_open");
        if tag == request::LOGON {
            return Reply::one(success(Vec::new()));
        }
        Reply::one(success(vec![
            ("server", PackValue::from(concat!("EngramDB/", env!("CARGO_PKG_VERSION")))),
            ("connection_id", PackValue::from(format!("bolt-{}", self.connection_id))),
        ]))
    }

    async fn begin(&mut self) -> Result<Reply, ServerError> {
        if self.tx.is_some() {
            return Err(ServerError::Request("a transaction is already open".into()));
        }
        let db = self.db.clone();
        let tx = blocking(move || db.begin()).await??;
        debug!(conn = self.connection_id, tx_id = tx.id().0, "bolt.begin");
        self.tx = Some(tx);
        Ok(Reply::one(success(Vec::new())))
    }

    async fn run(&mut self, fields: Vec<PackValue>) -> Result<Reply, ServerError> {
        let mut fields = fields.into_iter();
        let query = match fields.next() {
            Some(PackValue::String(query)) => query,
            _ => return Err(ServerError::Request("RUN expects a query string".into())),
        };
        let params = match fields.next() {
            Some(PackValue::Map(entries)) => entries
                .into_iter()
                .map(|(k, v)| Ok((k, packstream::to_value(v)?)))
                .collect::<Result<Params, ServerError>>()?,
            Some(PackValue::Null) | None => Params::new(),
            Some(_) => return Err(ServerError::Request("RUN parameters must be a map".into())),
        };
        self.pending = None;
        let db = self.db.clone();

        let columns = match &self.tx {
            Some(tx) => {
                let tx = tx.clone();
                let cursor = blocking(move || db.stream_in(&tx, &query, &params)).await??;
                let columns = cursor.columns().to_vec();
                self.pending = Some(Pending::Streaming(cursor));
                columns
            }
            None => {
                let (result, commit) = blocking(move || {
                    let result = db.execute(&query, params)?;
                    Ok::<_, ServerError>((result, db.visible_commit()))
                })
                .await??;
                let columns = result.columns;
                self.pending = Some(Pending::Committed {
                    rows: result.rows.into(),
                    stats: result.stats,
                    bookmark: bookmark(commit),
                });
                columns
            }
        };
        Ok(Reply::one(success(vec![
            (
                "fields",
                PackValue::List(columns.into_iter().map(PackValue::from).collect()),
            ),
            ("t_first", PackValue::Int(0)),
        ])))
    }

    async fn pull(&mut self, fields: Vec<PackValue>) -> Result<Reply, ServerError> {
        let limit = fields
            .first()
            .and_then(|extra| extra.get("n"))
            .and_then(PackValue::as_int)
            .filter(|n| *n >= 0)
            .map(|n| n as usize)
            .unwrap_or(usize::MAX);
        let Some(pending) = self.pending.take() else {
            return Err(ServerError::Request("no result is available to pull".into()));
        };
        match pending {
            Pending::Committed {
                mut rows,
                stats,
                bookmark,
            } => {
                let take = limit.min(rows.len());
                let mut messages: Vec<PackValue> = rows.drain(..take).map(|r| record(&r)).collect();
                if rows.is_empty() {
                    messages.push(summary(&stats, Some(bookmark)));
                } else {
                    messages.push(success(vec![("has_more", PackValue::Bool(true))]));
                    self.pending = Some(Pending::Committed {
                        rows,
                        stats,
                        bookmark,
                    });
                }
                Ok(Reply {
                    messages,
                    close: false,
                })
            }
            Pending::Streaming(cursor) => {
                let (cursor, rows, done, error) = blocking(move || {
                    let mut cursor = cursor;
                    let mut rows = Vec::new();
                    let mut done = false;
                    let mut error = None;
                    while rows.len() < limit {
                        match cursor.next_row() {
                            Ok(Some(row)) => rows.push(row),
                            Ok(None) => {
                                done = true;
                                break;
                            }
                            Err(err) => {
                                error = Some(err);
                                break;
                            }
                        }
                    }
                    (cursor, rows, done, error)
                })
                .await?;
                let mut messages: Vec<PackValue> = rows.iter().map(|r| record(r)).collect();
                if let Some(err) = error {
                    let err = ServerError::from(err);
                    messages.extend(self.fail(&err).messages);
                } else if done {
                    messages.push(summary(cursor.stats(), None));
                } else {
                    messages.push(success(vec![("has_more", PackValue::Bool(true))]));
                    self.pending = Some(Pending::Streaming(cursor));
                }
                Ok(Reply {
                    messages,
                    close: false,
                })
            }
        }
    }

    async fn commit(&mut self) -> Result<Reply, ServerError> {
        let Some(tx) = self.tx.take() else {
            return Err(ServerError::Request("no transaction is open".into()));
        };
        self.pending = None;
        let tx_id = tx.id().0;
        let commit = blocking(move || tx.commit()).await??;
        debug!(conn = self.connection_id, tx_id, commit, "bolt.commit");
        Ok(Reply::one(success(vec![("bookmark", PackValue::from(bookmark(commit)))])))
    }

    async fn rollback(&mut self) -> Result<Reply, ServerError> {
        let Some(tx) = self.tx.take() else {
            return Err(ServerError::Request("no transaction is open".into()));
        };
        self.pending = None;
        blocking(move || tx.rollback()).await??;
        Ok(Reply::one(success(Vec::new())))
    }

    /// Drops pending results and rolls back any open transaction.
    async fn abandon(&mut self) {
        self.pending = None;
        if let Some(tx) = self.tx.take() {
            let tx_id = tx.id().0;
            match blocking(move || tx.rollback()).await {
                Ok(Ok(())) => debug!(conn = self.connection_id, tx_id, "bolt.rollback_on_reset"),
                Ok(Err(err)) => warn!(conn = self.connection_id, tx_id, %err, "bolt.rollback_failed"),
                Err(err) => warn!(conn = self.connection_id, tx_id, %err, "bolt.rollback_failed"),
            }
        }
    }
}

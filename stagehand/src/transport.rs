//! Streaming transport: TCP listener, version handshake, per-session request loop
//! and the chunk/ack pump.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use stagehand_core::protocol::{negotiate_version, ErrorCode, Message, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
use stagehand_core::session::{RetryDecision, Session, SessionManager, Transfer, TransferError};
use stagehand_core::wire::{decode_frame, encode_frame, FrameDecodeError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// No frame within this window drops the connection.
    pub idle_timeout: Duration,
    /// How long to wait for a chunk acknowledgement before resuming.
    pub ack_timeout: Duration,
}

enum ReadError {
    Malformed(String),
    Io(io::Error),
}

/// What the request loop does after handling one request.
enum Flow {
    Continue,
    Close(&'static str),
}

/// Run transport: accept connections until `shutdown`, one task per connection.
pub async fn serve(
    listener: TcpListener,
    sessions: Arc<SessionManager>,
    settings: TransportSettings,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            r = listener.accept() => r,
        };
        match accepted {
            Ok((stream, peer)) => {
                let sessions = sessions.clone();
                let settings = settings.clone();
                tokio::spawn(async move {
                    handle_connection(stream, peer, sessions, settings).await;
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!("transport listener stopped");
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    sessions: Arc<SessionManager>,
    settings: TransportSettings,
) {
    let _ = stream.set_nodelay(true);
    let mut conn = Conn::new(stream);
    let session = match handshake(&mut conn, peer, &sessions, &settings).await {
        Ok(Some(s)) => s,
        Ok(None) => return,
        Err(e) => {
            debug!(%peer, error = %e, "handshake failed");
            return;
        }
    };
    let reason = run_session(&mut conn, &session, &sessions, &settings).await;
    info!(session = %session.id_string(), %peer, reason, "connection closed");
    sessions.on_disconnect(&session.id());
}

/// Read `Hello`, negotiate, reply `Welcome`. None means the connection was refused.
async fn handshake(
    conn: &mut Conn,
    peer: SocketAddr,
    sessions: &SessionManager,
    settings: &TransportSettings,
) -> io::Result<Option<Arc<Session>>> {
    let first = match tokio::time::timeout(settings.idle_timeout, conn.recv()).await {
        Err(_) | Ok(Ok(None)) => return Ok(None),
        Ok(Ok(Some(m))) => m,
        Ok(Err(ReadError::Malformed(why))) => {
            conn.send(&Message::error(ErrorCode::MalformedFrame, why)).await?;
            return Ok(None);
        }
        Ok(Err(ReadError::Io(e))) => return Err(e),
    };
    let Message::Hello {
        min_version,
        max_version,
        client,
    } = first
    else {
        conn.send(&Message::error(ErrorCode::MalformedFrame, "expected Hello")).await?;
        return Ok(None);
    };
    let Some(version) = negotiate_version(min_version, max_version) else {
        warn!(%peer, min_version, max_version, "unsupported protocol range");
        let msg = format!(
            "server speaks protocol {}..={}",
            MIN_PROTOCOL_VERSION, PROTOCOL_VERSION
        );
        conn.send(&Message::error(ErrorCode::UnsupportedProtocol, msg)).await?;
        return Ok(None);
    };

    let session = sessions.on_connect(version, Some(peer));
    debug!(session = %session.id_string(), client = %client, "handshake complete");
    let welcome = Message::Welcome {
        version,
        session_id: session.id(),
        revision: session.pinned_revision(),
    };
    if let Err(e) = conn.send(&welcome).await {
        sessions.on_disconnect(&session.id());
        return Err(e);
    }
    Ok(Some(session))
}

async fn run_session(
    conn: &mut Conn,
    session: &Session,
    sessions: &SessionManager,
    settings: &TransportSettings,
) -> &'static str {
    loop {
        let next = tokio::select! {
            _ = session.cancel_token().cancelled() => {
                let _ = conn.send(&Message::Bye).await;
                return "server shutdown";
            }
            r = tokio::time::timeout(settings.idle_timeout, conn.recv()) => r,
        };
        let msg = match next {
            Err(_) => return "idle timeout",
            Ok(Ok(None)) => return "peer closed",
            Ok(Err(ReadError::Io(_))) => return "read error",
            Ok(Err(ReadError::Malformed(why))) => {
                let _ = conn.send(&Message::error(ErrorCode::MalformedFrame, why)).await;
                return "malformed frame";
            }
            Ok(Ok(Some(m))) => m,
        };

        let outcome = match msg {
            Message::List { prefix } => {
                let (revision, entries) = sessions.list(session, &prefix);
                conn.send(&Message::Listing { revision, entries })
                    .await
                    .map(|_| Flow::Continue)
            }
            Message::GetItem {
                path,
                offset,
                expected_hash,
            } => match sessions.request_item(session, &path, offset, expected_hash) {
                Ok(t) => stream_transfer(conn, sessions, session, t, settings).await,
                Err(e) => reject(conn, &e).await,
            },
            Message::GetArchive {
                selection,
                offset,
                expected_hash,
            } => match sessions
                .request_archive(session, &selection, offset, expected_hash)
                .await
            {
                Ok(t) => stream_transfer(conn, sessions, session, t, settings).await,
                Err(e) => reject(conn, &e).await,
            },
            Message::Ping => {
                let revision = sessions.index().current().seq();
                conn.send(&Message::Pong { revision })
                    .await
                    .map(|_| Flow::Continue)
            }
            Message::Bye => return "peer said bye",
            Message::ChunkAck { .. } | Message::Cancel { .. } => {
                debug!(session = %session.id_string(), "no transfer in progress; ignoring");
                Ok(Flow::Continue)
            }
            _ => conn.send(&Message::error(ErrorCode::MalformedFrame, "unexpected message"),
            )
            .await
            .map(|_| Flow::Continue),
        };
        match outcome {
            Ok(Flow::Continue) => {}
            Ok(Flow::Close(reason)) => return reason,
            Err(_) => return "write error",
        }
    }
}

async fn reject(conn: &mut Conn, err: &TransferError) -> io::Result<Flow> {
    debug!(error = %err, "request rejected");
    conn.send(&Message::error(err.code(), err.to_string())).await?;
    Ok(Flow::Continue)
}

async fn stream_transfer(
    conn: &mut Conn,
    sessions: &SessionManager,
    session: &Session,
    mut transfer: Transfer,
    settings: &TransportSettings,
) -> io::Result<Flow> {
    let start = Message::TransferStart {
        transfer_id: transfer.id(),
        name: transfer.name().to_string(),
        revision: transfer.revision(),
        total_len: transfer.total_len(),
        content_hash: transfer.content_hash(),
        offset: transfer.start_offset(),
        archive_id: transfer.archive_id(),
    };
    let flow = match conn.send(&start).await {
        Ok(()) => pump(conn, session, &mut transfer, settings).await,
        Err(e) => Err(e),
    };
    transfer.abort();
    sessions.finish_transfer(session, &transfer);
    flow
}

/// Send chunks one at a time, each waiting for its acknowledgement, then `TransferEnd`.
async fn pump(
    conn: &mut Conn,
    session: &Session,
    transfer: &mut Transfer,
    settings: &TransportSettings,
) -> io::Result<Flow> {
    let id = transfer.id();
    loop {
        let chunk = match transfer.next_chunk() {
            Ok(Some(c)) => c,
            Ok(None) => break,
            Err(TransferError::SessionClosed) => return Ok(Flow::Close("session closed")),
            Err(e) => {
                transfer.abort();
                warn!(name = %transfer.name(), error = %e, "transfer failed");
                conn.send(&Message::error(e.code(), e.to_string())).await?;
                return Ok(Flow::Continue);
            }
        };
        let end = chunk.offset + chunk.payload.len() as u64;
        conn.send(&Message::Chunk {
                transfer_id: id,
                offset: chunk.offset,
                checksum: chunk.checksum,
                payload: chunk.payload,
            },
        )
        .await?;

        loop {
            let next = tokio::select! {
                _ = transfer.cancel_token().cancelled() => return Ok(Flow::Close("session closed")),
                r = tokio::time::timeout(settings.ack_timeout, conn.recv()) => r,
            };
            let msg = match next {
                Err(_) => match transfer.on_transient_failure() {
                    RetryDecision::Resume { offset, attempt } => {
                        debug!(name = %transfer.name(), offset, attempt, "ack timeout; resuming");
                        break;
                    }
                    RetryDecision::GiveUp { attempts } => {
                        warn!(name = %transfer.name(), attempts, "no acknowledgement; aborting transfer");
                        let why = format!("no acknowledgement after {} resume attempts", attempts);
                        conn.send(&Message::error(ErrorCode::TransferAborted, why)).await?;
                        return Ok(Flow::Continue);
                    }
                },
                Ok(Ok(None)) => return Ok(Flow::Close("peer closed")),
                Ok(Err(ReadError::Io(_))) => return Ok(Flow::Close("read error")),
                Ok(Err(ReadError::Malformed(why))) => {
                    conn.send(&Message::error(ErrorCode::MalformedFrame, why)).await?;
                    return Ok(Flow::Close("malformed frame"));
                }
                Ok(Ok(Some(m))) => m,
            };
            match msg {
                Message::ChunkAck {
                    transfer_id,
                    next_offset,
                } if transfer_id == id => {
                    if !transfer.acknowledge(next_offset) {
                        transfer.abort();
                        let why = format!("acknowledged offset {} was never sent", next_offset);
                        conn.send(&Message::error(ErrorCode::InvalidRange, why)).await?;
                        return Ok(Flow::Continue);
                    }
                    if next_offset >= end {
                        break;
                    }
                }
                Message::ChunkAck { .. } => debug!("ack for another transfer; ignoring"),
                Message::Cancel { transfer_id } if transfer_id == id => {
                    transfer.abort();
                    debug!(name = %transfer.name(), acked = transfer.acked(), "transfer cancelled by client");
                    return Ok(Flow::Continue);
                }
                Message::Ping => {
                    let revision = transfer.revision();
                    conn.send(&Message::Pong { revision }).await?;
                }
                Message::Bye => return Ok(Flow::Close("peer said bye")),
                _ => {
                    conn.send(&Message::error(ErrorCode::MalformedFrame, "unexpected message during transfer"),
                    )
                    .await?;
                }
            }
        }
    }

    conn.send(&Message::TransferEnd {
            transfer_id: id,
            content_hash: transfer.content_hash(),
            bytes_sent: transfer.bytes_sent(),
            sent_digest: transfer.sent_digest(),
        },
    )
    .await?;
    Ok(Flow::Continue)
}

/// A client connection. Incoming bytes are buffered across reads so a timeout
/// or cancellation never loses part of a frame.
pub(crate) struct Conn {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Conn {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    /// Next message. Ok(None) on a clean close between frames.
    async fn recv(&mut self) -> Result<Option<Message>, ReadError> {
        loop {
            match decode_frame(&self.buf) {
                Ok((msg, used)) => {
                    self.buf.drain(..used);
                    return Ok(Some(msg));
                }
                Err(FrameDecodeError::NeedMore) => {}
                Err(e) => return Err(ReadError::Malformed(e.to_string())),
            }
            let mut tmp = [0u8; 16 * 1024];
            let n = self.stream.read(&mut tmp).await.map_err(ReadError::Io)?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ReadError::Io(io::ErrorKind::UnexpectedEof.into()));
            }
            self.buf.extend_from_slice(&tmp[..n]);
        }
    }

    async fn send(&mut self, msg: &Message) -> io::Result<()> {
        let frame = encode_frame(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::Engine;
    use stagehand_core::archive::{ArchiveReader, ArchiveStatus};
    use stagehand_core::integrity::{self, ContentHash};
    use stagehand_core::selection::Selection;

    struct Client {
        conn: Conn,
    }

    struct Received {
        start: Message,
        bytes: Vec<u8>,
        end: Message,
    }

    impl Client {
        async fn connect(engine: &Engine) -> (Self, Message) {
            let stream = TcpStream::connect(engine.stream_addr()).await.unwrap();
            let mut client = Client {
                conn: Conn::new(stream),
            };
            let welcome = client
                .hello(PROTOCOL_VERSION, PROTOCOL_VERSION)
                .await;
            (client, welcome)
        }

        async fn hello(&mut self, min_version: u16, max_version: u16) -> Message {
            self.send(Message::Hello {
                min_version,
                max_version,
                client: "test-device".into(),
            })
            .await;
            self.recv().await
        }

        async fn send(&mut self, msg: Message) {
            self.conn.send(&msg).await.unwrap();
        }

        async fn recv(&mut self) -> Message {
            match self.conn.recv().await {
                Ok(Some(m)) => m,
                Ok(None) => panic!("connection closed"),
                Err(_) => panic!("bad frame from server"),
            }
        }

        /// Receive a whole transfer, acknowledging every chunk.
        async fn receive(&mut self) -> Result<Received, Message> {
            let start = self.recv().await;
            let Message::TransferStart { transfer_id, offset, .. } = start else {
                return Err(start);
            };
            let mut bytes = Vec::new();
            let mut expected = offset;
            loop {
                match self.recv().await {
                    Message::Chunk {
                        offset,
                        checksum,
                        payload,
                        ..
                    } => {
                        assert_eq!(offset, expected, "chunks arrive in order");
                        assert!(integrity::verify_chunk(&payload, &checksum));
                        expected += payload.len() as u64;
                        bytes.extend_from_slice(&payload);
                        self.send(Message::ChunkAck {
                            transfer_id,
                            next_offset: expected,
                        })
                        .await;
                    }
                    end @ Message::TransferEnd { .. } => return Ok(Received { start, bytes, end }),
                    other => return Err(other),
                }
            }
        }

        async fn get_item(&mut self, path: &str) -> Result<Received, Message> {
            self.send(Message::GetItem {
                path: path.into(),
                offset: 0,
                expected_hash: None,
            })
            .await;
            self.receive().await
        }

        async fn get_archive(&mut self, selection: Selection) -> Result<Received, Message> {
            self.send(Message::GetArchive {
                selection,
                offset: 0,
                expected_hash: None,
            })
            .await;
            self.receive().await
        }
    }

    fn body(n: usize, tag: u8) -> Vec<u8> {
        (0..n).map(|i| (i as u8).wrapping_mul(13) ^ tag).collect()
    }

    async fn engine(cook: &std::path::Path, tweak: impl FnOnce(&mut Config)) -> Engine {
        let mut cfg = Config {
            bind_addr: "127.0.0.1".into(),
            stream_port: 0,
            control_port: 0,
            cook_root: cook.to_path_buf(),
            chunk_size: 4096,
            ..Config::default()
        };
        tweak(&mut cfg);
        Engine::start(cfg).await.unwrap()
    }

    fn write(root: &std::path::Path, rel: &str, data: &[u8]) {
        std::fs::write(root.join(rel), data).unwrap();
    }

    fn code_of(msg: &Message) -> Option<ErrorCode> {
        match msg {
            Message::Error { code, .. } => Some(*code),
            _ => None,
        }
    }

    #[tokio::test]
    async fn two_revision_archive_scenario() {
        let cook = tempfile::tempdir().unwrap();
        let a = body(40_000, 1);
        write(cook.path(), "a.pak", &a);
        write(cook.path(), "b.pak", &body(30_000, 2));
        let engine = engine(cook.path(), |_| {}).await;
        assert_eq!(engine.stager().stage(&["a.pak", "b.pak"]).unwrap().revision, 1);

        let (mut client, welcome) = Client::connect(&engine).await;
        assert!(matches!(welcome, Message::Welcome { version: PROTOCOL_VERSION, revision: 1, .. }));
        let sel = Selection::paths(["a.pak", "b.pak"]);

        let first = client.get_archive(sel.clone()).await.ok().unwrap();
        let Message::TransferStart { archive_id: Some(first_id), revision: 1, .. } = first.start else {
            panic!("expected archive transfer at revision 1");
        };
        let Message::TransferEnd { content_hash, sent_digest, .. } = first.end else {
            unreachable!()
        };
        assert_eq!(ContentHash::of(&first.bytes), content_hash);
        assert_eq!(sent_digest, *content_hash.as_bytes());

        let b2 = body(30_000, 9);
        write(cook.path(), "b.pak", &b2);
        assert_eq!(engine.stager().stage(&["b.pak"]).unwrap().revision, 2);

        let second = client.get_archive(sel).await.ok().unwrap();
        let Message::TransferStart { archive_id: Some(second_id), revision: 2, .. } = second.start else {
            panic!("expected archive transfer at revision 2");
        };
        assert_ne!(first_id, second_id);

        let r1 = ArchiveReader::parse(&first.bytes).unwrap();
        let r2 = ArchiveReader::parse(&second.bytes).unwrap();
        assert_eq!(
            r1.stored_bytes(r1.entry("a.pak").unwrap()),
            r2.stored_bytes(r2.entry("a.pak").unwrap())
        );
        assert_eq!(r2.extract("a.pak").unwrap(), a);
        assert_eq!(r2.extract("b.pak").unwrap(), b2);

        let builder = engine.sessions().builder();
        assert_eq!(builder.get(&second_id).unwrap().encoded_paths(), &["b.pak".to_string()]);
        assert_eq!(builder.status_of(&first_id), Some(ArchiveStatus::Stale));
        client.send(Message::Bye).await;
        engine.stop().await;
    }

    #[tokio::test]
    async fn disconnect_mid_transfer_then_fresh_client() {
        let cook = tempfile::tempdir().unwrap();
        let data = body(64 * 1024, 3);
        write(cook.path(), "level.umap", &data);
        let engine = engine(cook.path(), |_| {}).await;
        engine.stager().stage(&["level.umap"]).unwrap();

        let (mut client, _) = Client::connect(&engine).await;
        client
            .send(Message::GetItem {
                path: "level.umap".into(),
                offset: 0,
                expected_hash: None,
            })
            .await;
        let Message::TransferStart { transfer_id, total_len, .. } = client.recv().await else {
            panic!("expected transfer start");
        };
        let mut received = 0;
        while received < total_len / 2 {
            let Message::Chunk { payload, .. } = client.recv().await else {
                panic!("expected chunk");
            };
            received += payload.len() as u64;
            client
                .send(Message::ChunkAck {
                    transfer_id,
                    next_offset: received,
                })
                .await;
        }
        drop(client);

        // The server notices the close and releases the session.
        for _ in 0..100 {
            if engine.sessions().session_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(engine.sessions().session_count(), 0);

        let (mut fresh, _) = Client::connect(&engine).await;
        let got = fresh.get_item("level.umap").await.ok().unwrap();
        assert!(matches!(got.start, Message::TransferStart { offset: 0, .. }));
        assert_eq!(got.bytes, data);
        engine.stop().await;
    }

    #[tokio::test]
    async fn resume_and_content_changed() {
        let cook = tempfile::tempdir().unwrap();
        let data = body(20_000, 4);
        write(cook.path(), "tex.uasset", &data);
        let engine = engine(cook.path(), |_| {}).await;
        engine.stager().stage(&["tex.uasset"]).unwrap();
        let hash = ContentHash::of(&data);

        let (mut client, _) = Client::connect(&engine).await;
        client
            .send(Message::GetItem {
                path: "tex.uasset".into(),
                offset: 8192,
                expected_hash: Some(hash),
            })
            .await;
        let resumed = client.receive().await.ok().unwrap();
        assert_eq!(resumed.bytes, &data[8192..]);
        let Message::TransferEnd { bytes_sent, sent_digest, .. } = resumed.end else {
            unreachable!()
        };
        assert_eq!(bytes_sent, (data.len() - 8192) as u64);
        assert_eq!(sent_digest, integrity::hash_chunk(&data[8192..]));

        write(cook.path(), "tex.uasset", &body(20_000, 5));
        engine.stager().stage(&["tex.uasset"]).unwrap();
        client
            .send(Message::GetItem {
                path: "tex.uasset".into(),
                offset: 8192,
                expected_hash: Some(hash),
            })
            .await;
        let err = client.receive().await.err().unwrap();
        assert_eq!(code_of(&err), Some(ErrorCode::ContentChanged));

        client
            .send(Message::GetItem {
                path: "tex.uasset".into(),
                offset: 50_000,
                expected_hash: Some(ContentHash::of(&body(20_000, 5))),
            })
            .await;
        let err = client.receive().await.err().unwrap();
        assert_eq!(code_of(&err), Some(ErrorCode::InvalidRange));

        let err = client.get_item("nope.uasset").await.err().unwrap();
        assert_eq!(code_of(&err), Some(ErrorCode::NotFound));
        engine.stop().await;
    }

    #[tokio::test]
    async fn unsupported_version_is_refused_before_content() {
        let cook = tempfile::tempdir().unwrap();
        let engine = engine(cook.path(), |_| {}).await;
        let stream = TcpStream::connect(engine.stream_addr()).await.unwrap();
        let mut client = Client {
            conn: Conn::new(stream),
        };
        let reply = client.hello(PROTOCOL_VERSION + 1, PROTOCOL_VERSION + 4).await;
        assert_eq!(code_of(&reply), Some(ErrorCode::UnsupportedProtocol));
        assert!(matches!(client.conn.recv().await, Ok(None)));
        assert_eq!(engine.sessions().session_count(), 0);
        engine.stop().await;
    }

    #[tokio::test]
    async fn malformed_frame_closes_connection() {
        let cook = tempfile::tempdir().unwrap();
        let engine = engine(cook.path(), |_| {}).await;
        let (mut client, _) = Client::connect(&engine).await;
        client.conn.stream.write_all(&3u32.to_le_bytes()).await.unwrap();
        client.conn.stream.write_all(&[0xff, 0xff, 0xff]).await.unwrap();
        let reply = client.recv().await;
        assert_eq!(code_of(&reply), Some(ErrorCode::MalformedFrame));
        assert!(matches!(client.conn.recv().await, Ok(None)));
        engine.stop().await;
    }

    #[tokio::test]
    async fn missing_ack_resends_from_last_acknowledged_offset() {
        let cook = tempfile::tempdir().unwrap();
        let data = body(10_000, 6);
        write(cook.path(), "a.bin", &data);
        let engine = engine(cook.path(), |c| {
            c.ack_timeout_secs = 1;
            c.max_resume_attempts = 1;
        })
        .await;
        engine.stager().stage(&["a.bin"]).unwrap();

        let (mut client, _) = Client::connect(&engine).await;
        client
            .send(Message::GetItem {
                path: "a.bin".into(),
                offset: 0,
                expected_hash: None,
            })
            .await;
        let Message::TransferStart { transfer_id, .. } = client.recv().await else {
            panic!("expected transfer start");
        };
        // Swallow the first chunk without acknowledging it.
        let Message::Chunk { offset: 0, .. } = client.recv().await else {
            panic!("expected first chunk");
        };
        let mut out = Vec::new();
        loop {
            match client.recv().await {
                Message::Chunk { offset, payload, .. } => {
                    assert_eq!(offset, out.len() as u64);
                    out.extend_from_slice(&payload);
                    client
                        .send(Message::ChunkAck {
                            transfer_id,
                            next_offset: out.len() as u64,
                        })
                        .await;
                }
                Message::TransferEnd { sent_digest, .. } => {
                    assert_eq!(sent_digest, integrity::hash_chunk(&data));
                    break;
                }
                other => panic!("unexpected {:?}", code_of(&other)),
            }
        }
        assert_eq!(out, data);

        // Never acknowledging exhausts the single resume attempt.
        client
            .send(Message::GetItem {
                path: "a.bin".into(),
                offset: 0,
                expected_hash: None,
            })
            .await;
        let mut aborted = false;
        for _ in 0..4 {
            let msg = client.recv().await;
            if code_of(&msg) == Some(ErrorCode::TransferAborted) {
                aborted = true;
                break;
            }
        }
        assert!(aborted);
        engine.stop().await;
    }

    #[tokio::test]
    async fn list_and_ping() {
        let cook = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(cook.path().join("Maps")).unwrap();
        write(cook.path(), "Maps/a.umap", b"aaaa");
        write(cook.path(), "Game.ini", b"ini");
        let engine = engine(cook.path(), |_| {}).await;
        engine.stager().stage(&["Maps", "Game.ini"]).unwrap();

        let (mut client, _) = Client::connect(&engine).await;
        client.send(Message::List { prefix: "Maps/".into() }).await;
        let Message::Listing { revision, entries } = client.recv().await else {
            panic!("expected listing");
        };
        assert_eq!(revision, 1);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "Maps/a.umap");

        client.send(Message::Ping).await;
        assert_eq!(client.recv().await, Message::Pong { revision: 1 });
        engine.stop().await;
    }

    #[tokio::test]
    async fn idle_connections_are_dropped() {
        let cook = tempfile::tempdir().unwrap();
        let engine = engine(cook.path(), |c| c.idle_timeout_secs = 1).await;
        let (mut client, _) = Client::connect(&engine).await;
        let closed = tokio::time::timeout(Duration::from_secs(5), client.conn.recv())
            .await
            .unwrap();
        assert!(matches!(closed, Ok(None)));
        engine.stop().await;
    }
}

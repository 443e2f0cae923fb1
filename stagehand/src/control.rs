//! HTTP control endpoint: the editor's command layer stages, invalidates and
//! builds through here. One request per connection, JSON in and out.

use std::io;
use std::time::Duration;

use serde::Deserialize;
use stagehand_core::command::{parse_path_list, Command, CommandError, CommandExecutor, CommandResponse, FailureKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Largest accepted request (headers plus body).
const MAX_REQUEST: usize = 1024 * 1024;

const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the control endpoint until `shutdown`.
pub async fn serve(listener: TcpListener, executor: CommandExecutor, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            r = listener.accept() => r,
        };
        match accepted {
            Ok((stream, peer)) => {
                let executor = executor.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, executor).await {
                        debug!(%peer, error = %e, "control connection failed");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "control accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!("control listener stopped");
}

#[derive(Debug, PartialEq, Eq)]
struct Request {
    method: String,
    path: String,
    query: Option<String>,
    body_start: usize,
    content_length: usize,
}

enum Parsed {
    Complete(Request),
    Partial,
    Invalid,
}

/// Parse the request line and headers.
fn parse_request(buf: &[u8]) -> Parsed {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    let body_start = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Parsed::Partial,
        Err(_) => return Parsed::Invalid,
    };
    let (Some(method), Some(target)) = (req.method, req.path) else {
        return Parsed::Invalid;
    };
    let mut content_length = 0;
    for h in req.headers.iter() {
        if h.name.eq_ignore_ascii_case("Content-Length") {
            match std::str::from_utf8(h.value).ok().and_then(|v| v.trim().parse().ok()) {
                Some(n) => content_length = n,
                None => return Parsed::Invalid,
            }
        }
    }
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p, Some(q.to_string())),
        None => (target, None),
    };
    let path = path.strip_prefix("/stagehand").unwrap_or(path);
    Parsed::Complete(Request {
        method: method.to_ascii_uppercase(),
        path: path.trim_end_matches('/').to_string(),
        query,
        body_start,
        content_length,
    })
}

/// Value of `key` in a query string, with `+` and `%XX` decoded.
fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        (k == key).then(|| percent_decode(v))
    })
}

fn percent_decode(s: &str) -> String {
    let spaced = s.replace('+', " ");
    String::from_utf8_lossy(&urlencoding::decode_binary(spaced.as_bytes())).into_owned()
}

async fn handle_client(mut stream: TcpStream, executor: CommandExecutor) -> io::Result<()> {
    let mut buf = Vec::with_capacity(4096);
    let mut tmp = [0u8; 8192];
    let req = loop {
        let n = tokio::time::timeout(READ_TIMEOUT, stream.read(&mut tmp))
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&tmp[..n]);
        match parse_request(&buf) {
            Parsed::Complete(req) => break req,
            Parsed::Partial if buf.len() < MAX_REQUEST => continue,
            _ => return write_reply(&mut stream, Reply::error(400, "BAD REQUEST", "malformed request")).await,
        }
    };
    let body_end = match req.body_start.checked_add(req.content_length) {
        Some(end) if end <= MAX_REQUEST => end,
        _ => return write_reply(&mut stream, Reply::error(413, "TOO LARGE", "request body too large")).await,
    };
    while buf.len() < body_end {
        let n = tokio::time::timeout(READ_TIMEOUT, stream.read(&mut tmp))
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&tmp[..n]);
    }
    let body = &buf[req.body_start..body_end];
    debug!(method = %req.method, path = %req.path, len = body.len(), "control request");
    let reply = dispatch(&req, body, &executor).await;
    write_reply(&mut stream, reply).await
}

/// `loadpak`-style mount body: JSON, or `pak_path,mount_point,pattern`.
#[derive(Deserialize)]
struct MountBody {
    pak_path: String,
    #[serde(default)]
    mount_point: String,
    #[serde(default)]
    pattern: Option<String>,
}

fn parse_mount(body: &[u8]) -> Result<Command, CommandError> {
    let parsed = match serde_json::from_slice::<MountBody>(body) {
        Ok(m) => m,
        Err(_) => {
            let text = String::from_utf8_lossy(body);
            let mut fields = text.trim().splitn(3, ',').map(|f| f.trim().to_string());
            let pak_path = fields
                .next()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| CommandError::BadRequest("missing pak_path".into()))?;
            MountBody {
                pak_path,
                mount_point: fields.next().unwrap_or_default(),
                pattern: fields.next().filter(|p| !p.is_empty()),
            }
        }
    };
    Ok(Command::Mount {
        pak_path: parsed.pak_path,
        mount_point: parsed.mount_point,
        pattern: parsed.pattern.unwrap_or_else(|| "*".to_string()),
    })
}

#[derive(Deserialize, Default)]
struct ArchiveBody {
    #[serde(default)]
    paths: Vec<String>,
    #[serde(default)]
    pattern: Option<String>,
}

fn parse_archive(body: &[u8]) -> Result<Command, CommandError> {
    let parsed = if body.iter().all(u8::is_ascii_whitespace) {
        ArchiveBody::default()
    } else if body.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'{') {
        serde_json::from_slice(body).map_err(|e| CommandError::BadRequest(e.to_string()))?
    } else {
        ArchiveBody {
            paths: parse_path_list(body)?,
            pattern: None,
        }
    };
    Ok(Command::BuildArchive {
        paths: parsed.paths,
        pattern: parsed.pattern,
    })
}

/// Map a request onto a command.
fn route(req: &Request, body: &[u8]) -> Result<Option<Command>, CommandError> {
    let cmd = match (req.method.as_str(), req.path.as_str()) {
        ("POST", "/stage") => Command::Stage {
            paths: parse_path_list(body)?,
        },
        ("POST", "/invalidate") => Command::Invalidate {
            paths: parse_path_list(body)?,
        },
        ("POST", "/mount") | ("POST", "/loadpak") => parse_mount(body)?,
        ("GET", "/list") | ("GET", "/list_assets") => Command::ListCurrent {
            prefix: query_param(req.query.as_deref(), "prefix").unwrap_or_default(),
        },
        ("POST", "/archive") | ("POST", "/build") => parse_archive(body)?,
        ("GET", "/status") => Command::Status,
        ("GET", "/idle") | ("GET", "/assets_idle") => Command::Idle,
        ("POST", "/command") => Command::from_json(body)?,
        _ => return Ok(None),
    };
    Ok(Some(cmd))
}

async fn dispatch(req: &Request, body: &[u8], executor: &CommandExecutor) -> Reply {
    let cmd = match route(req, body) {
        Ok(Some(cmd)) => cmd,
        Ok(None) => return Reply::error(404, "NOT FOUND", "no such endpoint"),
        Err(e) => return Reply::failure(&e),
    };
    match executor.execute(cmd).await {
        Ok(resp @ CommandResponse::Idle { idle: false, .. }) => Reply::json(416, "TRY AGAIN", &resp),
        Ok(resp) => Reply::json(200, "OK", &resp),
        Err(e) => Reply::failure(&e),
    }
}

#[derive(Debug)]
struct Reply {
    status: u16,
    reason: &'static str,
    body: Vec<u8>,
}

impl Reply {
    fn json<T: serde::Serialize>(status: u16, reason: &'static str, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Reply { status, reason, body },
            Err(e) => Reply::error(501, "ERROR", &e.to_string()),
        }
    }

    fn error(status: u16, reason: &'static str, message: &str) -> Self {
        let body = serde_json::json!({ "error": message }).to_string().into_bytes();
        Reply { status, reason, body }
    }

    fn failure(err: &CommandError) -> Self {
        let (status, reason) = match err.kind() {
            FailureKind::BadEntity => (422, "BAD ENTITY"),
            FailureKind::BadAction => (500, "BAD ACTION"),
            FailureKind::Internal => (501, "ERROR"),
        };
        debug!(status, error = %err, "command failed");
        Reply::error(status, reason, &err.to_string())
    }
}

async fn write_reply(stream: &mut TcpStream, reply: Reply) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        reply.status,
        reply.reason,
        reply.body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&reply.body).await?;
    stream.flush().await?;
    stream.shutdown().await
}

//! Unix socket server for state access
//!
//! Newline-delimited JSON requests (`pb_protocol::RequestEnvelope`), one
//! response line per request. Writes arrive as unacknowledged commands and
//! reach the GPIO lifecycle through the store's command stream.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use pb_core::{MemoryStore, StateStore};
use pb_protocol::{Request, RequestEnvelope, Response, ResponseEnvelope};

// ============================================================================
// Limits
// ============================================================================

/// Maximum concurrent client connections
const MAX_CONNECTIONS: usize = 16;

/// Maximum message size in bytes
const MAX_MESSAGE_SIZE: usize = pb_protocol::MAX_MESSAGE_SIZE;

/// Read timeout per message
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Write timeout per message
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Owner and group (home-automation clients) may connect
const SOCKET_MODE: u32 = 0o660;

static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

async fn read_line_bounded<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    out: &mut Vec<u8>,
    max_len: usize,
) -> std::io::Result<usize> {
    out.clear();

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(0);
        }

        let (take_len, found_newline) = match available.iter().position(|b| *b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };

        if take_len > max_len.saturating_sub(out.len()) {
            let consume_len = max_len.saturating_sub(out.len()).min(available.len());
            reader.consume(consume_len);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Message too large",
            ));
        }

        out.extend_from_slice(&available[..take_len]);
        reader.consume(take_len);

        if found_newline {
            return Ok(out.len());
        }
    }
}

pub async fn run_server(
    socket_path: &str,
    store: Arc<MemoryStore>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let path = Path::new(socket_path);

    // Remove a stale socket, but never follow a symlink
    if path.exists() {
        let metadata = path.symlink_metadata()?;
        if metadata.file_type().is_symlink() {
            anyhow::bail!("Socket path {} is a symlink, refusing to remove it", socket_path);
        }
        std::fs::remove_file(path)?;
        debug!("Removed existing socket file");
    }

    let listener = UnixListener::bind(socket_path)?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))?;

    info!("Listening on {} (mode {:o})", socket_path, SOCKET_MODE);
    info!("Limits: max_conn={}, max_msg={}", MAX_CONNECTIONS, MAX_MESSAGE_SIZE);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let current = ACTIVE_CONNECTIONS.load(Ordering::SeqCst);
                        if current >= MAX_CONNECTIONS {
                            warn!("Connection limit reached ({}), rejecting new connection", current);
                            drop(stream);
                            continue;
                        }

                        ACTIVE_CONNECTIONS.fetch_add(1, Ordering::SeqCst);
                        let store = store.clone();
                        tokio::spawn(async move {
                            handle_client(stream, store).await;
                            ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("Server shutting down");
                break;
            }
        }
    }

    let _ = std::fs::remove_file(socket_path);
    info!("Server stopped");
    Ok(())
}

async fn handle_client(stream: UnixStream, store: Arc<MemoryStore>) {
    let (uid, pid) = match stream.peer_cred() {
        Ok(cred) => (cred.uid(), cred.pid()),
        Err(e) => {
            error!("Failed to get peer credentials, rejecting connection: {}", e);
            return;
        }
    };
    debug!(uid, ?pid, "Client connected");

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line: Vec<u8> = Vec::with_capacity(MAX_MESSAGE_SIZE);
    let mut request_count: u64 = 0;
    let connection_start = Instant::now();

    loop {
        let read_result = timeout(
            READ_TIMEOUT,
            read_line_bounded(&mut reader, &mut line, MAX_MESSAGE_SIZE),
        )
        .await;

        match read_result {
            Ok(Ok(0)) => {
                debug!(
                    uid, requests = request_count, duration = ?connection_start.elapsed(),
                    "Client disconnected"
                );
                break;
            }
            Ok(Ok(n)) => {
                request_count += 1;
                trace!("Request #{} from uid={}: {} bytes", request_count, uid, n);

                let response = match std::str::from_utf8(&line) {
                    Ok(text) => process_request(text, uid, store.as_ref()).await,
                    Err(_) => ResponseEnvelope::new(0, Response::error("Invalid request encoding")),
                };

                if send_response(&mut writer, &response).await.is_err() {
                    break;
                }
            }
            Ok(Err(e)) => {
                if e.kind() == std::io::ErrorKind::InvalidData {
                    warn!(uid, "Message too large (>{} bytes)", MAX_MESSAGE_SIZE);
                    let response = ResponseEnvelope::new(0, Response::error("Message too large"));
                    let _ = send_response(&mut writer, &response).await;
                } else {
                    error!(uid, error = %e, "Read error");
                }
                break;
            }
            Err(_) => {
                debug!(uid, "Read timeout");
                break;
            }
        }
    }
}

async fn send_response(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    response: &ResponseEnvelope,
) -> Result<(), ()> {
    let json = serde_json::to_string(response).unwrap_or_else(|_| {
        r#"{"id":0,"status":"error","message":"Serialization error"}"#.to_string()
    });

    let write_result = timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        Ok::<_, std::io::Error>(())
    })
    .await;

    match write_result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("Write error: {}", e);
            Err(())
        }
        Err(_) => {
            error!("Write timeout");
            Err(())
        }
    }
}

pub(crate) async fn process_request(line: &str, uid: u32, store: &MemoryStore) -> ResponseEnvelope {
    let envelope: RequestEnvelope = match serde_json::from_str(line.trim()) {
        Ok(e) => e,
        Err(e) => {
            debug!(uid, error = %e, "Invalid request");
            return ResponseEnvelope::new(0, Response::error("Invalid request format"));
        }
    };

    let id = envelope.id;
    let request = envelope.request;

    if let Err(e) = request.validate() {
        warn!(uid, request = request.type_name(), "Request validation failed: {}", e);
        return ResponseEnvelope::new(id, Response::error(e));
    }

    debug!(uid, id, request = request.type_name(), "Processing request");

    let response = match request {
        Request::Ping => Response::ok_string("pong"),

        Request::Version => Response::ok_string(env!("CARGO_PKG_VERSION")),

        Request::GetState { path } => match store.get_state(&path).await {
            Ok(Some(state)) => Response::ok_state(state.snapshot(&path)),
            Ok(None) => Response::error(format!("Unknown state: {}", path)),
            Err(e) => Response::error(e.to_string()),
        },

        Request::SetState { path, value } => {
            info!(uid, path = %path, value = %value, "External write");
            match store.command(&path, value) {
                Ok(()) => Response::ok(),
                Err(e) => Response::error(e.to_string()),
            }
        }

        Request::ListStates { prefix } => {
            let prefix = prefix.unwrap_or_else(pb_core::paths::namespace_prefix);
            match store.list_objects(&prefix).await {
                Ok(paths) => Response::ok_paths(paths),
                Err(e) => Response::error(e.to_string()),
            }
        }
    };

    ResponseEnvelope::new(id, response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pb_core::store::{ObjectDescriptor, ValueType};
    use pb_protocol::{ResponseData, StateValue};

    async fn store_with_switch() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .ensure_object(
                "gpio.5.state",
                ObjectDescriptor::state("GPIO 5", "switch", ValueType::Boolean, false, true),
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_ping() {
        let store = MemoryStore::new();
        let resp = process_request(r#"{"id":1,"cmd":"Ping"}"#, 0, &store).await;
        assert_eq!(resp.id, 1);
        assert!(matches!(resp.response, Response::Ok(ResponseData { value: Some(ref v), .. }) if v == "pong"));
    }

    #[tokio::test]
    async fn test_set_state_emits_command() {
        let store = store_with_switch().await;
        let mut commands = store.take_commands().unwrap();

        let resp = process_request(
            r#"{"id":2,"cmd":"SetState","data":{"path":"gpio.5.state","value":"true"}}"#,
            0,
            &store,
        )
        .await;
        assert!(matches!(resp.response, Response::Ok(_)));

        let cmd = commands.try_recv().unwrap();
        assert_eq!(cmd.path, "gpio.5.state");
        assert_eq!(cmd.value, StateValue::Text("true".into()));
    }

    #[tokio::test]
    async fn test_get_state() {
        let store = store_with_switch().await;
        store.set_state("gpio.5.state", true.into(), true).await.unwrap();

        let resp = process_request(
            r#"{"id":3,"cmd":"GetState","data":{"path":"gpio.5.state"}}"#,
            0,
            &store,
        )
        .await;
        match resp.response {
            Response::Ok(data) => {
                let state = data.state.unwrap();
                assert_eq!(state.val, Some(StateValue::Bool(true)));
                assert!(state.ack);
            }
            Response::Error { message } => panic!("unexpected error: {}", message),
        }
    }

    #[tokio::test]
    async fn test_rejects_foreign_path() {
        let store = MemoryStore::new();
        let resp = process_request(
            r#"{"id":4,"cmd":"GetState","data":{"path":"system.host"}}"#,
            0,
            &store,
        )
        .await;
        assert_eq!(resp.id, 4);
        assert!(matches!(resp.response, Response::Error { .. }));
    }

    #[tokio::test]
    async fn test_invalid_json() {
        let store = MemoryStore::new();
        let resp = process_request("{ nope", 0, &store).await;
        assert_eq!(resp.id, 0);
        assert!(matches!(resp.response, Response::Error { .. }));
    }

    #[tokio::test]
    async fn test_list_states_default_prefix() {
        let store = store_with_switch().await;
        let resp = process_request(r#"{"id":5,"cmd":"ListStates","data":{}}"#, 0, &store).await;
        match resp.response {
            Response::Ok(data) => assert_eq!(data.paths.unwrap(), vec!["gpio.5.state"]),
            Response::Error { message } => panic!("unexpected error: {}", message),
        }
    }

    #[tokio::test]
    async fn test_read_line_bounded_limit() {
        let data = vec![b'a'; 64];
        let mut reader = BufReader::new(&data[..]);
        let mut out = Vec::new();
        assert!(read_line_bounded(&mut reader, &mut out, 16).await.is_err());

        let mut reader = BufReader::new(&b"{\"id\":1}\nrest"[..]);
        assert_eq!(read_line_bounded(&mut reader, &mut out, 16).await.unwrap(), 9);
    }
}

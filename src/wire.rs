//! Newline-delimited JSON protocol. One request object per line, one reply
//! per request, in order. Notifications for listened resources are pushed
//! between replies.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use ulid::Ulid;

use crate::auth::PasswordAuth;
use crate::engine::{Engine, EngineError};
use crate::limits::MAX_FRAME_LEN;
use crate::model::*;
use crate::tenant::TenantManager;

/// Pushed notifications buffered per connection before forwarders wait.
const NOTIFY_BUFFER: usize = 256;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Hello {
        database: String,
        password: String,
    },
    CreateResource {
        id: ResourceId,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        capacity: Option<u32>,
    },
    Reserve(ReserveRequest),
    Cancel {
        allocation_id: Ulid,
        requester_id: RequesterId,
    },
    GetResource {
        resource_id: ResourceId,
    },
    AvailableCapacity {
        resource_id: ResourceId,
    },
    ListActive {
        requester_id: RequesterId,
        resource_id: ResourceId,
    },
    ListAllocations {
        requester_id: RequesterId,
    },
    GetAllocation {
        allocation_id: Ulid,
    },
    Listen {
        resource_id: ResourceId,
    },
    Unlisten {
        resource_id: ResourceId,
    },
}

impl Request {
    fn op(&self) -> &'static str {
        match self {
            Request::Hello { .. } => "hello",
            Request::CreateResource { .. } => "create_resource",
            Request::Reserve(_) => "reserve",
            Request::Cancel { .. } => "cancel",
            Request::GetResource { .. } => "get_resource",
            Request::AvailableCapacity { .. } => "available_capacity",
            Request::ListActive { .. } => "list_active",
            Request::ListAllocations { .. } => "list_allocations",
            Request::GetAllocation { .. } => "get_allocation",
            Request::Listen { .. } => "listen",
            Request::Unlisten { .. } => "unlisten",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Ok(Value),
    Error(ErrorBody),
    Notification { resource_id: ResourceId, event: Event },
}

impl Reply {
    fn error(kind: &'static str, message: impl Into<String>) -> Self {
        Reply::Error(ErrorBody {
            kind,
            message: message.into(),
            retryable: false,
        })
    }
}

impl From<&EngineError> for Reply {
    fn from(e: &EngineError) -> Self {
        Reply::Error(ErrorBody {
            kind: e.kind(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        })
    }
}

fn codec_err(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "frame too long")
        }
    }
}

async fn send_reply<S>(framed: &mut Framed<S, LinesCodec>, reply: &Reply) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = serde_json::to_string(reply)?;
    framed.send(line).await.map_err(codec_err)
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::TaskFailed(e.to_string()))
}

// ── Listen/unlisten ──────────────────────────────────────────────

/// Per-connection subscriptions. Each listened resource has a forwarder task
/// copying its broadcast events into the connection's outbound queue.
struct Listeners {
    tasks: HashMap<ResourceId, JoinHandle<()>>,
    tx: mpsc::Sender<Reply>,
}

impl Listeners {
    fn new(tx: mpsc::Sender<Reply>) -> Self {
        Self {
            tasks: HashMap::new(),
            tx,
        }
    }

    fn listen(&mut self, resource_id: ResourceId, rx: broadcast::Receiver<Event>) {
        if self.tasks.contains_key(&resource_id) {
            return;
        }
        let handle = tokio::spawn(forward(rx, resource_id.clone(), self.tx.clone()));
        self.tasks.insert(resource_id, handle);
    }

    fn unlisten(&mut self, resource_id: &str) -> bool {
        match self.tasks.remove(resource_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for Listeners {
    fn drop(&mut self) {
        for handle in self.tasks.values() {
            handle.abort();
        }
    }
}

async fn forward(mut rx: broadcast::Receiver<Event>, resource_id: ResourceId, tx: mpsc::Sender<Reply>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let note = Reply::Notification {
                    resource_id: resource_id.clone(),
                    event,
                };
                if tx.send(note).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("listener on {resource_id} lagged, {n} notifications dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ── Request execution ────────────────────────────────────────────

async fn execute(engine: &Arc<Engine>, request: Request, listeners: &mut Listeners) -> Result<Value, EngineError> {
    match request {
        Request::Hello { .. } => Err(EngineError::InvalidRequest("already authenticated".into())),
        Request::CreateResource { id, name, capacity } => {
            engine.create_resource(id.clone(), name, capacity).await?;
            Ok(json!({ "id": id }))
        }
        Request::Reserve(req) => to_json(&engine.reserve(req).await?),
        Request::Cancel {
            allocation_id,
            requester_id,
        } => to_json(&engine.cancel(allocation_id, requester_id).await?),
        Request::GetResource { resource_id } => to_json(&engine.get(&resource_id).await?),
        Request::AvailableCapacity { resource_id } => {
            let available = engine.available_capacity(&resource_id).await?;
            Ok(json!({ "resource_id": resource_id, "available": available }))
        }
        Request::ListActive {
            requester_id,
            resource_id,
        } => to_json(&engine.list_active(&requester_id, &resource_id).await?),
        Request::ListAllocations { requester_id } => {
            to_json(&engine.list_for_requester(&requester_id).await?)
        }
        Request::GetAllocation { allocation_id } => to_json(&engine.get_allocation(allocation_id).await?),
        Request::Listen { resource_id } => {
            // Existence check, so a typo doesn't silently listen to nothing.
            engine.get(&resource_id).await?;
            let rx = engine.notify.subscribe(&resource_id);
            listeners.listen(resource_id.clone(), rx);
            Ok(json!({ "resource_id": resource_id, "listening": true }))
        }
        Request::Unlisten { resource_id } => {
            let was = listeners.unlisten(&resource_id);
            Ok(json!({ "resource_id": resource_id, "listening": false, "was_listening": was }))
        }
    }
}

async fn dispatch(engine: &Arc<Engine>, line: &str, listeners: &mut Listeners) -> Reply {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            metrics::counter!(crate::observability::REQUESTS_TOTAL, "op" => "unknown", "status" => "error")
                .increment(1);
            return Reply::error("bad_request", e.to_string());
        }
    };

    let op = request.op();
    let start = Instant::now();
    let result = execute(engine, request, listeners).await;
    metrics::histogram!(crate::observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(start.elapsed().as_secs_f64());
    let status = if result.is_ok() { "ok" } else { "error" };
    metrics::counter!(crate::observability::REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);

    match result {
        Ok(value) => Reply::Ok(value),
        Err(e) => {
            if e.is_retryable() {
                tracing::warn!("{op} failed: {e}");
            }
            Reply::from(&e)
        }
    }
}

// ── Connection lifecycle ─────────────────────────────────────────

/// Read the hello frame, check the password and resolve the tenant.
/// `None` means the connection should close; the client was already told why.
async fn handshake<S>(
    framed: &mut Framed<S, LinesCodec>,
    tenants: &TenantManager,
    auth: &PasswordAuth,
) -> io::Result<Option<Arc<Engine>>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = match framed.next().await {
        Some(line) => line.map_err(codec_err)?,
        None => return Ok(None),
    };
    let (database, password) = match serde_json::from_str::<Request>(&line) {
        Ok(Request::Hello { database, password }) => (database, password),
        Ok(_) => {
            send_reply(framed, &Reply::error("unauthorized", "expected hello")).await?;
            return Ok(None);
        }
        Err(e) => {
            send_reply(framed, &Reply::error("bad_request", e.to_string())).await?;
            return Ok(None);
        }
    };

    if !auth.verify(&password) {
        metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
        tracing::warn!("password authentication failed for database {database:?}");
        let reply = Reply::error("unauthorized", "password authentication failed");
        send_reply(framed, &reply).await?;
        return Ok(None);
    }

    let engine = match tenants.get_or_create(&database).await {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("tenant {database:?} unavailable: {e}");
            let reply = Reply::error("tenant_unavailable", format!("tenant error: {e}"));
            send_reply(framed, &reply).await?;
            return Ok(None);
        }
    };

    let ready = json!({ "database": database, "resources": engine.resource_count() });
    send_reply(framed, &Reply::Ok(ready)).await?;
    Ok(Some(engine))
}

/// Serve one client connection until it closes.
pub async fn process_connection<S>(socket: S, tenants: Arc<TenantManager>, password: String) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let auth = PasswordAuth::new(password);
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_FRAME_LEN));

    let Some(engine) = handshake(&mut framed, &tenants, &auth).await? else {
        return Ok(());
    };

    let (notify_tx, mut notify_rx) = mpsc::channel(NOTIFY_BUFFER);
    let mut listeners = Listeners::new(notify_tx);

    loop {
        tokio::select! {
            frame = framed.next() => {
                let line = match frame {
                    None => break,
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        // The codec skips to the next newline; the session survives.
                        send_reply(&mut framed, &Reply::error("bad_request", "frame too long")).await?;
                        continue;
                    }
                    Some(Err(LinesCodecError::Io(e))) => return Err(e),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = dispatch(&engine, &line, &mut listeners).await;
                send_reply(&mut framed, &reply).await?;
            }
            Some(note) = notify_rx.recv() => {
                send_reply(&mut framed, &note).await?;
            }
        }
    }
    Ok(())
}

//! Callback fabric: WebSocket client sessions and guest→client RPC routing.
//!
//! Each VM has at most one client session. Requests originating inside the
//! guest are assigned a correlation id, queued to the session's writer task,
//! and awaited against the matching response from the reader task. Slots are
//! unregistered on every exit path so `pending` never leaks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;

use sandcastle_core::error::{FleetError, Result};
use sandcastle_core::wire::{CallbackRequest, CallbackResponse};

/// Maximum inbound frame size.
pub const MAX_FRAME_SIZE: usize = 512 * 1024;

/// Time allowed to write one frame to the peer.
const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Read deadline; any inbound frame (pongs included) resets it.
const PONG_WAIT: Duration = Duration::from_secs(60);

/// Ping period. Must be shorter than the read deadline.
const PING_PERIOD: Duration = Duration::from_secs(54);

/// Outbound queue depth per session.
const OUTBOUND_QUEUE: usize = 256;

/// Default deadline for a callback round trip.
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Hook invoked after a session closes on its own (peer disconnect or read
/// failure), installed by the supervisor to destroy the session's VM.
pub type OnSessionClose = Arc<dyn Fn(&str) + Send + Sync>;

/// An active WebSocket session for one VM.
pub struct ClientSession {
    id: String,
    vm_name: String,
    outbound: mpsc::Sender<String>,
    done: watch::Sender<bool>,
    pending: Mutex<HashMap<String, oneshot::Sender<CallbackResponse>>>,
}

impl ClientSession {
    fn new(vm_name: &str) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (done_tx, _) = watch::channel(false);

        let session = Arc::new(Self {
            id: format!("{}-{}", vm_name, monotonic_ns()),
            vm_name: vm_name.to_string(),
            outbound: outbound_tx,
            done: done_tx,
            pending: Mutex::new(HashMap::new()),
        });
        (session, outbound_rx)
    }

    /// The session identifier (logged, not otherwise exposed).
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    /// Close the session. Pending callbacks fail with `SessionClosed`.
    pub fn close(&self) {
        let _ = self.done.send(true);
        // Dropping the senders fails every waiting round trip.
        self.pending.lock().unwrap().clear();
    }

    /// Resolves when the session closes.
    async fn closed(&self) {
        let mut rx = self.done.subscribe();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    /// Hand an inbound response to the waiting caller, if any.
    pub(crate) fn deliver(&self, resp: CallbackResponse) {
        let slot = self.pending.lock().unwrap().remove(&resp.id);
        match slot {
            Some(tx) => {
                if tx.send(resp).is_err() {
                    // Caller gave up (deadline or cancellation) after the
                    // response was already in flight.
                    tracing::warn!(session_id = %self.id, "Dropping late callback response");
                }
            }
            None => {
                tracing::warn!(
                    session_id = %self.id,
                    vm_name = %self.vm_name,
                    callback_id = %resp.id,
                    "Received response for unknown callback"
                );
            }
        }
    }

    /// Send one callback request and wait for its response.
    async fn send_callback(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        deadline: Duration,
    ) -> Result<serde_json::Value> {
        let id = format!("{}:{}", self.vm_name, monotonic_ns());
        let request = CallbackRequest {
            id: id.clone(),
            method: method.to_string(),
            params,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64,
        };

        let frame = serde_json::to_string(&request)?;
        if frame.len() > MAX_FRAME_SIZE {
            return Err(FleetError::Backpressure);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id.clone(), tx);
        // Unregisters the slot on every exit path below.
        let _slot = PendingSlot { session: self, id: &id };

        match self.outbound.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => return Err(FleetError::Backpressure),
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(FleetError::SessionClosed),
        }

        tokio::select! {
            resp = rx => match resp {
                Ok(resp) => {
                    if let Some(err) = resp.error {
                        return Err(FleetError::Internal(format!(
                            "callback error [{}]: {}",
                            err.code, err.message
                        )));
                    }
                    Ok(resp.result.unwrap_or(serde_json::Value::Null))
                }
                Err(_) => Err(FleetError::SessionClosed),
            },
            _ = self.closed() => Err(FleetError::SessionClosed),
            _ = tokio::time::sleep(deadline) => Err(FleetError::Timeout(format!(
                "callback '{}' not answered within {:?}",
                method, deadline
            ))),
        }
    }
}

/// Removes a pending slot when the round trip ends, however it ends.
struct PendingSlot<'a> {
    session: &'a ClientSession,
    id: &'a str,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.session.pending.lock().unwrap().remove(self.id);
    }
}

/// Registry of active client sessions, keyed by VM name.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<ClientSession>>>,
    on_close: Mutex<Option<OnSessionClose>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            on_close: Mutex::new(None),
        })
    }

    /// Install the session-close hook (wired to VM destroy by the
    /// supervisor). The registry only calls it; it does not know what it
    /// does.
    pub fn set_on_session_close(&self, hook: OnSessionClose) {
        *self.on_close.lock().unwrap() = Some(hook);
    }

    /// Register a new session for `vm_name`, closing any prior one first,
    /// and start its reader and writer tasks over `socket`.
    pub fn create_session(self: &Arc<Self>, vm_name: &str, socket: WebSocket) -> Arc<ClientSession> {
        let (session, outbound_rx) = self.install_session(vm_name);

        let (sink, stream) = socket.split();
        tokio::spawn(write_pump(session.clone(), sink, outbound_rx));
        tokio::spawn(read_pump(session.clone(), stream, self.clone()));

        tracing::info!(
            session_id = %session.id,
            vm_name = %vm_name,
            "Client session created"
        );
        session
    }

    /// Replace-and-register without transport pumps.
    pub(crate) fn install_session(
        &self,
        vm_name: &str,
    ) -> (Arc<ClientSession>, mpsc::Receiver<String>) {
        let (session, outbound_rx) = ClientSession::new(vm_name);

        let previous = self
            .sessions
            .lock()
            .unwrap()
            .insert(vm_name.to_string(), session.clone());

        if let Some(previous) = previous {
            tracing::info!(
                session_id = %previous.id,
                vm_name = %vm_name,
                "Closing existing session for VM"
            );
            previous.close();
        }

        (session, outbound_rx)
    }

    /// The session for `vm_name`, if one is active.
    pub fn get_session(&self, vm_name: &str) -> Option<Arc<ClientSession>> {
        self.sessions.lock().unwrap().get(vm_name).cloned()
    }

    /// Close and forget the session for `vm_name`. Does not fire the
    /// close hook; used by the destroy path itself.
    pub fn remove_session(&self, vm_name: &str) {
        let session = self.sessions.lock().unwrap().remove(vm_name);
        if let Some(session) = session {
            session.close();
        }
    }

    /// Number of active sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Called when a session's reader exits. Only unregisters (and fires the
    /// close hook for) the session that actually closed; a session replaced
    /// by a newer one must not tear the newer one down.
    fn finish_session(&self, session: &ClientSession) {
        let mut sessions = self.sessions.lock().unwrap();
        let still_registered = sessions
            .get(session.vm_name())
            .is_some_and(|current| current.id == session.id);
        if !still_registered {
            return;
        }
        sessions.remove(session.vm_name());
        drop(sessions);

        tracing::info!(
            session_id = %session.id,
            vm_name = %session.vm_name,
            "Client session closed"
        );

        let hook = self.on_close.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(session.vm_name());
        }
    }

    /// Route a guest-originated callback to the VM's client session and wait
    /// for the response. `deadline` defaults to
    /// [`DEFAULT_CALLBACK_TIMEOUT`].
    pub async fn route_callback(
        &self,
        vm_name: &str,
        method: &str,
        params: Option<serde_json::Value>,
        deadline: Option<Duration>,
    ) -> Result<serde_json::Value> {
        let session = self
            .get_session(vm_name)
            .ok_or_else(|| FleetError::NoSession(vm_name.to_string()))?;

        session
            .send_callback(method, params, deadline.unwrap_or(DEFAULT_CALLBACK_TIMEOUT))
            .await
    }
}

/// Pump inbound frames into pending slots until the peer goes away.
async fn read_pump(
    session: Arc<ClientSession>,
    mut stream: SplitStream<WebSocket>,
    registry: Arc<SessionRegistry>,
) {
    loop {
        let frame = match timeout(PONG_WAIT, stream.next()).await {
            Err(_) => {
                tracing::warn!(session_id = %session.id, "Read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::warn!(session_id = %session.id, error = %e, "WebSocket read error");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let payload = match frame {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            // Pings are answered by the transport; both kinds reset the
            // read deadline by reaching this point.
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => break,
        };

        if payload.len() > MAX_FRAME_SIZE {
            tracing::warn!(
                session_id = %session.id,
                size = payload.len(),
                "Dropping oversized frame"
            );
            continue;
        }

        match serde_json::from_slice::<CallbackResponse>(&payload) {
            Ok(resp) => session.deliver(resp),
            Err(e) => {
                tracing::warn!(
                    session_id = %session.id,
                    error = %e,
                    "Failed to parse callback response"
                );
            }
        }
    }

    session.close();
    registry.finish_session(&session);
}

/// Drain the outbound queue to the peer, pinging periodically.
async fn write_pump(
    session: Arc<ClientSession>,
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
) {
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; treat it as the session greeting.
    ping.tick().await;

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                match timeout(WRITE_WAIT, sink.send(Message::Text(frame))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
            _ = ping.tick() => {
                if timeout(WRITE_WAIT, sink.send(Message::Ping(Vec::new()))).await.is_err() {
                    break;
                }
            }
            _ = session.closed() => {
                let _ = timeout(WRITE_WAIT, sink.send(Message::Close(None))).await;
                break;
            }
        }
    }
}

fn monotonic_ns() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandcastle_core::wire::CallbackError;
    use serde_json::json;

    /// Drains the outbound queue and answers every request with `respond`.
    fn spawn_responder(
        session: Arc<ClientSession>,
        mut outbound: mpsc::Receiver<String>,
        respond: impl Fn(CallbackRequest) -> CallbackResponse + Send + 'static,
    ) {
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let req: CallbackRequest = serde_json::from_str(&frame).unwrap();
                session.deliver(respond(req));
            }
        });
    }

    #[tokio::test]
    async fn test_route_without_session_fails() {
        let registry = SessionRegistry::new();
        let err = registry
            .route_callback("ghost", "echo", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::NoSession(_)));
    }

    #[tokio::test]
    async fn test_round_trip_echoes_params() {
        let registry = SessionRegistry::new();
        let (session, outbound) = registry.install_session("alpha");
        spawn_responder(session.clone(), outbound, |req| CallbackResponse {
            id: req.id,
            result: req.params,
            error: None,
        });

        let result = registry
            .route_callback("alpha", "echo", Some(json!({"x": 1})), None)
            .await
            .unwrap();
        assert_eq!(result, json!({"x": 1}));
        assert!(session.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_error_response_preferred_over_result() {
        let registry = SessionRegistry::new();
        let (session, outbound) = registry.install_session("alpha");
        spawn_responder(session.clone(), outbound, |req| CallbackResponse {
            id: req.id,
            result: Some(json!({"ignored": true})),
            error: Some(CallbackError {
                code: -32601,
                message: "Method not found".to_string(),
            }),
        });

        let err = registry
            .route_callback("alpha", "nope", None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("-32601"));
        assert!(session.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_discards_slot() {
        let registry = SessionRegistry::new();
        let (session, _outbound) = registry.install_session("alpha");

        let err = registry
            .route_callback("alpha", "slow", None, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Timeout(_)));
        assert!(session.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_fails_inflight_callback() {
        let registry = SessionRegistry::new();
        let (session, _outbound) = registry.install_session("alpha");

        let closer = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close();
        });

        let err = registry
            .route_callback("alpha", "never", None, Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::SessionClosed));
        assert!(session.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_is_backpressure() {
        let registry = SessionRegistry::new();
        let (session, _outbound) = registry.install_session("alpha");

        // Fill the queue without a drain task.
        for _ in 0..OUTBOUND_QUEUE {
            session.outbound.try_send("{}".to_string()).unwrap();
        }

        let err = registry
            .route_callback("alpha", "echo", None, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Backpressure));
        assert!(session.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_request_is_backpressure() {
        let registry = SessionRegistry::new();
        let (_session, _outbound) = registry.install_session("alpha");

        let big = "x".repeat(MAX_FRAME_SIZE + 1);
        let err = registry
            .route_callback("alpha", "upload", Some(json!({ "blob": big })), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Backpressure));
    }

    #[tokio::test]
    async fn test_second_session_closes_first() {
        let registry = SessionRegistry::new();
        let (first, _rx1) = registry.install_session("alpha");
        let (second, _rx2) = registry.install_session("alpha");

        assert!(*first.done.borrow());
        assert!(!*second.done.borrow());
        assert_eq!(registry.session_count(), 1);
        assert_eq!(
            registry.get_session("alpha").unwrap().id(),
            second.id()
        );
    }

    #[tokio::test]
    async fn test_finish_of_replaced_session_keeps_new_one() {
        let registry = SessionRegistry::new();
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = fired.clone();
        registry.set_on_session_close(Arc::new(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));

        let (first, _rx1) = registry.install_session("alpha");
        let (_second, _rx2) = registry.install_session("alpha");

        // The replaced session's reader exits; the new session must survive
        // and the close hook must not fire.
        registry.finish_session(&first);
        assert_eq!(registry.session_count(), 1);
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 0);

        // A genuine close of the live session fires the hook once.
        let live = registry.get_session("alpha").unwrap();
        registry.finish_session(&live);
        assert_eq!(registry.session_count(), 0);
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_response_id_matches_request_id() {
        let registry = SessionRegistry::new();
        let (session, mut outbound) = registry.install_session("alpha");

        let deliverer = session.clone();
        let seen_id = Arc::new(Mutex::new(String::new()));
        let seen = seen_id.clone();
        tokio::spawn(async move {
            let frame = outbound.recv().await.unwrap();
            let req: CallbackRequest = serde_json::from_str(&frame).unwrap();
            *seen.lock().unwrap() = req.id.clone();
            deliverer.deliver(CallbackResponse {
                id: req.id,
                result: Some(json!("ok")),
                error: None,
            });
        });

        registry
            .route_callback("alpha", "check", None, None)
            .await
            .unwrap();
        assert!(seen_id.lock().unwrap().starts_with("alpha:"));
    }
}

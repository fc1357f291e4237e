pub mod backoff;
pub mod wire;

use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::schema::EngineSettings;
use crate::model::EngineStatus;
use backoff::Backoff;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const COMMAND_QUEUE: usize = 16;

/// Connection lifecycle of the engine client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

/// Failure of a single engine operation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine is unreachable")]
    Unreachable,

    #[error("engine did not answer within {0:?}")]
    Timeout(Duration),

    #[error("engine rejected {request}: {comment}")]
    Rejected { request: String, comment: String },

    #[error("engine connection lost mid-request")]
    ConnectionLost,
}

#[derive(Debug, Clone)]
enum EngineOp {
    SwitchScene { scene: String },
    SetStream { on: bool },
    ToggleStream,
    SetRecord { on: bool },
    ToggleRecord,
    PauseRecord,
    ResumeRecord,
    ToggleRecordPause,
    SetMute { input: String, muted: bool },
    ToggleMute { input: String },
    SetSourceVisibility { source: String, visible: bool },
}

/// Read-only engine enumerations, answered with a list of names.
#[derive(Debug, Clone, Copy)]
enum QueryOp {
    Scenes,
    Inputs,
}

enum Command {
    Execute {
        op: EngineOp,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Query {
        op: QueryOp,
        reply: oneshot::Sender<Result<Vec<String>, EngineError>>,
    },
}

/// Cheap handle to the engine client task. Operations are forwarded over a
/// command channel and answered per caller; state and status are observable
/// without touching the task.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    status_rx: watch::Receiver<EngineStatus>,
}

impl EngineHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Last full status snapshot received from the engine.
    pub fn status(&self) -> EngineStatus {
        self.status_rx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Status snapshots as they are published, including the re-fetch after
    /// a reconnect. Intermediate snapshots may coalesce; the value is always
    /// a complete picture.
    pub fn watch_status(&self) -> watch::Receiver<EngineStatus> {
        self.status_rx.clone()
    }

    pub async fn switch_scene(&self, scene: &str) -> Result<(), EngineError> {
        self.execute(EngineOp::SwitchScene {
            scene: scene.to_string(),
        })
        .await
    }

    pub async fn set_streaming(&self, on: bool) -> Result<(), EngineError> {
        self.execute(EngineOp::SetStream { on }).await
    }

    pub async fn toggle_streaming(&self) -> Result<(), EngineError> {
        self.execute(EngineOp::ToggleStream).await
    }

    pub async fn set_recording(&self, on: bool) -> Result<(), EngineError> {
        self.execute(EngineOp::SetRecord { on }).await
    }

    pub async fn toggle_recording(&self) -> Result<(), EngineError> {
        self.execute(EngineOp::ToggleRecord).await
    }

    pub async fn pause_recording(&self) -> Result<(), EngineError> {
        self.execute(EngineOp::PauseRecord).await
    }

    pub async fn resume_recording(&self) -> Result<(), EngineError> {
        self.execute(EngineOp::ResumeRecord).await
    }

    pub async fn toggle_recording_pause(&self) -> Result<(), EngineError> {
        self.execute(EngineOp::ToggleRecordPause).await
    }

    pub async fn set_input_mute(&self, input: &str, muted: bool) -> Result<(), EngineError> {
        self.execute(EngineOp::SetMute {
            input: input.to_string(),
            muted,
        })
        .await
    }

    pub async fn toggle_input_mute(&self, input: &str) -> Result<(), EngineError> {
        self.execute(EngineOp::ToggleMute {
            input: input.to_string(),
        })
        .await
    }

    pub async fn set_source_visibility(
        &self,
        source: &str,
        visible: bool,
    ) -> Result<(), EngineError> {
        self.execute(EngineOp::SetSourceVisibility {
            source: source.to_string(),
            visible,
        })
        .await
    }

    /// Names of the scenes the engine currently knows about.
    pub async fn list_scenes(&self) -> Result<Vec<String>, EngineError> {
        self.query(QueryOp::Scenes).await
    }

    /// Names of the engine's inputs (audio sources and the like).
    pub async fn list_inputs(&self) -> Result<Vec<String>, EngineError> {
        self.query(QueryOp::Inputs).await
    }

    async fn execute(&self, op: EngineOp) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Execute { op, reply: reply_tx })
            .await
            .map_err(|_| EngineError::Unreachable)?;
        reply_rx.await.map_err(|_| EngineError::Unreachable)?
    }

    async fn query(&self, op: QueryOp) -> Result<Vec<String>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Query { op, reply: reply_tx })
            .await
            .map_err(|_| EngineError::Unreachable)?;
        reply_rx.await.map_err(|_| EngineError::Unreachable)?
    }
}

/// Spawn the engine client task and hand back its handle.
pub fn spawn(settings: &EngineSettings, cancel: CancellationToken) -> (EngineHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (status_tx, status_rx) = watch::channel(EngineStatus::default());

    let client = EngineClient {
        url: settings.url(),
        password: settings.password.clone(),
        timeout: settings.action_timeout(),
        backoff: Backoff::new(settings.reconnect_base(), settings.reconnect_cap()),
        cmd_rx,
        state_tx,
        status_tx,
        cancel,
        request_seq: 0,
        pending_events: Vec::new(),
    };
    let handle = EngineHandle {
        cmd_tx,
        state_rx,
        status_rx,
    };
    (handle, tokio::spawn(client.run()))
}

enum ConnectOutcome {
    Ready(Socket),
    Failed(String),
    Cancelled,
}

enum ServeEnd {
    Cancelled,
    Lost(String),
}

/// Owns the engine socket. One connection at a time; operations are executed
/// in arrival order on the current connection generation. While no connection
/// is up, every queued operation fails with `Unreachable` immediately.
struct EngineClient {
    url: String,
    password: String,
    timeout: Duration,
    backoff: Backoff,
    cmd_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    status_tx: watch::Sender<EngineStatus>,
    cancel: CancellationToken,
    request_seq: u64,
    // Event frames read while a request was in flight, applied in order
    // once the request settles.
    pending_events: Vec<Value>,
}

impl EngineClient {
    async fn run(mut self) {
        let mut first = true;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.set_state(if first {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            });
            first = false;

            match self.connect_phase().await {
                ConnectOutcome::Cancelled => break,
                ConnectOutcome::Failed(reason) => {
                    warn!("engine connect failed: {reason}");
                    self.set_state(ConnectionState::Reconnecting);
                }
                ConnectOutcome::Ready(ws) => {
                    self.backoff.reset();
                    info!("engine connected at {}", self.url);
                    match self.serve(ws).await {
                        ServeEnd::Cancelled => break,
                        ServeEnd::Lost(reason) => {
                            warn!("engine connection lost: {reason}");
                            self.set_state(ConnectionState::Reconnecting);
                        }
                    }
                }
            }

            if !self.wait_before_retry().await {
                break;
            }
        }
        self.set_state(ConnectionState::Disconnected);
        debug!("engine client stopped");
    }

    /// Drive the connect handshake while answering queued operations with
    /// `Unreachable` instead of letting them wait.
    async fn connect_phase(&mut self) -> ConnectOutcome {
        let connect = connect_and_identify(self.url.clone(), self.password.clone(), self.timeout);
        tokio::pin!(connect);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return ConnectOutcome::Cancelled,
                result = &mut connect => {
                    return match result {
                        Ok(ws) => ConnectOutcome::Ready(ws),
                        Err(reason) => ConnectOutcome::Failed(reason),
                    };
                }
                Some(cmd) = self.cmd_rx.recv() => fail_unreachable(cmd),
            }
        }
    }

    /// Backoff sleep between attempts, still failing operations fast.
    async fn wait_before_retry(&mut self) -> bool {
        let delay = self.backoff.next_delay();
        debug!("next engine connection attempt in {delay:?}");
        let wait = tokio::time::sleep(delay);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return false,
                () = &mut wait => return true,
                Some(cmd) = self.cmd_rx.recv() => fail_unreachable(cmd),
            }
        }
    }

    async fn serve(&mut self, mut ws: Socket) -> ServeEnd {
        // Events deferred on a previous connection must not replay here.
        self.pending_events.clear();

        // Fresh snapshot before anything else; events only patch it. The
        // state flips to Connected after the snapshot is out, so observers
        // never see Connected paired with pre-outage status.
        match self.fetch_snapshot(&mut ws).await {
            Ok(status) => {
                debug!("engine snapshot: {status:?}");
                self.publish(status);
                // Events that raced the snapshot fetch are fresher than
                // the fetched values and win over them.
                self.flush_events();
                self.set_state(ConnectionState::Connected);
            }
            Err(e) => return ServeEnd::Lost(format!("status snapshot failed: {e}")),
        }

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = ws.close(None).await;
                    return ServeEnd::Cancelled;
                }
                _ = keepalive.tick() => {
                    if let Err(e) = ws.send(Message::Ping(Vec::new())).await {
                        return ServeEnd::Lost(e.to_string());
                    }
                }
                message = ws.next() => {
                    match message {
                        None | Some(Ok(Message::Close(_))) => {
                            return ServeEnd::Lost("engine closed the connection".to_string());
                        }
                        Some(Err(e)) => return ServeEnd::Lost(e.to_string()),
                        Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                        Some(Ok(_)) => {}
                    }
                }
                Some(cmd) = self.cmd_rx.recv() => {
                    if let Err(reason) = self.handle_command(&mut ws, cmd).await {
                        return ServeEnd::Lost(reason);
                    }
                }
            }
        }
    }

    /// Run one queued command against the live socket and answer its caller.
    /// `Err` means the connection died underneath the request.
    async fn handle_command(&mut self, ws: &mut Socket, cmd: Command) -> Result<(), String> {
        let lost = match cmd {
            Command::Execute { op, reply } => {
                let result = self.perform(ws, &op).await;
                self.flush_events();
                let lost = matches!(result, Err(EngineError::ConnectionLost));
                let _ = reply.send(result);
                lost
            }
            Command::Query { op, reply } => {
                let result = self.perform_query(ws, op).await;
                self.flush_events();
                let lost = matches!(result, Err(EngineError::ConnectionLost));
                let _ = reply.send(result);
                lost
            }
        };
        if lost {
            Err("engine connection lost mid-request".to_string())
        } else {
            Ok(())
        }
    }

    async fn perform(&mut self, ws: &mut Socket, op: &EngineOp) -> Result<(), EngineError> {
        match op {
            EngineOp::SwitchScene { scene } => {
                self.request(ws, "SetCurrentProgramScene", Some(json!({ "sceneName": scene })))
                    .await?;
            }
            EngineOp::SetStream { on: true } => {
                self.request(ws, "StartStream", None).await?;
            }
            EngineOp::SetStream { on: false } => {
                self.request(ws, "StopStream", None).await?;
            }
            EngineOp::ToggleStream => {
                self.request(ws, "ToggleStream", None).await?;
            }
            EngineOp::SetRecord { on: true } => {
                self.request(ws, "StartRecord", None).await?;
            }
            EngineOp::SetRecord { on: false } => {
                self.request(ws, "StopRecord", None).await?;
            }
            EngineOp::ToggleRecord => {
                self.request(ws, "ToggleRecord", None).await?;
            }
            EngineOp::PauseRecord => {
                self.request(ws, "PauseRecord", None).await?;
            }
            EngineOp::ResumeRecord => {
                self.request(ws, "ResumeRecord", None).await?;
            }
            EngineOp::ToggleRecordPause => {
                self.request(ws, "ToggleRecordPause", None).await?;
            }
            EngineOp::SetMute { input, muted } => {
                self.request(
                    ws,
                    "SetInputMute",
                    Some(json!({ "inputName": input, "inputMuted": muted })),
                )
                .await?;
            }
            EngineOp::ToggleMute { input } => {
                self.request(ws, "ToggleInputMute", Some(json!({ "inputName": input })))
                    .await?;
            }
            EngineOp::SetSourceVisibility { source, visible } => {
                // Visibility is scoped to the scene that is live right now.
                let scene: wire::CurrentScene =
                    self.request_as(ws, "GetCurrentProgramScene", None).await?;
                let scene_name = scene.current_program_scene_name;
                let item: wire::SceneItemId = self
                    .request_as(
                        ws,
                        "GetSceneItemId",
                        Some(json!({ "sceneName": scene_name, "sourceName": source })),
                    )
                    .await?;
                self.request(
                    ws,
                    "SetSceneItemEnabled",
                    Some(json!({
                        "sceneName": scene_name,
                        "sceneItemId": item.scene_item_id,
                        "sceneItemEnabled": visible,
                    })),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn perform_query(
        &mut self,
        ws: &mut Socket,
        op: QueryOp,
    ) -> Result<Vec<String>, EngineError> {
        match op {
            QueryOp::Scenes => {
                let list: wire::SceneList = self.request_as(ws, "GetSceneList", None).await?;
                Ok(list.scenes.into_iter().map(|s| s.scene_name).collect())
            }
            QueryOp::Inputs => {
                let list: wire::InputList = self.request_as(ws, "GetInputList", None).await?;
                Ok(list.inputs.into_iter().map(|i| i.input_name).collect())
            }
        }
    }

    async fn fetch_snapshot(&mut self, ws: &mut Socket) -> Result<EngineStatus, EngineError> {
        let scene: wire::CurrentScene = self.request_as(ws, "GetCurrentProgramScene", None).await?;
        let stream: wire::OutputStatus = self.request_as(ws, "GetStreamStatus", None).await?;
        let record: wire::OutputStatus = self.request_as(ws, "GetRecordStatus", None).await?;
        Ok(EngineStatus {
            streaming: stream.output_active,
            recording: record.output_active,
            current_scene: Some(scene.current_program_scene_name),
        })
    }

    async fn request_as<T: DeserializeOwned>(
        &mut self,
        ws: &mut Socket,
        request_type: &str,
        data: Option<Value>,
    ) -> Result<T, EngineError> {
        let value = self.request(ws, request_type, data).await?;
        serde_json::from_value(value).map_err(|e| EngineError::Rejected {
            request: request_type.to_string(),
            comment: format!("malformed response: {e}"),
        })
    }

    /// One request/response round-trip. Events arriving while we wait are
    /// deferred, not dropped: an event is newer than any value fetched
    /// alongside it, so it is applied after the response.
    async fn request(
        &mut self,
        ws: &mut Socket,
        request_type: &str,
        data: Option<Value>,
    ) -> Result<Value, EngineError> {
        self.request_seq += 1;
        let request_id = self.request_seq.to_string();
        let request = wire::Request {
            request_type: request_type.to_string(),
            request_id: request_id.clone(),
            request_data: data,
        };
        if send_payload(ws, wire::OP_REQUEST, &request).await.is_err() {
            return Err(EngineError::ConnectionLost);
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(EngineError::Timeout(self.timeout));
            }
            let message = match tokio::time::timeout(remaining, ws.next()).await {
                Err(_) => return Err(EngineError::Timeout(self.timeout)),
                Ok(message) => message,
            };
            match message {
                None | Some(Ok(Message::Close(_))) => return Err(EngineError::ConnectionLost),
                Some(Err(_)) => return Err(EngineError::ConnectionLost),
                Some(Ok(Message::Text(text))) => {
                    let envelope = match wire::decode(&text) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            warn!("malformed engine frame: {e}");
                            continue;
                        }
                    };
                    match envelope.op {
                        wire::OP_EVENT => self.pending_events.push(envelope.d),
                        wire::OP_REQUEST_RESPONSE => {
                            let response: wire::RequestResponse =
                                match serde_json::from_value(envelope.d) {
                                    Ok(response) => response,
                                    Err(e) => {
                                        warn!("malformed engine response: {e}");
                                        continue;
                                    }
                                };
                            // Responses to abandoned earlier requests are skipped.
                            if response.request_id != request_id {
                                continue;
                            }
                            if response.request_status.result {
                                return Ok(response.response_data.unwrap_or(Value::Null));
                            }
                            let comment = response
                                .request_status
                                .comment
                                .unwrap_or_else(|| format!("code {}", response.request_status.code));
                            return Err(EngineError::Rejected {
                                request: response.request_type,
                                comment,
                            });
                        }
                        _ => {}
                    }
                }
                Some(Ok(_)) => {}
            }
        }
    }

    /// Passive frame handling between operations.
    fn handle_frame(&mut self, text: &str) {
        match wire::decode(text) {
            Ok(envelope) if envelope.op == wire::OP_EVENT => self.handle_event(envelope.d),
            Ok(_) => {}
            Err(e) => warn!("malformed engine frame: {e}"),
        }
    }

    /// Apply events deferred by [`Self::request`], in arrival order.
    fn flush_events(&mut self) {
        for event in std::mem::take(&mut self.pending_events) {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, d: Value) {
        let event: wire::Event = match serde_json::from_value(d) {
            Ok(event) => event,
            Err(e) => {
                warn!("malformed engine event: {e}");
                return;
            }
        };

        let mut status = self.status_tx.borrow().clone();
        match event.event_type.as_str() {
            "CurrentProgramSceneChanged" => {
                match serde_json::from_value::<wire::SceneChanged>(event.event_data) {
                    Ok(data) => status.current_scene = Some(data.scene_name),
                    Err(e) => {
                        warn!("ignoring malformed {} event: {e}", event.event_type);
                        return;
                    }
                }
            }
            "StreamStateChanged" => {
                match serde_json::from_value::<wire::OutputStateChanged>(event.event_data) {
                    Ok(data) => status.streaming = data.output_active,
                    Err(e) => {
                        warn!("ignoring malformed {} event: {e}", event.event_type);
                        return;
                    }
                }
            }
            "RecordStateChanged" => {
                match serde_json::from_value::<wire::OutputStateChanged>(event.event_data) {
                    Ok(data) => status.recording = data.output_active,
                    Err(e) => {
                        warn!("ignoring malformed {} event: {e}", event.event_type);
                        return;
                    }
                }
            }
            _ => return,
        }
        self.publish(status);
    }

    fn publish(&mut self, status: EngineStatus) {
        self.status_tx.send_replace(status);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if *self.state_tx.borrow() != state {
            info!("engine {}", state.as_str());
        }
        self.state_tx.send_replace(state);
    }
}

fn fail_unreachable(cmd: Command) {
    match cmd {
        Command::Execute { reply, .. } => {
            let _ = reply.send(Err(EngineError::Unreachable));
        }
        Command::Query { reply, .. } => {
            let _ = reply.send(Err(EngineError::Unreachable));
        }
    }
}

async fn connect_and_identify(
    url: String,
    password: String,
    timeout: Duration,
) -> Result<Socket, String> {
    let (mut ws, _) = tokio::time::timeout(timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| format!("timed out connecting to {url}"))?
        .map_err(|e| format!("{url}: {e}"))?;

    let hello: wire::Hello = loop {
        let envelope = next_envelope(&mut ws, timeout).await?;
        if envelope.op == wire::OP_HELLO {
            break serde_json::from_value(envelope.d).map_err(|e| format!("bad hello: {e}"))?;
        }
    };

    let authentication = match hello.authentication {
        Some(challenge) if !password.is_empty() => Some(wire::auth_token(
            &password,
            &challenge.challenge,
            &challenge.salt,
        )),
        Some(_) => return Err("engine requires a password and none is configured".to_string()),
        None => None,
    };
    send_payload(
        &mut ws,
        wire::OP_IDENTIFY,
        &wire::Identify {
            rpc_version: wire::RPC_VERSION,
            authentication,
        },
    )
    .await?;

    loop {
        let envelope = next_envelope(&mut ws, timeout).await?;
        if envelope.op == wire::OP_IDENTIFIED {
            let identified: wire::Identified =
                serde_json::from_value(envelope.d).map_err(|e| format!("bad identified: {e}"))?;
            debug!(
                "engine negotiated rpc version {}",
                identified.negotiated_rpc_version
            );
            return Ok(ws);
        }
    }
}

async fn next_envelope(ws: &mut Socket, timeout: Duration) -> Result<wire::Envelope, String> {
    loop {
        match tokio::time::timeout(timeout, ws.next()).await {
            Err(_) => return Err("timed out waiting for the engine handshake".to_string()),
            Ok(None) => return Err("engine closed the connection".to_string()),
            Ok(Some(Err(e))) => return Err(e.to_string()),
            Ok(Some(Ok(Message::Text(text)))) => match wire::decode(&text) {
                Ok(envelope) => return Ok(envelope),
                Err(e) => warn!("malformed engine frame: {e}"),
            },
            Ok(Some(Ok(Message::Close(_)))) => {
                return Err("engine closed the connection".to_string())
            }
            Ok(Some(Ok(_))) => {}
        }
    }
}

async fn send_payload<T: Serialize>(ws: &mut Socket, op: u8, payload: &T) -> Result<(), String> {
    let text = wire::encode(op, payload).map_err(|e| e.to_string())?;
    ws.send(Message::Text(text)).await.map_err(|e| e.to_string())
}

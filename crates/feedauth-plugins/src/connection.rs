//! Plugin connection over newline-delimited JSON.
//!
//! A connection owns two background tasks: a writer draining an mpsc queue
//! onto the plugin's stdin, and a reader that routes responses to pending
//! requests and dispatches inbound requests to registered handlers. Requests
//! are matched to responses by request id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{PluginError, Result};
use crate::messages::{
    Fault, HandshakeRequest, HandshakeResponse, Message, MessageMethod, MessageResponseCode,
    MessageType, ProtocolVersion,
};
use crate::options::ConnectionOptions;

/// Handles a request initiated by the plugin.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Returns the response payload. An error is sent back as a fault.
    async fn handle(&self, request: &Message) -> Result<Value>;
}

/// Inbound request handlers, at most one per method.
#[derive(Default)]
pub struct RequestHandlers {
    handlers: DashMap<MessageMethod, Arc<dyn RequestHandler>>,
}

impl RequestHandlers {
    /// Register `handler` unless one is already registered for `method`.
    pub fn try_add(&self, method: MessageMethod, handler: Arc<dyn RequestHandler>) -> bool {
        match self.handlers.entry(method) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handler);
                true
            }
        }
    }

    pub fn get(&self, method: MessageMethod) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.get(&method).map(|handler| handler.value().clone())
    }

    pub fn contains(&self, method: MessageMethod) -> bool {
        self.handlers.contains_key(&method)
    }
}

struct PendingRequest {
    responder: oneshot::Sender<Message>,
    progress: Arc<Notify>,
}

type PendingMap = DashMap<String, PendingRequest>;

/// Removes the pending entry however the waiting future ends.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.request_id);
    }
}

pub struct PluginConnection {
    sender: mpsc::Sender<Message>,
    pending: Arc<PendingMap>,
    handlers: Arc<RequestHandlers>,
    options: RwLock<ConnectionOptions>,
    protocol_version: RwLock<Option<ProtocolVersion>>,
    closed: CancellationToken,
}

impl PluginConnection {
    /// Start the reader and writer tasks over the given byte streams.
    ///
    /// `reader` carries messages from the plugin, `writer` carries messages to it.
    pub fn new<R, W>(reader: R, writer: W, options: ConnectionOptions) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (sender, receiver) = mpsc::channel::<Message>(128);
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let handlers = Arc::new(RequestHandlers::default());
        let closed = CancellationToken::new();

        handlers.try_add(
            MessageMethod::Handshake,
            Arc::new(HandshakeResponder {
                options: options.clone(),
            }),
        );

        tokio::spawn(read_loop(
            reader,
            pending.clone(),
            handlers.clone(),
            sender.clone(),
            closed.clone(),
        ));
        tokio::spawn(write_loop(writer, receiver, closed.clone()));

        Self {
            sender,
            pending,
            handlers,
            options: RwLock::new(options),
            protocol_version: RwLock::new(None),
            closed,
        }
    }

    /// Perform the protocol handshake and record the negotiated version.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<ProtocolVersion> {
        let options = self.options.read().clone();
        let request = HandshakeRequest {
            protocol_version: options.protocol_version,
            minimum_protocol_version: options.minimum_protocol_version,
        };

        let response: HandshakeResponse = self
            .send_request_with_timeout(
                MessageMethod::Handshake,
                &request,
                options.handshake_timeout,
                cancel,
            )
            .await?;

        if response.response_code != MessageResponseCode::Success {
            return Err(PluginError::Handshake(format!(
                "plugin rejected protocol range {} - {}",
                options.minimum_protocol_version, options.protocol_version
            )));
        }
        let version = response
            .protocol_version
            .ok_or_else(|| PluginError::Handshake("response had no protocol version".to_string()))?;
        if !options.supports(version) {
            return Err(PluginError::Handshake(format!(
                "protocol version {} is not supported",
                version
            )));
        }

        *self.protocol_version.write() = Some(version);
        debug!(%version, "Plugin handshake completed");
        Ok(version)
    }

    /// Send a request using the connection's request timeout.
    pub async fn send_request<Req, Resp>(
        &self,
        method: MessageMethod,
        payload: &Req,
        cancel: &CancellationToken,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let timeout = self.options.read().request_timeout;
        self.send_request_with_timeout(method, payload, timeout, cancel)
            .await
    }

    /// Send a request and wait for its response.
    ///
    /// Progress messages for the request restart the timeout. Cancelling
    /// `cancel` notifies the plugin and yields [`PluginError::Cancelled`].
    pub async fn send_request_with_timeout<Req, Resp>(
        &self,
        method: MessageMethod,
        payload: &Req,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled);
        }
        if self.closed.is_cancelled() {
            return Err(PluginError::ConnectionClosed);
        }

        let request_id = Uuid::new_v4().to_string();
        let message = Message {
            request_id: request_id.clone(),
            message_type: MessageType::Request,
            method,
            payload: Some(serde_json::to_value(payload)?),
        };

        let (tx, mut rx) = oneshot::channel();
        let progress = Arc::new(Notify::new());
        self.pending.insert(
            request_id.clone(),
            PendingRequest {
                responder: tx,
                progress: progress.clone(),
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            request_id: &request_id,
        };

        self.sender
            .send(message)
            .await
            .map_err(|_| PluginError::ConnectionClosed)?;

        let response = loop {
            tokio::select! {
                biased;
                response = &mut rx => {
                    break response.map_err(|_| PluginError::ConnectionClosed)?;
                }
                _ = progress.notified() => continue,
                _ = tokio::time::sleep(timeout) => {
                    let _ = self.sender.try_send(Message::cancel(request_id.as_str(), method));
                    return Err(PluginError::Timeout { method, timeout });
                }
                _ = cancel.cancelled() => {
                    let _ = self.sender.try_send(Message::cancel(request_id.as_str(), method));
                    return Err(PluginError::Cancelled);
                }
                _ = self.closed.cancelled() => {
                    // The reader routes a final reply before it marks the connection closed.
                    match rx.try_recv() {
                        Ok(response) => break response,
                        Err(_) => return Err(PluginError::ConnectionClosed),
                    }
                }
            }
        };

        match response.message_type {
            MessageType::Response => response.payload_as(),
            MessageType::Fault => {
                let message = response
                    .payload_as::<Fault>()
                    .map(|fault| fault.message)
                    .unwrap_or_else(|_| format!("plugin faulted handling {}", method));
                Err(PluginError::Fault(message))
            }
            other => Err(PluginError::Protocol(format!(
                "unexpected {:?} reply to {}",
                other, method
            ))),
        }
    }

    pub fn handlers(&self) -> &RequestHandlers {
        &self.handlers
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        *self.protocol_version.read()
    }

    pub fn request_timeout(&self) -> Duration {
        self.options.read().request_timeout
    }

    pub fn set_request_timeout(&self, timeout: Duration) {
        self.options.write().request_timeout = timeout;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has closed for any reason.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Mark the connection closed without notifying the plugin.
    pub(crate) fn mark_closed(&self) {
        self.closed.cancel();
    }

    /// Ask the plugin to exit and stop both background tasks.
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        let goodbye = Message {
            request_id: Uuid::new_v4().to_string(),
            message_type: MessageType::Request,
            method: MessageMethod::Close,
            payload: None,
        };
        if self.sender.try_send(goodbye).is_err() {
            debug!("Could not queue close request for plugin");
        }
        self.closed.cancel();
    }
}

impl Drop for PluginConnection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn read_loop<R>(
    reader: R,
    pending: Arc<PendingMap>,
    handlers: Arc<RequestHandlers>,
    sender: mpsc::Sender<Message>,
    closed: CancellationToken,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = closed.cancelled() => break,
        };
        match line {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Message>(&line) {
                    Ok(message) => handle_incoming(message, &pending, &handlers, &sender),
                    Err(err) => warn!(error = %err, "Discarding malformed plugin message"),
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "Plugin reader error");
                break;
            }
        }
    }
    closed.cancel();
    // Dropping the responders wakes every waiter with a closed-connection error.
    pending.clear();
}

async fn write_loop<W>(mut writer: W, mut receiver: mpsc::Receiver<Message>, closed: CancellationToken)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let message = tokio::select! {
            biased;
            message = receiver.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = closed.cancelled() => break,
        };
        if let Err(err) = write_message(&mut writer, &message).await {
            warn!(error = %err, "Plugin writer error");
            closed.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let mut payload = serde_json::to_vec(message)?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

fn handle_incoming(
    message: Message,
    pending: &PendingMap,
    handlers: &Arc<RequestHandlers>,
    sender: &mpsc::Sender<Message>,
) {
    match message.message_type {
        MessageType::Response | MessageType::Fault => {
            match pending.remove(&message.request_id) {
                Some((_, request)) => {
                    let _ = request.responder.send(message);
                }
                None => debug!(
                    request_id = %message.request_id,
                    "Dropping reply for unknown request"
                ),
            }
        }
        MessageType::Progress => {
            if let Some(request) = pending.get(&message.request_id) {
                request.progress.notify_one();
            }
        }
        MessageType::Request => {
            let handler = handlers.get(message.method);
            let sender = sender.clone();
            tokio::spawn(async move {
                let reply = match handler {
                    Some(handler) => match handler.handle(&message).await {
                        Ok(payload) => message.response_to(MessageType::Response, payload),
                        Err(err) => fault_reply(&message, err.to_string()),
                    },
                    None => fault_reply(
                        &message,
                        format!("No request handler is registered for method {}.", message.method),
                    ),
                };
                if sender.send(reply).await.is_err() {
                    debug!("Connection closed before reply could be sent");
                }
            });
        }
        MessageType::Cancel => {
            debug!(request_id = %message.request_id, "Plugin cancelled an inbound request");
        }
    }
}

fn fault_reply(request: &Message, message: String) -> Message {
    request.response_to(MessageType::Fault, json!({ "Message": message }))
}

/// Answers handshakes initiated by the plugin.
struct HandshakeResponder {
    options: ConnectionOptions,
}

#[async_trait]
impl RequestHandler for HandshakeResponder {
    async fn handle(&self, request: &Message) -> Result<Value> {
        let handshake: HandshakeRequest = request.payload_as()?;
        let compatible = handshake.minimum_protocol_version <= self.options.protocol_version
            && handshake.protocol_version >= self.options.minimum_protocol_version;

        let response = if compatible {
            HandshakeResponse {
                response_code: MessageResponseCode::Success,
                protocol_version: Some(handshake.protocol_version.min(self.options.protocol_version)),
            }
        } else {
            HandshakeResponse {
                response_code: MessageResponseCode::Error,
                protocol_version: None,
            }
        };
        Ok(serde_json::to_value(response)?)
    }
}

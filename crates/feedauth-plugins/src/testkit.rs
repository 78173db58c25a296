//! In-process scripted plugin for tests.
//!
//! [`FakePluginLauncher`] hands out connections backed by `tokio::io::duplex`
//! and runs a scripted plugin on the other end that records every message it
//! receives.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, split};

use crate::connection::PluginConnection;
use crate::error::{PluginError, Result};
use crate::factory::{LaunchedPlugin, PluginLauncher};
use crate::messages::{
    GetAuthenticationCredentialsResponse, LogLevel, LogRequest, Message, MessageMethod,
    MessageResponseCode, MessageType, OperationClaim, ProtocolVersion,
};
use crate::options::ConnectionOptions;

/// How the fake plugin answers each request.
#[derive(Debug, Clone)]
pub struct FakePluginScript {
    pub protocol_version: ProtocolVersion,
    pub claims: Vec<OperationClaim>,
    pub initialize_response: MessageResponseCode,
    pub credentials: GetAuthenticationCredentialsResponse,
    /// Sent to the host as a `Log` request before answering a credentials request.
    pub log_before_credentials: Option<(LogLevel, String)>,
    /// Methods answered with a fault.
    pub fault_on: Option<MessageMethod>,
    /// Methods never answered.
    pub silent_on: Option<MessageMethod>,
}

impl Default for FakePluginScript {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::new(2, 0, 0),
            claims: vec![OperationClaim::Authentication],
            initialize_response: MessageResponseCode::Success,
            credentials: GetAuthenticationCredentialsResponse {
                username: Some("user".to_string()),
                password: Some("password".to_string()),
                message: None,
                authentication_types: None,
                response_code: MessageResponseCode::Success,
            },
            log_before_credentials: None,
            fault_on: None,
            silent_on: None,
        }
    }
}

impl FakePluginScript {
    pub fn with_claims(claims: Vec<OperationClaim>) -> Self {
        Self {
            claims,
            ..Self::default()
        }
    }
}

pub struct FakePluginLauncher {
    default_script: FakePluginScript,
    scripts: HashMap<PathBuf, FakePluginScript>,
    launches: AtomicUsize,
    received: Arc<Mutex<Vec<Message>>>,
    fail_launch: bool,
}

impl FakePluginLauncher {
    pub fn new(script: FakePluginScript) -> Self {
        Self {
            default_script: script,
            scripts: HashMap::new(),
            launches: AtomicUsize::new(0),
            received: Arc::new(Mutex::new(Vec::new())),
            fail_launch: false,
        }
    }

    /// Launcher whose every launch fails as if the executable were missing.
    pub fn failing() -> Self {
        Self {
            fail_launch: true,
            ..Self::new(FakePluginScript::default())
        }
    }

    pub fn with_script_for(mut self, path: impl Into<PathBuf>, script: FakePluginScript) -> Self {
        self.scripts.insert(path.into(), script);
        self
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Every message the fake plugins received, in arrival order.
    pub fn received(&self) -> Vec<Message> {
        self.received.lock().clone()
    }

    /// Requests of `method` received from the host.
    pub fn requests(&self, method: MessageMethod) -> Vec<Message> {
        self.received
            .lock()
            .iter()
            .filter(|m| m.method == method && m.message_type == MessageType::Request)
            .cloned()
            .collect()
    }

    /// Wait until a message with `method` has arrived.
    pub async fn wait_for_method(&self, method: MessageMethod) {
        for _ in 0..200 {
            if self.received.lock().iter().any(|m| m.method == method) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("fake plugin never received {method}");
    }
}

#[async_trait]
impl PluginLauncher for FakePluginLauncher {
    async fn launch(&self, path: &Path, options: &ConnectionOptions) -> Result<LaunchedPlugin> {
        if self.fail_launch {
            return Err(PluginError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such plugin: {}", path.display()),
            )));
        }
        self.launches.fetch_add(1, Ordering::SeqCst);

        let script = self
            .scripts
            .get(path)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone());
        let (host, plugin) = tokio::io::duplex(64 * 1024);
        tokio::spawn(run_fake_plugin(script, plugin, self.received.clone()));

        let (host_read, host_write) = split(host);
        Ok(LaunchedPlugin {
            connection: PluginConnection::new(host_read, host_write, options.clone()),
            process: None,
        })
    }
}

async fn run_fake_plugin(
    script: FakePluginScript,
    stream: DuplexStream,
    received: Arc<Mutex<Vec<Message>>>,
) {
    let (read, mut write) = split(stream);
    let mut lines = BufReader::new(read).lines();
    let mut log_counter = 0usize;

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(message) = serde_json::from_str::<Message>(&line) else {
            continue;
        };
        received.lock().push(message.clone());

        if message.message_type != MessageType::Request {
            continue;
        }
        if message.method == MessageMethod::Close {
            break;
        }
        if script.silent_on == Some(message.method) {
            continue;
        }
        if script.fault_on == Some(message.method) {
            let fault = message.response_to(
                MessageType::Fault,
                json!({ "Message": format!("{} failed in plugin", message.method) }),
            );
            if send(&mut write, &fault).await.is_err() {
                break;
            }
            continue;
        }

        if message.method == MessageMethod::GetAuthenticationCredentials
            && let Some((level, text)) = &script.log_before_credentials
        {
            log_counter += 1;
            let log = Message::request(
                format!("plugin-log-{}", log_counter),
                MessageMethod::Log,
                &LogRequest {
                    log_level: *level,
                    message: text.clone(),
                },
            );
            if let Ok(log) = log
                && send(&mut write, &log).await.is_err()
            {
                break;
            }
        }

        let payload = match message.method {
            MessageMethod::Handshake => json!({
                "ResponseCode": "Success",
                "ProtocolVersion": script.protocol_version,
            }),
            MessageMethod::Initialize => json!({ "ResponseCode": script.initialize_response }),
            MessageMethod::GetOperationClaims => json!({ "Claims": script.claims }),
            MessageMethod::GetAuthenticationCredentials => {
                serde_json::to_value(&script.credentials).unwrap_or(Value::Null)
            }
            _ => json!({ "ResponseCode": "Success" }),
        };
        let reply = message.response_to(MessageType::Response, payload);
        if send(&mut write, &reply).await.is_err() {
            break;
        }
    }
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> std::io::Result<()> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await
}

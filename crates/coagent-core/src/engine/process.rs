//! Engine running as a child process
//!
//! The process speaks the line-delimited JSON control protocol from
//! `coagent-stdio`. Three tasks serve each engine:
//!
//! - writer: drains the control client's outbound queue into stdin
//! - input forwarder: turns session input into `user` lines
//! - reader: routes stdout lines to the output stream, the control client
//!   or the permission callback

use async_trait::async_trait;
use coagent_stdio::protocol::subtypes;
use coagent_stdio::{
    ControlClient, Inbound, InboundControl, Outbound, StdioError, StdioTransport, TransportReader,
    TransportWriter,
};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::{
    AgentEngine, EngineLauncher, EngineMessage, EngineOptions, InputStream, LaunchedEngine,
    McpServerInfo, ModelInfo, PermissionCallback, SlashCommand, ToolUseContext,
};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::permission::PermissionDecision;

/// How long the writer waits for permission answers decided during shutdown
const ANSWER_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Launches one engine process per session
pub struct ProcessLauncher {
    config: EngineConfig,
}

impl ProcessLauncher {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EngineLauncher for ProcessLauncher {
    async fn launch(
        &self,
        options: EngineOptions,
        input: InputStream,
        permissions: Arc<dyn PermissionCallback>,
    ) -> Result<LaunchedEngine> {
        let (process, writer, reader) = StdioTransport::spawn(&self.config.to_command())
            .map_err(|e| {
                Error::EngineStart(format!("failed to spawn {}: {}", self.config.command, e))
            })?;
        info!(
            session_id = %options.session_id,
            pid = ?process.id(),
            "Engine process started"
        );

        let connection = Connection {
            writer: Box::new(writer),
            reader: Box::new(reader),
            process: Some(process),
        };
        let startup_timeout = Duration::from_secs(self.config.startup_timeout_secs);
        StdioEngine::connect(connection, options, input, permissions, startup_timeout).await
    }
}

/// Both halves of an engine connection, plus the process behind them if any
pub struct Connection {
    pub writer: Box<dyn TransportWriter>,
    pub reader: Box<dyn TransportReader>,
    pub process: Option<StdioTransport>,
}

impl Connection {
    pub fn new(
        writer: impl TransportWriter + 'static,
        reader: impl TransportReader + 'static,
    ) -> Self {
        Self {
            writer: Box::new(writer),
            reader: Box::new(reader),
            process: None,
        }
    }
}

/// What the engine advertises in its initialize response
#[derive(Debug, Default, Deserialize)]
struct InitializeInfo {
    #[serde(default)]
    commands: Vec<SlashCommand>,
    #[serde(default)]
    models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct McpStatusResponse {
    #[serde(default)]
    mcp_servers: Vec<McpServerInfo>,
}

/// Control handle for an engine behind a stdio connection
pub struct StdioEngine {
    client: Arc<ControlClient>,
    process: AsyncMutex<Option<StdioTransport>>,
    shutdown: CancellationToken,
    info: InitializeInfo,
}

impl StdioEngine {
    /// Start the connection tasks and run the initialize handshake
    pub async fn connect(
        connection: Connection,
        options: EngineOptions,
        input: InputStream,
        permissions: Arc<dyn PermissionCallback>,
        startup_timeout: Duration,
    ) -> Result<LaunchedEngine> {
        let Connection {
            writer,
            reader,
            process,
        } = connection;
        let (client, outbound) = ControlClient::new();
        let client = Arc::new(client);
        let shutdown = CancellationToken::new();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let answers = TaskTracker::new();

        tokio::spawn(write_loop(writer, outbound, shutdown.clone(), answers.clone()));
        tokio::spawn(forward_input(input, client.clone(), shutdown.clone()));
        tokio::spawn(read_loop(
            reader,
            Router {
                client: client.clone(),
                permissions,
                output: output_tx,
                in_flight: Arc::new(Mutex::new(HashMap::new())),
                answers,
                shutdown: shutdown.clone(),
            },
        ));

        let mut engine = Self {
            client,
            process: AsyncMutex::new(process),
            shutdown,
            info: InitializeInfo::default(),
        };

        match engine.initialize(startup_timeout).await {
            Ok(info) => engine.info = info,
            Err(e) => {
                engine.shutdown().await;
                return Err(e);
            }
        }

        if let Some(model) = options.model.as_deref() {
            if let Err(e) = engine.set_model(model).await {
                engine.shutdown().await;
                return Err(Error::EngineStart(format!("failed to select model {}: {}", model, e)));
            }
        }
        debug!(
            session_id = %options.session_id,
            commands = engine.info.commands.len(),
            models = engine.info.models.len(),
            "Engine initialized"
        );

        let output = futures::stream::unfold(output_rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        })
        .boxed();

        Ok(LaunchedEngine {
            engine: Arc::new(engine),
            output,
        })
    }

    async fn initialize(&self, startup_timeout: Duration) -> Result<InitializeInfo> {
        let request = self
            .client
            .request(json!({ "subtype": subtypes::INITIALIZE }));
        let response = tokio::time::timeout(startup_timeout, request)
            .await
            .map_err(|_| {
                Error::EngineStart(format!(
                    "engine did not initialize within {:?}",
                    startup_timeout
                ))
            })?
            .map_err(|e| Error::EngineStart(format!("initialize failed: {}", e)))?;

        match response {
            Some(value) => serde_json::from_value(value).map_err(|e| {
                Error::EngineStart(format!("invalid initialize response: {}", e))
            }),
            None => Ok(InitializeInfo::default()),
        }
    }
}

#[async_trait]
impl AgentEngine for StdioEngine {
    async fn interrupt(&self) -> Result<()> {
        self.client
            .request(json!({ "subtype": subtypes::INTERRUPT }))
            .await?;
        Ok(())
    }

    async fn set_model(&self, model: &str) -> Result<()> {
        self.client
            .request(json!({ "subtype": subtypes::SET_MODEL, "model": model }))
            .await?;
        Ok(())
    }

    async fn supported_commands(&self) -> Result<Vec<SlashCommand>> {
        Ok(self.info.commands.clone())
    }

    async fn supported_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(self.info.models.clone())
    }

    async fn mcp_server_status(&self) -> Result<Vec<McpServerInfo>> {
        let response = self
            .client
            .request(json!({ "subtype": subtypes::MCP_STATUS }))
            .await?;
        match response {
            Some(value) => Ok(serde_json::from_value::<McpStatusResponse>(value)?.mcp_servers),
            None => Ok(Vec::new()),
        }
    }

    async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.client.close();
        if let Some(mut process) = self.process.lock().await.take() {
            if let Err(e) = process.close().await {
                warn!("Failed to stop engine process: {}", e);
            }
        }
    }
}

impl Drop for StdioEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn write_loop(
    mut writer: Box<dyn TransportWriter>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    shutdown: CancellationToken,
    answers: TaskTracker,
) {
    let stopped = loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break true,
            message = outbound.recv() => message,
        };
        let Some(message) = message else { break false };
        if let Err(e) = writer.send(&message).await {
            warn!("Failed to write to engine: {}", e);
            break false;
        }
    };
    if stopped {
        flush_answers(&mut writer, &mut outbound, &answers).await;
    }
    let _ = writer.close().await;
    debug!("Engine writer stopped");
}

/// Deliver the denials an abort produced before the pipe closes
async fn flush_answers(
    writer: &mut Box<dyn TransportWriter>,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    answers: &TaskTracker,
) {
    answers.close();
    if tokio::time::timeout(ANSWER_FLUSH_TIMEOUT, answers.wait())
        .await
        .is_err()
    {
        warn!(
            pending = answers.len(),
            "Permission answers still undecided at shutdown"
        );
    }
    while let Ok(message) = outbound.try_recv() {
        if let Err(e) = writer.send(&message).await {
            warn!("Failed to flush engine writes: {}", e);
            break;
        }
    }
}

async fn forward_input(
    mut input: InputStream,
    client: Arc<ControlClient>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = input.next() => message,
        };
        let Some(message) = message else { break };
        if client.send(Outbound::user(message.content)).is_err() {
            break;
        }
    }
}

/// Dispatches lines read from the engine
struct Router {
    client: Arc<ControlClient>,
    permissions: Arc<dyn PermissionCallback>,
    output: mpsc::UnboundedSender<Result<EngineMessage>>,
    /// Cancellation tokens of permission requests still being decided
    in_flight: Arc<Mutex<HashMap<String, CancellationToken>>>,
    /// Tasks deciding and sending permission answers
    answers: TaskTracker,
    shutdown: CancellationToken,
}

impl Router {
    fn route(&self, inbound: Inbound) {
        match inbound {
            Inbound::Message(value) => {
                let _ = self.output.send(Ok(EngineMessage::classify(value)));
            }
            Inbound::ControlResponse { response } => {
                self.client.handle_response(response);
            }
            Inbound::ControlRequest {
                request_id,
                request:
                    InboundControl::CanUseTool {
                        tool_name,
                        input,
                        permission_suggestions,
                    },
            } => self.ask_permission(request_id, tool_name, input, permission_suggestions),
            Inbound::ControlRequest {
                request_id,
                request: InboundControl::Unsupported,
            } => {
                warn!(request_id = %request_id, "Unsupported control request from engine");
                let _ = self
                    .client
                    .send(Outbound::error(request_id, "unsupported control request"));
            }
            Inbound::ControlCancelRequest { request_id } => {
                if let Some(token) = self.in_flight.lock().remove(&request_id) {
                    debug!(request_id = %request_id, "Engine cancelled permission request");
                    token.cancel();
                }
            }
        }
    }

    fn ask_permission(
        &self,
        request_id: String,
        tool_name: String,
        input: Value,
        suggestions: Option<Vec<Value>>,
    ) {
        let token = self.shutdown.child_token();
        self.in_flight
            .lock()
            .insert(request_id.clone(), token.clone());
        let context = ToolUseContext {
            cancellation: token,
            suggestions,
        };

        let permissions = self.permissions.clone();
        let client = self.client.clone();
        let in_flight = self.in_flight.clone();
        self.answers.spawn(async move {
            let decision = permissions
                .can_use_tool(&tool_name, input.clone(), context)
                .await;
            in_flight.lock().remove(&request_id);
            let response = decision_payload(decision, input);
            if client.send(Outbound::success(request_id, response)).is_err() {
                debug!("Engine connection closed before the permission answer was sent");
            }
        });
    }
}

/// Engines expect `updatedInput` on every allow
fn decision_payload(decision: PermissionDecision, original_input: Value) -> Value {
    match decision {
        PermissionDecision::Allow { updated_input } => json!({
            "behavior": "allow",
            "updatedInput": updated_input.unwrap_or(original_input),
        }),
        PermissionDecision::Deny { message, interrupt } => json!({
            "behavior": "deny",
            "message": message,
            "interrupt": interrupt,
        }),
    }
}

async fn read_loop(mut reader: Box<dyn TransportReader>, router: Router) {
    loop {
        let next = tokio::select! {
            _ = router.shutdown.cancelled() => break,
            next = reader.receive() => next,
        };
        match next {
            Ok(Some(inbound)) => router.route(inbound),
            Ok(None) => {
                info!("Engine closed its output");
                break;
            }
            Err(StdioError::Transport(e)) => {
                error!("Engine output failed: {}", e);
                let _ = router.output.send(Err(Error::EngineStream(e.to_string())));
                break;
            }
            Err(e) => {
                warn!("Bad line from engine: {}", e);
                let _ = router.output.send(Err(Error::EngineStream(e.to_string())));
            }
        }
    }

    router.client.close();
    for (_, token) in router.in_flight.lock().drain() {
        token.cancel();
    }
}

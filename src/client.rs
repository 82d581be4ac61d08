//! Client context: owns the command table, reply tracking and transfers
//!
//! Every operation goes through an explicit [`Client`], so several clients
//! can live in one process without sharing state.

use crate::command::{
    ActionHandler, ActionOutcome, CommandError, CommandRegistry, HandlerResult, ProcessRunner,
    SystemRunner, UserData,
};
use crate::osal;
use crate::tracker::{PendingPublish, ReplyCorrelator, ReplyTimeout, TrackerError};
use crate::transfer::{PendingTransfer, PendingTransferSet, TransferIdentity, TransferKey};
use crate::transport::Transport;
use anyhow::{Context, Result};
use chrono::Utc;
use device_cloud_shared::codec::{self, CodecError, InboundEvent, OutboundCommand, Reply};
use device_cloud_shared::{
    protocol, status, ActionRequest, ConfigError, ConfigLoader, ConfigTree, TransferStatus,
    TransportId,
};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, error, info, warn};

/// Built-in configuration defaults
pub fn default_config() -> Value {
    json!({
        "cloud": {
            "host": "api.devicecloud.example.com",
            "port": 8883,
            "token": ""
        },
        "validate_cloud_cert": true,
        "keep_alive": 300,
        "loop_time": 1,
        "thread_count": 3,
        "qos_level": 1,
        "log_level": "INFO",
        "runtime_dir": ".",
        "reply_timeout_secs": protocol::DEFAULT_REPLY_TIMEOUT_SECS
    })
}

/// Load configuration for `app_id`: defaults, then `<app_id>.cfg`, then env
pub fn load_config(app_id: &str, path: Option<&Path>) -> Result<ConfigTree, ConfigError> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(".").join(format!("{}.cfg", app_id)),
    };
    ConfigLoader::new(default_config()).file(path).load()
}

/// A location fix; unset fields are left out of the publish
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub heading: Option<f64>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub accuracy: Option<f64>,
    pub fix_type: Option<String>,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            ..Default::default()
        }
    }
}

/// Worker count used when `thread_count` is not configured
const DEFAULT_ACTION_WORKERS: usize = 3;

/// A device's connection to the cloud
pub struct Client {
    app_id: String,
    config: RwLock<Arc<ConfigTree>>,
    commands: CommandRegistry<Client>,
    tracker: Arc<ReplyCorrelator>,
    transfers: PendingTransferSet<Client>,
    transport: Arc<dyn Transport>,
    runner: Arc<dyn ProcessRunner>,
    /// Bounds how many actions run at once (`thread_count`)
    action_slots: Arc<Semaphore>,
    topic_seq: AtomicU64,
}

impl Client {
    pub fn new(app_id: impl Into<String>, config: ConfigTree, transport: Arc<dyn Transport>) -> Self {
        Self::with_runner(app_id, config, transport, Arc::new(SystemRunner))
    }

    /// Create a client whose command actions run through `runner`
    pub fn with_runner(
        app_id: impl Into<String>,
        config: ConfigTree,
        transport: Arc<dyn Transport>,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        let workers = config
            .get_u64("thread_count")
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_ACTION_WORKERS)
            .max(1);

        Self {
            app_id: app_id.into(),
            config: RwLock::new(Arc::new(config)),
            commands: CommandRegistry::with_runner(runner.clone()),
            tracker: Arc::new(ReplyCorrelator::new()),
            transfers: PendingTransferSet::new(),
            transport,
            runner,
            action_slots: Arc::new(Semaphore::new(workers)),
            topic_seq: AtomicU64::new(1),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Snapshot of the current configuration
    pub async fn config(&self) -> Arc<ConfigTree> {
        self.config.read().await.clone()
    }

    /// Replace the configuration wholesale
    pub async fn reconfigure(&self, config: ConfigTree) {
        *self.config.write().await = Arc::new(config);
        info!("Configuration replaced for {}", self.app_id);
    }

    pub fn tracker(&self) -> &Arc<ReplyCorrelator> {
        &self.tracker
    }

    // ========================================================================
    // Actions
    // ========================================================================

    /// Register an in-process handler for `name`
    pub async fn action_register_callback(
        &self,
        name: impl Into<String>,
        handler: ActionHandler<Client>,
        user_data: Option<UserData>,
    ) -> Result<(), CommandError> {
        self.commands.register(name, handler, user_data).await
    }

    /// Register an external program for `name`
    pub async fn action_register_command(
        &self,
        name: impl Into<String>,
        program: impl Into<String>,
        user_data: Option<UserData>,
    ) -> Result<(), CommandError> {
        self.commands
            .register(name, ActionHandler::process(program), user_data)
            .await
    }

    pub async fn action_deregister(&self, name: &str) -> Result<(), CommandError> {
        self.commands.unregister(name).await
    }

    pub async fn registered_actions(&self) -> Vec<String> {
        self.commands.names().await
    }

    /// Run the handler registered for `request.name`
    pub async fn dispatch_action(&self, request: &ActionRequest) -> Result<ActionOutcome, CommandError> {
        self.commands.dispatch(self, request).await
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    /// Publish a telemetry sample (`property.publish`)
    pub async fn telemetry_publish(&self, name: &str, value: f64) -> Result<TransportId> {
        let params = json!({
            "thingKey": self.thing_key().await,
            "key": name,
            "value": value,
            "ts": timestamp(),
        });
        let description = format!("Property Publish {} : {}", name, value);
        self.publish_one("property.publish", description, params).await
    }

    /// Publish an attribute (`attribute.publish`)
    pub async fn attribute_publish(&self, name: &str, value: &str) -> Result<TransportId> {
        let params = json!({
            "thingKey": self.thing_key().await,
            "key": name,
            "value": value,
            "ts": timestamp(),
        });
        let description = format!("Attribute Publish {} : \"{}\"", name, value);
        self.publish_one("attribute.publish", description, params).await
    }

    /// Publish an alarm state (`alarm.publish`)
    pub async fn alarm_publish(
        &self,
        name: &str,
        state: i64,
        message: Option<&str>,
    ) -> Result<TransportId> {
        let mut params = json!({
            "thingKey": self.thing_key().await,
            "key": name,
            "state": state,
            "ts": timestamp(),
        });
        if let Some(message) = message {
            params["msg"] = json!(message);
        }
        let description = format!("Alarm Publish {} : state {}", name, state);
        self.publish_one("alarm.publish", description, params).await
    }

    /// Publish a log line (`log.publish`)
    pub async fn log_publish(&self, message: &str) -> Result<TransportId> {
        let params = json!({
            "thingKey": self.thing_key().await,
            "msg": message,
            "ts": timestamp(),
        });
        let description = format!("Log Publish {}", message);
        self.publish_one("log.publish", description, params).await
    }

    /// Publish a location fix (`location.publish`)
    pub async fn location_publish(&self, location: &Location) -> Result<TransportId> {
        let mut params = Map::new();
        params.insert("thingKey".into(), json!(self.thing_key().await));
        params.insert("lat".into(), json!(location.latitude));
        params.insert("lng".into(), json!(location.longitude));
        let optional = [
            ("heading", location.heading),
            ("altitude", location.altitude),
            ("speed", location.speed),
            ("fixAcc", location.accuracy),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                params.insert(key.into(), json!(value));
            }
        }
        if let Some(fix_type) = &location.fix_type {
            params.insert("fixType".into(), json!(fix_type));
        }
        params.insert("ts".into(), json!(timestamp()));

        let description = format!(
            "Location Publish {}, {}",
            location.latitude, location.longitude
        );
        self.publish_one("location.publish", description, Value::Object(params))
            .await
    }

    async fn publish_one(
        &self,
        command: &str,
        description: String,
        params: Value,
    ) -> Result<TransportId> {
        self.publish_commands(vec![(OutboundCommand::new(command, params), description)])
            .await
    }

    /// Publish a batch of commands on a fresh topic and track each one
    pub async fn publish_commands(
        &self,
        commands: Vec<(OutboundCommand, String)>,
    ) -> Result<TransportId> {
        let topic_seq = self.topic_seq.fetch_add(1, Ordering::Relaxed);
        let outbound: Vec<OutboundCommand> = commands.iter().map(|(cmd, _)| cmd.clone()).collect();
        let payload = codec::encode_commands(&outbound)?;

        let topic = codec::api_topic(topic_seq);
        let transport_id = self
            .transport
            .publish(&topic, payload)
            .await
            .with_context(|| format!("failed to publish on {}", topic))?;

        for (offset, (cmd, description)) in commands.into_iter().enumerate() {
            let command_seq = protocol::FIRST_COMMAND_SEQ + offset as u32;
            debug!("Sending {} as {}-{}", description, topic_seq, command_seq);
            self.tracker
                .track(PendingPublish::new(
                    transport_id,
                    command_seq,
                    cmd.command,
                    description,
                    cmd.params,
                ))
                .await;
        }
        self.tracker.assign_correlation(transport_id, topic_seq).await;

        Ok(transport_id)
    }

    /// The transport accepted a publish; returns the topic it was sent on
    pub async fn on_publish_accepted(&self, transport_id: TransportId) -> Result<u64, TrackerError> {
        let topic_seq = self.tracker.resolve_correlation(transport_id).await?;
        debug!("{} accepted on topic {}", transport_id, topic_seq);
        Ok(topic_seq)
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Decode an inbound message and route every event it carries
    ///
    /// Replies are matched inline. Actions are handed to a worker task and
    /// at most `thread_count` of them run at once, so a slow handler never
    /// holds up reply processing. Duplicate or stray replies are logged and
    /// skipped; they never stop the remaining events from being processed.
    pub async fn handle_message(
        self: &Arc<Self>,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), CodecError> {
        for event in codec::decode(topic, payload)? {
            match event {
                InboundEvent::Action(request) => self.spawn_action(request),
                InboundEvent::Reply(reply) => self.handle_reply(reply).await,
            }
        }
        Ok(())
    }

    fn spawn_action(self: &Arc<Self>, request: ActionRequest) {
        let client = Arc::clone(self);
        let slots = Arc::clone(&self.action_slots);

        tokio::spawn(async move {
            let Ok(_permit) = slots.acquire_owned().await else {
                error!("[ACTION] Worker pool closed; dropping {}", request.request_id);
                return;
            };
            client.handle_action(request).await;
        });
    }

    async fn handle_action(&self, request: ActionRequest) {
        info!("[ACTION] Received {} (request {})", request.name, request.request_id);

        let (error_code, error_message) = match self.dispatch_action(&request).await {
            Ok(outcome) => (outcome.status(), outcome.message()),
            Err(e) => {
                warn!("[ACTION] {}", e);
                (status::FAILURE, e.to_string())
            }
        };

        let params = json!({
            "id": request.request_id,
            "errorCode": error_code,
            "errorMessage": error_message,
        });
        let description = format!("Action Complete \"{}\"", request.name);
        if let Err(e) = self.publish_one("mailbox.ack", description, params).await {
            error!("[ACTION] Failed to acknowledge {}: {:#}", request.request_id, e);
        }
    }

    async fn handle_reply(&self, reply: Reply) {
        let key = reply.key;
        match self.tracker.resolve(key.topic_seq, key.command_seq).await {
            Ok(publish) if reply.success => {
                debug!("[TRACKER] {} - success", publish.description);
            }
            Ok(publish) => {
                warn!(
                    "[TRACKER] {} - failed: {}",
                    publish.description,
                    reply.error_messages.join(", ")
                );
            }
            Err(e) => warn!("[TRACKER] {}", e),
        }
    }

    // ========================================================================
    // File transfers
    // ========================================================================

    /// Start tracking a transfer; false if the same file is already in flight
    pub async fn file_transfer_begin<F>(
        &self,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        callback: Option<F>,
    ) -> bool
    where
        F: Fn(&Client, &str, TransferStatus) + Send + Sync + 'static,
    {
        let mut transfer = PendingTransfer::new(name, path);
        if let Some(callback) = callback {
            transfer = transfer.with_callback(callback);
        }
        self.transfers.begin(transfer).await
    }

    pub async fn file_transfer_assign_id(
        &self,
        identity: &TransferIdentity,
        file_id: impl Into<String>,
        checksum: Option<String>,
    ) -> bool {
        self.transfers.assign_id(identity, file_id, checksum).await
    }

    /// Report a transfer status; the callback runs on the first terminal one
    pub async fn file_transfer_complete(
        &self,
        key: impl Into<TransferKey>,
        status: TransferStatus,
    ) -> bool {
        self.transfers.complete(self, key, status).await
    }

    pub async fn file_transfer_status(&self, key: impl Into<TransferKey>) -> Option<TransferStatus> {
        self.transfers.status(key).await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Drop tracked publishes older than `max_age`
    pub async fn expire_pending(&self, max_age: Duration) -> Vec<PendingPublish> {
        ReplyTimeout::new(self.tracker.clone(), max_age).sweep().await
    }

    /// Background sweeper using the configured reply timeout
    pub async fn reply_timeout(&self) -> ReplyTimeout {
        let secs = self
            .config()
            .await
            .get_u64("reply_timeout_secs")
            .unwrap_or(protocol::DEFAULT_REPLY_TIMEOUT_SECS);
        ReplyTimeout::new(self.tracker.clone(), Duration::from_secs(secs))
    }

    /// Release everything still outstanding; returns the publishes dropped
    pub async fn disconnect(&self) -> Vec<PendingPublish> {
        let dropped = self.tracker.drain().await;
        if !dropped.is_empty() {
            warn!("Disconnecting with {} publishes unanswered", dropped.len());
        }
        let aborted = self.transfers.abort_all(self).await;
        if aborted > 0 {
            warn!("[TRANSFER] Aborted {} transfers on disconnect", aborted);
        }
        info!("Client {} disconnected", self.app_id);
        dropped
    }

    /// Reboot the host through the client's process runner
    pub async fn system_reboot(&self, delay_minutes: i64, force: bool) -> i32 {
        osal::reboot(self.runner.as_ref(), delay_minutes, force).await
    }

    /// Halt the host through the client's process runner
    pub async fn system_shutdown(&self, delay_minutes: i64, force: bool) -> i32 {
        osal::shutdown(self.runner.as_ref(), delay_minutes, force).await
    }

    async fn thing_key(&self) -> String {
        let config = self.config().await;
        config
            .get_str("thing_key")
            .map(str::to_string)
            .unwrap_or_else(|| self.app_id.clone())
    }
}

/// Convenience for handlers that only report success
pub fn completed(message: impl Into<String>) -> HandlerResult {
    Ok(ActionOutcome::completed(message))
}

fn timestamp() -> String {
    Utc::now().format(protocol::TIME_FORMAT).to_string()
}

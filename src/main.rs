use anyhow::Result;
use bytes::Bytes;
use device_cloud::client::completed;
use device_cloud::{
    load_config, osal, ActionHandler, ChannelTransport, Client, Location, OutboundMessage,
    UserData,
};
use device_cloud_shared::codec;
use device_cloud_shared::{protocol, ActionRequest, Params, TransportId};
use serde_json::{json, Map};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Traffic from the loopback cloud back to the device
#[derive(Debug)]
enum CloudEvent {
    /// Transport accepted the publish with this id
    Accepted(TransportId),
    /// Message arrived on a subscribed topic
    Message { topic: String, payload: Bytes },
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let app_id = args.next().unwrap_or_else(|| "device-cloud-agent".to_string());
    let config_path = args.next().map(PathBuf::from);

    let config = load_config(&app_id, config_path.as_deref())?;

    // RUST_LOG wins over the configured level
    let level = config.get_str("log_level").unwrap_or("info").to_lowercase();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("Device agent starting: {}", app_id);
    info!(
        "  Cloud: {}:{}",
        config.get_str("cloud.host").unwrap_or("-"),
        config.get_i64("cloud.port").unwrap_or_default()
    );
    debug!("Configuration:\n{}", config);

    let loop_time = config.get_u64("loop_time").unwrap_or(1).max(1);

    let (transport, outbound_rx) = ChannelTransport::new(64);
    let client = Arc::new(Client::new(app_id.clone(), config, Arc::new(transport)));
    info!("Using {} transport", client.transport_name());

    register_actions(&client).await?;

    // Spawn reply deadline enforcement
    let timeout = client.reply_timeout().await;
    tokio::spawn(async move {
        timeout.run().await;
    });

    // Spawn the loopback cloud
    let (cloud_tx, mut cloud_rx) = mpsc::channel(64);
    let cloud_app_id = app_id.clone();
    tokio::spawn(async move {
        run_loopback_cloud(cloud_app_id, outbound_rx, cloud_tx).await;
    });

    client.attribute_publish("os_name", &osal::os_name().await).await?;
    client
        .attribute_publish("kernel", &osal::kernel_version().await)
        .await?;
    client
        .location_publish(&Location {
            fix_type: Some("3d".to_string()),
            ..Location::new(45.3516, -75.9183)
        })
        .await?;

    // Main event loop
    let mut ticker = interval(Duration::from_secs(loop_time));
    let mut tick: u64 = 0;
    loop {
        tokio::select! {
            event = cloud_rx.recv() => match event {
                Some(CloudEvent::Accepted(transport_id)) => {
                    if let Err(e) = client.on_publish_accepted(transport_id).await {
                        warn!("{}", e);
                    }
                }
                Some(CloudEvent::Message { topic, payload }) => {
                    if let Err(e) = client.handle_message(&topic, &payload).await {
                        error!("Dropping message on {}: {}", topic, e);
                    }
                }
                None => {
                    error!("Cloud channel closed");
                    break;
                }
            },
            _ = ticker.tick() => {
                tick += 1;
                let temperature = 20.0 + (tick as f64 * 0.3).sin() * 2.5;
                if let Err(e) = client.telemetry_publish("temperature", temperature).await {
                    error!("Failed to publish telemetry: {:#}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    client.disconnect().await;
    Ok(())
}

async fn register_actions(client: &Client) -> Result<()> {
    // Handlers are synchronous; query the host once up front
    let host_info = format!(
        "{} {} (kernel {})",
        osal::os_name().await,
        osal::os_version().await,
        osal::kernel_version().await
    );
    client
        .action_register_callback(
            "host_info",
            ActionHandler::client(move |_client: &Client| completed(host_info.clone())),
            None,
        )
        .await?;

    client
        .action_register_callback(
            "log_message",
            ActionHandler::full(
                |client: &Client,
                 params: &Params,
                 _data: Option<&UserData>,
                 request: &ActionRequest| {
                    let message = params
                        .get("message")
                        .map(|v| v.to_string())
                        .unwrap_or_default();
                    info!(
                        "[ACTION] {} asked {} to log: {}",
                        request.request_id,
                        client.app_id(),
                        message
                    );
                    completed("logged")
                },
            ),
            None,
        )
        .await?;

    client.action_register_command("echo", "echo", None).await?;

    for name in client.registered_actions().await {
        debug!("  action: {}", name);
    }
    Ok(())
}

/// Answer every publish the device makes and send it a few actions
async fn run_loopback_cloud(
    app_id: String,
    mut outbound: mpsc::Receiver<OutboundMessage>,
    tx: mpsc::Sender<CloudEvent>,
) {
    let action_topic = format!("{}{}", protocol::ACTION_TOPIC_PREFIX, app_id);
    let actions = [
        json!({"id": "req-1", "method": "host_info"}),
        json!({"id": "req-2", "method": "echo", "params": {"verbose": true, "name": "loopback"}}),
        json!({"id": "req-3", "method": "log_message", "params": {"message": "hello"}}),
        json!({"id": "req-4", "method": "not_registered"}),
    ];
    for action in actions {
        let event = CloudEvent::Message {
            topic: action_topic.clone(),
            payload: Bytes::from(action.to_string()),
        };
        if tx.send(event).await.is_err() {
            return;
        }
    }

    while let Some(message) = outbound.recv().await {
        if tx.send(CloudEvent::Accepted(message.transport_id)).await.is_err() {
            break;
        }

        let topic_seq = match codec::topic_sequence(&message.topic) {
            Ok(seq) => seq,
            Err(e) => {
                warn!("Loopback cloud ignoring publish: {}", e);
                continue;
            }
        };
        let commands = match codec::decode_commands(&message.payload) {
            Ok(commands) => commands,
            Err(e) => {
                warn!("Loopback cloud could not decode publish: {}", e);
                continue;
            }
        };

        let mut body = Map::new();
        for (command_seq, command) in commands {
            debug!("Loopback cloud got {} #{}", command.command, command_seq);
            body.insert(command_seq.to_string(), json!({"success": true}));
        }

        let reply = CloudEvent::Message {
            topic: codec::reply_topic(topic_seq),
            payload: Bytes::from(serde_json::Value::Object(body).to_string()),
        };
        if tx.send(reply).await.is_err() {
            break;
        }
    }
}

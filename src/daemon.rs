use anyhow::{Context, Result};
use dalybms_monitor::events::{Event, EventKind};
use dalybms_monitor::supervisor::SupervisorHandle;
use log::{error, info, warn};
use serde_json::json;
use std::time::Duration;

use crate::{commandline, mqtt};

/// Lifecycle events and snapshots; polling chatter and raw messages are left out.
fn is_key_event(kind: &EventKind) -> bool {
    !matches!(kind, EventKind::Tx { .. } | EventKind::Decoded { .. })
}

/// Lifecycle events forwarded to MQTT; snapshots go out as samples instead.
fn is_lifecycle_event(kind: &EventKind) -> bool {
    is_key_event(kind) && !matches!(kind, EventKind::State { .. })
}

/// Flattens `value` into one `(topic, payload)` pair per leaf, skipping nulls.
fn simple_format(base_topic: &str, metric_name: &str, value: &serde_json::Value) -> Vec<(String, String)> {
    fn collect(topic: &str, val: &serde_json::Value, out: &mut Vec<(String, String)>) {
        match val {
            serde_json::Value::Object(map) => {
                for (k, v) in map {
                    let sub_topic = format!("{topic}/{k}");
                    collect(&sub_topic, v, out);
                }
            }
            serde_json::Value::Array(arr) => {
                for (i, v) in arr.iter().enumerate() {
                    let sub_topic = format!("{topic}/{i}");
                    collect(&sub_topic, v, out);
                }
            }
            serde_json::Value::String(s) => out.push((topic.to_string(), s.clone())),
            serde_json::Value::Number(n) => out.push((topic.to_string(), n.to_string())),
            serde_json::Value::Bool(b) => out.push((topic.to_string(), b.to_string())),
            serde_json::Value::Null => {
                // Do not publish null values
            }
        }
    }
    let mut out = Vec::new();
    collect(&format!("{base_topic}/{metric_name}"), value, &mut out);
    out
}

async fn publish_simple_format(
    publisher: &mqtt::MqttPublisher,
    metric_name: &str,
    value: &serde_json::Value,
) {
    for (topic, payload) in simple_format(publisher.topic(), metric_name, value) {
        if let Err(e) = publisher.publish(&topic, &payload).await {
            error!("Failed to publish message to topic {topic}: {e}");
        }
    }
}

async fn publish_event(publisher: &mqtt::MqttPublisher, event: &Event) {
    match serde_json::to_string(event) {
        Ok(payload) => {
            let topic = format!("{}/event", publisher.topic());
            if let Err(e) = publisher.publish(&topic, &payload).await {
                error!("Failed to publish event to MQTT: {e:?}");
            }
        }
        Err(e) => error!("Failed to serialize event: {e}"),
    }
}

async fn publish_sample(
    publisher: &mqtt::MqttPublisher,
    handle: &SupervisorHandle,
    format: &commandline::MqttFormat,
) {
    let Some(snapshot) = handle.last_snapshot() else {
        info!("No snapshot yet, skipping sample.");
        return;
    };
    let value = match serde_json::to_value(&*snapshot) {
        Ok(value) => value,
        Err(e) => {
            error!("Failed to serialize snapshot: {e}");
            return;
        }
    };
    match format {
        commandline::MqttFormat::Json => {
            let payload = json!({
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "connected": handle.is_connected(),
                "device": handle.device_info().as_deref(),
                "snapshot": value,
            });
            info!("MQTT output: Attempting to publish sample: {payload}");
            if let Err(e) = publisher.publish(publisher.topic(), &payload.to_string()).await {
                error!("Failed to publish sample to MQTT: {e:?}");
            }
        }
        commandline::MqttFormat::Simple => {
            publish_simple_format(publisher, "snapshot", &value).await;
        }
    }
}

pub async fn run(
    handle: &SupervisorHandle,
    output: commandline::DaemonOutput,
    sample_interval: Duration,
) -> Result<()> {
    info!("Starting daemon mode: output={output:?}, sample_interval={sample_interval:?}");
    let mut subscription = handle.subscribe();

    match output {
        commandline::DaemonOutput::Console { all_events } => {
            while let Some(event) = subscription.recv().await {
                if all_events || is_key_event(&event.kind) {
                    let line = serde_json::to_string(&event).context("Cannot serialize event")?;
                    println!("{line}");
                }
            }
        }
        commandline::DaemonOutput::Mqtt {
            config_file,
            format,
        } => {
            let config = mqtt::MqttConfig::load(&config_file)
                .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
            info!("Successfully loaded MQTT config from {config_file}: {config:?}");
            let publisher = mqtt::MqttPublisher::new(config);

            let mut samples = tokio::time::interval(sample_interval.max(Duration::from_secs(1)));
            samples.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    event = subscription.recv() => match event {
                        Some(event) if is_lifecycle_event(&event.kind) => {
                            publish_event(&publisher, &event).await;
                        }
                        Some(_) => {}
                        None => break,
                    },
                    _ = samples.tick() => publish_sample(&publisher, handle, &format).await,
                }
            }
        }
    }
    warn!("Event bus closed, leaving daemon mode.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_format_flattens_leaves() {
        let value = json!({
            "voltage_v": 52.3,
            "cells_v": [3.301, 3.305],
            "balancing": false,
            "current_a": null,
            "current_source": "direct",
        });
        let mut pairs = simple_format("dalybms", "snapshot", &value);
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("dalybms/snapshot/balancing".to_string(), "false".to_string()),
                ("dalybms/snapshot/cells_v/0".to_string(), "3.301".to_string()),
                ("dalybms/snapshot/cells_v/1".to_string(), "3.305".to_string()),
                ("dalybms/snapshot/current_source".to_string(), "direct".to_string()),
                ("dalybms/snapshot/voltage_v".to_string(), "52.3".to_string()),
            ]
        );
    }

    #[test]
    fn console_filter() {
        assert!(is_key_event(&EventKind::Ready));
        assert!(is_key_event(&EventKind::TxError {
            message: "timeout".into()
        }));
        assert!(!is_key_event(&EventKind::Tx {
            frame_hex: String::new()
        }));
        assert!(!is_lifecycle_event(&EventKind::State {
            snapshot: Default::default()
        }));
    }
}

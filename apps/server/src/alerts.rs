//! Operator alerts: warnings and errors logged anywhere in the controller
//! are posted to a webhook, throttled to one per interval.

use crate::config::AlertConfig;
use crate::records::HEARTBEAT_FORMAT;
use anyhow::{anyhow, Context as _, Result};
use chrono::Local;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{warn, Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

const QUEUE_DEPTH: usize = 16;

/// Own logging and the HTTP stack would feed back into the webhook.
const SILENT_TARGETS: &[&str] = &[module_path!(), "hyper", "reqwest", "h2", "rustls"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub subject: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub timestamp: String,
}

/// Lets one event through per interval.
#[derive(Debug)]
struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    fn allow(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// `tracing` layer that queues qualifying events for [`forward_alerts`].
pub struct AlertLayer {
    min_level: Level,
    subject: String,
    throttle: Mutex<Throttle>,
    tx: mpsc::Sender<Alert>,
}

impl AlertLayer {
    pub fn new(config: &AlertConfig) -> Result<(AlertLayer, mpsc::Receiver<Alert>)> {
        let min_level: Level = config
            .min_level
            .parse()
            .map_err(|_| anyhow!("bad alert level {:?}", config.min_level))?;
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let layer = AlertLayer {
            min_level,
            subject: config.subject.clone(),
            throttle: Mutex::new(Throttle {
                interval: Duration::from_secs(config.min_interval_secs),
                last: None,
            }),
            tx,
        };
        Ok((layer, rx))
    }

    /// Builds the layer and spawns the webhook forwarder on the current runtime.
    pub fn spawn(config: &AlertConfig) -> Result<AlertLayer> {
        let (layer, rx) = Self::new(config)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building alert client")?;
        tokio::spawn(forward_alerts(client, config.webhook_url.clone(), rx));
        Ok(layer)
    }

    fn wants(&self, level: &Level, target: &str) -> bool {
        // More verbose levels compare greater.
        *level <= self.min_level && !SILENT_TARGETS.iter().any(|t| target.starts_with(t))
    }
}

impl<S: Subscriber> Layer<S> for AlertLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if !self.wants(meta.level(), meta.target()) {
            return;
        }
        let allowed = self
            .throttle
            .lock()
            .map(|mut t| t.allow(Instant::now()))
            .unwrap_or(false);
        if !allowed {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let alert = Alert {
            subject: self.subject.clone(),
            level: meta.level().to_string(),
            target: meta.target().to_string(),
            message: format!("{}{}", visitor.message, visitor.fields),
            timestamp: Local::now().naive_local().format(HEARTBEAT_FORMAT).to_string(),
        };
        // A full queue means the webhook is already behind; drop.
        let _ = self.tx.try_send(alert);
    }
}

/// Posts each queued alert as JSON until every sender is gone.
pub async fn forward_alerts(client: reqwest::Client, url: String, mut rx: mpsc::Receiver<Alert>) {
    while let Some(alert) = rx.recv().await {
        let res = client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&alert)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        if let Err(e) = res {
            warn!("alert delivery to {} failed: {}", url, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tracing::{error, info};
    use tracing_subscriber::prelude::*;

    fn config(interval: u64) -> AlertConfig {
        AlertConfig {
            webhook_url: "http://127.0.0.1:9/hook".to_string(),
            min_level: "warn".to_string(),
            min_interval_secs: interval,
            subject: "ALERTA sistema RCE".to_string(),
        }
    }

    #[test]
    fn throttle_lets_one_through_per_interval() {
        let mut t = Throttle {
            interval: Duration::from_secs(300),
            last: None,
        };
        let start = Instant::now();
        assert!(t.allow(start));
        assert!(!t.allow(start + Duration::from_secs(299)));
        assert!(t.allow(start + Duration::from_secs(300)));
        assert!(!t.allow(start + Duration::from_secs(301)));
    }

    #[test]
    fn level_and_target_filter() {
        let (layer, _rx) = AlertLayer::new(&config(0)).unwrap();
        assert!(layer.wants(&Level::ERROR, "rce_server::doors"));
        assert!(layer.wants(&Level::WARN, "rce_server::control"));
        assert!(!layer.wants(&Level::INFO, "rce_server::control"));
        assert!(!layer.wants(&Level::ERROR, "hyper::proto"));
        assert!(!layer.wants(&Level::ERROR, "rce_server::alerts"));
    }

    #[test]
    fn events_become_alerts() {
        let (layer, mut rx) = AlertLayer::new(&config(300)).unwrap();
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            info!(target: "rce_server::control", "routine tick");
            error!(target: "rce_server::doors", step = "wait closed", "door sequence failed");
            warn!(target: "rce_server::doors", "second problem inside the interval");
            error!(target: "rce_server::alerts", "delivery failed");
        });

        let alert = rx.try_recv().unwrap();
        assert_eq!(alert.subject, "ALERTA sistema RCE");
        assert_eq!(alert.level, "ERROR");
        assert_eq!(alert.message, "door sequence failed step=wait closed");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn rejects_unknown_level() {
        let mut c = config(0);
        c.min_level = "loud".to_string();
        assert!(AlertLayer::new(&c).is_err());
    }

    #[tokio::test]
    async fn forwarder_posts_json() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received);
                if text.contains("\r\n\r\n") && text.trim_end().ends_with('}') {
                    break;
                }
            }
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8(received).unwrap()
        });

        let (tx, rx) = mpsc::channel(1);
        tx.send(Alert {
            subject: "ALERTA sistema RCE".to_string(),
            level: "ERROR".to_string(),
            target: "rce_server::doors".to_string(),
            message: "end-stop timeout".to_string(),
            timestamp: "2024-06-03T10:00:00".to_string(),
        })
        .await
        .unwrap();
        drop(tx);
        forward_alerts(reqwest::Client::new(), url, rx).await;

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /hook"));
        assert!(request.contains("\"message\":\"end-stop timeout\""));
        assert!(request.contains("\"subject\":\"ALERTA sistema RCE\""));
    }
}

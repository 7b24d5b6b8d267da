//! Outbound delivery of lead events to a configured HTTP endpoint.

use std::time::Duration;

use hmac::{Hmac, Mac};
use leadroute_core::config::EventsConfig;
use leadroute_core::events::{EventEmitter, LeadEvent};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-leadroute-signature";
pub const EVENT_TYPE_HEADER: &str = "x-leadroute-event";

/// Posts each event as JSON on a spawned task. Delivery failures are logged and dropped.
#[derive(Clone)]
pub struct WebhookEventEmitter {
    client: Client,
    url: String,
    signing_secret: Option<SecretString>,
}

impl WebhookEventEmitter {
    pub fn new(
        url: impl Into<String>,
        signing_secret: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.into(), signing_secret })
    }

    /// `None` when no webhook url is configured.
    pub fn from_config(config: &EventsConfig) -> Result<Option<Self>, reqwest::Error> {
        match &config.webhook_url {
            Some(url) => Self::new(
                url.clone(),
                config.signing_secret.clone(),
                Duration::from_secs(config.timeout_secs),
            )
            .map(Some),
            None => Ok(None),
        }
    }

    async fn deliver(&self, event: LeadEvent) {
        let body = match serde_json::to_vec(&event) {
            Ok(body) => body,
            Err(error) => {
                warn!(
                    event_name = "events.webhook.encode_failed",
                    event_id = %event.event_id,
                    lead_id = %event.lead_id,
                    error = %error,
                    "could not encode lead event"
                );
                return;
            }
        };

        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(EVENT_TYPE_HEADER, event.event_type.as_str());
        if let Some(secret) = &self.signing_secret {
            request = request.header(SIGNATURE_HEADER, sign_payload(secret, &body));
        }

        match request.body(body).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(
                    event_name = "events.webhook.delivered",
                    event_id = %event.event_id,
                    lead_id = %event.lead_id,
                    status = response.status().as_u16(),
                    "lead event delivered"
                );
            }
            Ok(response) => {
                warn!(
                    event_name = "events.webhook.rejected",
                    event_id = %event.event_id,
                    lead_id = %event.lead_id,
                    status = response.status().as_u16(),
                    "webhook endpoint rejected lead event"
                );
            }
            Err(error) => {
                warn!(
                    event_name = "events.webhook.failed",
                    event_id = %event.event_id,
                    lead_id = %event.lead_id,
                    error = %error,
                    "lead event delivery failed"
                );
            }
        }
    }
}

impl EventEmitter for WebhookEventEmitter {
    fn publish(&self, event: LeadEvent) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(
                    event_name = "events.webhook.no_runtime",
                    event_id = %event.event_id,
                    lead_id = %event.lead_id,
                    "no async runtime available; lead event dropped"
                );
                return;
            }
        };

        let emitter = self.clone();
        runtime.spawn(async move { emitter.deliver(event).await });
    }
}

/// `sha256=<hex>` HMAC of the raw request body.
pub fn sign_payload(secret: &SecretString, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.expose_secret().as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", encode_hex(mac.finalize().into_bytes().as_slice()))
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{body::Bytes, extract::State, http::HeaderMap, routing::post, Router};
    use chrono::Utc;
    use leadroute_core::domain::lead::LeadId;
    use leadroute_core::events::{EventEmitter, LeadEvent, LeadEventType};
    use secrecy::SecretString;
    use tokio::sync::mpsc;

    use super::{sign_payload, WebhookEventEmitter, EVENT_TYPE_HEADER, SIGNATURE_HEADER};

    #[test]
    fn signature_matches_known_hmac_sha256_vector() {
        let secret = SecretString::from("key".to_string());
        let signature = sign_payload(&secret, b"The quick brown fox jumps over the lazy dog");

        assert_eq!(
            signature,
            "sha256=f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[tokio::test]
    async fn published_event_arrives_signed() {
        let (tx, mut rx) = mpsc::channel::<(HeaderMap, Bytes)>(1);
        let receiver = Router::new()
            .route(
                "/hooks/leads",
                post(|State(tx): State<mpsc::Sender<(HeaderMap, Bytes)>>, headers: HeaderMap, body: Bytes| async move {
                    let _ = tx.send((headers, body)).await;
                    "ok"
                }),
            )
            .with_state(tx);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, receiver).await;
        });

        let secret = SecretString::from("whsec-test".to_string());
        let emitter = WebhookEventEmitter::new(
            format!("http://{address}/hooks/leads"),
            Some(secret.clone()),
            Duration::from_secs(5),
        )
        .expect("client");

        emitter.publish(LeadEvent::new(
            LeadEventType::Assigned,
            LeadId("lead-77".to_string()),
            "roofing",
            Utc::now(),
        ));

        let (headers, body) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("webhook delivered in time")
            .expect("webhook body");

        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
            .expect("signature header");
        assert_eq!(signature, sign_payload(&secret, &body));
        assert_eq!(
            headers.get(EVENT_TYPE_HEADER).and_then(|value| value.to_str().ok()),
            Some("lead.assigned")
        );

        let decoded: serde_json::Value = serde_json::from_slice(&body).expect("json body");
        assert_eq!(decoded["lead_id"], "lead-77");
    }

    #[tokio::test]
    async fn unreachable_endpoint_does_not_block_publish() {
        let emitter = WebhookEventEmitter::new(
            "http://127.0.0.1:9/unreachable",
            None,
            Duration::from_millis(200),
        )
        .expect("client");

        emitter.publish(LeadEvent::new(
            LeadEventType::Unassigned,
            LeadId("lead-78".to_string()),
            "hvac",
            Utc::now(),
        ));
    }
}

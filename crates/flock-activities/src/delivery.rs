//! Outbound activity delivery.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{DeliveryError, Identity};

/// Content type for ActivityPub payloads.
pub const ACTIVITY_JSON: &str = "application/activity+json";

/// Sends an activity to a remote inbox on behalf of a local identity.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(
        &self,
        signer: &Identity,
        inbox: &str,
        activity: &Value,
    ) -> Result<(), DeliveryError>;
}

/// Delivers activities with an HTTP POST.
pub struct HttpDelivery {
    http: Client,
}

impl HttpDelivery {
    pub fn new() -> Result<Self, DeliveryError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("flock/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Delivery for HttpDelivery {
    #[tracing::instrument(skip(self, signer, activity), fields(signer = %signer.actor_uri))]
    async fn deliver(
        &self,
        signer: &Identity,
        inbox: &str,
        activity: &Value,
    ) -> Result<(), DeliveryError> {
        let response = self
            .http
            .post(inbox)
            .header(reqwest::header::CONTENT_TYPE, ACTIVITY_JSON)
            .header(reqwest::header::ACCEPT, ACTIVITY_JSON)
            .body(activity.to_string())
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(DeliveryError::RateLimited {
                inbox: inbox.to_string(),
                retry_after_secs,
            });
        }

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("failed to read response: {}", e));
            return Err(DeliveryError::Rejected {
                inbox: inbox.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        debug!(%status, "activity delivered");
        Ok(())
    }
}

/// One delivery captured by [`RecordingDelivery`].
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    pub signer: String,
    pub inbox: String,
    pub activity: Value,
}

/// Records deliveries instead of sending them.
#[derive(Debug, Default)]
pub struct RecordingDelivery {
    delivered: Mutex<Vec<Delivered>>,
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything delivered so far, in order.
    pub async fn delivered(&self) -> Vec<Delivered> {
        self.delivered.lock().await.clone()
    }
}

#[async_trait]
impl Delivery for RecordingDelivery {
    async fn deliver(
        &self,
        signer: &Identity,
        inbox: &str,
        activity: &Value,
    ) -> Result<(), DeliveryError> {
        info!(
            signer = %signer.actor_uri,
            inbox,
            kind = activity["type"].as_str().unwrap_or("?"),
            "recorded delivery"
        );
        self.delivered.lock().await.push(Delivered {
            signer: signer.actor_uri.clone(),
            inbox: inbox.to_string(),
            activity: activity.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn signer() -> Identity {
        Identity::local("alice", "https://flock.test")
    }

    #[tokio::test]
    async fn test_deliver_posts_activity_json() {
        let mock_server = MockServer::start().await;
        let activity = json!({"type": "Follow", "id": "https://flock.test/f/1"});

        Mock::given(method("POST"))
            .and(path("/users/bob/inbox"))
            .and(header("content-type", ACTIVITY_JSON))
            .and(body_json(&activity))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&mock_server)
            .await;

        let delivery = HttpDelivery::new().unwrap();
        let inbox = format!("{}/users/bob/inbox", mock_server.uri());
        let result = delivery.deliver(&signer(), &inbox, &activity).await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_deliver_rejected() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/inbox"))
            .respond_with(ResponseTemplate::new(403).set_body_string("blocked"))
            .mount(&mock_server)
            .await;

        let delivery = HttpDelivery::new().unwrap();
        let inbox = format!("{}/inbox", mock_server.uri());
        let err = delivery
            .deliver(&signer(), &inbox, &json!({"type": "Like"}))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DeliveryError::Rejected { status: 403, ref body, .. } if body == "blocked"
        ));
    }

    #[tokio::test]
    async fn test_deliver_rate_limited() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/inbox"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "30"))
            .mount(&mock_server)
            .await;

        let delivery = HttpDelivery::new().unwrap();
        let inbox = format!("{}/inbox", mock_server.uri());
        let err = delivery
            .deliver(&signer(), &inbox, &json!({"type": "Like"}))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DeliveryError::RateLimited {
                retry_after_secs: Some(30),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_recording_delivery_keeps_order() {
        let recorder = RecordingDelivery::new();
        recorder
            .deliver(&signer(), "https://a.test/inbox", &json!({"type": "Follow"}))
            .await
            .unwrap();
        recorder
            .deliver(&signer(), "https://b.test/inbox", &json!({"type": "Undo"}))
            .await
            .unwrap();

        let delivered = recorder.delivered().await;
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].inbox, "https://a.test/inbox");
        assert_eq!(delivered[1].activity["type"], "Undo");
        assert_eq!(delivered[1].signer, "https://flock.test/@alice/");
    }
}

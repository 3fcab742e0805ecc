mod common;

use std::sync::Arc;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::Harness;
use flock_activities::{ACTIVITY_JSON, ActivitiesConfig, HttpDelivery, Identity, follow_id};

#[tokio::test]
async fn test_follow_request_reaches_remote_inbox() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/users/bob/inbox"))
        .and(header("content-type", ACTIVITY_JSON))
        .and(body_partial_json(json!({
            "type": "Follow",
            "object": format!("{}/users/bob", mock_server.uri()),
        })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&mock_server)
        .await;

    let harness = Harness::with_delivery(
        Arc::new(HttpDelivery::new().unwrap()),
        ActivitiesConfig::default(),
    );
    let alice = harness.local("alice").await;
    let bob = Identity::remote(
        "bob",
        &format!("{}/users/bob", mock_server.uri()),
        &format!("{}/users/bob/inbox", mock_server.uri()),
    );
    harness.federation.directory().add_identity(bob.clone()).await;

    harness.federation.follow(alice, bob.id).await.unwrap();
    harness.settle().await;

    assert_eq!(
        harness.state(follow_id(alice, bob.id)).await,
        "local_requested"
    );
}

#[tokio::test]
async fn test_refused_follow_request_is_retried_later() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&mock_server)
        .await;

    let harness = Harness::with_delivery(
        Arc::new(HttpDelivery::new().unwrap()),
        ActivitiesConfig::default(),
    );
    let alice = harness.local("alice").await;
    let bob = Identity::remote(
        "bob",
        &format!("{}/users/bob", mock_server.uri()),
        &format!("{}/users/bob/inbox", mock_server.uri()),
    );
    harness.federation.directory().add_identity(bob.clone()).await;

    harness.federation.follow(alice, bob.id).await.unwrap();
    assert_eq!(harness.settle().await, 1);

    let follow = harness
        .federation
        .stator()
        .get(follow_id(alice, bob.id))
        .await
        .unwrap();
    assert_eq!(follow.state, "unrequested");
    assert_eq!(follow.state_attempts, 1);
}

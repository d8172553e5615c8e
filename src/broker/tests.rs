//! Broker Abstraction Tests

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;

use super::stream::{ensure_stream, StreamAdmin};
use super::token::user_from_token;
use super::{BrokerError, Result};

// =============================================================================
// Token Extraction
// =============================================================================

fn make_jwt(claims: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims);
    format!("{}.{}.sig", header, payload)
}

#[test]
fn test_user_from_plain_sub_claim() {
    let token = make_jwt(r#"{"sub":"bridge-user"}"#);
    assert_eq!(user_from_token(&token).unwrap(), "bridge-user");
}

#[test]
fn test_user_from_namespaced_sub_claim() {
    let token = make_jwt(r#"{"sub":"system:serviceaccount:bridge-user"}"#);
    assert_eq!(user_from_token(&token).unwrap(), "bridge-user");
}

#[test]
fn test_user_missing_sub_claim() {
    let token = make_jwt(r#"{"iss":"someone"}"#);
    let err = user_from_token(&token).unwrap_err();
    assert!(matches!(err, BrokerError::Auth(_)));
    assert!(err.to_string().contains("sub claim not found"));
}

#[test]
fn test_user_empty_sub_claim() {
    let token = make_jwt(r#"{"sub":""}"#);
    let err = user_from_token(&token).unwrap_err();
    assert!(err.to_string().contains("empty sub claim"));
}

#[test]
fn test_user_not_a_jwt() {
    assert!(matches!(
        user_from_token("just-a-password"),
        Err(BrokerError::Auth(_))
    ));
    assert!(matches!(
        user_from_token("a.!!notbase64!!.c"),
        Err(BrokerError::Auth(_))
    ));
}

// =============================================================================
// Stream Provisioning
// =============================================================================

#[derive(Default)]
struct MockAdmin {
    streams: Mutex<Vec<String>>,
    lookups: AtomicUsize,
    creates: AtomicUsize,
    fail_create: bool,
}

#[async_trait]
impl StreamAdmin for MockAdmin {
    async fn stream_exists(&self, name: &str) -> bool {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.streams.lock().iter().any(|s| s == name)
    }

    async fn add_stream(&self, name: &str, _subjects: Vec<String>) -> Result<()> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_create {
            return Err(BrokerError::Provision("boom".to_string()));
        }
        self.streams.lock().push(name.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn test_ensure_stream_creates_once() {
    let admin = MockAdmin::default();
    let subjects = vec!["events.wheel.hub.mailbox".to_string()];

    ensure_stream(&admin, "events", subjects.clone()).await.unwrap();
    ensure_stream(&admin, "events", subjects).await.unwrap();

    assert_eq!(admin.creates.load(Ordering::SeqCst), 1);
    assert_eq!(admin.lookups.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_ensure_stream_existing_stream_is_accepted_unchanged() {
    let admin = MockAdmin::default();
    admin.streams.lock().push("events".to_string());

    // Different subject set than whatever the stream was created with;
    // no reconciliation happens.
    ensure_stream(&admin, "events", vec!["other.subject".to_string()])
        .await
        .unwrap();

    assert_eq!(admin.creates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_ensure_stream_propagates_create_failure() {
    let admin = MockAdmin {
        fail_create: true,
        ..Default::default()
    };

    let err = ensure_stream(&admin, "events", vec![]).await.unwrap_err();
    assert!(matches!(err, BrokerError::Provision(_)));
}

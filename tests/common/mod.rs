//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use axum::{body::Body, http::Request, Router};
use serde_json::Value;
use tower::ServiceExt;

use admin_shield::config::ShieldConfig;
use admin_shield::http::server::build_router;
use admin_shield::http::AppState;
use admin_shield::{DefenseStack, ManualClock};

pub const API_KEY: &str = "test-admin-key";

/// Arbitrary fixed start so time arithmetic never underflows.
pub const T0: u64 = 1_700_000_000_000;

pub fn test_config() -> ShieldConfig {
    let mut config = ShieldConfig::default();
    config.admin.api_key = API_KEY.to_string();
    config.sweeper.enabled = false;
    config
}

pub fn stack_with(config: &ShieldConfig) -> (DefenseStack, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(T0));
    let stack = DefenseStack::from_config(config, clock.clone()).unwrap();
    (stack, clock)
}

pub fn app_with(config: ShieldConfig) -> (Router, DefenseStack, Arc<ManualClock>) {
    let (stack, clock) = stack_with(&config);
    let router = build_router(AppState::new(stack.clone(), config));
    (router, stack, clock)
}

pub fn admin_request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", API_KEY));
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Send one request through the router and return status and JSON body.
pub async fn send(router: &Router, request: Request<Body>) -> (u16, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status().as_u16();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

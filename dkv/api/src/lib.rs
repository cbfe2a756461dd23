// Copyright 2022-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The client-facing HTTP surface. Handlers only translate between HTTP and
//! [`dkv_service::KvService`]; validation and leader gating live in the
//! service.

use std::sync::Arc;
use std::time::Duration;

use axum::error_handling::HandleErrorLayer;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{BoxError, Router};
use tower::timeout::TimeoutLayer;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use dkv_service::KvService;

mod handlers;

/// Build the public router over the service.
pub fn app_router(service: Arc<KvService>, request_timeout: Duration) -> Router {
    let routes = Router::new()
        .route("/hello", get(handlers::hello))
        .route("/key", post(handlers::set_key))
        .route(
            "/key/:id",
            get(handlers::get_key).delete(handlers::delete_key),
        )
        .route("/register-follower", post(handlers::register_follower))
        .with_state(service);
    with_middleware(routes, request_timeout)
}

/// Request logging, panic recovery, and the global request deadline.
fn with_middleware(router: Router, request_timeout: Duration) -> Router {
    router.layer(
        ServiceBuilder::new()
            .layer(CatchPanicLayer::new())
            .layer(TraceLayer::new_for_http())
            .layer(HandleErrorLayer::new(middleware_error))
            .layer(TimeoutLayer::new(request_timeout)),
    )
}

async fn middleware_error(err: BoxError) -> (StatusCode, String) {
    if err.is::<tower::timeout::error::Elapsed>() {
        (StatusCode::GATEWAY_TIMEOUT, "request timed out".to_string())
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("unhandled internal error: {err}"),
        )
    }
}

// Copyright 2022-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use dkv_raft::NodeId;
use dkv_service::{KvService, ServiceError};

pub async fn hello() -> &'static str {
    "world!"
}

pub async fn get_key(State(service): State<Arc<KvService>>, Path(id): Path<String>) -> Response {
    match service.get(&id) {
        // Literal spacing, pinned by the on-the-wire tests.
        Ok(val) => (StatusCode::OK, format!("{{ \"{id}\" : \"{val}\" }}")).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct SetRequest {
    key: String,
    value: String,
}

pub async fn set_key(
    State(service): State<Arc<KvService>>,
    Json(body): Json<SetRequest>,
) -> Response {
    match service.set(&body.key, &body.value).await {
        Ok(()) => (StatusCode::CREATED, "key created successfully!").into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn delete_key(
    State(service): State<Arc<KvService>>,
    Path(id): Path<String>,
) -> Response {
    match service.delete(&id).await {
        Ok(()) => (StatusCode::OK, "key deleted successfully").into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterFollowerRequest {
    follower_id: String,
    follower_addr: String,
}

pub async fn register_follower(
    State(service): State<Arc<KvService>>,
    Json(body): Json<RegisterFollowerRequest>,
) -> Response {
    let Ok(follower_id) = body.follower_id.parse::<NodeId>() else {
        return (StatusCode::BAD_REQUEST, "follower id must be numeric").into_response();
    };
    match service
        .register_follower(follower_id, &body.follower_addr)
        .await
    {
        Ok(()) => (StatusCode::OK, "registered").into_response(),
        Err(e) => {
            tracing::error!(follower = follower_id, "follower registration failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "registration of follower failed",
            )
                .into_response()
        }
    }
}

/// The one place service errors turn into status codes.
fn error_response(err: ServiceError) -> Response {
    let status = match &err {
        ServiceError::InvalidKey(_) | ServiceError::InvalidValue(_) | ServiceError::MapFull => {
            StatusCode::BAD_REQUEST
        }
        ServiceError::NotFound => StatusCode::NOT_FOUND,
        // A non-leader in a steady cluster is a conflict the client resolves
        // by talking to the leader; an election in progress is unavailability.
        ServiceError::AlreadyExists | ServiceError::NotLeader(_) => StatusCode::CONFLICT,
        ServiceError::LeaderNotReady => StatusCode::SERVICE_UNAVAILABLE,
        ServiceError::NoLeader | ServiceError::Consensus(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

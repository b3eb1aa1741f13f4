//! Liveness and readiness probes.
//!
//! `/readyz` checks every resource an upload passes through: the record
//! database, the chunk root and the artifact root. Failure details are
//! logged; the response only names the check that failed.

use crate::services::chunked_upload::ChunkedUploadService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::BTreeMap, fmt::Display};
use tracing::warn;

/// `GET /healthz`. Never touches storage.
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// `GET /readyz`: 200 when all checks pass, 503 otherwise.
pub async fn readyz(State(service): State<ChunkedUploadService>) -> impl IntoResponse {
    let database = sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*service.db)
        .await;
    let database = match database {
        Ok(1) => Ok(()),
        Ok(other) => Err(format!("unexpected result {}", other)),
        Err(err) => Err(err.to_string()),
    };

    let mut checks = BTreeMap::new();
    checks.insert("database", check("database", database));
    checks.insert(
        "chunk_root",
        check("chunk_root", service.chunks.check_writable().await),
    );
    checks.insert(
        "artifact_root",
        check("artifact_root", service.artifacts.check_writable().await),
    );

    let ready = checks.values().all(|c| c.ok);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            status: if ready { "ok" } else { "unavailable" },
            checks,
        }),
    )
}

fn check<E: Display>(name: &'static str, result: Result<(), E>) -> CheckStatus {
    match result {
        Ok(()) => CheckStatus {
            ok: true,
            error: None,
        },
        Err(err) => {
            warn!("readiness check {} failed: {}", name, err);
            CheckStatus {
                ok: false,
                error: Some("unavailable"),
            }
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
}

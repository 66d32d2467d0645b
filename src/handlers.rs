//! HTTP endpoints of the router service.
//!
//! Two surfaces share one Axum router: the metered-call surface
//! (`POST /v1/router/{agentId}`) and the permit admin surface (`/permits`).
//! Every error kind maps onto the status contract in [`crate::error`];
//! `OPTIONS` preflight is answered by the permissive CORS layer installed in
//! `main`.

use alloy_primitives::Address;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

use crate::error::RouterError;
use crate::router::{
    CreatePermitRequest, PaymentRouter, RevokePermitRequest, RouterRequest,
};
use crate::types::PermitStatus;

pub fn routes(router: Arc<PaymentRouter>) -> Router {
    Router::new()
        .route("/v1/router/{agent_id}", post(post_router_call))
        .route("/permits", post(post_create_permit).get(get_permits))
        .route("/permits/revoke", post(post_revoke_permit))
        .route("/permits/{id}", patch(patch_permit))
        .route("/health", get(get_health))
        .with_state(router)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// `POST /v1/router/{agentId}`: route one metered API call.
#[instrument(skip_all, fields(agent = %agent_id))]
async fn post_router_call(
    State(router): State<Arc<PaymentRouter>>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    body: Result<Json<RouterRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(_) => return RouterError::InvalidJson.into_response(),
    };
    match router
        .handle_call(bearer_token(&headers), &agent_id, request)
        .await
    {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(error) => {
            tracing::warn!(error = %error, "routed call failed");
            error.into_response()
        }
    }
}

/// `POST /permits`: store a signed permit and bring chain state in sync.
#[instrument(skip_all)]
async fn post_create_permit(
    State(router): State<Arc<PaymentRouter>>,
    body: Result<Json<CreatePermitRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(_) => return RouterError::InvalidJson.into_response(),
    };
    match router.create_permit(request).await {
        Ok(submission) => (StatusCode::CREATED, Json(submission)).into_response(),
        Err(error) => {
            tracing::warn!(error = %error, "permit creation failed");
            error.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PermitListQuery {
    user_address: Address,
    #[serde(default)]
    status: Option<PermitStatus>,
}

/// `GET /permits?userAddress=0x…[&status=active]`.
#[instrument(skip_all)]
async fn get_permits(
    State(router): State<Arc<PaymentRouter>>,
    Query(query): Query<PermitListQuery>,
) -> Response {
    match router.list_permits(query.user_address, query.status).await {
        Ok(permits) => (StatusCode::OK, Json(permits)).into_response(),
        Err(error) => error.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct PermitPatchBody {
    status: PermitStatus,
}

/// `PATCH /permits/{id}`: local status update (revocation bookkeeping).
#[instrument(skip_all, fields(permit = %id))]
async fn patch_permit(
    State(router): State<Arc<PaymentRouter>>,
    Path(id): Path<String>,
    body: Result<Json<PermitPatchBody>, JsonRejection>,
) -> Response {
    let Json(patch) = match body {
        Ok(body) => body,
        Err(_) => return RouterError::InvalidJson.into_response(),
    };
    match router.update_permit_status(&id, patch.status).await {
        Ok(permit) => (StatusCode::OK, Json(permit)).into_response(),
        Err(error) => error.into_response(),
    }
}

/// `POST /permits/revoke`: submit a zero-amount revocation permit on-chain.
#[instrument(skip_all)]
async fn post_revoke_permit(
    State(router): State<Arc<PaymentRouter>>,
    body: Result<Json<RevokePermitRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(_) => return RouterError::InvalidJson.into_response(),
    };
    match router.revoke_permit(request).await {
        Ok(submission) => (StatusCode::OK, Json(submission)).into_response(),
        Err(error) => {
            tracing::warn!(error = %error, "permit revocation failed");
            error.into_response()
        }
    }
}

/// `GET /health`: configured networks and the admin signer address.
#[instrument(skip_all)]
async fn get_health(State(router): State<Arc<PaymentRouter>>) -> Response {
    (StatusCode::OK, Json(router.health())).into_response()
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: ErrorDetail,
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: ErrorDetail {
                code: self.code(),
                message: self.to_string(),
            },
        };
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_requires_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer sk_live_1".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("sk_live_1"));

        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn errors_render_with_their_status() {
        let response = RouterError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = RouterError::SubscriptionRequired.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = RouterError::InvalidJson.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

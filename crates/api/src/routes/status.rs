//! Signature lookup and confirmation policy endpoints.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use super::intents::parse_chain_id;
use crate::{state::AppState, ApiResult};

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub signature: String,
}

/// GET /v1/status/{id}
///
/// Waits briefly for a session still in flight before answering 404.
pub async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    let signature = state.signer.status(&id).await?;
    Ok(Json(StatusResponse {
        signature: format!("0x{}", hex::encode(signature)),
    }))
}

/// GET /v1/chains/{chainId}/confirmations
///
/// Amount threshold (whole USD) to required block confirmations.
pub async fn get_confirmations(
    State(state): State<AppState>,
    Path(chain_id): Path<String>,
) -> ApiResult<Json<BTreeMap<u64, u64>>> {
    let chain_id = parse_chain_id(&chain_id)?;
    Ok(Json(state.signer.confirmations(chain_id)?))
}

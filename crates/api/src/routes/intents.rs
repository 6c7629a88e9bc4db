//! Signing and unlock endpoints.

use alloy_primitives::{Address, B256, U256};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use threshold_orchestrator::{Intent, SignatureResponse};
use tracing::debug;

use crate::{error::ApiError, state::AppState, ApiResult};

pub const PROTOCOL_ACROSS: &str = "across";
pub const PROTOCOL_LIFI_ESCROW: &str = "lifi-escrow";
pub const PROTOCOL_LIFI: &str = "lifi";

/// Body of `POST /v1/chains/{chainId}/signing`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningRequest {
    /// Deposit id (decimal or `0x` hex) or, for escrow orders, the order id.
    pub deposit_id: String,
    #[serde(default)]
    pub chain_id: Option<u64>,
    #[serde(default)]
    pub protocol: Option<String>,
}

/// Body of `POST /v1/chains/{chainId}/unlocks`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockRequest {
    pub protocol: String,
    pub order_id: String,
    pub settler: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AcceptedResponse {
    pub id: String,
}

pub(crate) fn parse_chain_id(raw: &str) -> ApiResult<u64> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("invalid chain id '{}'", raw)))
}

fn parse_order_id(raw: &str) -> ApiResult<B256> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("invalid orderId '{}'", raw)))
}

impl SigningRequest {
    fn into_intent(self, chain_id: u64) -> ApiResult<Intent> {
        if let Some(body_chain) = self.chain_id {
            if body_chain != chain_id {
                return Err(ApiError::bad_request("chainId does not match path"));
            }
        }
        match self.protocol.as_deref().unwrap_or(PROTOCOL_ACROSS) {
            PROTOCOL_ACROSS => {
                let deposit_id: U256 = self.deposit_id.parse().map_err(|_| {
                    ApiError::bad_request(format!("invalid depositId '{}'", self.deposit_id))
                })?;
                Ok(Intent::Across {
                    chain_id,
                    deposit_id,
                })
            }
            PROTOCOL_LIFI_ESCROW => Ok(Intent::LifiEscrow {
                chain_id,
                order_id: parse_order_id(&self.deposit_id)?,
            }),
            other => Err(ApiError::bad_request(format!(
                "unsupported protocol '{}'",
                other
            ))),
        }
    }
}

impl UnlockRequest {
    fn into_intent(self, chain_id: u64) -> ApiResult<Intent> {
        if self.protocol != PROTOCOL_LIFI && self.protocol != PROTOCOL_LIFI_ESCROW {
            return Err(ApiError::bad_request(format!(
                "unsupported protocol '{}'",
                self.protocol
            )));
        }
        let settler: Address = self
            .settler
            .parse()
            .map_err(|_| ApiError::bad_request(format!("invalid settler '{}'", self.settler)))?;
        Ok(Intent::LifiUnlock {
            chain_id,
            order_id: parse_order_id(&self.order_id)?,
            settler,
        })
    }
}

/// POST /v1/chains/{chainId}/signing
///
/// Returns 202 once the intent passed validation; signing continues in the
/// background and the result shows up under `/v1/status/{id}`.
pub async fn submit_signing(
    State(state): State<AppState>,
    Path(chain_id): Path<String>,
    payload: Result<Json<SigningRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    let chain_id = parse_chain_id(&chain_id)?;
    let Json(request) = payload?;
    let intent = request.into_intent(chain_id)?;
    debug!(session_id = %intent.session_id(), "Signing request");

    let accepted = state.signer.submit(intent).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            id: accepted.session_id,
        }),
    ))
}

/// POST /v1/chains/{chainId}/unlocks
pub async fn submit_unlock(
    State(state): State<AppState>,
    Path(chain_id): Path<String>,
    payload: Result<Json<UnlockRequest>, JsonRejection>,
) -> ApiResult<Json<SignatureResponse>> {
    let chain_id = parse_chain_id(&chain_id)?;
    let Json(request) = payload?;
    let intent = request.into_intent(chain_id)?;
    debug!(session_id = %intent.session_id(), "Unlock request");

    Ok(Json(state.signer.unlock(intent).await?))
}

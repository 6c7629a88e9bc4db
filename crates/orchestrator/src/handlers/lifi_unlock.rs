//! Input settler unlocks.
//!
//! Once an escrow order is settled, or its fill deadline has passed
//! unfilled, the pool authorizes the input settler to open the order's
//! lock. The signature is returned to the caller directly.

use std::sync::Arc;

use alloy_primitives::U256;
use async_trait::async_trait;
use threshold_chains::{OrderApi, OrderStatus};
use threshold_types::Error;
use tracing::debug;

use super::{order_identifier, unix_now, HandlerContext, IntentPipeline, Prepared};
use crate::digest::allow_open_digest;
use crate::message::{Intent, IntentMessage};

pub struct LifiUnlockPipeline {
    ctx: Arc<HandlerContext>,
    orders: Arc<dyn OrderApi>,
}

impl LifiUnlockPipeline {
    pub fn new(ctx: Arc<HandlerContext>, orders: Arc<dyn OrderApi>) -> Self {
        Self { ctx, orders }
    }
}

#[async_trait]
impl IntentPipeline for LifiUnlockPipeline {
    fn family(&self) -> &'static str {
        "lifi-unlock"
    }

    async fn prepare(&self, message: &IntentMessage) -> Result<Prepared, Error> {
        let Intent::LifiUnlock {
            chain_id,
            order_id,
            settler,
        } = message.intent
        else {
            return Err(Error::invalid("expected a lifi-unlock intent"));
        };

        let chain = self.ctx.chains.require(chain_id)?;
        if chain.config.lifi_input_settler != Some(settler) {
            return Err(Error::invalid(format!(
                "settler {} not supported on chain '{}'",
                settler, chain_id
            )));
        }

        let signed = self
            .ctx
            .fetch(format!("order {}", order_id), self.orders.order(order_id))
            .await?;
        let order = &signed.order;
        if order.origin_chain_id != U256::from(chain_id) {
            return Err(Error::policy("order origin chain mismatch"));
        }
        if order_identifier(chain_id, settler, order) != order_id {
            return Err(Error::unavailable("order hash mismatch"));
        }

        match signed.meta.order_status {
            OrderStatus::Refunded => return Err(Error::policy("order already refunded")),
            OrderStatus::Settled => {}
            _ if u64::from(order.fill_deadline) < unix_now() => {}
            _ => return Err(Error::policy("order not unlockable yet")),
        }

        let digest = allow_open_digest(
            chain_id,
            settler,
            order_id,
            U256::from_be_bytes(order_id.0),
            U256::from(order.expires),
        );
        debug!(chain_id, %order_id, %digest, "Unlock validated");
        Ok(Prepared {
            session_id: message.intent.session_id(),
            digest,
        })
    }
}

//! Escrow orders backed by resource locks.
//!
//! The order's input sits in a lock on the origin chain, committed to by
//! both the sponsor and the lock's allocator over one `BatchCompact` hash.
//! When every check passes, the pool on the output chain is authorized to
//! lend the output amount to the output settler's `fill`.

use std::borrow::Cow;
use std::sync::Arc;

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_sol_types::{Eip712Domain, SolCall, SolStruct, SolValue};
use async_trait::async_trait;
use threshold_chains::abi::{
    address_to_word, fillCall, getForcedWithdrawalStatusCall, getLockDetailsCall,
    hasConsumedAllocatorNonceCall, split_lock_id, word_to_address, BatchCompact, Lock, Mandate,
    MandateOutput, StandardOrder, FORCED_WITHDRAWAL_DISABLED,
};
use threshold_chains::tokens::rescale;
use threshold_chains::{Chain, Order, OrderApi, SignedOrder};
use threshold_types::Error;
use tracing::debug;

use super::{call_contract, unix_now, HandlerContext, IntentPipeline, Prepared};
use crate::digest::{recover_signer, BorrowRequest};
use crate::message::{Intent, IntentMessage};

pub const COMPACT_DOMAIN_NAME: &str = "The Compact";
pub const COMPACT_DOMAIN_VERSION: &str = "1";

const NORMALIZED_DECIMALS: u8 = 18;

/// Order id as the input settler derives it on `chain_id`.
pub fn order_identifier(chain_id: u64, input_settler: Address, order: &Order) -> B256 {
    keccak256((U256::from(chain_id), input_settler, StandardOrder::from(order)).abi_encode())
}

/// The hash sponsor and allocator both sign.
pub fn compact_digest(chain_id: u64, compact: Address, arbiter: Address, order: &Order) -> B256 {
    let commitments = order
        .inputs
        .iter()
        .map(|[id, amount]| {
            let (tag, token) = split_lock_id(*id);
            Lock {
                lockTag: tag.into(),
                token,
                amount: *amount,
            }
        })
        .collect();
    let batch = BatchCompact {
        arbiter,
        sponsor: order.user,
        nonce: order.nonce,
        expires: U256::from(order.expires),
        commitments,
        mandate: Mandate {
            fillDeadline: order.fill_deadline,
            inputOracle: order.input_oracle,
            outputs: order.outputs.iter().map(MandateOutput::from).collect(),
        },
    };
    let domain = Eip712Domain::new(
        Some(Cow::Borrowed(COMPACT_DOMAIN_NAME)),
        Some(Cow::Borrowed(COMPACT_DOMAIN_VERSION)),
        Some(U256::from(chain_id)),
        Some(compact),
        None,
    );
    batch.eip712_signing_hash(&domain)
}

pub struct LifiEscrowPipeline {
    ctx: Arc<HandlerContext>,
    orders: Arc<dyn OrderApi>,
}

struct Contracts {
    compact: Address,
    input_settler: Address,
}

impl LifiEscrowPipeline {
    pub fn new(ctx: Arc<HandlerContext>, orders: Arc<dyn OrderApi>) -> Self {
        Self { ctx, orders }
    }

    fn contracts(origin: &Chain) -> Result<Contracts, Error> {
        match (origin.config.lifi_compact, origin.config.lifi_input_settler) {
            (Some(compact), Some(input_settler)) => Ok(Contracts {
                compact,
                input_settler,
            }),
            _ => Err(Error::invalid(format!(
                "lifi-escrow not supported on chain '{}'",
                origin.id()
            ))),
        }
    }

    /// Shape, deadline, route and amount checks that need no chain access.
    fn validate_order<'a>(&'a self, origin_id: u64, order: &Order, now: u64) -> Result<&'a Chain, Error> {
        match order.inputs.len() {
            0 => return Err(Error::policy("order has no inputs")),
            1 => {}
            _ => return Err(Error::policy("orders with multiple inputs not supported")),
        }
        match order.outputs.len() {
            0 => return Err(Error::policy("order has no outputs")),
            1 => {}
            _ => return Err(Error::policy("orders with multiple outputs not supported")),
        }
        if order.origin_chain_id != U256::from(origin_id) {
            return Err(Error::policy("order origin chain mismatch"));
        }
        if u64::from(order.expires) <= now {
            return Err(Error::policy("order expired"));
        }
        if u64::from(order.fill_deadline) <= now {
            return Err(Error::policy("fill deadline passed"));
        }

        let output = &order.outputs[0];
        let destination_id: u64 = output
            .chain_id
            .try_into()
            .map_err(|_| Error::policy("destination chain out of range"))?;
        let destination = self.ctx.chains.get(destination_id).ok_or_else(|| {
            Error::policy(format!("destination chain '{}' not supported", destination_id))
        })?;
        if destination.config.lifi_settler != Some(word_to_address(output.settler)) {
            return Err(Error::policy("unsupported output settler"));
        }

        let [lock_id, input_amount] = order.inputs[0];
        let (_, input_token) = split_lock_id(lock_id);
        let output_token = word_to_address(output.token);
        let input = self.ctx.tokens.token(origin_id, &input_token).ok_or_else(|| {
            Error::policy(format!("token {} not supported on chain {}", input_token, origin_id))
        })?;
        let out = self
            .ctx
            .tokens
            .token(destination_id, &output_token)
            .ok_or_else(|| {
                Error::policy(format!(
                    "token {} not supported on chain {}",
                    output_token, destination_id
                ))
            })?;
        if input.symbol != out.symbol {
            return Err(Error::policy("input and output tokens differ"));
        }
        if rescale(output.amount, out.decimals, NORMALIZED_DECIMALS)
            > rescale(input_amount, input.decimals, NORMALIZED_DECIMALS)
        {
            return Err(Error::policy("borrow amount exceeds input amount"));
        }

        Ok(destination)
    }

    /// Signatures and lock state on the origin chain.
    async fn verify_lock(
        &self,
        origin: &Chain,
        contracts: &Contracts,
        signed: &SignedOrder,
    ) -> Result<(), Error> {
        let order = &signed.order;
        let digest = compact_digest(origin.id(), contracts.compact, contracts.input_settler, order);

        let sponsor = recover_signer(&digest, &signed.sponsor_signature)?;
        if sponsor != order.user {
            return Err(Error::unavailable("sponsor signature mismatch"));
        }

        let lock_id = order.inputs[0][0];
        let details = call_contract(origin, contracts.compact, &getLockDetailsCall { id: lock_id }).await?;
        let allocator = recover_signer(&digest, &signed.allocator_signature)?;
        if allocator != details.allocator {
            return Err(Error::unavailable("allocator signature mismatch"));
        }

        let withdrawal = call_contract(
            origin,
            contracts.compact,
            &getForcedWithdrawalStatusCall {
                account: order.user,
                id: lock_id,
            },
        )
        .await?;
        if withdrawal.status != FORCED_WITHDRAWAL_DISABLED {
            return Err(Error::policy("forced withdrawal enabled"));
        }

        let consumed = call_contract(
            origin,
            contracts.compact,
            &hasConsumedAllocatorNonceCall {
                nonce: order.nonce,
                allocator: details.allocator,
            },
        )
        .await?;
        if consumed {
            return Err(Error::policy("allocator nonce consumed"));
        }
        Ok(())
    }
}

fn fill_request(order_id: B256, order: &Order, destination: &Chain) -> Result<BorrowRequest, Error> {
    let output = &order.outputs[0];
    let settler = destination
        .config
        .lifi_settler
        .ok_or_else(|| Error::policy("unsupported output settler"))?;
    let pool = destination.config.liquidity_pool;
    let call = fillCall {
        orderId: order_id,
        output: MandateOutput::from(output),
        fillDeadline: order.fill_deadline,
        fillerData: Bytes::from(address_to_word(pool).abi_encode()),
    };
    Ok(BorrowRequest {
        chain_id: destination.id(),
        pool,
        caller: destination.config.caller,
        tokens: vec![(word_to_address(output.token), output.amount)],
        target: settler,
        call_data: Bytes::from(call.abi_encode()),
        nonce: U256::from_be_bytes(order_id.0),
        deadline: U256::from(order.fill_deadline),
    })
}

#[async_trait]
impl IntentPipeline for LifiEscrowPipeline {
    fn family(&self) -> &'static str {
        "lifi-escrow"
    }

    async fn prepare(&self, message: &IntentMessage) -> Result<Prepared, Error> {
        let Intent::LifiEscrow { chain_id, order_id } = message.intent else {
            return Err(Error::invalid("expected a lifi-escrow intent"));
        };

        let origin = self.ctx.chains.require(chain_id)?;
        let contracts = Self::contracts(origin)?;

        let signed = self
            .ctx
            .fetch(format!("order {}", order_id), self.orders.order(order_id))
            .await?;
        let order = &signed.order;

        if order_identifier(chain_id, contracts.input_settler, order) != order_id {
            return Err(Error::unavailable("order hash mismatch"));
        }
        let destination = self.validate_order(chain_id, order, unix_now())?;
        self.verify_lock(origin, &contracts, &signed).await?;

        let digest = fill_request(order_id, order, destination)?.digest()?;
        debug!(chain_id, %order_id, destination = destination.id(), %digest, "Order validated");
        Ok(Prepared {
            session_id: message.intent.session_id(),
            digest,
        })
    }
}

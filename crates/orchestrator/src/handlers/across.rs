//! Spoke pool deposits.
//!
//! The deposit log on the origin chain is the evidence. Once it is buried
//! deep enough for its value, the pool on the destination chain is
//! authorized to lend the output amount to the destination spoke pool's
//! `fillRelay`, with repayment to the pool itself.

use std::sync::Arc;

use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::{SolCall, SolEvent};
use async_trait::async_trait;
use threshold_chains::abi::{address_to_word, fillRelayCall, word_to_address, FundsDeposited, V3RelayData};
use threshold_chains::tokens::rescale;
use threshold_chains::{Chain, LogFilter};
use threshold_types::Error;
use tracing::debug;

use super::{unix_now, HandlerContext, IntentPipeline, Prepared};
use crate::digest::{deposit_nonce, BorrowRequest};
use crate::listener::{uint_topic, DepositIndex, DEFAULT_LOOKBACK};
use crate::message::{Intent, IntentMessage};

/// Decimals amounts are compared at.
const NORMALIZED_DECIMALS: u8 = 18;

pub struct AcrossPipeline {
    ctx: Arc<HandlerContext>,
    index: Arc<DepositIndex>,
    lookback: u64,
}

struct Route<'a> {
    destination: &'a Chain,
    spoke_pool: Address,
    output_token: Address,
}

impl AcrossPipeline {
    pub fn new(ctx: Arc<HandlerContext>, index: Arc<DepositIndex>) -> Self {
        Self {
            ctx,
            index,
            lookback: DEFAULT_LOOKBACK,
        }
    }

    /// Locate the deposit log, narrowing to the indexed block when known.
    async fn find_deposit(
        &self,
        origin: &Chain,
        spoke_pool: Address,
        deposit_id: U256,
    ) -> Result<(B256, FundsDeposited), Error> {
        let (from, to) = match self.index.block_of(origin.id(), deposit_id) {
            Some(block) => (block, block),
            None => {
                let latest = origin.client.block_number().await?;
                (latest.saturating_sub(self.lookback), latest)
            }
        };
        let filter = LogFilter::new(spoke_pool, from, to)
            .topic(0, FundsDeposited::SIGNATURE_HASH)
            .topic(2, uint_topic(deposit_id));

        for log in origin.client.logs(&filter).await? {
            if log.removed {
                continue;
            }
            let event = FundsDeposited::decode_raw_log(log.topics.iter().copied(), &log.data)
                .map_err(|e| Error::unavailable(format!("malformed deposit log: {}", e)))?;
            if event.depositId != deposit_id {
                continue;
            }
            let tx_hash = log
                .transaction_hash
                .ok_or_else(|| Error::unavailable("deposit log without transaction hash"))?;
            return Ok((tx_hash, event));
        }
        Err(Error::NotFound(format!(
            "deposit {} not found on chain {}",
            deposit_id,
            origin.id()
        )))
    }

    fn validate(&self, origin_id: u64, deposit: &FundsDeposited, now: u64) -> Result<Route<'_>, Error> {
        let destination_id: u64 = deposit
            .destinationChainId
            .try_into()
            .map_err(|_| Error::policy("destination chain out of range"))?;
        let destination = self.ctx.chains.get(destination_id).ok_or_else(|| {
            Error::policy(format!("destination chain '{}' not supported", destination_id))
        })?;
        let spoke_pool = destination.config.spoke_pool.ok_or_else(|| {
            Error::policy(format!("across not supported on chain '{}'", destination_id))
        })?;

        if u64::from(deposit.fillDeadline) <= now {
            return Err(Error::policy("fill deadline passed"));
        }

        let input_token = word_to_address(deposit.inputToken);
        let output_token = word_to_address(deposit.outputToken);
        let input = self.ctx.tokens.token(origin_id, &input_token).ok_or_else(|| {
            Error::policy(format!("token {} not supported on chain {}", input_token, origin_id))
        })?;
        let output = self
            .ctx
            .tokens
            .token(destination_id, &output_token)
            .ok_or_else(|| {
                Error::policy(format!(
                    "token {} not supported on chain {}",
                    output_token, destination_id
                ))
            })?;
        if input.symbol != output.symbol {
            return Err(Error::policy("input and output tokens differ"));
        }

        let input_amount = rescale(deposit.inputAmount, input.decimals, NORMALIZED_DECIMALS);
        let output_amount = rescale(deposit.outputAmount, output.decimals, NORMALIZED_DECIMALS);
        if output_amount > input_amount {
            return Err(Error::policy("borrow amount exceeds input amount"));
        }

        Ok(Route {
            destination,
            spoke_pool,
            output_token,
        })
    }
}

/// The pool borrow that funds the relay on the destination chain.
fn fill_request(origin_id: u64, deposit: &FundsDeposited, route: &Route<'_>) -> BorrowRequest {
    let destination = &route.destination.config;
    let relay = V3RelayData {
        depositor: deposit.depositor,
        recipient: deposit.recipient,
        exclusiveRelayer: deposit.exclusiveRelayer,
        inputToken: deposit.inputToken,
        outputToken: deposit.outputToken,
        inputAmount: deposit.inputAmount,
        outputAmount: deposit.outputAmount,
        originChainId: U256::from(origin_id),
        depositId: deposit.depositId,
        fillDeadline: deposit.fillDeadline,
        exclusivityDeadline: deposit.exclusivityDeadline,
        message: deposit.message.clone(),
    };
    let call = fillRelayCall {
        relayData: relay,
        repaymentChainId: U256::from(destination.id),
        repaymentAddress: address_to_word(destination.liquidity_pool),
    };
    BorrowRequest {
        chain_id: destination.id,
        pool: destination.liquidity_pool,
        caller: destination.caller,
        tokens: vec![(route.output_token, deposit.outputAmount)],
        target: route.spoke_pool,
        call_data: Bytes::from(call.abi_encode()),
        nonce: deposit_nonce(origin_id, deposit.depositId),
        deadline: U256::from(deposit.fillDeadline),
    }
}

#[async_trait]
impl IntentPipeline for AcrossPipeline {
    fn family(&self) -> &'static str {
        "across"
    }

    async fn prepare(&self, message: &IntentMessage) -> Result<Prepared, Error> {
        let Intent::Across {
            chain_id,
            deposit_id,
        } = message.intent
        else {
            return Err(Error::invalid("expected an across intent"));
        };

        let origin = self.ctx.chains.require(chain_id)?;
        let spoke_pool = origin.config.spoke_pool.ok_or_else(|| {
            Error::invalid(format!("across not supported on chain '{}'", chain_id))
        })?;

        let (tx_hash, deposit) = self
            .ctx
            .fetch(
                format!("deposit {}", deposit_id),
                self.find_deposit(origin, spoke_pool, deposit_id),
            )
            .await?;
        let route = self.validate(chain_id, &deposit, unix_now())?;

        self.ctx
            .watcher
            .wait(
                chain_id,
                tx_hash,
                &word_to_address(deposit.inputToken),
                deposit.inputAmount,
                &self.ctx.cancel,
            )
            .await?;

        let digest = fill_request(chain_id, &deposit, &route).digest()?;
        debug!(
            chain_id,
            %deposit_id,
            destination = route.destination.id(),
            %digest,
            "Deposit validated"
        );
        Ok(Prepared {
            session_id: message.intent.session_id(),
            digest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::harness;
    use super::*;
    use crate::testing::{
        ARBITRUM, BASE, CALLER, POOL, SPOKE_POOL, USDC_ARBITRUM, USDC_BASE,
    };
    use alloy_primitives::U64;
    use threshold_chains::{Log, MockEvmClient, TransactionReceipt};

    const DEPOSIT_ID: u64 = 100;

    fn deposit(destination: u64, input: u64, output: u64, fill_deadline: u32) -> FundsDeposited {
        FundsDeposited {
            inputToken: address_to_word(USDC_BASE),
            outputToken: address_to_word(USDC_ARBITRUM),
            inputAmount: U256::from(input),
            outputAmount: U256::from(output),
            destinationChainId: U256::from(destination),
            depositId: U256::from(DEPOSIT_ID),
            quoteTimestamp: 1_700_000_000,
            fillDeadline: fill_deadline,
            exclusivityDeadline: 0,
            depositor: B256::repeat_byte(0xd0),
            recipient: B256::repeat_byte(0xd1),
            exclusiveRelayer: B256::ZERO,
            message: Bytes::new(),
        }
    }

    fn log_of(event: &FundsDeposited) -> Log {
        let data = event.encode_log_data();
        Log {
            address: SPOKE_POOL,
            topics: data.topics().to_vec(),
            data: data.data.clone(),
            block_number: Some(U64::from(990)),
            transaction_hash: Some(B256::repeat_byte(0xee)),
            removed: false,
        }
    }

    fn future_deadline() -> u32 {
        (unix_now() + 3_600) as u32
    }

    /// Base client serving `event` at block 990 with the head at 1 000.
    fn base_client(event: FundsDeposited) -> MockEvmClient {
        let mut client = MockEvmClient::new();
        client.expect_block_number().returning(|| Ok(1_000));
        client
            .expect_logs()
            .returning(move |_| Ok(vec![log_of(&event)]));
        client.expect_transaction_receipt().returning(|hash| {
            Ok(Some(TransactionReceipt {
                transaction_hash: hash,
                block_number: U64::from(990),
                status: Some(U64::from(1)),
                logs: vec![],
            }))
        });
        client
    }

    fn message(chain_id: u64) -> IntentMessage {
        IntentMessage::new(Intent::Across {
            chain_id,
            deposit_id: U256::from(DEPOSIT_ID),
        })
    }

    #[tokio::test]
    async fn test_valid_deposit_authorizes_fill_on_destination() {
        let event = deposit(ARBITRUM, 499_000_000, 498_000_000, future_deadline());
        let h = harness(base_client(event.clone()), MockEvmClient::new());
        let pipeline = AcrossPipeline::new(h.ctx.clone(), DepositIndex::new());

        let prepared = pipeline.prepare(&message(BASE)).await.unwrap();
        assert_eq!(prepared.session_id, "8453-100");

        let relay = V3RelayData {
            depositor: event.depositor,
            recipient: event.recipient,
            exclusiveRelayer: event.exclusiveRelayer,
            inputToken: event.inputToken,
            outputToken: event.outputToken,
            inputAmount: event.inputAmount,
            outputAmount: event.outputAmount,
            originChainId: U256::from(BASE),
            depositId: U256::from(DEPOSIT_ID),
            fillDeadline: event.fillDeadline,
            exclusivityDeadline: 0,
            message: Bytes::new(),
        };
        let expected = BorrowRequest {
            chain_id: ARBITRUM,
            pool: POOL,
            caller: CALLER,
            tokens: vec![(USDC_ARBITRUM, U256::from(498_000_000u64))],
            target: SPOKE_POOL,
            call_data: Bytes::from(
                fillRelayCall {
                    relayData: relay,
                    repaymentChainId: U256::from(ARBITRUM),
                    repaymentAddress: address_to_word(POOL),
                }
                .abi_encode(),
            ),
            nonce: deposit_nonce(BASE, U256::from(DEPOSIT_ID)),
            deadline: U256::from(event.fillDeadline),
        };
        assert_eq!(prepared.digest, expected.digest().unwrap());
    }

    #[tokio::test]
    async fn test_indexed_deposit_queries_single_block() {
        let event = deposit(ARBITRUM, 10_000_000, 10_000_000, future_deadline());
        let mut client = MockEvmClient::new();
        client.expect_block_number().returning(|| Ok(1_000));
        client
            .expect_logs()
            .withf(|f| f.from_block == U64::from(990) && f.to_block == U64::from(990))
            .returning(move |_| Ok(vec![log_of(&event)]));
        client.expect_transaction_receipt().returning(|hash| {
            Ok(Some(TransactionReceipt {
                transaction_hash: hash,
                block_number: U64::from(990),
                status: Some(U64::from(1)),
                logs: vec![],
            }))
        });

        let h = harness(client, MockEvmClient::new());
        let index = DepositIndex::new();
        index.insert(BASE, U256::from(DEPOSIT_ID), 990);
        let pipeline = AcrossPipeline::new(h.ctx.clone(), index);

        assert!(pipeline.prepare(&message(BASE)).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_deadline_is_rejected() {
        let event = deposit(ARBITRUM, 10_000_000, 10_000_000, (unix_now() - 60) as u32);
        let h = harness(base_client(event), MockEvmClient::new());
        let pipeline = AcrossPipeline::new(h.ctx.clone(), DepositIndex::new());

        let err = pipeline.prepare(&message(BASE)).await.unwrap_err();
        assert_eq!(err, Error::policy("fill deadline passed"));
    }

    #[tokio::test]
    async fn test_output_above_input_is_rejected() {
        let event = deposit(ARBITRUM, 10_000_000, 10_000_001, future_deadline());
        let h = harness(base_client(event), MockEvmClient::new());
        let pipeline = AcrossPipeline::new(h.ctx.clone(), DepositIndex::new());

        let err = pipeline.prepare(&message(BASE)).await.unwrap_err();
        assert_eq!(err, Error::policy("borrow amount exceeds input amount"));
    }

    #[tokio::test]
    async fn test_unsupported_destination_is_rejected() {
        let event = deposit(999, 10_000_000, 10_000_000, future_deadline());
        let h = harness(base_client(event), MockEvmClient::new());
        let pipeline = AcrossPipeline::new(h.ctx.clone(), DepositIndex::new());

        let err = pipeline.prepare(&message(BASE)).await.unwrap_err();
        assert_eq!(err, Error::policy("destination chain '999' not supported"));
    }

    #[tokio::test]
    async fn test_missing_deposit_is_not_found() {
        let mut client = MockEvmClient::new();
        client.expect_block_number().returning(|| Ok(1_000));
        client.expect_logs().returning(|_| Ok(vec![]));
        let h = harness(client, MockEvmClient::new());
        let pipeline = AcrossPipeline::new(h.ctx.clone(), DepositIndex::new());

        let err = pipeline.prepare(&message(BASE)).await.unwrap_err();
        assert_eq!(
            err,
            Error::NotFound("deposit 100 not found on chain 8453".to_string())
        );
    }

    #[tokio::test]
    async fn test_unknown_origin_chain() {
        let h = harness(MockEvmClient::new(), MockEvmClient::new());
        let pipeline = AcrossPipeline::new(h.ctx.clone(), DepositIndex::new());

        let err = pipeline.prepare(&message(999)).await.unwrap_err();
        assert_eq!(err.to_string(), "chain '999' not supported");
    }
}

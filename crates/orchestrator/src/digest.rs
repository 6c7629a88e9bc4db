//! EIP-712 digests for liquidity pool authorizations.
//!
//! All typed data shares one domain shape: name `LiquidityPool`, version
//! `1.0.0`, the chain the authorization is consumed on, and the contract
//! that verifies it (the pool for borrows, the input settler for
//! `AllowOpen`). Every field is ABI-typed; byte strings are `bytes`, ids are
//! `bytes32` or `uint256`, never text.

use std::borrow::Cow;

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_sol_types::{Eip712Domain, SolStruct, SolValue};
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use threshold_chains::abi::{AllowOpen, Borrow, BorrowMany};
use threshold_types::Error;

pub const DOMAIN_NAME: &str = "LiquidityPool";
pub const DOMAIN_VERSION: &str = "1.0.0";

pub fn domain(chain_id: u64, verifying_contract: Address) -> Eip712Domain {
    Eip712Domain::new(
        Some(Cow::Borrowed(DOMAIN_NAME)),
        Some(Cow::Borrowed(DOMAIN_VERSION)),
        Some(U256::from(chain_id)),
        Some(verifying_contract),
        None,
    )
}

/// A pool borrow to authorize. One token signs as `Borrow`, several as
/// `BorrowMany`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BorrowRequest {
    pub chain_id: u64,
    pub pool: Address,
    pub caller: Address,
    pub tokens: Vec<(Address, U256)>,
    pub target: Address,
    pub call_data: Bytes,
    pub nonce: U256,
    pub deadline: U256,
}

impl BorrowRequest {
    pub fn digest(&self) -> Result<B256, Error> {
        let domain = domain(self.chain_id, self.pool);
        match self.tokens.as_slice() {
            [] => Err(Error::invalid("borrow without tokens")),
            [(token, amount)] => Ok(Borrow {
                caller: self.caller,
                borrowToken: *token,
                amount: *amount,
                target: self.target,
                targetCallData: self.call_data.clone(),
                nonce: self.nonce,
                deadline: self.deadline,
            }
            .eip712_signing_hash(&domain)),
            many => Ok(BorrowMany {
                caller: self.caller,
                borrowTokens: many.iter().map(|(t, _)| *t).collect(),
                amounts: many.iter().map(|(_, a)| *a).collect(),
                target: self.target,
                targetCallData: self.call_data.clone(),
                nonce: self.nonce,
                deadline: self.deadline,
            }
            .eip712_signing_hash(&domain)),
        }
    }
}

pub fn allow_open_digest(
    chain_id: u64,
    settler: Address,
    order_id: B256,
    nonce: U256,
    deadline: U256,
) -> B256 {
    AllowOpen {
        orderId: order_id,
        settler,
        nonce,
        deadline,
    }
    .eip712_signing_hash(&domain(chain_id, settler))
}

/// Borrow nonce for a spoke pool deposit: `keccak256(originChainId || depositId)`.
pub fn deposit_nonce(origin_chain_id: u64, deposit_id: U256) -> U256 {
    let encoded = (U256::from(origin_chain_id), deposit_id).abi_encode();
    U256::from_be_bytes(keccak256(encoded).0)
}

pub fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

/// Ethereum address of a hex SEC1 public key.
pub fn address_from_public_key(public_key_hex: &str) -> Result<Address, Error> {
    let bytes = hex::decode(public_key_hex.trim_start_matches("0x"))
        .map_err(|e| Error::internal(format!("invalid public key: {}", e)))?;
    let key = VerifyingKey::from_sec1_bytes(&bytes)
        .map_err(|e| Error::internal(format!("invalid public key: {}", e)))?;
    Ok(address_of(&key))
}

/// Signer of a 65-byte `r || s || v` signature over `digest`. Accepts
/// `v` as 27/28 or 0/1.
pub fn recover_signer(digest: &B256, signature: &[u8]) -> Result<Address, Error> {
    if signature.len() != 65 {
        return Err(Error::unavailable(format!(
            "invalid signature length {}",
            signature.len()
        )));
    }
    let v = match signature[64] {
        v @ (27 | 28) => v - 27,
        v @ (0 | 1) => v,
        v => return Err(Error::unavailable(format!("invalid recovery id {}", v))),
    };
    let sig = Signature::from_slice(&signature[..64])
        .map_err(|e| Error::unavailable(format!("invalid signature: {}", e)))?;
    let recid = RecoveryId::from_byte(v)
        .ok_or_else(|| Error::unavailable("invalid recovery id"))?;
    let key = VerifyingKey::recover_from_prehash(digest.as_slice(), &sig, recid)
        .map_err(|e| Error::unavailable(format!("signature recovery failed: {}", e)))?;
    Ok(address_of(&key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::SigningKey;

    fn key_one() -> SigningKey {
        let mut secret = [0u8; 32];
        secret[31] = 1;
        SigningKey::from_slice(&secret).unwrap()
    }

    fn sign(key: &SigningKey, digest: &B256) -> Vec<u8> {
        let (sig, recid) = key.sign_prehash_recoverable(digest.as_slice()).unwrap();
        let mut out = sig.to_bytes().to_vec();
        out.push(27 + recid.to_byte());
        out
    }

    fn request() -> BorrowRequest {
        BorrowRequest {
            chain_id: 42161,
            pool: Address::repeat_byte(0xaa),
            caller: Address::repeat_byte(0xbb),
            tokens: vec![(Address::repeat_byte(0x11), U256::from(499_000_000u64))],
            target: Address::repeat_byte(0xcc),
            call_data: Bytes::from(vec![1, 2, 3]),
            nonce: deposit_nonce(8453, U256::from(100)),
            deadline: U256::from(1_900_000_000u64),
        }
    }

    #[test]
    fn test_known_address() {
        let expected: Address = "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf".parse().unwrap();
        assert_eq!(address_of(key_one().verifying_key()), expected);
    }

    #[test]
    fn test_borrow_digest_is_deterministic_and_bound_to_domain() {
        let a = request();
        assert_eq!(a.digest().unwrap(), request().digest().unwrap());

        let mut other_chain = request();
        other_chain.chain_id = 10;
        assert_ne!(a.digest().unwrap(), other_chain.digest().unwrap());

        let mut other_pool = request();
        other_pool.pool = Address::repeat_byte(0xab);
        assert_ne!(a.digest().unwrap(), other_pool.digest().unwrap());
    }

    #[test]
    fn test_several_tokens_use_borrow_many() {
        let single = request();
        let mut many = request();
        many.tokens
            .push((Address::repeat_byte(0x12), U256::from(1u64)));
        assert_ne!(single.digest().unwrap(), many.digest().unwrap());

        let mut none = request();
        none.tokens.clear();
        assert!(none.digest().is_err());
    }

    #[test]
    fn test_deposit_nonce_depends_on_both_fields() {
        let n = deposit_nonce(8453, U256::from(100));
        assert_ne!(n, deposit_nonce(8453, U256::from(101)));
        assert_ne!(n, deposit_nonce(10, U256::from(100)));
    }

    #[test]
    fn test_recover_signer() {
        let key = key_one();
        let digest = allow_open_digest(
            10,
            Address::repeat_byte(0x33),
            B256::repeat_byte(0x99),
            U256::from(7),
            U256::from(1_900_000_000u64),
        );
        let signature = sign(&key, &digest);
        assert_eq!(
            recover_signer(&digest, &signature).unwrap(),
            address_of(key.verifying_key())
        );

        let mut zero_one = signature.clone();
        zero_one[64] -= 27;
        assert_eq!(
            recover_signer(&digest, &zero_one).unwrap(),
            address_of(key.verifying_key())
        );

        assert!(recover_signer(&digest, &signature[..64]).is_err());
    }

    #[test]
    fn test_address_from_public_key() {
        let key = key_one();
        let compressed = hex::encode(key.verifying_key().to_encoded_point(true).as_bytes());
        assert_eq!(
            address_from_public_key(&compressed).unwrap(),
            address_of(key.verifying_key())
        );
        assert!(address_from_public_key("zz").is_err());
    }
}

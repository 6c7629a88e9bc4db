//! Contract ABIs and typed-data structs.

#![allow(clippy::too_many_arguments)]

use alloy_primitives::{Address, B256, U256};
use alloy_sol_types::sol;

sol! {
    #![sol(all_derives)]

    // Across spoke pool.

    event FundsDeposited(
        bytes32 inputToken,
        bytes32 outputToken,
        uint256 inputAmount,
        uint256 outputAmount,
        uint256 indexed destinationChainId,
        uint256 indexed depositId,
        uint32 quoteTimestamp,
        uint32 fillDeadline,
        uint32 exclusivityDeadline,
        bytes32 indexed depositor,
        bytes32 recipient,
        bytes32 exclusiveRelayer,
        bytes message
    );

    struct V3RelayData {
        bytes32 depositor;
        bytes32 recipient;
        bytes32 exclusiveRelayer;
        bytes32 inputToken;
        bytes32 outputToken;
        uint256 inputAmount;
        uint256 outputAmount;
        uint256 originChainId;
        uint256 depositId;
        uint32 fillDeadline;
        uint32 exclusivityDeadline;
        bytes message;
    }

    function fillRelay(V3RelayData relayData, uint256 repaymentChainId, bytes32 repaymentAddress);

    // Escrow orders and their output settler.

    struct MandateOutput {
        bytes32 oracle;
        bytes32 settler;
        uint256 chainId;
        bytes32 token;
        uint256 amount;
        bytes32 recipient;
        bytes call;
        bytes context;
    }

    struct StandardOrder {
        address user;
        uint256 nonce;
        uint256 originChainId;
        uint32 expires;
        uint32 fillDeadline;
        address inputOracle;
        uint256[2][] inputs;
        MandateOutput[] outputs;
    }

    function fill(bytes32 orderId, MandateOutput output, uint32 fillDeadline, bytes fillerData);

    // Compact resource locks. Sponsor and allocator both sign the
    // `BatchCompact` hash.

    struct Lock {
        bytes12 lockTag;
        address token;
        uint256 amount;
    }

    struct Mandate {
        uint32 fillDeadline;
        address inputOracle;
        MandateOutput[] outputs;
    }

    struct BatchCompact {
        address arbiter;
        address sponsor;
        uint256 nonce;
        uint256 expires;
        Lock[] commitments;
        Mandate mandate;
    }

    function getLockDetails(uint256 id) external view returns (address token, address allocator, uint8 resetPeriod, uint8 scope, bytes12 lockTag);
    function getForcedWithdrawalStatus(address account, uint256 id) external view returns (uint8 status, uint256 forcedWithdrawalAvailableAt);
    function hasConsumedAllocatorNonce(uint256 nonce, address allocator) external view returns (bool consumed);

    // Liquidity pool authorizations.

    struct Borrow {
        address caller;
        address borrowToken;
        uint256 amount;
        address target;
        bytes targetCallData;
        uint256 nonce;
        uint256 deadline;
    }

    struct BorrowMany {
        address caller;
        address[] borrowTokens;
        uint256[] amounts;
        address target;
        bytes targetCallData;
        uint256 nonce;
        uint256 deadline;
    }

    struct AllowOpen {
        bytes32 orderId;
        address settler;
        uint256 nonce;
        uint256 deadline;
    }
}

/// Forced withdrawal status value meaning the lock cannot be pulled.
pub const FORCED_WITHDRAWAL_DISABLED: u8 = 0;

/// Lower 20 bytes of a left-padded word.
pub fn word_to_address(word: B256) -> Address {
    Address::from_word(word)
}

pub fn address_to_word(address: Address) -> B256 {
    address.into_word()
}

/// Compact lock id: `lockTag (12 bytes) || token (20 bytes)`.
pub fn split_lock_id(id: U256) -> ([u8; 12], Address) {
    let bytes = id.to_be_bytes::<32>();
    let mut tag = [0u8; 12];
    tag.copy_from_slice(&bytes[..12]);
    (tag, Address::from_slice(&bytes[12..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_sol_types::{SolEvent, SolStruct};

    #[test]
    fn test_lock_id_split() {
        let mut bytes = [0u8; 32];
        bytes[..12].copy_from_slice(&[0xab; 12]);
        bytes[12..].copy_from_slice(&[0x11; 20]);
        let (tag, token) = split_lock_id(U256::from_be_bytes(bytes));
        assert_eq!(tag, [0xab; 12]);
        assert_eq!(token, Address::repeat_byte(0x11));
    }

    #[test]
    fn test_word_address_round_trip() {
        let address = Address::repeat_byte(0x42);
        assert_eq!(word_to_address(address_to_word(address)), address);
    }

    #[test]
    fn test_type_strings() {
        assert_eq!(
            AllowOpen::eip712_encode_type(),
            "AllowOpen(bytes32 orderId,address settler,uint256 nonce,uint256 deadline)"
        );
        assert_eq!(
            FundsDeposited::SIGNATURE,
            "FundsDeposited(bytes32,bytes32,uint256,uint256,uint256,uint256,uint32,uint32,uint32,bytes32,bytes32,bytes32,bytes)"
        );
    }
}

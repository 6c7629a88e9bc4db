//! Deterministic peer ranking.
//!
//! Every node must derive the same order for a session without talking to
//! anyone, so the rank is a pure function of the peer id and the session id:
//!
//! ```text
//! rank(peer, session) = SHA-256(peer_id_hex || session_id)
//! ```
//!
//! Lower rank is better. Equal ranks fall back to the raw peer id bytes.
//! The same order drives coordinator election and signer subset selection.

use std::cmp::Ordering;

use sha2::{Digest, Sha256};
use threshold_types::PeerId;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("insufficient peers: need {required}, available {available}")]
    InsufficientPeers { required: usize, available: usize },
}

pub fn rank(peer: &PeerId, session_id: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(peer.to_string().as_bytes());
    hasher.update(session_id.as_bytes());
    hasher.finalize().into()
}

pub fn compare_rank(a: &PeerId, b: &PeerId, session_id: &str) -> Ordering {
    rank(a, session_id)
        .cmp(&rank(b, session_id))
        .then_with(|| a.cmp(b))
}

/// Peers ordered best-first for `session_id`.
pub fn sort_by_rank(peers: &[PeerId], session_id: &str) -> Vec<PeerId> {
    let mut scored: Vec<([u8; 32], PeerId)> =
        peers.iter().map(|p| (rank(p, session_id), *p)).collect();
    scored.sort();
    scored.dedup_by(|a, b| a.1 == b.1);
    scored.into_iter().map(|(_, p)| p).collect()
}

/// The `threshold + 1` best-ranked peers of `ready`, in rank order.
pub fn select_signers(
    ready: &[PeerId],
    session_id: &str,
    threshold: usize,
) -> Result<Vec<PeerId>, SelectionError> {
    let required = threshold + 1;
    let ranked = sort_by_rank(ready, session_id);
    if ranked.len() < required {
        return Err(SelectionError::InsufficientPeers {
            required,
            available: ranked.len(),
        });
    }
    Ok(ranked.into_iter().take(required).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(n: u8) -> Vec<PeerId> {
        (1..=n).map(|i| PeerId::from_bytes([i; 32])).collect()
    }

    #[test]
    fn test_sort_is_deterministic_and_input_order_independent() {
        let p = peers(5);
        let mut reversed = p.clone();
        reversed.reverse();

        assert_eq!(sort_by_rank(&p, "8453-100"), sort_by_rank(&reversed, "8453-100"));
    }

    #[test]
    fn test_rank_depends_on_session() {
        let p = peers(8);
        assert_ne!(sort_by_rank(&p, "a"), sort_by_rank(&p, "b"));
    }

    #[test]
    fn test_select_signers_takes_prefix() {
        let p = peers(5);
        let ranked = sort_by_rank(&p, "s");
        let chosen = select_signers(&p, "s", 2).unwrap();
        assert_eq!(chosen, ranked[..3].to_vec());
    }

    #[test]
    fn test_select_signers_insufficient() {
        let p = peers(2);
        assert_eq!(
            select_signers(&p, "s", 2),
            Err(SelectionError::InsufficientPeers {
                required: 3,
                available: 2
            })
        );
    }

    #[test]
    fn test_duplicates_collapse() {
        let mut p = peers(3);
        p.push(p[0]);
        assert_eq!(sort_by_rank(&p, "s").len(), 3);
    }
}

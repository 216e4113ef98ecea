//! Off-chain VTXO coin selection: choosing which VTXOs to spend to cover a target amount.
//!
//! Mirrors [`crate::unilateral_exit::select_anchor_utxos`]'s greedy largest-first strategy, applied
//! to VTXOs instead of on-chain UTXOs.

use crate::Error;
use bitcoin::Amount;
use bitcoin::OutPoint;

/// The subset of [`crate::server::VirtualTxOutPoint`] coin selection actually needs.
#[derive(Debug, Clone, Copy)]
pub struct VirtualTxOutPoint {
    pub outpoint: OutPoint,
    pub expire_at: i64,
    pub amount: Amount,
}

/// Greedily selects VTXOs (largest first) from `candidates` until their total covers `target`.
///
/// When `prefer_expiring_soon` is set, VTXOs closer to `expire_at` are selected first, falling back
/// to largest-first among VTXOs with the same expiry; this lets callers drain recoverable or
/// soon-to-expire VTXOs ahead of fresh ones.
pub fn select_vtxos(
    mut candidates: Vec<VirtualTxOutPoint>,
    target: Amount,
    dust: Amount,
    prefer_expiring_soon: bool,
) -> Result<Vec<VirtualTxOutPoint>, Error> {
    if prefer_expiring_soon {
        candidates.sort_by(|a, b| a.expire_at.cmp(&b.expire_at).then(b.amount.cmp(&a.amount)));
    } else {
        candidates.sort_by(|a, b| b.amount.cmp(&a.amount));
    }

    let mut selected = Vec::new();
    let mut total = Amount::ZERO;

    for candidate in candidates {
        // Keep going past `target` while the leftover change would be dust: it cannot be paid out
        // as its own output, so it is better absorbed by selecting one more input.
        if total >= target && total - target >= dust {
            break;
        }

        selected.push(candidate);
        total += candidate.amount;
    }

    if total < target {
        return Err(Error::ad_hoc(format!(
            "insufficient VTXO funds: have {total}, need {target}"
        )));
    }

    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vtxo(sats: u64, expire_at: i64) -> VirtualTxOutPoint {
        VirtualTxOutPoint {
            outpoint: OutPoint::null(),
            expire_at,
            amount: Amount::from_sat(sats),
        }
    }

    #[test]
    fn selects_largest_first_by_default() {
        let candidates = vec![vtxo(1_000, 0), vtxo(5_000, 0), vtxo(2_000, 0)];

        let selected = select_vtxos(candidates, Amount::from_sat(4_000), Amount::from_sat(1), false)
            .unwrap();

        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].amount, Amount::from_sat(5_000));
    }

    #[test]
    fn errors_on_insufficient_funds() {
        let candidates = vec![vtxo(1_000, 0)];

        assert!(select_vtxos(candidates, Amount::from_sat(4_000), Amount::from_sat(1), false).is_err());
    }
}

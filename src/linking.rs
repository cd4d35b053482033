//! Linking engine (C13, §4.13): a post-ingest pass correlating exchange
//! deposits/withdrawals with blockchain outflows/inflows belonging to the
//! same user. Runs after ledgerization, over already-committed transactions;
//! it never mutates the ledger itself, only proposes and tracks links.
//!
//! Candidate selection follows the same two-phase shape as the provider
//! manager's failover ordering (§4.6): build every eligible pairing, then
//! resolve overlapping candidates by a fixed preference order rather than
//! accepting the first match found.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{TransactionId, UserId};
use crate::money::{CurrencyTicker, Decimal};
use crate::settings::LinkingSettings;

/// One side of a candidate link: an exchange withdrawal/deposit or a
/// blockchain outflow/inflow, reduced to what the linking engine needs.
/// `tx_hash` is populated only when the importer/mapper recovered a
/// blockchain transaction hash for this side (§4.13 "Exact by transaction
/// hash").
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSide {
    pub transaction_id: TransactionId,
    pub user_id: UserId,
    pub asset: CurrencyTicker,
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
    pub tx_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkStatus {
    Suggested,
    Confirmed,
    Rejected,
}

/// How a link was established. `Heuristic` carries the scoring inputs so
/// callers (and tests) can inspect why a pairing was preferred over another.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkConfidence {
    ExactTxHash,
    Heuristic { similarity: f64, variance: f64, time_delta: chrono::Duration },
}

impl LinkConfidence {
    /// Total ordering used for greedy dedup (§4.13): exact matches always
    /// outrank heuristic ones; among heuristic matches, higher similarity
    /// wins, then lower variance, then smaller time delta.
    fn rank(&self) -> (u8, i64, i64, i64) {
        match self {
            LinkConfidence::ExactTxHash => (1, 0, 0, 0),
            LinkConfidence::Heuristic { similarity, variance, time_delta } => (
                0,
                (similarity * 1_000_000.0).round() as i64,
                -((variance * 1_000_000.0).round() as i64),
                -time_delta.num_seconds(),
            ),
        }
    }
}

/// A proposed or decided correlation between one outflow and one inflow.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub id: uuid::Uuid,
    pub source_transaction_id: TransactionId,
    pub target_transaction_id: TransactionId,
    pub confidence: LinkConfidence,
    pub status: LinkStatus,
}

#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum LinkingError {
    #[error("link {0} not found")]
    NotFound(uuid::Uuid),
    #[error("cannot transition a rejected link; create a new link instead")]
    RejectedIsTerminal,
}

impl Link {
    fn new(source: TransactionId, target: TransactionId, confidence: LinkConfidence) -> Self {
        Link {
            id: uuid::Uuid::new_v4(),
            source_transaction_id: source,
            target_transaction_id: target,
            confidence,
            status: LinkStatus::Suggested,
        }
    }

    /// `suggested -> confirmed` (idempotent), `confirmed -> rejected`
    /// (allowed, overrides an earlier auto-confirmation), `rejected -> *`
    /// disallowed (§4.13 state machine).
    pub fn confirm(&mut self) -> Result<(), LinkingError> {
        match self.status {
            LinkStatus::Suggested | LinkStatus::Confirmed => {
                self.status = LinkStatus::Confirmed;
                Ok(())
            }
            LinkStatus::Rejected => Err(LinkingError::RejectedIsTerminal),
        }
    }

    pub fn reject(&mut self) -> Result<(), LinkingError> {
        match self.status {
            LinkStatus::Suggested | LinkStatus::Confirmed => {
                self.status = LinkStatus::Rejected;
                Ok(())
            }
            LinkStatus::Rejected => Ok(()),
        }
    }
}

/// Stateless matcher: holds only the tunables from §4.13 / `LinkingSettings`.
/// Callers own persistence of the resulting `Link`s; this engine only
/// produces candidates from two already-loaded slices of sides.
pub struct LinkingEngine {
    min_amount_similarity: f64,
    max_variance: f64,
    time_window: chrono::Duration,
}

impl LinkingEngine {
    pub fn new(settings: &LinkingSettings) -> Self {
        LinkingEngine {
            min_amount_similarity: settings.min_amount_similarity,
            max_variance: settings.max_variance,
            time_window: chrono::Duration::hours(settings.time_window_hours),
        }
    }

    /// Finds links between `outflows` (e.g. exchange withdrawals, blockchain
    /// sends) and `inflows` (exchange deposits, blockchain receives) for the
    /// same user. Exact tx-hash matches are found first; the remaining,
    /// unmatched sides are then scored heuristically. Every source and every
    /// target participates in at most one returned link (§4.13 "Deduplicate
    /// greedily").
    pub fn find_links(&self, outflows: &[LinkSide], inflows: &[LinkSide]) -> Vec<Link> {
        let mut candidates = Vec::new();

        for outflow in outflows {
            for inflow in inflows {
                if outflow.transaction_id == inflow.transaction_id {
                    continue;
                }
                if let (Some(out_hash), Some(in_hash)) = (&outflow.tx_hash, &inflow.tx_hash) {
                    if out_hash == in_hash {
                        candidates.push(Link::new(
                            outflow.transaction_id,
                            inflow.transaction_id,
                            LinkConfidence::ExactTxHash,
                        ));
                        continue;
                    }
                }
                if let Some(confidence) = self.heuristic_confidence(outflow, inflow) {
                    candidates.push(Link::new(outflow.transaction_id, inflow.transaction_id, confidence));
                }
            }
        }

        self.dedup_greedy(candidates)
    }

    fn heuristic_confidence(&self, outflow: &LinkSide, inflow: &LinkSide) -> Option<LinkConfidence> {
        if outflow.asset != inflow.asset {
            return None;
        }
        let time_delta = (inflow.timestamp - outflow.timestamp).abs();
        if time_delta > self.time_window {
            return None;
        }

        let a = outflow.amount.abs();
        let b = inflow.amount.abs();
        if a.is_zero() || b.is_zero() {
            return None;
        }
        let (lo, hi) = if crate::money::compare(&a, &b) == std::cmp::Ordering::Greater {
            (&b, &a)
        } else {
            (&a, &b)
        };
        let similarity = to_f64(lo) / to_f64(hi);
        let variance = (to_f64(hi) - to_f64(lo)) / to_f64(hi);

        if similarity >= self.min_amount_similarity && variance <= self.max_variance {
            Some(LinkConfidence::Heuristic { similarity, variance, time_delta })
        } else {
            None
        }
    }

    /// Sorts candidates best-first by [`LinkConfidence::rank`] and greedily
    /// accepts each one whose source and target have not already been
    /// claimed by a higher-ranked candidate.
    fn dedup_greedy(&self, mut candidates: Vec<Link>) -> Vec<Link> {
        candidates.sort_by(|a, b| b.confidence.rank().cmp(&a.confidence.rank()));

        let mut used_sources: HashSet<TransactionId> = HashSet::new();
        let mut used_targets: HashSet<TransactionId> = HashSet::new();
        let mut accepted = Vec::new();

        for candidate in candidates {
            if used_sources.contains(&candidate.source_transaction_id)
                || used_targets.contains(&candidate.target_transaction_id)
            {
                continue;
            }
            used_sources.insert(candidate.source_transaction_id);
            used_targets.insert(candidate.target_transaction_id);
            accepted.push(candidate);
        }

        accepted
    }
}

/// `Decimal` carries arbitrary precision throughout the pipeline; converting
/// to `f64` here is deliberate and confined to this module's similarity
/// scoring, which is advisory (drives ordering and a threshold comparison),
/// never a ledger amount.
fn to_f64(d: &Decimal) -> f64 {
    d.to_string().parse().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::decimal_from_str;

    fn side(tx: TransactionId, asset: &str, amount: &str, ts: DateTime<Utc>, hash: Option<&str>) -> LinkSide {
        LinkSide {
            transaction_id: tx,
            user_id: "user-1".to_string(),
            asset: asset.to_string(),
            amount: decimal_from_str(amount).unwrap(),
            timestamp: ts,
            tx_hash: hash.map(|h| h.to_string()),
        }
    }

    fn engine() -> LinkingEngine {
        LinkingEngine::new(&LinkingSettings::default())
    }

    #[test]
    fn exact_tx_hash_match_wins_over_heuristic_even_when_later() {
        let t0 = Utc::now();
        let out_id = TransactionId::new_v4();
        let in_id = TransactionId::new_v4();
        let outflow = side(out_id, "BTC", "-1.0", t0, Some("0xabc"));
        let inflow = side(in_id, "BTC", "1.0", t0, Some("0xabc"));

        let links = engine().find_links(&[outflow], &[inflow]);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].confidence, LinkConfidence::ExactTxHash);
        assert_eq!(links[0].status, LinkStatus::Suggested);
    }

    #[test]
    fn heuristic_match_within_tolerance_is_suggested() {
        let t0 = Utc::now();
        let outflow = side(TransactionId::new_v4(), "ETH", "-2.0", t0, None);
        let inflow =
            side(TransactionId::new_v4(), "ETH", "1.98", t0 + chrono::Duration::hours(1), None);

        let links = engine().find_links(&[outflow], &[inflow]);
        assert_eq!(links.len(), 1);
        match &links[0].confidence {
            LinkConfidence::Heuristic { similarity, variance, .. } => {
                assert!(*similarity >= 0.95);
                assert!(*variance <= 0.10);
            }
            other => panic!("expected heuristic confidence, got {other:?}"),
        }
    }

    #[test]
    fn amounts_outside_variance_tolerance_do_not_link() {
        let t0 = Utc::now();
        let outflow = side(TransactionId::new_v4(), "ETH", "-2.0", t0, None);
        let inflow = side(TransactionId::new_v4(), "ETH", "1.5", t0, None);

        assert!(engine().find_links(&[outflow], &[inflow]).is_empty());
    }

    #[test]
    fn timestamps_outside_window_do_not_link() {
        let t0 = Utc::now();
        let outflow = side(TransactionId::new_v4(), "ETH", "-2.0", t0, None);
        let inflow =
            side(TransactionId::new_v4(), "ETH", "2.0", t0 + chrono::Duration::hours(25), None);

        assert!(engine().find_links(&[outflow], &[inflow]).is_empty());
    }

    #[test]
    fn each_source_and_target_participates_in_at_most_one_link() {
        let t0 = Utc::now();
        let out_a = side(TransactionId::new_v4(), "BTC", "-1.0", t0, None);
        let in_close = side(TransactionId::new_v4(), "BTC", "1.0", t0, None);
        let in_far = side(TransactionId::new_v4(), "BTC", "0.97", t0 + chrono::Duration::hours(2), None);
        let in_close_id = in_close.transaction_id;

        let links = engine().find_links(&[out_a], &[in_close, in_far]);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].target_transaction_id, in_close_id);
    }

    #[test]
    fn rejected_is_terminal() {
        let t0 = Utc::now();
        let out_id = TransactionId::new_v4();
        let in_id = TransactionId::new_v4();
        let mut link = Link::new(out_id, in_id, LinkConfidence::ExactTxHash);

        link.reject().unwrap();
        assert_eq!(link.status, LinkStatus::Rejected);
        assert_eq!(link.confirm(), Err(LinkingError::RejectedIsTerminal));
    }

    #[test]
    fn confirm_is_idempotent_and_confirmed_can_still_be_rejected() {
        let t0 = Utc::now();
        let mut link =
            Link::new(TransactionId::new_v4(), TransactionId::new_v4(), LinkConfidence::ExactTxHash);
        link.confirm().unwrap();
        link.confirm().unwrap();
        assert_eq!(link.status, LinkStatus::Confirmed);
        link.reject().unwrap();
        assert_eq!(link.status, LinkStatus::Rejected);
        let _ = t0;
    }
}

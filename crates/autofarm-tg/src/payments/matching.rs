use super::explorer::IncomingTx;
use chrono::prelude::*;
use std::collections::HashSet;

/// Relative difference that is still considered an exact amount match
const EXACT_TOLERANCE: f64 = 1e-9;

/// Any transaction within this relative difference matches
const LOOSE_TOLERANCE: f64 = 0.05;

/// Transactions within this relative difference match only if they carry
/// the payment memo
const MEMO_TOLERANCE: f64 = 0.10;

/// Transactions made shortly before the payment was created are accepted
/// to tolerate clock skew between us and the blockchain
pub(crate) fn window_leeway() -> chrono::Duration {
    chrono::Duration::minutes(5)
}

/// Ordered from the tightest match to the loosest one
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum MatchKind {
    Exact,
    WithinLooseTolerance,
    WithinMemoTolerance,
}

/// What we expect to receive for a pending payment
#[derive(Debug, Clone)]
pub(crate) struct Expectation<'a> {
    pub(crate) amount: f64,
    pub(crate) memo: &'a str,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) expires_at: DateTime<Utc>,
}

impl Expectation<'_> {
    /// Returns the transaction that pays for the expectation. An exact match
    /// wins over the loose ones regardless of the order of transactions, the
    /// ties are resolved in favor of the first transaction. Transactions
    /// outside of the time window and the ones that already paid for another
    /// payment are skipped.
    pub(crate) fn find_match<'t>(
        &self,
        txs: &'t [IncomingTx],
        claimed: &HashSet<String>,
    ) -> Option<(&'t IncomingTx, MatchKind)> {
        txs.iter()
            .filter(|tx| self.is_within_window(tx.timestamp))
            .filter(|tx| !claimed.contains(&tx.hash))
            .filter_map(|tx| Some((tx, self.match_kind(tx)?)))
            .min_by_key(|(_, kind)| *kind)
    }

    fn is_within_window(&self, timestamp: DateTime<Utc>) -> bool {
        self.created_at - window_leeway() <= timestamp && timestamp <= self.expires_at
    }

    pub(crate) fn match_kind(&self, tx: &IncomingTx) -> Option<MatchKind> {
        let has_memo = match tx.memo.as_deref() {
            // Transaction for a different payment
            Some(memo) if !memo.trim().eq_ignore_ascii_case(self.memo) => return None,
            Some(_) => true,
            None => false,
        };

        if self.amount <= 0.0 {
            return None;
        }

        let diff = ((tx.amount - self.amount) / self.amount).abs();

        if diff <= EXACT_TOLERANCE {
            return Some(MatchKind::Exact);
        }
        if diff <= LOOSE_TOLERANCE {
            return Some(MatchKind::WithinLooseTolerance);
        }
        if diff <= MEMO_TOLERANCE && has_memo {
            return Some(MatchKind::WithinMemoTolerance);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn expectation() -> Expectation<'static> {
        Expectation {
            amount: 3.0,
            memo: "PAY123",
            created_at: t0(),
            expires_at: t0() + chrono::Duration::minutes(30),
        }
    }

    fn tx(hash: &str, amount: f64, memo: Option<&str>, minutes: i64) -> IncomingTx {
        IncomingTx {
            hash: hash.to_owned(),
            amount,
            memo: memo.map(ToOwned::to_owned),
            timestamp: t0() + chrono::Duration::minutes(minutes),
        }
    }

    #[test]
    fn tolerance_ordering() {
        let exp = expectation();

        assert_eq!(exp.match_kind(&tx("a", 3.0, None, 1)), Some(MatchKind::Exact));
        assert_eq!(
            exp.match_kind(&tx("b", 3.12, None, 1)),
            Some(MatchKind::WithinLooseTolerance)
        );
        assert_eq!(
            exp.match_kind(&tx("c", 2.88, Some("PAY123"), 1)),
            Some(MatchKind::WithinLooseTolerance)
        );

        // 7% off is accepted only together with the memo
        assert_eq!(exp.match_kind(&tx("d", 3.21, None, 1)), None);
        assert_eq!(
            exp.match_kind(&tx("e", 3.21, Some("pay123"), 1)),
            Some(MatchKind::WithinMemoTolerance)
        );

        assert_eq!(exp.match_kind(&tx("f", 3.6, Some("PAY123"), 1)), None);
    }

    #[test]
    fn different_memo_never_matches() {
        let exp = expectation();
        assert_eq!(exp.match_kind(&tx("a", 3.0, Some("OTHER"), 1)), None);
    }

    #[test]
    fn skips_claimed_and_out_of_window_transactions() {
        let exp = expectation();
        let txs = [
            tx("too-early", 3.0, None, -6),
            tx("too-late", 3.0, None, 31),
            tx("claimed", 3.0, None, 2),
            tx("slightly-early", 3.0, None, -4),
        ];
        let claimed = HashSet::from(["claimed".to_owned()]);

        let (found, kind) = exp.find_match(&txs, &claimed).unwrap();

        assert_eq!(found.hash, "slightly-early");
        assert_eq!(kind, MatchKind::Exact);
    }

    #[test]
    fn exact_match_wins_over_earlier_loose_one() {
        let exp = expectation();
        let txs = [
            tx("someone-else", 3.1, None, 3),
            tx("with-memo", 3.2, Some("PAY123"), 2),
            tx("ours", 3.0, None, 1),
        ];

        let (found, kind) = exp.find_match(&txs, &HashSet::new()).unwrap();

        assert_eq!(found.hash, "ours");
        assert_eq!(kind, MatchKind::Exact);
    }

    #[test]
    fn loose_match_wins_over_memo_one() {
        let exp = expectation();
        let txs = [
            tx("memo", 3.25, Some("PAY123"), 3),
            tx("first-loose", 3.1, None, 2),
            tx("second-loose", 2.95, None, 1),
        ];

        let (found, kind) = exp.find_match(&txs, &HashSet::new()).unwrap();

        assert_eq!(found.hash, "first-loose");
        assert_eq!(kind, MatchKind::WithinLooseTolerance);
    }

    #[test]
    fn zero_expectation_never_matches() {
        let exp = Expectation {
            amount: 0.0,
            ..expectation()
        };
        assert_eq!(exp.match_kind(&tx("a", 0.0, Some("PAY123"), 1)), None);
    }

    #[test]
    fn nothing_matches() {
        let exp = expectation();
        let txs = [tx("a", 1.0, None, 1), tx("b", 3.0, Some("OTHER"), 1)];

        assert_eq!(exp.find_match(&txs, &HashSet::new()), None);
    }
}

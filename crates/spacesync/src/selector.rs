use crate::timeframe::Timeframe;
use crate::types::FeedMessage;

/// Admission policy for the pipeline.
///
/// Given the head candidate of every feed that has one (in feed attachment
/// order) and the pipeline's current timeframe, returns the index of the
/// candidate to deliver next, or `None` if nothing may be delivered yet.
pub trait MessageSelector: Send + Sync {
    fn select(&self, candidates: &[&FeedMessage], timeframe: &Timeframe) -> Option<usize>;
}

/// Delivers the first candidate whose declared timeframe has no gaps
/// against the current one.
#[derive(Debug, Default, Clone, Copy)]
pub struct CausalSelector;

impl MessageSelector for CausalSelector {
    fn select(&self, candidates: &[&FeedMessage], timeframe: &Timeframe) -> Option<usize> {
        candidates
            .iter()
            .position(|candidate| Timeframe::dependencies(&candidate.timeframe, timeframe).is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FeedId;
    use bytes::Bytes;

    fn message(feed: u64, seq: u64, deps: &[(u64, u64)]) -> FeedMessage {
        FeedMessage {
            feed_id: FeedId::from_u64(feed),
            seq,
            timeframe: deps
                .iter()
                .map(|(f, s)| (FeedId::from_u64(*f), *s))
                .collect(),
            payload: Bytes::new(),
        }
    }

    #[test]
    fn test_empty_candidates() {
        assert_eq!(CausalSelector.select(&[], &Timeframe::new()), None);
    }

    #[test]
    fn test_selects_first_ready_in_order() {
        let a = message(1, 1, &[]);
        let b = message(2, 1, &[]);
        assert_eq!(CausalSelector.select(&[&a, &b], &Timeframe::new()), Some(0));
        assert_eq!(CausalSelector.select(&[&b, &a], &Timeframe::new()), Some(0));
    }

    #[test]
    fn test_skips_candidates_with_gaps() {
        let blocked = message(2, 1, &[(1, 3)]);
        let ready = message(1, 2, &[(1, 1)]);
        let current = Timeframe::from_frames([(FeedId::from_u64(1), 1)]);
        assert_eq!(CausalSelector.select(&[&blocked, &ready], &current), Some(1));
    }

    #[test]
    fn test_nothing_ready() {
        let a = message(2, 1, &[(1, 3)]);
        let b = message(3, 1, &[(4, 1)]);
        assert_eq!(CausalSelector.select(&[&a, &b], &Timeframe::new()), None);
    }
}

use crate::types::{FeedId, IdError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Causal position across feeds: for every known feed, the highest sequence
/// number (inclusive) that has been seen. A feed that is absent counts as 0.
///
/// Timeframes are values. `merge` and `dependencies` return new timeframes;
/// `update` exists for the clock, which owns its timeframe exclusively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeframe {
    frames: BTreeMap<FeedId, u64>,
}

impl Timeframe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_frames(frames: impl IntoIterator<Item = (FeedId, u64)>) -> Self {
        let mut timeframe = Self::new();
        for (feed_id, seq) in frames {
            timeframe.update(feed_id, seq);
        }
        timeframe
    }

    /// Highest sequence seen for a feed, 0 if unknown
    pub fn get(&self, feed_id: FeedId) -> u64 {
        self.frames.get(&feed_id).copied().unwrap_or(0)
    }

    /// Raise the entry for a feed to at least `seq`
    pub fn update(&mut self, feed_id: FeedId, seq: u64) {
        if seq == 0 {
            return;
        }
        let current = self.frames.entry(feed_id).or_insert(0);
        *current = (*current).max(seq);
    }

    /// Pointwise maximum of two timeframes.
    pub fn merge(&self, other: &Timeframe) -> Timeframe {
        let mut merged = self.clone();
        for (feed_id, &seq) in &other.frames {
            merged.update(*feed_id, seq);
        }
        merged
    }

    /// The entries of `target` that `known` has not reached yet.
    /// An empty result means `target` is causally satisfied by `known`.
    pub fn dependencies(target: &Timeframe, known: &Timeframe) -> Timeframe {
        Timeframe {
            frames: target
                .frames
                .iter()
                .filter(|(feed_id, seq)| **seq > known.get(**feed_id))
                .map(|(feed_id, seq)| (*feed_id, *seq))
                .collect(),
        }
    }

    /// True if this timeframe has seen everything in `other`
    pub fn descends(&self, other: &Timeframe) -> bool {
        Self::dependencies(other, self).is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn total_messages(&self) -> u64 {
        self.frames.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FeedId, u64)> + '_ {
        self.frames.iter().map(|(feed_id, seq)| (*feed_id, *seq))
    }

    pub fn feeds(&self) -> impl Iterator<Item = FeedId> + '_ {
        self.frames.keys().copied()
    }
}

/// Format as "feed:..:5,feed:..:3", sorted by feed id
impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs = self
            .frames
            .iter()
            .map(|(feed_id, seq)| format!("{}:{}", feed_id, seq))
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&pairs)
    }
}

impl FromStr for Timeframe {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::new());
        }

        let mut timeframe = Self::new();
        for pair in s.split(',') {
            let (feed_str, seq_str) = pair
                .rsplit_once(':')
                .ok_or_else(|| IdError::InvalidFormat(pair.to_string()))?;
            let feed_id = FeedId::from_str(feed_str)?;
            let seq = seq_str
                .parse()
                .map_err(|_| IdError::InvalidFormat(pair.to_string()))?;
            timeframe.update(feed_id, seq);
        }
        Ok(timeframe)
    }
}

impl FromIterator<(FeedId, u64)> for Timeframe {
    fn from_iter<I: IntoIterator<Item = (FeedId, u64)>>(iter: I) -> Self {
        Self::from_frames(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(n: u64) -> FeedId {
        FeedId::from_u64(n)
    }

    #[test]
    fn test_get_missing_is_zero() {
        let tf = Timeframe::new();
        assert_eq!(tf.get(feed(1)), 0);
        assert!(tf.is_empty());
    }

    #[test]
    fn test_update_keeps_max() {
        let mut tf = Timeframe::new();
        tf.update(feed(1), 5);
        tf.update(feed(1), 3);
        assert_eq!(tf.get(feed(1)), 5);
        tf.update(feed(1), 7);
        assert_eq!(tf.get(feed(1)), 7);
    }

    #[test]
    fn test_update_zero_adds_nothing() {
        let mut tf = Timeframe::new();
        tf.update(feed(1), 0);
        assert!(tf.is_empty());
    }

    #[test]
    fn test_merge() {
        let a = Timeframe::from_frames([(feed(1), 5), (feed(2), 3)]);
        let b = Timeframe::from_frames([(feed(1), 3), (feed(2), 7), (feed(3), 2)]);

        let merged = a.merge(&b);
        assert_eq!(merged.get(feed(1)), 5);
        assert_eq!(merged.get(feed(2)), 7);
        assert_eq!(merged.get(feed(3)), 2);
        assert_eq!(merged, b.merge(&a));
        // inputs are untouched
        assert_eq!(a.get(feed(2)), 3);
    }

    #[test]
    fn test_dependencies() {
        let target = Timeframe::from_frames([(feed(1), 3), (feed(2), 2)]);
        let known = Timeframe::from_frames([(feed(1), 1), (feed(2), 2)]);

        let deps = Timeframe::dependencies(&target, &known);
        assert_eq!(deps, Timeframe::from_frames([(feed(1), 3)]));
    }

    #[test]
    fn test_dependencies_missing_key_is_zero() {
        let target = Timeframe::from_frames([(feed(9), 1)]);
        let deps = Timeframe::dependencies(&target, &Timeframe::new());
        assert_eq!(deps.get(feed(9)), 1);
    }

    #[test]
    fn test_dependencies_of_self_is_empty() {
        let tf = Timeframe::from_frames([(feed(1), 3), (feed(2), 2)]);
        assert!(Timeframe::dependencies(&tf, &tf).is_empty());
    }

    #[test]
    fn test_descends() {
        let a = Timeframe::from_frames([(feed(1), 5), (feed(2), 3)]);
        let b = Timeframe::from_frames([(feed(1), 3), (feed(2), 3)]);
        let c = Timeframe::from_frames([(feed(1), 5), (feed(2), 2), (feed(3), 1)]);

        assert!(a.descends(&b));
        assert!(!b.descends(&a));
        assert!(!a.descends(&c));
        assert!(!c.descends(&a));
        assert!(a.descends(&Timeframe::new()));
    }

    #[test]
    fn test_total_messages() {
        let tf = Timeframe::from_frames([(feed(1), 5), (feed(2), 3)]);
        assert_eq!(tf.total_messages(), 8);
    }

    #[test]
    fn test_display_sorted() {
        let tf = Timeframe::from_frames([(feed(2), 3), (feed(1), 5)]);
        assert_eq!(
            tf.to_string(),
            "feed:0000000000000001:5,feed:0000000000000002:3"
        );
        assert_eq!(Timeframe::new().to_string(), "");
    }

    #[test]
    fn test_parse_roundtrip() {
        let tf = Timeframe::from_frames([(feed(1), 5), (feed(20), 3)]);
        let parsed: Timeframe = tf.to_string().parse().unwrap();
        assert_eq!(parsed, tf);
        assert_eq!("".parse::<Timeframe>().unwrap(), Timeframe::new());
    }

    #[test]
    fn test_parse_invalid() {
        assert!("feed:0000000000000001".parse::<Timeframe>().is_err());
        assert!("feed:0000000000000001:x".parse::<Timeframe>().is_err());
        assert!("garbage".parse::<Timeframe>().is_err());
    }
}

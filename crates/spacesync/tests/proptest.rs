use proptest::prelude::*;
use proptest::test_runner::Config;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use serde_json::json;
use spacesync::crdt::CrdtDoc;
use spacesync::{FeedId, Timeframe};
use std::collections::{BTreeMap, BTreeSet};

fn timeframe_strategy() -> impl Strategy<Value = Timeframe> {
    prop::collection::btree_map(0u64..6, 0u64..20, 0..6).prop_map(|frames| {
        frames
            .into_iter()
            .map(|(feed, seq)| (FeedId::from_u64(feed), seq))
            .collect()
    })
}

proptest! {
    #[test]
    fn merge_is_commutative(a in timeframe_strategy(), b in timeframe_strategy()) {
        prop_assert_eq!(a.merge(&b), b.merge(&a));
    }

    #[test]
    fn merge_is_associative(
        a in timeframe_strategy(),
        b in timeframe_strategy(),
        c in timeframe_strategy(),
    ) {
        prop_assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
    }

    #[test]
    fn merge_dominates_both_inputs(a in timeframe_strategy(), b in timeframe_strategy()) {
        let merged = a.merge(&b);
        prop_assert!(merged.descends(&a));
        prop_assert!(merged.descends(&b));
        prop_assert_eq!(merged.merge(&a), merged.clone());
    }

    #[test]
    fn dependencies_are_exactly_the_unmet_entries(
        target in timeframe_strategy(),
        known in timeframe_strategy(),
    ) {
        let missing = Timeframe::dependencies(&target, &known);
        prop_assert!(Timeframe::dependencies(&target, &target).is_empty());
        prop_assert_eq!(missing.is_empty(), known.descends(&target));
        for (feed_id, seq) in missing.iter() {
            prop_assert_eq!(seq, target.get(feed_id));
            prop_assert!(seq > known.get(feed_id));
        }
    }

    #[test]
    fn timeframe_text_form(timeframe in timeframe_strategy()) {
        let parsed: Timeframe = timeframe.to_string().parse().unwrap();
        prop_assert_eq!(parsed, timeframe);
    }
}

type NodeId = usize;

const NODES: usize = 3;
const KEYS: [&str; 3] = ["a", "b", "c"];

/// The operations on the cluster
#[derive(Clone, Debug)]
pub enum Ops {
    Update(NodeId, &'static str, i64),
    Replicate(NodeId, NodeId),
}

/// Which local edits each replica has seen. Two replicas that have seen the
/// same edits must hold the same value, whatever order they saw them in.
#[derive(Clone, Debug)]
struct Knowledge {
    seen: Vec<BTreeSet<u64>>,
    next_edit: u64,
}

impl ReferenceStateMachine for Knowledge {
    type State = Self;
    type Transition = Ops;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Knowledge {
            seen: vec![BTreeSet::new(); NODES],
            next_edit: 0,
        })
        .boxed()
    }

    fn transitions(_state: &Self::State) -> BoxedStrategy<Self::Transition> {
        prop_oneof![
            (0..NODES, prop::sample::select(KEYS.to_vec()), -5i64..5)
                .prop_map(|(node, key, value)| Ops::Update(node, key, value)),
            (0..NODES, 0..NODES).prop_map(|(from, to)| Ops::Replicate(from, to)),
        ]
        .boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            Ops::Update(node, _, _) => {
                state.seen[*node].insert(state.next_edit);
                state.next_edit += 1;
            }
            Ops::Replicate(from, to) => {
                let seen = state.seen[*from].clone();
                state.seen[*to].extend(seen);
            }
        }
        state
    }

    fn preconditions(_state: &Self::State, transition: &Self::Transition) -> bool {
        match transition {
            Ops::Update(..) => true,
            Ops::Replicate(from, to) => from != to,
        }
    }
}

/// Replicas exchanging only the deltas the receiver is missing
struct Replicas {
    docs: Vec<CrdtDoc>,
}

impl StateMachineTest for Replicas {
    type SystemUnderTest = Self;
    type Reference = Knowledge;

    fn init_test(_ref_state: &Knowledge) -> Self::SystemUnderTest {
        Replicas {
            docs: (0..NODES).map(|_| CrdtDoc::new()).collect(),
        }
    }

    fn apply(state: Self, _ref_state: &Knowledge, transition: Ops) -> Self::SystemUnderTest {
        match transition {
            Ops::Update(node, key, value) => {
                state.docs[node]
                    .change(|tx| tx.set(key, json!(value)))
                    .unwrap();
            }
            Ops::Replicate(from, to) => {
                let since = state.docs[to].current_position();
                if let Some(delta) = state.docs[from].diff_since(&since).unwrap() {
                    state.docs[to].merge(&delta).unwrap();
                }
            }
        }
        state
    }

    fn check_invariants(state: &Self, ref_state: &Knowledge) {
        let mut by_knowledge: BTreeMap<&BTreeSet<u64>, NodeId> = BTreeMap::new();
        for (node, seen) in ref_state.seen.iter().enumerate() {
            match by_knowledge.get(seen) {
                Some(&other) => assert_eq!(
                    state.docs[node].value(),
                    state.docs[other].value(),
                    "replicas {} and {} saw the same edits but differ",
                    other,
                    node
                ),
                None => {
                    by_knowledge.insert(seen, node);
                }
            }
        }
    }
}

prop_state_machine! {
    #![proptest_config(Config {
        // Enable verbose mode to make the state machine test print the
        // transitions for each case.
        verbose: 1,
        .. Config::default()
    })]

    #[test]
    fn replicas_converge(
        sequential
        10..100
        =>
        Replicas
    );
}

//! Algebraic properties of channel merging
//!
//! Union merge must be commutative, associative and idempotent so that
//! replicas converge whatever order they sync in.

use bytes::Bytes;
use dreview_core::replication::union_channels;
use dreview_core::{ChannelContents, CommitId, HistoryStore, MemoryStore, RefSpec, Replicator};
use proptest::prelude::*;

const REVIEWS: &str = "refs/notes/devtools/reviews";
const PATTERN: &str = "refs/notes/devtools/*";

fn records() -> impl Strategy<Value = Vec<Bytes>> {
    prop::collection::vec("[a-z:]{1,8}", 0..6)
        .prop_map(|v| v.into_iter().map(Bytes::from).collect())
}

fn channel() -> impl Strategy<Value = ChannelContents> {
    prop::collection::btree_map(0u8..4, records(), 0..4).prop_map(|m| {
        m.into_iter()
            .map(|(k, v)| (CommitId::new([k; 20]), v))
            .collect()
    })
}

/// Merged contents compared as record sets per commit.
fn normalized(contents: &ChannelContents) -> ChannelContents {
    let empty = ChannelContents::new();
    union_channels(contents, &empty)
}

proptest! {
    #[test]
    fn union_is_commutative(a in channel(), b in channel()) {
        prop_assert_eq!(union_channels(&a, &b), union_channels(&b, &a));
    }

    #[test]
    fn union_is_associative(a in channel(), b in channel(), c in channel()) {
        prop_assert_eq!(
            union_channels(&union_channels(&a, &b), &c),
            union_channels(&a, &union_channels(&b, &c))
        );
    }

    #[test]
    fn union_is_idempotent(a in channel(), b in channel()) {
        let once = union_channels(&a, &b);
        prop_assert_eq!(union_channels(&once, &b), once.clone());
        prop_assert_eq!(union_channels(&a, &a), normalized(&a));
    }

    #[test]
    fn replicas_converge(
        left in prop::collection::vec("[a-z]{1,6}", 0..5),
        right in prop::collection::vec("[a-z]{1,6}", 0..5),
        left_first in any::<bool>(),
    ) {
        let a = MemoryStore::shared("a");
        let b = MemoryStore::shared("b");
        a.add_remote("peer", &b).unwrap();
        b.add_remote("peer", &a).unwrap();
        let head = a.commit(&[], "initial").unwrap();
        a.set_ref("refs/heads/main", head).unwrap();
        b.fetch_channel("peer", &RefSpec::new("refs/heads/*", "refs/heads/*", true)).unwrap();

        for record in &left {
            a.append_channel_record(REVIEWS, head, record.as_bytes()).unwrap();
        }
        for record in &right {
            b.append_channel_record(REVIEWS, head, record.as_bytes()).unwrap();
        }

        let (first, second) = if left_first { (&a, &b) } else { (&b, &a) };
        Replicator::new(first.clone()).pull("peer", PATTERN).unwrap();
        Replicator::new(second.clone()).pull("peer", PATTERN).unwrap();

        let a_records = a.read_channel_records(REVIEWS, head).unwrap();
        let b_records = b.read_channel_records(REVIEWS, head).unwrap();
        prop_assert_eq!(&a_records, &b_records);
        for record in left.iter().chain(&right) {
            prop_assert!(a_records.iter().any(|r| r.as_ref() == record.as_bytes()));
        }
    }
}

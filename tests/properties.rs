use std::collections::HashSet;

use peerchat::{bucket_index, xor_distance, NodeId, RoutingEntry, RoutingTable, ID_LEN};
use proptest::prelude::*;

fn entry(id: NodeId) -> RoutingEntry {
    RoutingEntry {
        node_id: id,
        ip_addr: format!("peer-{id:016x}"),
    }
}

proptest! {
    #[test]
    fn distance_is_zero_on_self_and_symmetric(a in any::<u64>(), b in any::<u64>()) {
        prop_assert_eq!(xor_distance(a, a), 0);
        prop_assert_eq!(xor_distance(a, b), xor_distance(b, a));
    }

    #[test]
    fn bucket_index_depends_only_on_xor(a in any::<u64>(), b in any::<u64>(), mask in any::<u64>()) {
        prop_assert_eq!(bucket_index(a, b), bucket_index(b, a));
        prop_assert_eq!(bucket_index(a, b), bucket_index(a ^ mask, b ^ mask));
        prop_assert!(bucket_index(a, b) < ID_LEN);
    }

    #[test]
    fn closest_agrees_with_brute_force(
        self_id in any::<u64>(),
        ids in prop::collection::vec(any::<u64>(), 0..200),
        target in any::<u64>(),
        n in 1usize..40,
        k in 1usize..12,
    ) {
        let mut table = RoutingTable::new(self_id, k);
        for id in &ids {
            table.update(entry(*id));
        }
        for idx in 0..ID_LEN {
            prop_assert!(table.bucket_len(idx) <= k);
        }

        let closest = table.closest(n, target);
        prop_assert!(closest.len() <= n);
        let unique: HashSet<NodeId> = closest.iter().map(|c| c.entry.node_id).collect();
        prop_assert_eq!(unique.len(), closest.len());
        prop_assert!(closest.windows(2).all(|w| w[0].distance <= w[1].distance));

        let mut expected: Vec<NodeId> = table
            .entries()
            .iter()
            .map(|e| xor_distance(e.node_id, target))
            .collect();
        expected.sort_unstable();
        expected.truncate(n);
        let got: Vec<NodeId> = closest.iter().map(|c| c.distance).collect();
        prop_assert_eq!(got, expected);
    }
}

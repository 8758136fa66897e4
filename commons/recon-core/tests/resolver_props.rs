use std::collections::HashMap;

use proptest::prelude::*;
use recon_core::graph::{DependencyResolver, GraphError, NodeId};

fn node(i: usize) -> NodeId {
    NodeId::new("apps/v1", "Deployment", "default", &format!("n{i}"))
}

/// Random DAG over `0..n`: node `i` may only depend on nodes `< i`.
fn dag() -> impl Strategy<Value = (usize, Vec<Vec<usize>>, Vec<usize>)> {
    (1usize..40).prop_flat_map(|n| {
        let deps = (0..n)
            .map(|i| {
                if i == 0 {
                    Just(Vec::new()).boxed()
                } else {
                    proptest::collection::vec(0..i, 0..4).boxed()
                }
            })
            .collect::<Vec<_>>();
        let order = Just((0..n).collect::<Vec<_>>()).prop_shuffle();
        (Just(n), deps, order)
    })
}

fn build(
    deps: &[Vec<usize>],
    insertion: &[usize],
) -> DependencyResolver<NodeId> {
    let mut resolver = DependencyResolver::new();
    for &i in insertion {
        let mut d = deps[i].clone();
        d.sort_unstable();
        d.dedup();
        resolver.add_node(node(i), d.into_iter().map(node));
    }
    resolver
}

proptest! {
    #[test]
    fn order_respects_every_edge((n, deps, insertion) in dag()) {
        let order = build(&deps, &insertion).resolve().unwrap();
        prop_assert_eq!(order.len(), n);

        let position: HashMap<NodeId, usize> = order
            .iter()
            .cloned()
            .enumerate()
            .map(|(pos, id)| (id, pos))
            .collect();
        prop_assert_eq!(position.len(), n);
        for (i, ds) in deps.iter().enumerate() {
            for &d in ds {
                prop_assert!(position[&node(d)] < position[&node(i)]);
            }
        }
    }

    #[test]
    fn back_edge_is_reported_as_cycle(
        (n, mut deps, insertion) in dag(),
        pick in any::<prop::sample::Index>(),
    ) {
        prop_assume!(n > 1);
        // Close a loop: the root now depends on a node that depends on it.
        let tail = 1 + pick.index(n - 1);
        deps[tail].push(0);
        deps[0].push(tail);

        let err = build(&deps, &insertion).resolve().unwrap_err();
        prop_assert!(err.to_string().contains("circular reference"));
        match err {
            GraphError::Cycle { members } => {
                prop_assert!(members.contains(&node(0)));
                prop_assert!(members.contains(&node(tail)));
            }
            other => prop_assert!(false, "unexpected error {other}"),
        }
    }
}

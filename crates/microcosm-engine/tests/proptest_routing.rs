//! Property tests for collision routing.
//!
//! Random group memberships and filter signatures are routed through a
//! [`CollisionRouter`]. A filter must receive the pair exactly when its
//! signature matches one group from each side, in either order, and the pair
//! is oriented to the signature.

use std::collections::BTreeSet;

use microcosm_engine::prelude::*;
use proptest::prelude::*;

const GROUPS: [&str; 4] = ["player", "enemy", "wall", "pickup"];

fn group_set() -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set(0..GROUPS.len(), 0..=3)
        .prop_map(|ids| ids.into_iter().map(|i| GROUPS[i].to_owned()).collect::<Vec<_>>())
}

fn signature() -> impl Strategy<Value = (usize, usize)> {
    (0..GROUPS.len(), 0..GROUPS.len())
}

/// Expected content of a `(g1, g2)` filter after routing one contact
/// reported as `(first, second)`.
///
/// The reported orientation wins when both orientations match.
fn expected(
    (g1, g2): (&str, &str),
    first: EntityId,
    first_groups: &[String],
    second: EntityId,
    second_groups: &[String],
) -> BTreeSet<Collision> {
    let has = |groups: &[String], g: &str| groups.iter().any(|x| x == g);
    let pair = if has(first_groups, g1) && has(second_groups, g2) {
        Some((first, second))
    } else if has(second_groups, g1) && has(first_groups, g2) {
        Some((second, first))
    } else {
        None
    };
    pair.map(|(x, y)| if g1 == g2 { (x.min(y), x.max(y)) } else { (x, y) })
        .into_iter()
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    #[test]
    fn routing_matches_group_membership(
        groups_a in group_set(),
        groups_b in group_set(),
        signatures in prop::collection::vec(signature(), 1..6),
        swap in any::<bool>(),
    ) {
        let a = EntityId::new(1, 0);
        let b = EntityId::new(2, 0);
        let mut router = CollisionRouter::new();
        let filters: Vec<CollisionFilter> = signatures
            .iter()
            .map(|&(i, j)| CollisionFilter::registered(GROUPS[i], GROUPS[j], &mut router))
            .collect();

        let (first, first_groups, second, second_groups) = if swap {
            (b, &groups_b, a, &groups_a)
        } else {
            (a, &groups_a, b, &groups_b)
        };
        let delivered = router.route(first, first_groups, second, second_groups);

        let mut total = 0;
        for filter in &filters {
            let want = expected(
                filter.collision_signature(),
                first,
                first_groups,
                second,
                second_groups,
            );
            prop_assert_eq!(&*filter.collisions(), &want);
            total += want.len();
        }
        prop_assert_eq!(delivered, total);
    }

    #[test]
    fn rerouting_the_same_contact_adds_nothing(
        groups_a in group_set(),
        groups_b in group_set(),
        sig in signature(),
    ) {
        let a = EntityId::new(0, 0);
        let b = EntityId::new(7, 2);
        let mut router = CollisionRouter::new();
        let filter = CollisionFilter::registered(GROUPS[sig.0], GROUPS[sig.1], &mut router);

        router.route(a, &groups_a, b, &groups_b);
        let once = filter.collisions().clone();
        router.route(a, &groups_a, b, &groups_b);
        prop_assert_eq!(&*filter.collisions(), &once);
    }
}

//! Mapping count and reduction structure properties.

use proptest::prelude::*;

use polygpu_ir::aff::QuasiAff;
use polygpu_ir::mapping::MappingCfg;
use polygpu_ir::test::fixtures;
use polygpu_ir::tree::{Band, BandMember, Node, ScheduleTree, SyntheticKind};
use polygpu_ir::{Mark, UserConfig};

use crate::mapping::map_thread_helper;
use crate::test::helpers::{count_marks, schedule, scop_info, synthetic_names};

/// Band over `S0` with `members` members, the first `coincident` of them parallel.
fn band_tree(members: usize, coincident: usize) -> ScheduleTree {
    let band = Band::new(
        (0..members).map(|m| BandMember::new(m < coincident).with("S0", QuasiAff::var(format!("x{m}")))),
        true,
    );
    ScheduleTree::new(["S0"], Node::band(band, Node::leaf()))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Threads bind exactly the leading coincident members the config can hold.
    #[test]
    fn mapped_members_bounded_by_config(
        (members, coincident) in (1usize..=4).prop_flat_map(|m| (Just(m), 0..=m)),
        extents in prop::collection::vec(1i64..=8, 1..=3),
    ) {
        let (kernel, _) = fixtures::stencil(64);
        let mut info = scop_info(kernel, UserConfig::default());
        let cfg = MappingCfg::threads(&extents).unwrap();
        let tree = band_tree(members, coincident);

        let (_, mark) = map_thread_helper(&tree, &[0], &cfg, Mark::Thread, &mut info).unwrap();
        if coincident == 0 {
            prop_assert!(mark.is_none());
            prop_assert!(info.analysis.mappings.is_empty());
        } else {
            prop_assert!(mark.is_some());
            let (_, mapping) = &info.analysis.mappings[0];
            prop_assert_eq!(mapping.bindings.len(), coincident.min(extents.len()));
        }
    }

    /// Every library reduction gets one init, one update and one area, whatever
    /// the derived configs end up being.
    #[test]
    fn one_init_and_update_per_reduction(rows in 1i64..=64, cols in 2i64..=4096) {
        let (kernel, tree) = fixtures::row_reduce(rows, cols);
        let (tree, _) = schedule(kernel, &tree, UserConfig::default());

        prop_assert_eq!(synthetic_names(&tree, |k| matches!(k, SyntheticKind::ReduceInit(_))).len(), 1);
        prop_assert_eq!(synthetic_names(&tree, |k| matches!(k, SyntheticKind::ReduceUpdate(_))).len(), 1);
        prop_assert_eq!(count_marks(&tree, |m| matches!(m, Mark::ReduceArea(_))), 1);
    }
}

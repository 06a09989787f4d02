//! Buffer padding and shared memory budget properties.

use polygpu_ir::{BufferDefInfo, MappingCfg, UserConfig};
use proptest::prelude::*;

use crate::shared_memory::padded_sizes;
use crate::test::helpers::{schedule, shifted_reads};

/// Bytes of a `[0, 1, reach]` shifted read over a 256-wide tile.
fn shifted_bytes(reach: i64) -> usize {
    padded_sizes(&[256 + reach], false, 0)[0] as usize * 4
}

proptest! {
    /// Padding only touches the innermost extent and never shrinks it.
    #[test]
    fn padding_grows_innermost_only(extents in prop::collection::vec(1i64..512, 1..4), bank_conflict: bool, align in 0usize..9) {
        let padded = padded_sizes(&extents, bank_conflict, align);
        let last = extents.len() - 1;
        prop_assert_eq!(&padded[..last], &extents[..last]);
        prop_assert!(padded[last] >= extents[last]);
    }

    /// Without alignment the innermost extent comes out odd.
    #[test]
    fn unaligned_innermost_is_odd(extents in prop::collection::vec(1i64..512, 1..4), bank_conflict: bool) {
        let padded = padded_sizes(&extents, bank_conflict, 0);
        prop_assert_eq!(padded[padded.len() - 1] % 2, 1);
    }

    /// Padded sizes are already padded.
    #[test]
    fn padding_is_idempotent(extents in prop::collection::vec(1i64..512, 1..4), bank_conflict: bool) {
        let once = padded_sizes(&extents, bank_conflict, 0);
        prop_assert_eq!(padded_sizes(&once, bank_conflict, 0), once);
    }

    /// Alignment rounds the innermost extent up to a multiple.
    #[test]
    fn aligned_innermost_is_multiple(extents in prop::collection::vec(1i64..512, 1..4), align in 2usize..9) {
        let padded = padded_sizes(&extents, false, align);
        prop_assert_eq!(padded[padded.len() - 1] % align as i64, 0);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Promotions are first-fit in name order and their buffers never
    /// exceed the configured budget.
    #[test]
    fn promotions_fit_budget(reaches in prop::collection::vec(1i64..600, 4), budget in 500usize..6000) {
        let names = ["A", "B", "C", "D"];
        let reads: Vec<(&str, Vec<i64>)> = names.iter().zip(&reaches).map(|(t, r)| (*t, vec![0, 1, *r])).collect();
        let (kernel, tree) = shifted_reads(1024, &reads);
        let config = UserConfig::builder()
            .thread_cfg(MappingCfg::threads(&[256]).unwrap())
            .block_cfg(MappingCfg::blocks(&[4]).unwrap())
            .shared_memory_size(budget)
            .build();
        let (_, info) = schedule(kernel, &tree, config);

        let mut remaining = budget;
        let mut expected = Vec::new();
        for (tensor, reach) in names.iter().zip(&reaches) {
            let bytes = shifted_bytes(*reach);
            if bytes < remaining {
                remaining -= bytes;
                expected.push(tensor.to_string());
            }
        }
        let promoted: Vec<String> = info.analysis.promoted_binds.iter().map(|(t, _)| t.clone()).collect();
        prop_assert_eq!(promoted, expected);
        let total: usize = info.analysis.buffer_defs.iter().map(BufferDefInfo::bytes).sum();
        prop_assert!(total <= budget);
    }
}

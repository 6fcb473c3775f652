// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the duplication classifier
//! OWNERS: @runtime
//! NOTE: Tests only; no runtime logic.
//!
//! TEST_SCOPE:
//!   - SHARE pages keep their propagatable bits exactly
//!   - Non-shared writable/COW pages never yield a writable mapping on either side
//!   - Read-only pages map read-only and leave the source untouched

use super::{classify, Disposition, PteFlags};
use proptest::prelude::*;

fn arb_present_flags() -> impl Strategy<Value = PteFlags> {
    any::<u32>().prop_map(|bits| PteFlags::from_bits_truncate(bits) | PteFlags::USER_RO)
}

proptest! {
    #[test]
    fn share_is_bit_exact(flags in arb_present_flags()) {
        let flags = flags | PteFlags::SHARE;
        let disposition = classify(flags);
        prop_assert_eq!(disposition.child_flags(), flags & PteFlags::SYSCALL);
        prop_assert_eq!(disposition.parent_flags(), None);
    }

    #[test]
    fn no_writable_alias_after_cow(flags in arb_present_flags()) {
        prop_assume!(!flags.contains(PteFlags::SHARE));
        prop_assume!(flags.intersects(PteFlags::WRITABLE | PteFlags::COW));
        let disposition = classify(flags);
        prop_assert_eq!(disposition, Disposition::CopyOnWrite);
        prop_assert!(!disposition.child_flags().contains(PteFlags::WRITABLE));
        prop_assert!(disposition.child_flags().contains(PteFlags::COW));
        let parent = disposition.parent_flags().unwrap();
        prop_assert!(!parent.contains(PteFlags::WRITABLE));
        prop_assert!(parent.contains(PteFlags::COW));
    }

    #[test]
    fn read_only_stays_plain(flags in arb_present_flags()) {
        let flags = flags - PteFlags::SHARE - PteFlags::WRITABLE - PteFlags::COW;
        let disposition = classify(flags);
        prop_assert_eq!(disposition.child_flags(), PteFlags::USER_RO);
        prop_assert_eq!(disposition.parent_flags(), None);
    }

    #[test]
    fn destination_bits_are_syscall_legal(flags in arb_present_flags()) {
        let child = classify(flags).child_flags();
        prop_assert!(PteFlags::SYSCALL.contains(child));
        prop_assert!(child.contains(PteFlags::USER_RO));
    }
}

// Property tests for the index policies.
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use dspl_runtime::container::{Dyn, Span};
use dspl_runtime::index::{self, Clamped, Index, LoopRange, Looped, Wrapped};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn wrap_is_periodic(i in -10_000i32..10_000, k in -50i32..50, n in 1i32..64) {
        let a = index::wrap(i, n);
        let b = index::wrap(i + k * n, n);
        prop_assert_eq!(a, b);
        prop_assert!((0..n).contains(&a));
    }

    #[test]
    fn wrapped_type_matches_policy(i in -1000i32..1000) {
        let slot = Wrapped::<7>::new(i).resolve(7);
        prop_assert_eq!(slot as i32, index::wrap(i, 7));
    }

    #[test]
    fn clamp_is_idempotent(i in -1000i32..1000, n in 1i32..64) {
        let once = index::clamp(i, n);
        prop_assert_eq!(index::clamp(once, n), once);
        if i >= n {
            prop_assert_eq!(once, n - 1);
        }
        if i < 0 {
            prop_assert_eq!(once, 0);
        }
    }

    #[test]
    fn looped_stays_in_container(i in -100i32..100, lo in 0i32..8, len in 1i32..8) {
        let mut idx = Looped::<16>::new(i);
        idx.set_loop_range(lo, lo + len);
        let slot = idx.resolve(16);
        prop_assert!(slot < 16);
        if i >= lo {
            prop_assert!((lo..lo + len).contains(&(slot as i32)));
        }
        prop_assert_eq!(idx.loop_range(), LoopRange::new(lo, lo + len));
    }

    #[test]
    fn dyn_alias_tracks_source(off in 0usize..8, len in 1usize..8) {
        let mut s = Span::from([0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0, 13.0, 14.0, 15.0]);
        let expected = s[off];
        let mut d = Dyn::default();
        d.refer_to(&mut s[..], len, off).unwrap();
        prop_assert_eq!(d.size(), len);
        prop_assert_eq!(*d.at(0usize), expected);
    }

    #[test]
    fn clamped_type_saturates(i in 8i32..1000) {
        prop_assert_eq!(Clamped::<8>::new(i).native(), 7);
    }
}

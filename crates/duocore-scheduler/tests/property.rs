use duocore_scheduler::Scheduler;
use proptest::prelude::*;

proptest! {
    #[test]
    fn random_add_cancel_sequences_preserve_heap_and_handle_invariants(
        ops in prop::collection::vec(
            prop_oneof![
                (0u64..1000, 0u32..1000).prop_map(|(d, p)| (true, d, p)),
                (0u64..1000, 0u32..1000).prop_map(|(d, p)| (false, d, p)),
            ],
            0..200,
        )
    ) {
        let mut sched: Scheduler<u32> = Scheduler::with_capacity(64);
        let mut handles = Vec::new();

        for (is_add, delay, payload) in ops {
            if is_add {
                if let Ok(h) = sched.add(delay, payload) {
                    handles.push(h);
                }
            } else if let Some(h) = handles.pop() {
                sched.cancel(&h);
            }
            prop_assert!(sched.check_heap_property());
            prop_assert!(sched.check_handle_integrity());
        }
    }

    #[test]
    fn events_never_fire_before_their_timestamp(
        delays in prop::collection::vec(0u64..500, 0..100),
        advance in 0u64..2000,
    ) {
        let mut sched: Scheduler<u64> = Scheduler::with_capacity(64);
        for d in &delays {
            let _ = sched.add(*d, *d);
        }
        sched.add_cycles(advance);

        let mut fired = Vec::new();
        sched.step_with(|payload, _| fired.push(payload));

        for payload in &fired {
            prop_assert!(*payload <= advance);
        }
        prop_assert!(sched.check_heap_property());
    }
}

use std::collections::HashMap;

use chrono::TimeDelta;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thl::concurrency::interval_guard::IntervalGuard;
use thl::test_utils::event::base_time;

#[test]
fn watermarks_bound_every_task_position() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut guard = IntervalGuard::new();
    let mut positions: HashMap<usize, i64> = HashMap::new();

    for _ in 0..5_000 {
        let task_id = rng.gen_range(0..8);
        let seqno = positions.get(&task_id).copied().unwrap_or(0) + rng.gen_range(0..50);
        positions.insert(task_id, seqno);

        guard
            .report(
                task_id,
                seqno,
                base_time() + TimeDelta::seconds(seqno),
                task_id,
            )
            .unwrap();

        let low = guard.low_seqno().unwrap();
        let high = guard.hi_seqno().unwrap();
        for position in positions.values() {
            assert!(low <= *position && *position <= high);
        }
        assert_eq!(Some(&low), positions.values().min());
        assert_eq!(Some(&high), positions.values().max());
    }

    guard.validate().unwrap();
    assert_eq!(guard.len(), positions.len());

    let ordered: Vec<i64> = guard
        .task_ids()
        .iter()
        .map(|task_id| positions[task_id])
        .collect();
    assert!(ordered.windows(2).all(|pair| pair[0] <= pair[1]));
}

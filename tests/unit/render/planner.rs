use proptest::prelude::*;

use super::*;

fn bounds(parts: &[Part]) -> Vec<[u64; 2]> {
    parts.iter().map(|p| [p.start.0, p.end.0]).collect()
}

#[test]
fn single_worker_gets_everything() {
    let parts = split_into_parts(FrameIndex(0), 2, 1).unwrap();
    assert_eq!(bounds(&parts), vec![[0, 2]]);
}

#[test]
fn remainder_goes_to_last_part() {
    let parts = split_into_parts(FrameIndex(0), 7, 3).unwrap();
    assert_eq!(bounds(&parts), vec![[0, 2], [2, 4], [4, 7]]);
    assert_eq!(
        parts.iter().map(|p| p.index).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
}

#[test]
fn concurrency_is_clamped_to_frame_count() {
    let parts = split_into_parts(FrameIndex(0), 2, 8).unwrap();
    assert_eq!(bounds(&parts), vec![[0, 1], [1, 2]]);
    assert_eq!(effective_concurrency(8, 2), 2);
    assert_eq!(effective_concurrency(0, 5), 1);
}

#[test]
fn start_offset_shifts_every_part() {
    let parts = split_into_parts(FrameIndex(100), 5, 2).unwrap();
    assert_eq!(bounds(&parts), vec![[100, 102], [102, 105]]);
}

#[test]
fn empty_render_or_zero_concurrency_is_rejected() {
    assert!(split_into_parts(FrameIndex(0), 0, 1).is_err());
    assert!(split_into_parts(FrameIndex(0), 3, 0).is_err());
}

proptest! {
    #[test]
    fn parts_partition_the_range(total in 1u64..5000, concurrency in 1usize..64) {
        let concurrency = concurrency.min(total as usize);
        let parts = split_into_parts(FrameIndex(0), total, concurrency).unwrap();

        prop_assert_eq!(parts.len(), concurrency);
        prop_assert_eq!(parts[0].start, FrameIndex(0));
        prop_assert_eq!(parts[parts.len() - 1].end, FrameIndex(total));
        for w in parts.windows(2) {
            prop_assert_eq!(w[0].end, w[1].start);
        }
        prop_assert!(parts.iter().all(|p| p.len_frames() >= 1));
        prop_assert_eq!(parts.iter().map(|p| p.len_frames()).sum::<u64>(), total);

        let base = total / concurrency as u64;
        let (last, rest) = parts.split_last().unwrap();
        prop_assert!(rest.iter().all(|p| p.len_frames() == base));
        prop_assert_eq!(last.len_frames(), base + total % concurrency as u64);
    }
}

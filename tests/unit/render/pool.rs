use std::{
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use super::*;
use crate::{
    foundation::core::FrameIndex,
    render::{config::RenderConfig, planner::split_into_parts},
};

fn jobs(frames: u64, parts: usize) -> Vec<RenderJob> {
    let config = RenderConfig {
        duration_frames: frames,
        ..RenderConfig::default()
    };
    split_into_parts(FrameIndex(0), frames, parts)
        .unwrap()
        .into_iter()
        .map(|part| RenderJob {
            part,
            config: config.clone(),
        })
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Plan {
    /// Emits progress for every frame, finishing later the lower the part index.
    Succeed,
    /// Fails with a content error once its siblings are running.
    Fail,
    /// Runs until cancelled.
    Block,
}

#[derive(Default)]
struct FakeRunner {
    plans: Vec<Plan>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    started: AtomicUsize,
    cancelled: Mutex<Vec<usize>>,
    terminated: AtomicUsize,
}

impl FakeRunner {
    fn new(plans: Vec<Plan>) -> Arc<Self> {
        Arc::new(Self {
            plans,
            ..Self::default()
        })
    }
}

#[async_trait]
impl PartRunner for FakeRunner {
    async fn run_part(
        &self,
        job: RenderJob,
        events: PartEvents,
        cancel: CancellationToken,
    ) -> FramecastResult<PathBuf> {
        let index = job.part.index;
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        let res = match self.plans[index] {
            Plan::Succeed => {
                let delay = (self.plans.len() - index) as u64 * 10;
                tokio::time::sleep(Duration::from_millis(delay)).await;
                for i in 0..job.part.len_frames() {
                    events.emit(WorkerEvent::Progress { frame_index: i });
                }
                Ok(job.output_path())
            }
            Plan::Fail => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err(FramecastError::content(format!("part {index} broke")))
            }
            Plan::Block => {
                cancel.cancelled().await;
                self.cancelled
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(index);
                Err(FramecastError::Cancelled)
            }
        };
        self.running.fetch_sub(1, Ordering::SeqCst);
        res
    }

    async fn terminate(&self) {
        self.terminated.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn outputs_come_back_in_job_order() {
    let runner = FakeRunner::new(vec![Plan::Succeed; 3]);
    let jobs = jobs(9, 3);
    let expected = jobs.iter().map(RenderJob::output_path).collect::<Vec<_>>();

    let pool = WorkerPool::new(runner.clone(), 3);
    assert_eq!(pool.run(jobs, None).await.unwrap(), expected);
}

#[tokio::test]
async fn first_failure_cancels_the_siblings_and_wins() {
    let runner = FakeRunner::new(vec![Plan::Block, Plan::Fail, Plan::Block]);
    let pool = WorkerPool::new(runner.clone(), 3);

    let err = pool.run(jobs(9, 3), None).await.unwrap_err();
    match err {
        FramecastError::Content(msg) => assert_eq!(msg, "part 1 broke"),
        other => panic!("expected the original failure, got {other}"),
    }
    let mut cancelled = runner.cancelled.lock().unwrap().clone();
    cancelled.sort_unstable();
    assert_eq!(cancelled, vec![0, 2]);
    assert_eq!(runner.running.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn queued_parts_do_not_start_after_a_failure() {
    let runner = FakeRunner::new(vec![Plan::Fail, Plan::Block, Plan::Block]);
    let pool = WorkerPool::new(runner.clone(), 1);

    let err = pool.run(jobs(9, 3), None).await.unwrap_err();
    assert!(matches!(err, FramecastError::Content(_)));
    // The part next in line may grab the permit before the abort lands, the last never does.
    assert!(runner.started.load(Ordering::SeqCst) <= 2);
    assert!(!runner.cancelled.lock().unwrap().contains(&2));
}

#[tokio::test]
async fn parallelism_is_bounded_by_concurrency() {
    let runner = FakeRunner::new(vec![Plan::Succeed; 6]);
    let pool = WorkerPool::new(runner.clone(), 2);

    let outputs = pool.run(jobs(12, 6), None).await.unwrap();
    assert_eq!(outputs.len(), 6);
    assert_eq!(runner.max_running.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn progress_callback_sees_every_frame() {
    let runner = FakeRunner::new(vec![Plan::Succeed; 2]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let callback: ProgressCallback = {
        let seen = Arc::clone(&seen);
        Arc::new(move |snap: &ProgressSnapshot| {
            seen.lock().unwrap().push(snap.frames_done);
        })
    };

    WorkerPool::new(runner, 2)
        .run(jobs(7, 2), Some(callback))
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 7);
    assert_eq!(seen.last(), Some(&7));
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn empty_job_list_is_a_no_op() {
    let runner = FakeRunner::new(Vec::new());
    let pool = WorkerPool::new(runner.clone(), 4);
    assert!(pool.run(Vec::new(), None).await.unwrap().is_empty());

    pool.terminate().await;
    assert_eq!(runner.terminated.load(Ordering::SeqCst), 1);
}

#[test]
fn tracker_aggregates_parts() {
    let mut tracker = ProgressTracker::new(vec![4, 6], Fps::new(30, 1).unwrap(), None);
    assert_eq!(tracker.total_frames(), 10);

    let snap = tracker.record(0, 1).unwrap();
    assert_eq!(snap.frames_done, 2);
    assert_eq!(snap.percent, 20.0);
    assert_eq!(snap.part_percent, vec![50.0, 0.0]);

    let snap = tracker.record(1, 5).unwrap();
    assert_eq!(snap.frames_done, 8);
    assert_eq!(snap.part_percent[1], 100.0);
}

#[test]
fn tracker_ignores_regressions_and_unknown_parts() {
    let mut tracker = ProgressTracker::new(vec![4], Fps::new(25, 1).unwrap(), None);
    tracker.record(0, 2);
    assert_eq!(tracker.record(0, 0).unwrap().frames_done, 3);
    assert_eq!(tracker.record(0, 99).unwrap().frames_done, 4);
    assert!(tracker.record(3, 0).is_none());
}

#[test]
fn detached_events_are_dropped_silently() {
    let events = PartEvents::detached(5);
    assert_eq!(events.part(), 5);
    events.emit(WorkerEvent::Progress { frame_index: 0 });
}

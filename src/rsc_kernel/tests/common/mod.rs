//! Kernel fixtures shared by the integration tests
#![allow(dead_code)]
use rsc_kernel::*;

pub type TestKernel = Kernel<HostedPort>;

pub fn init_logger() {
    let _ = env_logger::try_init();
}

/// Build a kernel with one scheduler per element of `schedulers`, each
/// owning the given number of online processors. Returns the scheduler
/// identifiers in configuration order.
pub fn kernel(schedulers: &[(SchedulerKind, usize)]) -> (TestKernel, Vec<SchedulerId>) {
    init_logger();
    let mut b = CfgBuilder::new();
    let mut num_processors = 0;
    for &(kind, cpus) in schedulers {
        let s = b.scheduler(kind);
        for _ in 0..cpus {
            b.processor(ProcessorCfg {
                scheduler: Some(s),
                online: true,
            });
            num_processors += 1;
        }
    }
    let k = Kernel::new(HostedPort::new(num_processors), b.finish().unwrap());
    let ids = (0..schedulers.len())
        .map(|i| k.scheduler_ident(i).unwrap())
        .collect();
    (k, ids)
}

/// A kernel with a single fixed-priority scheduler on one processor.
pub fn uniprocessor() -> (TestKernel, SchedulerId) {
    let (k, s) = kernel(&[(SchedulerKind::Priority, 1)]);
    (k, s[0])
}

pub fn spawn(k: &TestKernel, scheduler: SchedulerId, priority: u32) -> ThreadId {
    k.thread_create(ThreadAttr {
        priority: Priority(priority),
        scheduler,
        affinity: None,
    })
    .unwrap()
}

pub fn spawn_with_affinity(
    k: &TestKernel,
    scheduler: SchedulerId,
    priority: u32,
    affinity: &[usize],
) -> ThreadId {
    k.thread_create(ThreadAttr {
        priority: Priority(priority),
        scheduler,
        affinity: Some(affinity.iter().copied().collect()),
    })
    .unwrap()
}

pub fn outcome(k: &TestKernel, thread: ThreadId) -> WaitOutcome {
    k.wait_result(thread).unwrap()
}

pub fn effective(k: &TestKernel, thread: ThreadId) -> u32 {
    k.thread_priority(thread).unwrap().1 .0
}

pub fn semaphore(k: &TestKernel, discipline: Discipline, initial: u32) -> SyncId {
    k.sync_create_with(SyncAttr {
        discipline,
        initial,
        ..SyncAttr::new(SyncKind::CountingSemaphore)
    })
    .unwrap()
}

pub fn set(indices: &[usize]) -> IndexSet {
    indices.iter().copied().collect()
}

/// Surrender `object` once and return the thread among `candidates` whose
/// wait completed successfully.
pub fn surrender_and_find(
    k: &TestKernel,
    executing: ThreadId,
    object: SyncId,
    candidates: &[ThreadId],
) -> ThreadId {
    k.sync_surrender(executing, object).unwrap();
    let woken: Vec<_> = candidates
        .iter()
        .copied()
        .filter(|&t| outcome(k, t) == WaitOutcome::Completed(Ok(())))
        .collect();
    assert_eq!(woken.len(), 1, "woken: {woken:?}");
    woken[0]
}

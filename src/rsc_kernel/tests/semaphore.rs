use assert_matches::assert_matches;
use rsc_kernel::*;

mod common;
use common::*;

#[test]
fn priority_discipline_wakes_highest_first_then_fifo() {
    let (k, s) = uniprocessor();
    let threads: Vec<_> = [5, 3, 5, 1].iter().map(|&p| spawn(&k, s, p)).collect();
    let sem = semaphore(&k, Discipline::Priority, 0);
    for &t in &threads {
        assert_eq!(k.sync_seize(t, sem, WaitOption::Wait, 0), Ok(SeizeStatus::Blocked));
        assert_eq!(outcome(&k, t), WaitOutcome::Waiting);
    }
    assert_eq!(k.sync_info(sem).unwrap().waiters, 4);

    let order: Vec<_> = (0..4)
        .map(|_| surrender_and_find(&k, threads[0], sem, &threads))
        .collect();
    assert_eq!(order, [threads[0], threads[2], threads[1], threads[3]]);
    assert_eq!(k.sync_info(sem).unwrap().waiters, 0);
}

#[test]
fn fifo_discipline_wakes_in_arrival_order() {
    let (k, s) = uniprocessor();
    let threads: Vec<_> = [1, 9, 4, 9].iter().map(|&p| spawn(&k, s, p)).collect();
    let sem = semaphore(&k, Discipline::Fifo, 0);
    for &t in &threads {
        k.sync_seize(t, sem, WaitOption::Wait, 0).unwrap();
    }

    let order: Vec<_> = (0..4)
        .map(|_| surrender_and_find(&k, threads[0], sem, &threads))
        .collect();
    assert_eq!(order, threads);
}

#[test]
fn count_and_no_wait() {
    let (k, s) = uniprocessor();
    let t = spawn(&k, s, 1);
    let sem = semaphore(&k, Discipline::Fifo, 2);

    assert_eq!(k.sync_seize(t, sem, WaitOption::NoWait, 0), Ok(SeizeStatus::Acquired));
    assert_eq!(k.sync_seize(t, sem, WaitOption::Wait, 0), Ok(SeizeStatus::Acquired));
    assert_eq!(k.sync_seize(t, sem, WaitOption::NoWait, 0), Err(SeizeError::Unsatisfied));
    assert_eq!(k.sync_info(sem).unwrap().count, 0);

    k.sync_surrender(t, sem).unwrap();
    assert_eq!(k.sync_info(sem).unwrap().count, 1);
    assert_eq!(outcome(&k, t), WaitOutcome::NotWaiting);
}

#[test]
fn binary_semaphore_saturates() {
    let (k, s) = uniprocessor();
    let t = spawn(&k, s, 1);
    let sem = k
        .sync_create(SyncKind::BinarySemaphore, Protocol::None, 0)
        .unwrap();
    k.sync_surrender(t, sem).unwrap();
    k.sync_surrender(t, sem).unwrap();
    assert_eq!(k.sync_info(sem).unwrap().count, 1);

    assert_eq!(
        k.sync_create(SyncKind::BinarySemaphore, Protocol::None, 2),
        Err(CreateSyncError::InvalidNumber)
    );
}

#[test]
fn counting_semaphore_overflow_is_unsatisfied() {
    let (k, s) = uniprocessor();
    let t = spawn(&k, s, 1);
    let sem = semaphore(&k, Discipline::Fifo, u32::MAX);
    assert_eq!(k.sync_surrender(t, sem), Err(SurrenderError::Unsatisfied));
    assert_eq!(k.sync_info(sem).unwrap().count, u32::MAX);
}

#[test]
fn waiting_thread_cannot_seize_again() {
    let (k, s) = uniprocessor();
    let t = spawn(&k, s, 1);
    let sem = semaphore(&k, Discipline::Fifo, 0);
    k.sync_seize(t, sem, WaitOption::Wait, 0).unwrap();
    assert_eq!(
        k.sync_seize(t, sem, WaitOption::Wait, 0),
        Err(SeizeError::IncorrectState)
    );
}

#[test]
fn flush_wakes_everyone_unsatisfied() {
    let (k, s) = uniprocessor();
    let a = spawn(&k, s, 3);
    let b = spawn(&k, s, 2);
    let sem = semaphore(&k, Discipline::Priority, 0);
    k.sync_seize(a, sem, WaitOption::Wait, 0).unwrap();
    k.sync_seize(b, sem, WaitOption::Wait, 10).unwrap();
    assert_eq!(k.armed_timeouts(), 1);

    k.sync_flush(sem).unwrap();
    assert_eq!(outcome(&k, a), WaitOutcome::Completed(Err(WaitError::Unsatisfied)));
    assert_eq!(outcome(&k, b), WaitOutcome::Completed(Err(WaitError::Unsatisfied)));
    assert_eq!(k.armed_timeouts(), 0);
    assert_eq!(k.sync_info(sem).unwrap().count, 0);
    assert_matches!(k.thread_state(a), Ok(ThreadState::Scheduled(0)));
}

#[test]
fn delete_wakes_waiters_and_invalidates_id() {
    let (k, s) = uniprocessor();
    let t = spawn(&k, s, 1);
    let sem = semaphore(&k, Discipline::Fifo, 0);
    k.sync_seize(t, sem, WaitOption::Wait, 0).unwrap();
    assert_eq!(k.thread_state(t), Ok(ThreadState::Blocked));

    k.sync_delete(sem).unwrap();
    assert_eq!(
        outcome(&k, t),
        WaitOutcome::Completed(Err(WaitError::ObjectWasDeleted))
    );
    assert_matches!(k.thread_state(t), Ok(ThreadState::Scheduled(_)));
    assert_eq!(k.sync_info(sem), Err(BadIdError::InvalidId));
    assert_eq!(
        k.sync_seize(t, sem, WaitOption::Wait, 0),
        Err(SeizeError::InvalidId)
    );
    assert_eq!(k.sync_delete(sem), Err(DeleteSyncError::InvalidId));
}

#[test]
fn blocked_heir_is_replaced() {
    let (k, s) = uniprocessor();
    let high = spawn(&k, s, 8);
    let low = spawn(&k, s, 2);
    assert_eq!(k.heir(0), Some(high));

    let sem = semaphore(&k, Discipline::Fifo, 0);
    k.sync_seize(high, sem, WaitOption::Wait, 0).unwrap();
    assert_eq!(k.heir(0), Some(low));
    assert!(k.is_dispatch_necessary(0));
    assert_eq!(k.dispatch(0), Some(low));
    assert_eq!(k.executing(0), Some(low));

    k.sync_surrender(low, sem).unwrap();
    assert_eq!(k.heir(0), Some(high));
}

#[test]
fn flush_wakes_thousands_of_waiters() {
    init_logger();
    let mut b = CfgBuilder::new();
    let s = b.scheduler(SchedulerKind::Priority);
    b.processor(ProcessorCfg {
        scheduler: Some(s),
        online: true,
    });
    b.max_threads(5000);
    let k = Kernel::new(HostedPort::new(1), b.finish().unwrap());
    let s = k.scheduler_ident(0).unwrap();

    let threads: Vec<_> = (0..4200).map(|_| spawn(&k, s, 1)).collect();
    let sem = semaphore(&k, Discipline::Fifo, 0);
    for &t in &threads {
        k.sync_seize(t, sem, WaitOption::Wait, 0).unwrap();
    }
    assert_eq!(k.heir(0), k.idle_thread(0));

    k.sync_flush(sem).unwrap();
    assert_eq!(k.sync_info(sem).unwrap().waiters, 0);
    let still_blocked = threads
        .iter()
        .filter(|&&t| k.thread_state(t) == Ok(ThreadState::Blocked))
        .count();
    assert_eq!(still_blocked, 0);
    for &t in &threads {
        assert_eq!(outcome(&k, t), WaitOutcome::Completed(Err(WaitError::Unsatisfied)));
    }
    assert_eq!(k.heir(0), Some(threads[0]));
}

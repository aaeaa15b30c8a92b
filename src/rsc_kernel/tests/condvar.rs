use rsc_kernel::*;

mod common;
use common::*;

fn cond_and_mutex(k: &TestKernel) -> (SyncId, SyncId) {
    let c = k.sync_create(SyncKind::Condition, Protocol::None, 0).unwrap();
    let m = k.sync_create(SyncKind::Mutex, Protocol::Inherit, 0).unwrap();
    (c, m)
}

#[test]
fn signal_returns_mutex_with_nest_level() {
    let (k, s) = uniprocessor();
    let waiter = spawn(&k, s, 5);
    let signaler = spawn(&k, s, 3);
    let (c, m) = cond_and_mutex(&k);

    k.sync_seize(waiter, m, WaitOption::Wait, 0).unwrap();
    k.sync_seize(waiter, m, WaitOption::Wait, 0).unwrap();
    assert_eq!(k.condition_wait(waiter, c, m, 0), Ok(()));
    assert_eq!(k.thread_state(waiter), Ok(ThreadState::Blocked));
    assert_eq!(k.sync_info(m).unwrap().owner, None);
    assert_eq!(k.sync_info(c).unwrap().waiters, 1);

    // The mutex is taken, so the notified waiter moves onto its queue
    k.sync_seize(signaler, m, WaitOption::Wait, 0).unwrap();
    k.sync_surrender(signaler, c).unwrap();
    assert_eq!(k.sync_info(c).unwrap().waiters, 0);
    assert_eq!(k.sync_info(m).unwrap().waiters, 1);
    assert_eq!(outcome(&k, waiter), WaitOutcome::Waiting);
    assert_eq!(effective(&k, signaler), 5);

    k.sync_surrender(signaler, m).unwrap();
    assert_eq!(outcome(&k, waiter), WaitOutcome::Completed(Ok(())));
    let info = k.sync_info(m).unwrap();
    assert_eq!((info.owner, info.nest), (Some(waiter), 2));
    assert_eq!(effective(&k, signaler), 3);
}

#[test]
fn signal_without_waiters_is_a_no_op() {
    let (k, s) = uniprocessor();
    let t = spawn(&k, s, 1);
    let (c, _) = cond_and_mutex(&k);
    assert_eq!(k.sync_surrender(t, c), Ok(()));
}

#[test]
fn timeout_completes_after_reacquiring_the_mutex() {
    let (k, s) = uniprocessor();
    let waiter = spawn(&k, s, 5);
    let other = spawn(&k, s, 3);
    let (c, m) = cond_and_mutex(&k);

    k.sync_seize(waiter, m, WaitOption::Wait, 0).unwrap();
    k.condition_wait(waiter, c, m, 3).unwrap();
    k.sync_seize(other, m, WaitOption::Wait, 0).unwrap();

    for _ in 0..3 {
        k.tick();
    }
    assert_eq!(k.sync_info(c).unwrap().waiters, 0);
    assert_eq!(outcome(&k, waiter), WaitOutcome::Waiting);
    assert_eq!(k.armed_timeouts(), 0);

    k.sync_surrender(other, m).unwrap();
    assert_eq!(
        outcome(&k, waiter),
        WaitOutcome::Completed(Err(WaitError::Timeout))
    );
    assert_eq!(k.sync_info(m).unwrap().owner, Some(waiter));
}

#[test]
fn timeout_with_free_mutex_completes_immediately() {
    let (k, s) = uniprocessor();
    let waiter = spawn(&k, s, 5);
    let (c, m) = cond_and_mutex(&k);

    k.sync_seize(waiter, m, WaitOption::Wait, 0).unwrap();
    k.condition_wait(waiter, c, m, 1).unwrap();
    k.tick();
    assert_eq!(
        outcome(&k, waiter),
        WaitOutcome::Completed(Err(WaitError::Timeout))
    );
    assert_eq!(k.sync_info(m).unwrap().owner, Some(waiter));
    assert_eq!(k.thread_state(waiter), Ok(ThreadState::Scheduled(0)));
}

#[test]
fn argument_validation() {
    let (k, s) = kernel(&[(SchedulerKind::Priority, 2)]);
    let s = s[0];
    let a = spawn(&k, s, 5);
    let b = spawn(&k, s, 5);
    let (c, m1) = cond_and_mutex(&k);
    let m2 = k.sync_create(SyncKind::Mutex, Protocol::None, 0).unwrap();

    assert_eq!(k.condition_wait(a, c, m1, 0), Err(ConditionWaitError::NotOwner));
    assert_eq!(k.condition_wait(a, m1, m1, 0), Err(ConditionWaitError::NotDefined));
    assert_eq!(
        k.sync_seize(a, c, WaitOption::Wait, 0),
        Err(SeizeError::NotDefined)
    );

    k.sync_seize(a, m1, WaitOption::Wait, 0).unwrap();
    k.condition_wait(a, c, m1, 0).unwrap();
    assert_eq!(
        k.condition_wait(a, c, m1, 0),
        Err(ConditionWaitError::IncorrectState)
    );

    // Concurrent waiters must agree on the mutex
    k.sync_seize(b, m2, WaitOption::Wait, 0).unwrap();
    assert_eq!(
        k.condition_wait(b, c, m2, 0),
        Err(ConditionWaitError::IncorrectState)
    );
    assert_eq!(k.sync_info(m2).unwrap().owner, Some(b));
    assert_eq!(outcome(&k, b), WaitOutcome::NotWaiting);
}

#[test]
fn flush_notifies_every_waiter() {
    let (k, s) = uniprocessor();
    let a = spawn(&k, s, 5);
    let b = spawn(&k, s, 4);
    let (c, m) = cond_and_mutex(&k);

    k.sync_seize(a, m, WaitOption::Wait, 0).unwrap();
    k.condition_wait(a, c, m, 0).unwrap();
    k.sync_seize(b, m, WaitOption::Wait, 0).unwrap();
    k.condition_wait(b, c, m, 0).unwrap();
    assert_eq!(k.sync_info(c).unwrap().waiters, 2);

    k.sync_flush(c).unwrap();
    assert_eq!(k.sync_info(c).unwrap().waiters, 0);
    assert_eq!(outcome(&k, a), WaitOutcome::Completed(Ok(())));
    assert_eq!(outcome(&k, b), WaitOutcome::Waiting);
    assert_eq!(k.sync_info(m).unwrap().owner, Some(a));

    k.sync_surrender(a, m).unwrap();
    assert_eq!(outcome(&k, b), WaitOutcome::Completed(Ok(())));
    assert_eq!(k.sync_info(m).unwrap().owner, Some(b));

    // With no waiters left the condition can be used with another mutex
    let m2 = k.sync_create(SyncKind::Mutex, Protocol::None, 0).unwrap();
    k.sync_seize(a, m2, WaitOption::Wait, 0).unwrap();
    assert_eq!(k.condition_wait(a, c, m2, 0), Ok(()));
}

#[test]
fn deleted_mutex_fails_the_wait() {
    let (k, s) = uniprocessor();
    let a = spawn(&k, s, 5);
    let c = k.sync_create(SyncKind::Condition, Protocol::None, 0).unwrap();
    let m = k.sync_create(SyncKind::Mutex, Protocol::None, 0).unwrap();

    k.sync_seize(a, m, WaitOption::Wait, 0).unwrap();
    k.condition_wait(a, c, m, 0).unwrap();
    k.sync_delete(m).unwrap();

    k.sync_surrender(a, c).unwrap();
    assert_eq!(
        outcome(&k, a),
        WaitOutcome::Completed(Err(WaitError::ObjectWasDeleted))
    );
}

#[test]
fn waiting_hands_the_mutex_to_its_next_waiter() {
    let (k, s) = uniprocessor();
    let owner = spawn(&k, s, 2);
    let next = spawn(&k, s, 6);
    let (c, m) = cond_and_mutex(&k);

    k.sync_seize(owner, m, WaitOption::Wait, 0).unwrap();
    assert_eq!(k.sync_seize(next, m, WaitOption::Wait, 0), Ok(SeizeStatus::Blocked));
    assert_eq!(effective(&k, owner), 6);

    assert_eq!(k.condition_wait(owner, c, m, 0), Ok(()));
    assert!(!k.port().is_halted());
    assert_eq!(outcome(&k, next), WaitOutcome::Completed(Ok(())));
    let info = k.sync_info(m).unwrap();
    assert_eq!((info.owner, info.nest, info.waiters), (Some(next), 1, 0));
    assert_eq!(effective(&k, owner), 2);
    assert_eq!(k.thread_state(owner), Ok(ThreadState::Blocked));
    assert_eq!(k.thread_state(next), Ok(ThreadState::Scheduled(0)));
}

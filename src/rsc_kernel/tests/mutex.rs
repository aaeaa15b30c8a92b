use assert_matches::assert_matches;
use rsc_kernel::*;

mod common;
use common::*;

fn inherit_mutex(k: &TestKernel) -> SyncId {
    k.sync_create(SyncKind::Mutex, Protocol::Inherit, 0).unwrap()
}

#[test]
fn owner_inherits_waiter_priority() {
    let (k, s) = uniprocessor();
    let low = spawn(&k, s, 1);
    let m = inherit_mutex(&k);
    assert_eq!(k.sync_seize(low, m, WaitOption::Wait, 0), Ok(SeizeStatus::Acquired));

    let high = spawn(&k, s, 9);
    assert_eq!(k.heir(0), Some(high));
    assert_eq!(k.sync_seize(high, m, WaitOption::Wait, 0), Ok(SeizeStatus::Blocked));
    assert_eq!(k.thread_priority(low), Ok((Priority(1), Priority(9))));
    assert_eq!(k.heir(0), Some(low));

    // A medium-priority thread cannot preempt the boosted owner
    let medium = spawn(&k, s, 5);
    assert_eq!(k.heir(0), Some(low));

    k.sync_surrender(low, m).unwrap();
    assert_eq!(outcome(&k, high), WaitOutcome::Completed(Ok(())));
    assert_eq!(k.thread_priority(low), Ok((Priority(1), Priority(1))));
    assert_eq!(k.sync_info(m).unwrap().owner, Some(high));
    assert_eq!(k.heir(0), Some(high));
    assert_eq!(k.thread_state(medium), Ok(ThreadState::Ready));
}

#[test]
fn inheritance_follows_chains_both_ways() {
    let (k, s) = kernel(&[(SchedulerKind::Priority, 2)]);
    let s = s[0];
    let low = spawn(&k, s, 1);
    let mid = spawn(&k, s, 5);
    let high = spawn(&k, s, 9);
    let m1 = inherit_mutex(&k);
    let m2 = inherit_mutex(&k);

    k.sync_seize(low, m1, WaitOption::Wait, 0).unwrap();
    k.sync_seize(mid, m2, WaitOption::Wait, 0).unwrap();
    assert_eq!(k.sync_seize(mid, m1, WaitOption::Wait, 0), Ok(SeizeStatus::Blocked));
    assert_eq!(effective(&k, low), 5);

    assert_eq!(k.sync_seize(high, m2, WaitOption::Wait, 0), Ok(SeizeStatus::Blocked));
    assert_eq!(effective(&k, mid), 9);
    assert_eq!(effective(&k, low), 9);

    // Lowering the top waiter propagates down the chain
    assert_eq!(k.thread_set_priority(high, Priority(2)), Ok(Priority(9)));
    assert_eq!(effective(&k, mid), 5);
    assert_eq!(effective(&k, low), 5);

    k.sync_surrender(low, m1).unwrap();
    assert_eq!(effective(&k, low), 1);
    assert_eq!(outcome(&k, mid), WaitOutcome::Completed(Ok(())));
    assert_eq!(k.sync_info(m1).unwrap().owner, Some(mid));
}

#[test]
fn waiter_timeout_drops_inherited_priority() {
    let (k, s) = uniprocessor();
    let low = spawn(&k, s, 1);
    let high = spawn(&k, s, 9);
    let m = inherit_mutex(&k);
    k.sync_seize(low, m, WaitOption::Wait, 0).unwrap();
    k.sync_seize(high, m, WaitOption::Wait, 2).unwrap();
    assert_eq!(effective(&k, low), 9);

    k.tick();
    k.tick();
    assert_eq!(outcome(&k, high), WaitOutcome::Completed(Err(WaitError::Timeout)));
    assert_eq!(effective(&k, low), 1);
    assert_eq!(k.sync_info(m).unwrap().owner, Some(low));
}

#[test]
fn ceiling_rejects_more_urgent_threads() {
    let (k, s) = uniprocessor();
    let urgent = spawn(&k, s, 15);
    let t = spawn(&k, s, 5);
    let m = k.sync_create(SyncKind::Mutex, Protocol::Ceiling, 10).unwrap();

    assert_eq!(
        k.sync_seize(urgent, m, WaitOption::Wait, 0),
        Err(SeizeError::CeilingViolated)
    );
    assert_eq!(k.sync_seize(t, m, WaitOption::Wait, 0), Ok(SeizeStatus::Acquired));
    assert_eq!(k.thread_priority(t), Ok((Priority(5), Priority(10))));

    assert_eq!(
        k.thread_set_priority(t, Priority(12)),
        Err(SetThreadPriorityError::CeilingViolated)
    );
    assert_eq!(k.thread_set_priority(t, Priority(8)), Ok(Priority(5)));

    k.sync_surrender(t, m).unwrap();
    assert_eq!(k.thread_priority(t), Ok((Priority(8), Priority(8))));
}

#[test]
fn set_ceiling_returns_previous() {
    let (k, s) = uniprocessor();
    let m = k.sync_create(SyncKind::Mutex, Protocol::Ceiling, 10).unwrap();
    assert_eq!(k.sync_set_ceiling(m, s, Priority(20)), Ok(Some(Priority(10))));
    assert_eq!(k.sync_info(m).unwrap().ceilings, [Some(Priority(20))]);
    assert_eq!(
        k.sync_set_ceiling(m, s, Priority(256)),
        Err(SetCeilingError::InvalidPriority)
    );

    let plain = k.sync_create(SyncKind::Mutex, Protocol::None, 0).unwrap();
    assert_eq!(
        k.sync_set_ceiling(plain, s, Priority(1)),
        Err(SetCeilingError::NotDefined)
    );
}

#[test]
fn recursion_and_ownership() {
    let (k, s) = uniprocessor();
    let a = spawn(&k, s, 3);
    let b = spawn(&k, s, 2);
    let m = k.sync_create(SyncKind::Mutex, Protocol::None, 0).unwrap();

    k.sync_seize(a, m, WaitOption::Wait, 0).unwrap();
    assert_eq!(k.sync_seize(a, m, WaitOption::Wait, 0), Ok(SeizeStatus::Acquired));
    assert_eq!(k.sync_info(m).unwrap().nest, 2);
    assert_eq!(k.sync_surrender(b, m), Err(SurrenderError::NotOwner));
    assert_eq!(
        k.sync_seize(b, m, WaitOption::NoWait, 0),
        Err(SeizeError::Unsatisfied)
    );

    k.sync_surrender(a, m).unwrap();
    assert_eq!(k.sync_info(m).unwrap().owner, Some(a));
    k.sync_surrender(a, m).unwrap();
    assert_eq!(k.sync_info(m).unwrap().owner, None);
    assert_eq!(k.sync_surrender(a, m), Err(SurrenderError::NotOwner));

    let strict = k
        .sync_create_with(SyncAttr {
            recursive: false,
            ..SyncAttr::new(SyncKind::Mutex)
        })
        .unwrap();
    k.sync_seize(a, strict, WaitOption::Wait, 0).unwrap();
    assert_eq!(
        k.sync_seize(a, strict, WaitOption::Wait, 0),
        Err(SeizeError::Unsatisfied)
    );
}

#[test]
fn ownership_cycle_is_refused() {
    let (k, s) = kernel(&[(SchedulerKind::Priority, 2)]);
    let a = spawn(&k, s[0], 3);
    let b = spawn(&k, s[0], 3);
    let m1 = inherit_mutex(&k);
    let m2 = inherit_mutex(&k);

    k.sync_seize(a, m1, WaitOption::Wait, 0).unwrap();
    k.sync_seize(b, m2, WaitOption::Wait, 0).unwrap();
    assert_eq!(k.sync_seize(a, m2, WaitOption::Wait, 0), Ok(SeizeStatus::Blocked));
    assert_eq!(
        k.sync_seize(b, m1, WaitOption::Wait, 0),
        Err(SeizeError::WouldDeadlock)
    );
    assert_eq!(outcome(&k, b), WaitOutcome::NotWaiting);
    assert_eq!(k.sync_info(m1).unwrap().waiters, 0);
}

#[test]
fn deleting_an_owned_mutex_is_refused_but_wakes_waiters() {
    let (k, s) = uniprocessor();
    let owner = spawn(&k, s, 3);
    let waiter = spawn(&k, s, 2);
    let m = inherit_mutex(&k);
    k.sync_seize(owner, m, WaitOption::Wait, 0).unwrap();
    k.sync_seize(waiter, m, WaitOption::Wait, 0).unwrap();

    assert_eq!(k.sync_delete(m), Err(DeleteSyncError::ResourceInUse));
    assert_eq!(
        outcome(&k, waiter),
        WaitOutcome::Completed(Err(WaitError::ObjectWasDeleted))
    );
    assert_matches!(k.sync_info(m), Ok(SyncInfo { owner: Some(o), waiters: 0, .. }) if o == owner);

    assert_eq!(
        k.thread_delete(owner),
        Err(DeleteThreadError::ResourceInUse)
    );
    k.sync_surrender(owner, m).unwrap();
    assert_eq!(k.sync_delete(m), Ok(()));
    assert_eq!(k.thread_delete(owner), Ok(()));
}

#[test]
fn protocol_validation() {
    let (k, _) = uniprocessor();
    assert_eq!(
        k.sync_create(SyncKind::CountingSemaphore, Protocol::Inherit, 0),
        Err(CreateSyncError::NotDefined)
    );
    assert_eq!(
        k.sync_create_with(SyncAttr {
            protocol: Protocol::Ceiling,
            ceiling: Some(Priority(3)),
            ..SyncAttr::new(SyncKind::Mutex)
        }),
        Err(CreateSyncError::NotDefined)
    );
    assert_eq!(
        k.sync_create(SyncKind::Mutex, Protocol::Ceiling, 256),
        Err(CreateSyncError::InvalidPriority)
    );

    let m = inherit_mutex(&k);
    assert_eq!(k.sync_flush(m), Err(FlushError::NotDefined));
    let plain = k.sync_create(SyncKind::Mutex, Protocol::None, 0).unwrap();
    assert_eq!(k.sync_flush(plain), Ok(()));
}

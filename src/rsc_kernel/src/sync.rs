//! Synchronization objects
//!
//! Every object is a thin variant wrapper around a [`ThreadQueue`]. The
//! directives in this module validate the object and dispatch to the
//! variant's implementation.
use alloc::{sync::Arc, vec, vec::Vec};

use crate::{
    dispatch::Actions,
    error::{
        BadIdError, CreateSyncError, DeleteSyncError, FlushError, ResultCode, SeizeError,
        SetCeilingError, SurrenderError,
    },
    id::{SchedulerId, SyncId, ThreadId},
    klock::{Critical, LockLevel, OrderedLock},
    port::Port,
    priority::Priority,
    thread::Thread,
    threadq::{detach_all, Discipline, ThreadQueue, Waiter},
    Kernel,
};

mod barrier;
mod condvar;
mod mutex;
mod semaphore;

pub(crate) use self::mutex::MutexState;

/// The variant of a synchronization object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    CountingSemaphore,
    /// A semaphore whose count saturates at one.
    BinarySemaphore,
    Mutex,
    /// A barrier that releases its waiters when the configured number of
    /// parties has arrived.
    AutomaticBarrier,
    /// A barrier that releases its waiters only when told to.
    ManualBarrier,
    /// A condition variable used with [`Kernel::condition_wait`].
    Condition,
}

/// The locking protocol of a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    None,
    /// Priority inheritance.
    Inherit,
    /// Immediate priority ceiling.
    Ceiling,
    /// Multiprocessor resource sharing protocol: a ceiling per scheduler,
    /// and an owner that may be helped by its waiters' schedulers.
    Mrsp,
}

impl Protocol {
    /// Get a flag indicating whether the owner's boost depends on the set of
    /// waiters.
    pub(crate) fn uses_waiters(self) -> bool {
        matches!(self, Self::Inherit | Self::Mrsp)
    }
}

/// The creation parameters of a synchronization object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncAttr {
    pub kind: SyncKind,
    pub protocol: Protocol,
    pub discipline: Discipline,
    /// The initial count of a semaphore, or the number of parties of an
    /// automatic barrier.
    pub initial: u32,
    /// The ceiling of a ceiling or MrsP mutex. An MrsP mutex starts with
    /// this ceiling in every scheduler.
    pub ceiling: Option<Priority>,
    /// Whether the owner of a mutex may seize it again.
    pub recursive: bool,
}

impl SyncAttr {
    pub const fn new(kind: SyncKind) -> Self {
        Self {
            kind,
            protocol: Protocol::None,
            discipline: Discipline::Fifo,
            initial: 0,
            ceiling: None,
            recursive: true,
        }
    }
}

/// Whether a directive may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOption {
    Wait,
    NoWait,
}

/// The immediate result of a directive that may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeizeStatus {
    /// The resource was acquired without blocking.
    Acquired,
    /// The thread blocked. [`Kernel::wait_result`] reports the outcome once
    /// the wait completes.
    Blocked,
}

/// A snapshot of a synchronization object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncInfo {
    pub kind: SyncKind,
    pub protocol: Protocol,
    pub discipline: Discipline,
    /// The number of threads in the thread queue.
    pub waiters: usize,
    /// The semaphore count or the number of barrier parties.
    pub count: u32,
    pub owner: Option<ThreadId>,
    /// The nest level of the owner.
    pub nest: u32,
    /// The ceilings per scheduler index.
    pub ceilings: Vec<Option<Priority>>,
}

#[derive(Debug)]
pub(crate) enum Variant {
    Semaphore { count: u32, binary: bool },
    Mutex(MutexState),
    /// `parties` is `None` for a manual barrier.
    Barrier { parties: Option<u32> },
    /// The mutex used by the current waiters.
    Condition { mutex: Option<SyncId> },
}

/// A waiter taken off the queue by a batch operation that has yet to be
/// resolved.
#[derive(Debug)]
pub(crate) struct Detached {
    pub(crate) waiter: Waiter,
    pub(crate) status: ResultCode,
    /// The mutex to move a condition waiter to.
    pub(crate) morph_to: Option<SyncId>,
}

/// The lock-protected state of a synchronization object.
#[derive(Debug)]
pub(crate) struct SyncState {
    pub(crate) queue: ThreadQueue,
    pub(crate) variant: Variant,
    pub(crate) detached: Vec<Detached>,
    pub(crate) deleted: bool,
}

impl SyncState {
    pub(crate) fn condition_mutex(&self) -> Option<SyncId> {
        match self.variant {
            Variant::Condition { mutex } => mutex,
            _ => None,
        }
    }

    /// Called whenever waiters are added or removed.
    pub(crate) fn waiters_changed(&mut self) {
        if self.queue.is_empty() {
            if let Variant::Condition { mutex } = &mut self.variant {
                *mutex = None;
            }
        }
    }

    pub(crate) fn mutex_mut(&mut self) -> Option<&mut MutexState> {
        match &mut self.variant {
            Variant::Mutex(m) => Some(m),
            _ => None,
        }
    }
}

/// A synchronization object.
#[derive(Debug)]
pub(crate) struct SyncObject {
    pub(crate) id: SyncId,
    pub(crate) attr: SyncAttr,
    pub(crate) state: OrderedLock<SyncState>,
}

impl<P: Port> Kernel<P> {
    pub(crate) fn get_sync(&self, id: SyncId) -> Result<Arc<SyncObject>, BadIdError> {
        self.syncs.get(id).ok_or(BadIdError::InvalidId)
    }

    /// Validate `attr` and build the initial variant state.
    fn initial_variant(&self, attr: &SyncAttr) -> Result<Variant, CreateSyncError> {
        if attr.protocol != Protocol::None && attr.kind != SyncKind::Mutex {
            return Err(CreateSyncError::NotDefined);
        }
        if matches!(attr.protocol, Protocol::Inherit | Protocol::Ceiling)
            && attr.discipline != Discipline::Priority
        {
            return Err(CreateSyncError::NotDefined);
        }

        Ok(match attr.kind {
            SyncKind::CountingSemaphore => Variant::Semaphore {
                count: attr.initial,
                binary: false,
            },
            SyncKind::BinarySemaphore => {
                if attr.initial > 1 {
                    return Err(CreateSyncError::InvalidNumber);
                }
                Variant::Semaphore {
                    count: attr.initial,
                    binary: true,
                }
            }
            SyncKind::Mutex => {
                let ceilings = match attr.protocol {
                    Protocol::Ceiling | Protocol::Mrsp => {
                        let ceiling = attr
                            .ceiling
                            .filter(|c| (c.0 as usize) < self.num_levels)
                            .ok_or(CreateSyncError::InvalidPriority)?;
                        vec![Some(ceiling); self.schedulers.len()]
                    }
                    Protocol::None | Protocol::Inherit => Vec::new(),
                };
                Variant::Mutex(MutexState::new(ceilings))
            }
            SyncKind::AutomaticBarrier => {
                if attr.initial == 0 {
                    return Err(CreateSyncError::InvalidNumber);
                }
                Variant::Barrier {
                    parties: Some(attr.initial),
                }
            }
            SyncKind::ManualBarrier => Variant::Barrier { parties: None },
            SyncKind::Condition => Variant::Condition { mutex: None },
        })
    }

    /// Create a synchronization object.
    pub fn sync_create_with(&self, attr: SyncAttr) -> Result<SyncId, CreateSyncError> {
        let variant = self.initial_variant(&attr)?;
        let mut attr = attr;
        if attr.protocol == Protocol::Mrsp {
            attr.discipline = Discipline::Fifo;
        }

        let (id, _) = self
            .syncs
            .allocate(|id| SyncObject {
                id,
                attr,
                state: OrderedLock::new(
                    LockLevel::Queue,
                    SyncState {
                        queue: ThreadQueue::new(attr.discipline),
                        variant,
                        detached: Vec::new(),
                        deleted: false,
                    },
                ),
            })
            .map_err(|_| CreateSyncError::TooMany)?;

        log::debug!("sync_create_with({attr:?}) = {id:?}");
        Ok(id)
    }

    /// Create a synchronization object with defaults for everything but the
    /// kind, the protocol and `initial`, which is the initial count of a
    /// semaphore, the number of parties of an automatic barrier or the
    /// ceiling of a ceiling or MrsP mutex.
    ///
    /// Protocol mutexes use the priority discipline, everything else FIFO.
    pub fn sync_create(
        &self,
        kind: SyncKind,
        protocol: Protocol,
        initial: u32,
    ) -> Result<SyncId, CreateSyncError> {
        let mut attr = SyncAttr {
            protocol,
            ..SyncAttr::new(kind)
        };
        match protocol {
            Protocol::None => attr.initial = initial,
            Protocol::Inherit => attr.discipline = Discipline::Priority,
            Protocol::Ceiling | Protocol::Mrsp => {
                attr.discipline = Discipline::Priority;
                attr.ceiling = Some(Priority(initial));
            }
        }
        self.sync_create_with(attr)
    }

    /// Delete a synchronization object. Waiters are woken with
    /// [`ResultCode::ObjectWasDeleted`]. An owned mutex is not deleted and
    /// the call fails with [`DeleteSyncError::ResourceInUse`], but its
    /// waiters are woken all the same.
    pub fn sync_delete(&self, id: SyncId) -> Result<(), DeleteSyncError> {
        let object = self.get_sync(id)?;
        let cs = Critical::enter(&self.port);
        let mut actions = Actions::new();

        let (threads, in_use) = {
            let mut st = object.state.lock(&cs);
            if st.deleted {
                return Err(DeleteSyncError::InvalidId);
            }
            let in_use = st.mutex_mut().map_or(false, |m| m.owner.is_some());
            if !in_use {
                st.deleted = true;
            }
            (detach_all(&mut st, ResultCode::ObjectWasDeleted), in_use)
        };
        self.resolve_detached(&cs, &object, threads, &mut actions);

        let result = if in_use {
            if object.attr.protocol.uses_waiters() {
                actions.boost(id);
            }
            Err(DeleteSyncError::ResourceInUse)
        } else {
            self.syncs.free(id);
            Ok(())
        };
        self.commit(&cs, actions);

        log::debug!("sync_delete({id:?}) = {result:?}");
        result
    }

    /// Acquire a semaphore or a mutex, or wait at a barrier, on behalf of
    /// the thread `executing`.
    pub fn sync_seize(
        &self,
        executing: ThreadId,
        id: SyncId,
        option: WaitOption,
        timeout: u64,
    ) -> Result<SeizeStatus, SeizeError> {
        let thread = self.get_user_thread(executing)?;
        let object = self.get_sync(id)?;
        let result = match object.attr.kind {
            SyncKind::CountingSemaphore | SyncKind::BinarySemaphore => {
                self.semaphore_seize(&thread, &object, option, timeout)
            }
            SyncKind::Mutex => self.mutex_seize(&thread, &object, option, timeout),
            SyncKind::AutomaticBarrier | SyncKind::ManualBarrier => {
                self.barrier_wait(&thread, &object, option, timeout)
            }
            SyncKind::Condition => Err(SeizeError::NotDefined),
        };
        log::debug!("sync_seize({executing:?}, {id:?}, {option:?}, {timeout}) = {result:?}");
        result
    }

    /// Release a semaphore or a mutex, release the waiters of a barrier, or
    /// notify one waiter of a condition.
    pub fn sync_surrender(&self, executing: ThreadId, id: SyncId) -> Result<(), SurrenderError> {
        let object = self.get_sync(id)?;
        let cs = Critical::enter(&self.port);
        let mut actions = Actions::new();
        let result = match object.attr.kind {
            SyncKind::CountingSemaphore | SyncKind::BinarySemaphore => {
                self.semaphore_surrender(&cs, &object, &mut actions)
            }
            SyncKind::Mutex => {
                let thread = self.get_user_thread(executing)?;
                self.mutex_surrender(&cs, &thread, &object, false, &mut actions)
            }
            SyncKind::AutomaticBarrier | SyncKind::ManualBarrier => {
                self.barrier_release(&cs, &object, &mut actions)
            }
            SyncKind::Condition => self.condition_signal(&cs, &object, &mut actions),
        };
        self.commit(&cs, actions);
        log::debug!("sync_surrender({executing:?}, {id:?}) = {result:?}");
        result
    }

    /// Wake every waiter.
    ///
    /// Waiters of a semaphore or a plain mutex get
    /// [`ResultCode::Unsatisfied`]. A barrier is released. Every waiter of a
    /// condition is notified. Protocol mutexes can't be flushed.
    pub fn sync_flush(&self, id: SyncId) -> Result<(), FlushError> {
        let object = self.get_sync(id)?;
        let cs = Critical::enter(&self.port);
        let mut actions = Actions::new();
        let status = match (object.attr.kind, object.attr.protocol) {
            (SyncKind::Mutex, Protocol::None)
            | (SyncKind::CountingSemaphore | SyncKind::BinarySemaphore, _) => {
                ResultCode::Unsatisfied
            }
            (SyncKind::Mutex, _) => return Err(FlushError::NotDefined),
            _ => ResultCode::Successful,
        };

        let threads = {
            let mut st = object.state.lock(&cs);
            if st.deleted {
                return Err(FlushError::InvalidId);
            }
            detach_all(&mut st, status)
        };
        log::debug!("sync_flush({id:?}): {} waiters", threads.len());
        self.resolve_detached(&cs, &object, threads, &mut actions);
        self.commit(&cs, actions);
        Ok(())
    }

    /// Change the ceiling of a ceiling or MrsP mutex in a scheduler. A
    /// ceiling mutex has one ceiling for all schedulers. Returns the previous
    /// ceiling.
    pub fn sync_set_ceiling(
        &self,
        id: SyncId,
        scheduler: SchedulerId,
        ceiling: Priority,
    ) -> Result<Option<Priority>, SetCeilingError> {
        let object = self.get_sync(id)?;
        let index = self.scheduler_index(scheduler)?;
        if (ceiling.0 as usize) >= self.num_levels {
            return Err(SetCeilingError::InvalidPriority);
        }

        let cs = Critical::enter(&self.port);
        let mut actions = Actions::new();
        let old = {
            let mut st = object.state.lock(&cs);
            if st.deleted {
                return Err(SetCeilingError::InvalidId);
            }
            let protocol = object.attr.protocol;
            let m = st.mutex_mut().ok_or(SetCeilingError::NotDefined)?;
            match protocol {
                Protocol::Ceiling => {
                    let old = m.ceilings.get(index).copied().flatten();
                    m.ceilings.iter_mut().for_each(|c| *c = Some(ceiling));
                    old
                }
                Protocol::Mrsp => core::mem::replace(&mut m.ceilings[index], Some(ceiling)),
                Protocol::None | Protocol::Inherit => return Err(SetCeilingError::NotDefined),
            }
        };
        actions.boost(id);
        self.commit(&cs, actions);

        log::debug!("sync_set_ceiling({id:?}, {scheduler:?}, {ceiling:?}) = {old:?}");
        Ok(old)
    }

    /// Take a snapshot of a synchronization object.
    pub fn sync_info(&self, id: SyncId) -> Result<SyncInfo, BadIdError> {
        let object = self.get_sync(id)?;
        let cs = Critical::enter(&self.port);
        let st = object.state.lock(&cs);
        let (count, owner, nest, ceilings) = match &st.variant {
            Variant::Semaphore { count, .. } => (*count, None, 0, Vec::new()),
            Variant::Mutex(m) => (
                0,
                m.owner.as_ref().map(|t| t.id),
                m.nest,
                m.ceilings.clone(),
            ),
            Variant::Barrier { parties } => (parties.unwrap_or(0), None, 0, Vec::new()),
            Variant::Condition { .. } => (0, None, 0, Vec::new()),
        };
        Ok(SyncInfo {
            kind: object.attr.kind,
            protocol: object.attr.protocol,
            discipline: object.attr.discipline,
            waiters: st.queue.len(),
            count,
            owner,
            nest,
            ceilings,
        })
    }

    /// Check that `thread` has no wait in progress.
    pub(crate) fn check_not_waiting(thread: &Thread) -> Result<(), SeizeError> {
        if thread.wait_cell.is_waiting() {
            Err(SeizeError::IncorrectState)
        } else {
            Ok(())
        }
    }
}

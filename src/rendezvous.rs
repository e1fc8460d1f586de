//! Coordinated checkpoints across all vCPU threads of a VM.
//!
//! A rendezvous is requested by one thread (a vCPU or an external one) and
//! joined by every vCPU thread. Once all vCPUs have entered, the callback
//! runs according to the requested [`RendezvousKind`]; every vCPU then waits
//! until all callbacks are done before it returns, and the initiator
//! returns the aggregated status.
//!
//! A callback may itself request a rendezvous if the outer one allows it.
//! The other vCPUs, all parked somewhere inside the outer rendezvous, are
//! pushed into the nested one and popped back out once it completes.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axerrno::{ax_err, AxError, AxResult};
use bitflags::bitflags;

use crate::sync::Gate;
use crate::VCpuId;

/// How the callback of a rendezvous runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousKind {
    /// Only one vCPU runs the callback: the initiator if it is a vCPU,
    /// vCPU 0 otherwise.
    Once,
    /// Every vCPU runs the callback concurrently.
    AllAtOnce,
    /// Every vCPU runs the callback, one at a time, in arrival order.
    OneByOne,
    /// Every vCPU runs the callback, one at a time, in ascending index order.
    Ascending,
    /// Every vCPU runs the callback, one at a time, in descending index order.
    Descending,
}

impl RendezvousKind {
    /// Whether callbacks run one at a time.
    pub const fn is_serial(self) -> bool {
        matches!(self, Self::OneByOne | Self::Ascending | Self::Descending)
    }
}

bitflags! {
    /// Modifiers of a rendezvous request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RendezvousFlags: u32 {
        /// Skip the remaining serial callbacks once one has failed.
        const STOP_ON_ERROR = 1 << 0;
        /// Allow callbacks of this rendezvous to request a nested one.
        const ALLOW_RECURSION = 1 << 1;
    }
}

/// A rendezvous callback, invoked with the index of the running vCPU.
pub type RendezvousCallback = Arc<dyn Fn(VCpuId) -> AxResult + Send + Sync>;

/// Read-only view of the outermost rendezvous' progress.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RendezvousSnapshot {
    /// A rendezvous is posted and not finished yet.
    pub pending: bool,
    /// vCPUs that have entered.
    pub entered: usize,
    /// vCPUs that are done with the callback.
    pub done: usize,
    /// vCPUs that have left.
    pub returned: usize,
    /// Current recursion depth.
    pub recursions: usize,
}

/// Owner tag of an initiator that is not a vCPU.
const EXTERNAL_OWNER: u32 = u32::MAX;
/// Poll interval of a vCPU waiting for the rendezvous lock.
const CONTENDED_POLL: Duration = Duration::from_millis(1);

/// One rendezvous frame. The outermost one is level 0; each recursion adds
/// a level on top.
struct Level {
    kind: RendezvousKind,
    flags: RendezvousFlags,
    callback: RendezvousCallback,
    initiator: Option<VCpuId>,
    depth: usize,
    vcpu_count: usize,
    entered: AtomicUsize,
    done: AtomicUsize,
    returned: AtomicUsize,
    /// Serial callbacks that have finished (or were skipped).
    cursor: AtomicUsize,
    /// vCPUs that have joined; only consulted for level 0.
    joined: Box<[AtomicBool]>,
    /// First failure, with the vCPU that reported it.
    status: spin::Mutex<Option<(VCpuId, AxError)>>,
    /// vCPUs pushed into this level from the one below.
    push: AtomicUsize,
    /// vCPUs popped back out of this level.
    pop: AtomicUsize,
    push_open: AtomicBool,
    pop_open: AtomicBool,
}

impl Level {
    fn new(
        kind: RendezvousKind,
        flags: RendezvousFlags,
        callback: RendezvousCallback,
        initiator: Option<VCpuId>,
        depth: usize,
        vcpu_count: usize,
    ) -> Self {
        Self {
            kind,
            flags,
            callback,
            initiator,
            depth,
            vcpu_count,
            entered: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
            returned: AtomicUsize::new(0),
            cursor: AtomicUsize::new(0),
            joined: (0..vcpu_count).map(|_| AtomicBool::new(false)).collect(),
            status: spin::Mutex::new(None),
            push: AtomicUsize::new(0),
            pop: AtomicUsize::new(0),
            push_open: AtomicBool::new(false),
            pop_open: AtomicBool::new(false),
        }
    }

    fn all_entered(&self) -> bool {
        self.entered.load(Ordering::SeqCst) == self.vcpu_count
    }

    /// The vCPU that runs a [`RendezvousKind::Once`] callback.
    fn runner(&self) -> VCpuId {
        self.initiator.unwrap_or(0)
    }

    /// Turn of `id` in an ordered rendezvous.
    fn position(&self, id: VCpuId) -> usize {
        match self.kind {
            RendezvousKind::Descending => self.vcpu_count - 1 - id,
            _ => id,
        }
    }

    /// The vCPU whose turn `position` is in an ordered rendezvous.
    fn vcpu_at(&self, position: usize) -> VCpuId {
        match self.kind {
            RendezvousKind::Descending => self.vcpu_count - 1 - position,
            _ => position,
        }
    }

    fn record(&self, id: VCpuId, err: AxError) {
        let mut status = self.status.lock();
        match *status {
            None => *status = Some((id, err)),
            // Concurrent callbacks have no meaningful order, the lowest index wins.
            Some((prev, _)) if self.kind == RendezvousKind::AllAtOnce && id < prev => {
                *status = Some((id, err))
            }
            Some(_) => {}
        }
    }

    fn failed(&self) -> bool {
        self.status.lock().is_some()
    }

    fn result(&self) -> AxResult {
        match *self.status.lock() {
            Some((_, err)) => Err(err),
            None => Ok(()),
        }
    }
}

/// The rendezvous coordinator of one VM.
pub struct Rendezvous {
    vcpu_count: usize,
    /// The rendezvous lock: 0 when free, `id + 1` for a vCPU initiator,
    /// [`EXTERNAL_OWNER`] otherwise.
    owner: AtomicU32,
    /// Set while a rendezvous is posted; vCPU threads poll it.
    pending: AtomicBool,
    levels: spin::Mutex<Vec<Arc<Level>>>,
    in_rendezvous: Box<[AtomicBool]>,
    recursions: AtomicUsize,
    /// A nested rendezvous waits for the other vCPUs to push.
    recursing: AtomicBool,
    recursion_request: spin::Mutex<Option<Arc<Level>>>,

    posted: Gate,
    ordered: Box<[Gate]>,
    one_by_one: Gate,
    all_at_once: Gate,
    done: Gate,
    done_caller: Gate,
    recursion_push: Gate,
    recursion_pop: Gate,
    push_caller: Gate,
    pop_caller: Gate,
}

impl Rendezvous {
    /// Creates a coordinator for `vcpu_count` vCPUs.
    pub fn new(vcpu_count: usize) -> Self {
        Self {
            vcpu_count,
            owner: AtomicU32::new(0),
            pending: AtomicBool::new(false),
            levels: spin::Mutex::new(Vec::new()),
            in_rendezvous: (0..vcpu_count).map(|_| AtomicBool::new(false)).collect(),
            recursions: AtomicUsize::new(0),
            recursing: AtomicBool::new(false),
            recursion_request: spin::Mutex::new(None),
            posted: Gate::new(),
            ordered: (0..vcpu_count).map(|_| Gate::new()).collect(),
            one_by_one: Gate::new(),
            all_at_once: Gate::new(),
            done: Gate::new(),
            done_caller: Gate::new(),
            recursion_push: Gate::new(),
            recursion_pop: Gate::new(),
            push_caller: Gate::new(),
            pop_caller: Gate::new(),
        }
    }

    /// Number of participating vCPUs.
    pub fn vcpu_count(&self) -> usize {
        self.vcpu_count
    }

    /// Whether a rendezvous is posted and not finished yet.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Whether the thread of vCPU `id` is currently inside a rendezvous.
    pub fn in_rendezvous(&self, id: VCpuId) -> bool {
        self.in_rendezvous
            .get(id)
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Progress of the outermost rendezvous.
    pub fn snapshot(&self) -> RendezvousSnapshot {
        let recursions = self.recursions.load(Ordering::SeqCst);
        let pending = self.is_pending();
        match self.levels.lock().first() {
            Some(level) => RendezvousSnapshot {
                pending,
                entered: level.entered.load(Ordering::SeqCst),
                done: level.done.load(Ordering::SeqCst),
                returned: level.returned.load(Ordering::SeqCst),
                recursions,
            },
            None => RendezvousSnapshot {
                pending,
                recursions,
                ..Default::default()
            },
        }
    }

    /// Requests a rendezvous and blocks until every vCPU has run or waited
    /// out `callback` according to `kind`.
    ///
    /// `caller` is the vCPU of the requesting thread, or `None` for a thread
    /// that is not a vCPU. A vCPU caller participates in the rendezvous
    /// itself; if another rendezvous is in progress it joins that one while
    /// waiting for its turn.
    ///
    /// Returns the first failure reported by a callback. For
    /// [`RendezvousKind::AllAtOnce`], the failure of the lowest vCPU index
    /// wins.
    ///
    /// # Panics
    ///
    /// Panics if called from a rendezvous callback and the rendezvous being
    /// run does not allow recursion, or is [`RendezvousKind::AllAtOnce`].
    pub fn request<F>(
        &self,
        caller: Option<VCpuId>,
        kind: RendezvousKind,
        flags: RendezvousFlags,
        callback: F,
    ) -> AxResult
    where
        F: Fn(VCpuId) -> AxResult + Send + Sync + 'static,
    {
        if let Some(id) = caller {
            if id >= self.vcpu_count {
                return ax_err!(InvalidInput, format!("vCPU {id} does not exist"));
            }
            if self.in_rendezvous(id) {
                return self.recurse(id, kind, flags, Arc::new(callback));
            }
        }

        let tag = caller.map_or(EXTERNAL_OWNER, |id| id as u32 + 1);
        self.lock(caller, tag);

        let level = Arc::new(Level::new(
            kind,
            flags,
            Arc::new(callback),
            caller,
            0,
            self.vcpu_count,
        ));
        self.levels.lock().push(level.clone());
        self.pending.store(true, Ordering::SeqCst);
        debug!("rendezvous {kind:?} ({flags:?}) posted by {caller:?}");
        self.posted.notify();

        if let Some(id) = caller {
            level.joined[id].store(true, Ordering::SeqCst);
            self.in_rendezvous[id].store(true, Ordering::SeqCst);
            self.participate_level(id, &level);
            self.in_rendezvous[id].store(false, Ordering::SeqCst);
        }
        self.done_caller
            .wait_until(|| level.returned.load(Ordering::SeqCst) == self.vcpu_count);

        let result = level.result();
        self.levels.lock().clear();
        self.pending.store(false, Ordering::SeqCst);
        self.owner.store(0, Ordering::SeqCst);
        debug!("rendezvous {kind:?} finished: {result:?}");
        self.posted.notify();
        result
    }

    /// Takes the rendezvous lock, servicing other rendezvous meanwhile if
    /// the caller is a vCPU.
    fn lock(&self, caller: Option<VCpuId>, tag: u32) {
        while self
            .owner
            .compare_exchange(0, tag, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            match caller {
                Some(id) => {
                    if !self.participate(id) {
                        self.posted.wait_timeout_until(CONTENDED_POLL, || {
                            self.owner.load(Ordering::SeqCst) == 0 || self.can_join(id)
                        });
                    }
                }
                None => self
                    .posted
                    .wait_until(|| self.owner.load(Ordering::SeqCst) == 0),
            }
        }
    }

    fn can_join(&self, id: VCpuId) -> bool {
        self.is_pending()
            && !self.in_rendezvous(id)
            && self
                .levels
                .lock()
                .first()
                .is_some_and(|level| !level.joined[id].load(Ordering::SeqCst))
    }

    /// Blocks until there is a rendezvous vCPU `id` has not joined yet, or
    /// `timeout` elapses. Returns whether there is one.
    pub fn wait_pending_timeout(&self, id: VCpuId, timeout: Duration) -> bool {
        id < self.vcpu_count && self.posted.wait_timeout_until(timeout, || self.can_join(id))
    }

    /// Joins the posted rendezvous on the thread of vCPU `id`, returning
    /// once the vCPU may leave it.
    ///
    /// Returns `false` if there is nothing to join: no rendezvous is posted,
    /// the vCPU already joined it, or the thread is inside one already.
    pub fn participate(&self, id: VCpuId) -> bool {
        if id >= self.vcpu_count || self.in_rendezvous(id) {
            return false;
        }
        let Some(level) = self.levels.lock().first().cloned() else {
            return false;
        };
        if level.joined[id].swap(true, Ordering::SeqCst) {
            return false;
        }
        self.in_rendezvous[id].store(true, Ordering::SeqCst);
        self.participate_level(id, &level);
        self.in_rendezvous[id].store(false, Ordering::SeqCst);
        true
    }

    /// Wakes every waiter of a level.
    fn kick_level(&self) {
        self.all_at_once.notify();
        self.one_by_one.notify();
        for gate in self.ordered.iter() {
            gate.notify();
        }
        self.done.notify();
        self.done_caller.notify();
    }

    fn kick_all(&self) {
        self.kick_level();
        self.posted.notify();
    }

    /// Runs vCPU `id` through one rendezvous level.
    fn participate_level(&self, id: VCpuId, level: &Arc<Level>) {
        let ticket = level.entered.fetch_add(1, Ordering::SeqCst);
        trace!("vCPU {id} entered rendezvous level {} as #{ticket}", level.depth);
        self.kick_level();

        let runs = match level.kind {
            RendezvousKind::Once => id == level.runner(),
            _ => true,
        };
        if runs {
            let turn = match level.kind {
                RendezvousKind::Once | RendezvousKind::AllAtOnce => None,
                RendezvousKind::OneByOne => Some(ticket),
                RendezvousKind::Ascending | RendezvousKind::Descending => Some(level.position(id)),
            };
            let gate = match level.kind {
                RendezvousKind::OneByOne => &self.one_by_one,
                RendezvousKind::Ascending | RendezvousKind::Descending => &self.ordered[id],
                _ => &self.all_at_once,
            };
            self.wait_in_level(id, level, gate, || {
                level.all_entered()
                    && turn.is_none_or(|turn| level.cursor.load(Ordering::SeqCst) == turn)
            });

            let skip = level.kind.is_serial()
                && level.flags.contains(RendezvousFlags::STOP_ON_ERROR)
                && level.failed();
            if skip {
                trace!("vCPU {id} skips the callback after an earlier failure");
            } else if let Err(err) = (level.callback)(id) {
                debug!("rendezvous callback failed on vCPU {id}: {err:?}");
                level.record(id, err);
            }

            if turn.is_some() {
                let next = level.cursor.fetch_add(1, Ordering::SeqCst) + 1;
                match level.kind {
                    RendezvousKind::OneByOne => self.one_by_one.notify(),
                    _ if next < level.vcpu_count => self.ordered[level.vcpu_at(next)].notify(),
                    _ => {}
                }
            }
        }

        level.done.fetch_add(1, Ordering::SeqCst);
        self.done.notify();
        self.done_caller.notify();
        self.wait_in_level(id, level, &self.done, || {
            level.done.load(Ordering::SeqCst) == level.vcpu_count
        });

        level.returned.fetch_add(1, Ordering::SeqCst);
        self.done_caller.notify();
    }

    /// Waits on `gate` until `ready`, following any recursion requested
    /// from within `level` in the meantime.
    fn wait_in_level(
        &self,
        id: VCpuId,
        level: &Level,
        gate: &Gate,
        mut ready: impl FnMut() -> bool,
    ) {
        loop {
            let mut nested = None;
            gate.wait_until(|| {
                nested = self.recursion_request(level.depth);
                nested.is_some() || ready()
            });
            match nested {
                Some(nested) => self.follow_recursion(id, &nested),
                None => return,
            }
        }
    }

    /// The nested level requested on top of `depth`, if any.
    fn recursion_request(&self, depth: usize) -> Option<Arc<Level>> {
        if !self.recursing.load(Ordering::SeqCst) {
            return None;
        }
        self.recursion_request
            .lock()
            .as_ref()
            .filter(|nested| nested.depth == depth + 1)
            .cloned()
    }

    /// Moves a parked vCPU into a nested rendezvous and back.
    fn follow_recursion(&self, id: VCpuId, nested: &Arc<Level>) {
        trace!("vCPU {id} pushed into rendezvous level {}", nested.depth);
        nested.push.fetch_add(1, Ordering::SeqCst);
        self.push_caller.notify();
        self.recursion_push
            .wait_until(|| nested.push_open.load(Ordering::SeqCst));

        self.participate_level(id, nested);

        self.recursion_pop
            .wait_until(|| nested.pop_open.load(Ordering::SeqCst));
        nested.pop.fetch_add(1, Ordering::SeqCst);
        self.pop_caller.notify();
        trace!("vCPU {id} popped out of rendezvous level {}", nested.depth);
    }

    /// Runs a rendezvous requested from within a callback of vCPU `id`.
    fn recurse(
        &self,
        id: VCpuId,
        kind: RendezvousKind,
        flags: RendezvousFlags,
        callback: RendezvousCallback,
    ) -> AxResult {
        let Some(outer) = self.levels.lock().last().cloned() else {
            panic!("vCPU {id} is marked in a rendezvous but none is active");
        };
        if !outer.flags.contains(RendezvousFlags::ALLOW_RECURSION) {
            panic!("rendezvous recursion requested by vCPU {id} without ALLOW_RECURSION");
        }
        if outer.kind == RendezvousKind::AllAtOnce {
            panic!("rendezvous recursion requested by vCPU {id} from an all-at-once callback");
        }

        let depth = outer.depth + 1;
        let others = self.vcpu_count - 1;
        let nested = Arc::new(Level::new(
            kind,
            flags,
            callback,
            Some(id),
            depth,
            self.vcpu_count,
        ));
        debug!("vCPU {id} requests nested rendezvous {kind:?} at depth {depth}");

        *self.recursion_request.lock() = Some(nested.clone());
        self.recursions.store(depth, Ordering::SeqCst);
        self.recursing.store(true, Ordering::SeqCst);
        self.kick_all();
        self.push_caller
            .wait_until(|| nested.push.load(Ordering::SeqCst) == others);

        self.recursing.store(false, Ordering::SeqCst);
        *self.recursion_request.lock() = None;
        self.levels.lock().push(nested.clone());
        nested.push_open.store(true, Ordering::SeqCst);
        self.recursion_push.notify();

        self.participate_level(id, &nested);
        self.done_caller
            .wait_until(|| nested.returned.load(Ordering::SeqCst) == self.vcpu_count);
        let result = nested.result();

        nested.push_open.store(false, Ordering::SeqCst);
        self.levels.lock().pop();
        nested.pop_open.store(true, Ordering::SeqCst);
        self.recursion_pop.notify();
        self.pop_caller
            .wait_until(|| nested.pop.load(Ordering::SeqCst) == others);
        nested.pop_open.store(false, Ordering::SeqCst);
        self.recursions.store(depth - 1, Ordering::SeqCst);
        debug!("nested rendezvous at depth {depth} finished: {result:?}");
        result
    }
}

impl core::fmt::Debug for Rendezvous {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Rendezvous")
            .field("vcpu_count", &self.vcpu_count)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

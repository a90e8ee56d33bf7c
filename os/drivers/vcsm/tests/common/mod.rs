//! Recording doubles for the broker's three collaborators.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

use vcsm::addresses::{
    BusAddress, PAGE_SIZE, PageFrame, PhysicalAddress, PhysicalRange, VirtualAddress,
    VirtualRange,
};
use vcsm::remote::{
    AllocRequest, Allocation, LockReply, PendingAction, RemoteHandle, RemoteMemoryService,
    RemoteStatus, Transaction, TransactionId,
};
use vcsm::{
    CacheMaintenance, HostError, HostMemory, InsertError, ProcessId, SharedMemory, SmConfig,
};

pub const WINDOW_BASE: u64 = 0x2000_0000;
pub const FIRST_BUS_ADDRESS: u32 = 0x4000_0000;

pub const A: ProcessId = ProcessId(100);
pub const B: ProcessId = ProcessId(200);

pub type Driver = SharedMemory<FakeRemote, FakeHost, FakeCache>;

pub fn driver() -> Driver {
    SharedMemory::connect(
        FakeRemote::default(),
        FakeHost::default(),
        FakeCache::default(),
        SmConfig::new(PhysicalAddress::new(WINDOW_BASE)),
    )
}

pub fn region(start: u64, len: u64) -> VirtualRange {
    VirtualRange::new(VirtualAddress::new(start), len)
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum Op {
    Allocate,
    Free,
    Lock,
    Unlock,
    Resize,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Forced {
    Fail(RemoteStatus),
    Abandon,
    /// Reply without an address.
    Null,
    /// Lock reply reporting the memory moved here.
    Relocate(BusAddress),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RemoteCall {
    Allocate(AllocRequest),
    Free(RemoteHandle),
    Lock(RemoteHandle),
    Unlock { handle: RemoteHandle, wait: bool },
    Resize(RemoteHandle, u32),
    CleanUp(PendingAction),
}

#[derive(Default)]
struct RemoteState {
    next_handle: u32,
    next_tx: u32,
    next_offset: u32,
    blocks: BTreeMap<RemoteHandle, BusAddress>,
    forced: BTreeMap<Op, VecDeque<Forced>>,
    calls: Vec<RemoteCall>,
}

impl RemoteState {
    fn tx(&mut self) -> TransactionId {
        self.next_tx += 1;
        TransactionId(self.next_tx)
    }
}

#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<RemoteState>,
}

impl FakeRemote {
    /// The next call of kind `op` without a queued outcome ends as `forced`.
    pub fn force_next(&self, op: Op, forced: Forced) {
        self.state
            .lock()
            .unwrap()
            .forced
            .entry(op)
            .or_default()
            .push_back(forced);
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, f: impl Fn(&RemoteCall) -> bool) -> usize {
        self.calls().iter().filter(|c| f(c)).count()
    }

    pub fn allocations(&self) -> usize {
        self.count(|c| matches!(c, RemoteCall::Allocate(_)))
    }

    pub fn frees(&self) -> usize {
        self.count(|c| matches!(c, RemoteCall::Free(_)))
    }

    pub fn locks(&self) -> usize {
        self.count(|c| matches!(c, RemoteCall::Lock(_)))
    }

    pub fn unlocks(&self) -> usize {
        self.count(|c| matches!(c, RemoteCall::Unlock { .. }))
    }

    pub fn resizes(&self) -> usize {
        self.count(|c| matches!(c, RemoteCall::Resize(..)))
    }

    pub fn cleanups(&self) -> Vec<PendingAction> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RemoteCall::CleanUp(action) => Some(action),
                _ => None,
            })
            .collect()
    }

    pub fn live_blocks(&self) -> usize {
        self.state.lock().unwrap().blocks.len()
    }

    fn begin(&self, op: Op, call: RemoteCall) -> (TransactionId, Option<Forced>) {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        let tx = state.tx();
        let forced = state.forced.get_mut(&op).and_then(VecDeque::pop_front);
        (tx, forced)
    }
}

impl RemoteMemoryService for FakeRemote {
    fn allocate(&self, request: &AllocRequest) -> Transaction<Allocation> {
        let (tx, forced) = self.begin(Op::Allocate, RemoteCall::Allocate(request.clone()));
        match forced {
            Some(Forced::Fail(status)) => return Transaction::failed(tx, status),
            Some(Forced::Abandon) => return Transaction::abandoned(tx),
            _ => {}
        }
        let mut state = self.state.lock().unwrap();
        state.next_handle += 1;
        let handle = RemoteHandle::new(state.next_handle).unwrap();
        if forced == Some(Forced::Null) {
            return Transaction::completed(
                tx,
                Allocation {
                    handle,
                    address: BusAddress::NULL,
                },
            );
        }
        let address = BusAddress::new(FIRST_BUS_ADDRESS + state.next_offset);
        state.next_offset += request.base_unit * request.num_unit;
        state.blocks.insert(handle, address);
        Transaction::completed(tx, Allocation { handle, address })
    }

    fn free(&self, handle: RemoteHandle, _address: BusAddress) -> Transaction<()> {
        let (tx, forced) = self.begin(Op::Free, RemoteCall::Free(handle));
        self.state.lock().unwrap().blocks.remove(&handle);
        match forced {
            Some(Forced::Fail(status)) => Transaction::failed(tx, status),
            Some(Forced::Abandon) => Transaction::abandoned(tx),
            _ => Transaction::completed(tx, ()),
        }
    }

    fn lock(&self, handle: RemoteHandle, _address: BusAddress) -> Transaction<LockReply> {
        let (tx, forced) = self.begin(Op::Lock, RemoteCall::Lock(handle));
        let mut state = self.state.lock().unwrap();
        let previous = state.blocks.get(&handle).copied().unwrap_or_default();
        match forced {
            Some(Forced::Fail(status)) => Transaction::failed(tx, status),
            Some(Forced::Abandon) => Transaction::abandoned(tx),
            Some(Forced::Null) => Transaction::completed(
                tx,
                LockReply {
                    address: BusAddress::NULL,
                    previous,
                },
            ),
            Some(Forced::Relocate(address)) => {
                state.blocks.insert(handle, address);
                Transaction::completed(tx, LockReply { address, previous })
            }
            None => Transaction::completed(
                tx,
                LockReply {
                    address: previous,
                    previous,
                },
            ),
        }
    }

    fn unlock(&self, handle: RemoteHandle, _address: BusAddress, wait_reply: bool) -> Transaction<()> {
        let (tx, forced) = self.begin(
            Op::Unlock,
            RemoteCall::Unlock {
                handle,
                wait: wait_reply,
            },
        );
        match forced {
            Some(Forced::Fail(status)) => Transaction::failed(tx, status),
            Some(Forced::Abandon) => Transaction::abandoned(tx),
            _ => Transaction::completed(tx, ()),
        }
    }

    fn resize(&self, handle: RemoteHandle, _address: BusAddress, new_size: u32) -> Transaction<()> {
        let (tx, forced) = self.begin(Op::Resize, RemoteCall::Resize(handle, new_size));
        match forced {
            Some(Forced::Fail(status)) => Transaction::failed(tx, status),
            Some(Forced::Abandon) => Transaction::abandoned(tx),
            _ => Transaction::completed(tx, ()),
        }
    }

    fn clean_up(&self, action: PendingAction) {
        self.state.lock().unwrap().calls.push(RemoteCall::CleanUp(action));
    }
}

#[derive(Default)]
struct HostState {
    populated: BTreeSet<(ProcessId, VirtualAddress)>,
    inserts: Vec<(ProcessId, VirtualAddress, PageFrame)>,
    zaps: Vec<(ProcessId, VirtualRange)>,
    unmaps: Vec<(ProcessId, VirtualRange)>,
    windows: BTreeMap<VirtualAddress, (PhysicalRange, bool)>,
    next_window: u64,
}

impl HostState {
    fn drop_pages(&mut self, pid: ProcessId, range: VirtualRange) {
        self.populated
            .retain(|(p, a)| !(*p == pid && range.contains(*a)));
    }
}

#[derive(Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    pub fn inserts(&self) -> Vec<(ProcessId, VirtualAddress, PageFrame)> {
        self.state.lock().unwrap().inserts.clone()
    }

    pub fn zaps(&self) -> Vec<(ProcessId, VirtualRange)> {
        self.state.lock().unwrap().zaps.clone()
    }

    pub fn unmaps(&self) -> Vec<(ProcessId, VirtualRange)> {
        self.state.lock().unwrap().unmaps.clone()
    }

    pub fn populated(&self) -> usize {
        self.state.lock().unwrap().populated.len()
    }

    /// Open kernel windows: address, physical range, cached.
    pub fn windows(&self) -> Vec<(VirtualAddress, PhysicalRange, bool)> {
        self.state
            .lock()
            .unwrap()
            .windows
            .iter()
            .map(|(va, (range, cached))| (*va, *range, *cached))
            .collect()
    }
}

impl HostMemory for FakeHost {
    fn insert_frame(
        &self,
        pid: ProcessId,
        address: VirtualAddress,
        frame: PageFrame,
    ) -> Result<(), InsertError> {
        let mut state = self.state.lock().unwrap();
        state.populated.insert((pid, address));
        state.inserts.push((pid, address, frame));
        Ok(())
    }

    fn zap_range(&self, pid: ProcessId, range: VirtualRange) {
        let mut state = self.state.lock().unwrap();
        state.drop_pages(pid, range);
        state.zaps.push((pid, range));
    }

    fn unmap_range(&self, pid: ProcessId, range: VirtualRange) -> Result<(), HostError> {
        let mut state = self.state.lock().unwrap();
        state.drop_pages(pid, range);
        state.unmaps.push((pid, range));
        Ok(())
    }

    fn is_populated(&self, pid: ProcessId, address: VirtualAddress) -> bool {
        self.state.lock().unwrap().populated.contains(&(pid, address))
    }

    fn map_kernel_window(&self, range: PhysicalRange, cached: bool) -> Option<VirtualAddress> {
        let mut state = self.state.lock().unwrap();
        let address = VirtualAddress::new(0xFFFF_9000_0000_0000 + state.next_window);
        state.next_window += range.len.next_multiple_of(PAGE_SIZE) + PAGE_SIZE;
        state.windows.insert(address, (range, cached));
        // Kernel windows are mapped eagerly.
        for page in VirtualRange::new(address, range.len).pages() {
            state.populated.insert((ProcessId::KERNEL, page));
        }
        Some(address)
    }

    fn unmap_kernel_window(&self, address: VirtualAddress) {
        let mut state = self.state.lock().unwrap();
        if let Some((range, _)) = state.windows.remove(&address) {
            state.drop_pages(ProcessId::KERNEL, VirtualRange::new(address, range.len));
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CacheOp {
    CleanLocal(VirtualRange),
    InvalidateLocal(VirtualRange),
    CleanOuter(PhysicalRange),
    InvalidateOuter(PhysicalRange),
}

#[derive(Default)]
pub struct FakeCache {
    ops: Mutex<Vec<CacheOp>>,
}

impl FakeCache {
    pub fn ops(&self) -> Vec<CacheOp> {
        self.ops.lock().unwrap().clone()
    }
}

impl CacheMaintenance for FakeCache {
    fn clean_local(&self, range: VirtualRange) {
        self.ops.lock().unwrap().push(CacheOp::CleanLocal(range));
    }

    fn invalidate_local(&self, range: VirtualRange) {
        self.ops.lock().unwrap().push(CacheOp::InvalidateLocal(range));
    }

    fn clean_outer(&self, range: PhysicalRange) {
        self.ops.lock().unwrap().push(CacheOp::CleanOuter(range));
    }

    fn invalidate_outer(&self, range: PhysicalRange) {
        self.ops.lock().unwrap().push(CacheOp::InvalidateOuter(range));
    }
}

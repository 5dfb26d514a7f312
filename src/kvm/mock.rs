//! In-memory stand-in for `/dev/kvm`.
//!
//! Every call and every release is appended to a shared [`Journal`], so
//! tests can assert on ordering. A single [`Step`] can be made to fail, and
//! vCPU exits are scripted as [`ScriptedExit`]s encoded into a `kvm_run`
//! value plus a fake run buffer page for port I/O data.

use super::{
    decode_exit, ControlInterface, KvmError, RunBuffer, VcpuExit, VcpuInterface, VmInterface,
};
use kvm_bindings::{
    kvm_regs, kvm_run, kvm_sregs, kvm_userspace_memory_region, KVM_EXIT_FAIL_ENTRY,
    KVM_EXIT_HLT, KVM_EXIT_INTERNAL_ERROR, KVM_EXIT_IO, KVM_EXIT_IO_OUT, KVM_EXIT_SHUTDOWN,
};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

/// Run buffer size reported by the mock: header page plus I/O data page.
pub const MOCK_RUN_SIZE: usize = 2 * 4096;

/// Where scripted port I/O data is placed, as KVM does (second page).
const IO_DATA_OFFSET: usize = 4096;

/// Shared, ordered record of mock calls.
#[derive(Clone, Default)]
pub struct Journal(Rc<RefCell<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.borrow_mut().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }

    /// Whether an entry equal to `entry` was recorded.
    pub fn contains(&self, entry: &str) -> bool {
        self.0.borrow().iter().any(|e| e == entry)
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.borrow().iter().filter(|e| *e == entry).count()
    }
}

/// A mock operation that can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    CreateVm,
    SetMemoryRegion,
    CreateVcpu,
    VcpuMmapSize,
    MapRunBuffer,
    GetSregs,
    SetSregs,
    SetRegs,
}

/// An exit the mock vCPU reports from `run`.
#[derive(Debug, Clone, Copy)]
pub enum ScriptedExit {
    PortOut { port: u16, value: u32 },
    Hlt,
    Shutdown,
    FailEntry(u64),
    InternalError(u32),
    Raw(u32),
}

/// Fill `run` and `buffer` the way KVM reports `exit`.
///
/// Port I/O data goes to `buffer` at the second page, as KVM places it.
pub fn encode_exit(run: &mut kvm_run, buffer: &mut [u8], exit: ScriptedExit) {
    *run = kvm_run::default();
    buffer.fill(0);

    match exit {
        ScriptedExit::PortOut { port, value } => {
            run.exit_reason = KVM_EXIT_IO;
            // SAFETY: reading a zeroed union member of plain integers.
            let mut io = unsafe { run.__bindgen_anon_1.io };
            io.direction = KVM_EXIT_IO_OUT as u8;
            io.size = 4;
            io.port = port;
            io.count = 1;
            io.data_offset = IO_DATA_OFFSET as u64;
            run.__bindgen_anon_1.io = io;
            buffer[IO_DATA_OFFSET..IO_DATA_OFFSET + 4].copy_from_slice(&value.to_le_bytes());
        }
        ScriptedExit::Hlt => run.exit_reason = KVM_EXIT_HLT,
        ScriptedExit::Shutdown => run.exit_reason = KVM_EXIT_SHUTDOWN,
        ScriptedExit::FailEntry(reason) => {
            run.exit_reason = KVM_EXIT_FAIL_ENTRY;
            // SAFETY: as above.
            let mut fail_entry = unsafe { run.__bindgen_anon_1.fail_entry };
            fail_entry.hardware_entry_failure_reason = reason;
            run.__bindgen_anon_1.fail_entry = fail_entry;
        }
        ScriptedExit::InternalError(suberror) => {
            run.exit_reason = KVM_EXIT_INTERNAL_ERROR;
            // SAFETY: as above.
            let mut internal = unsafe { run.__bindgen_anon_1.internal };
            internal.suberror = suberror;
            run.__bindgen_anon_1.internal = internal;
        }
        ScriptedExit::Raw(reason) => run.exit_reason = reason,
    }
}

struct MockState {
    journal: Journal,
    fail: Cell<Option<Step>>,
    run_size: Cell<usize>,
    exits: RefCell<VecDeque<ScriptedExit>>,
    regs: Cell<kvm_regs>,
    sregs: Cell<kvm_sregs>,
    regions: RefCell<Vec<kvm_userspace_memory_region>>,
    run: RefCell<kvm_run>,
    run_bytes: RefCell<Vec<u8>>,
}

impl MockState {
    fn check(&self, step: Step) -> Result<(), kvm_ioctls::Error> {
        if self.fail.get() == Some(step) {
            Err(kvm_ioctls::Error::new(libc::ENOMEM))
        } else {
            Ok(())
        }
    }
}

/// Mock control handle. Dropping it records `close control`.
pub struct MockControl {
    state: Rc<MockState>,
}

impl MockControl {
    pub fn new(journal: Journal) -> Self {
        journal.record("open control");
        Self {
            state: Rc::new(MockState {
                journal,
                fail: Cell::new(None),
                run_size: Cell::new(MOCK_RUN_SIZE),
                exits: RefCell::new(VecDeque::new()),
                regs: Cell::new(kvm_regs::default()),
                sregs: Cell::new(kvm_sregs::default()),
                regions: RefCell::new(Vec::new()),
                run: RefCell::new(kvm_run::default()),
                run_bytes: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn failing_at(self, step: Step) -> Self {
        self.state.fail.set(Some(step));
        self
    }

    pub fn with_exits(self, exits: impl IntoIterator<Item = ScriptedExit>) -> Self {
        self.state.exits.borrow_mut().extend(exits);
        self
    }

    pub fn with_run_size(self, size: usize) -> Self {
        self.state.run_size.set(size);
        self
    }

    pub fn with_regs(self, regs: kvm_regs) -> Self {
        self.state.regs.set(regs);
        self
    }

    pub fn with_sregs(self, sregs: kvm_sregs) -> Self {
        self.state.sregs.set(sregs);
        self
    }

    pub fn regions(&self) -> Vec<kvm_userspace_memory_region> {
        self.state.regions.borrow().clone()
    }

    pub fn sregs(&self) -> kvm_sregs {
        self.state.sregs.get()
    }
}

impl Drop for MockControl {
    fn drop(&mut self) {
        self.state.journal.record("close control");
    }
}

impl ControlInterface for MockControl {
    type Vm = MockVm;

    fn create_vm(&self) -> Result<MockVm, KvmError> {
        self.state.journal.record("create_vm");
        self.state.check(Step::CreateVm).map_err(KvmError::CreateVm)?;
        Ok(MockVm {
            state: Rc::clone(&self.state),
        })
    }

    fn vcpu_mmap_size(&self) -> Result<usize, KvmError> {
        self.state.journal.record("vcpu_mmap_size");
        self.state
            .check(Step::VcpuMmapSize)
            .map_err(KvmError::GetVcpuMmapSize)?;
        Ok(self.state.run_size.get())
    }
}

pub struct MockVm {
    state: Rc<MockState>,
}

impl Drop for MockVm {
    fn drop(&mut self) {
        self.state.journal.record("close vm");
    }
}

impl VmInterface for MockVm {
    type Vcpu = MockVcpu;

    unsafe fn set_user_memory_region(
        &self,
        region: kvm_userspace_memory_region,
    ) -> Result<(), KvmError> {
        self.state.journal.record("set_user_memory_region");
        self.state
            .check(Step::SetMemoryRegion)
            .map_err(KvmError::SetMemoryRegion)?;
        self.state.regions.borrow_mut().push(region);
        Ok(())
    }

    fn create_vcpu(&self, _id: u64) -> Result<MockVcpu, KvmError> {
        self.state.journal.record("create_vcpu");
        self.state
            .check(Step::CreateVcpu)
            .map_err(KvmError::CreateVcpu)?;
        Ok(MockVcpu {
            state: Rc::clone(&self.state),
        })
    }
}

pub struct MockVcpu {
    state: Rc<MockState>,
}

impl Drop for MockVcpu {
    fn drop(&mut self) {
        self.state.journal.record("close vcpu");
    }
}

impl VcpuInterface for MockVcpu {
    type RunBuffer = MockRunBuffer;

    fn get_regs(&self) -> Result<kvm_regs, KvmError> {
        self.state.journal.record("get_regs");
        Ok(self.state.regs.get())
    }

    fn set_regs(&self, regs: &kvm_regs) -> Result<(), KvmError> {
        self.state.journal.record("set_regs");
        self.state
            .check(Step::SetRegs)
            .map_err(KvmError::SetRegisters)?;
        self.state.regs.set(*regs);
        Ok(())
    }

    fn get_sregs(&self) -> Result<kvm_sregs, KvmError> {
        self.state.journal.record("get_sregs");
        self.state
            .check(Step::GetSregs)
            .map_err(KvmError::GetSpecialRegisters)?;
        Ok(self.state.sregs.get())
    }

    fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), KvmError> {
        self.state.journal.record("set_sregs");
        self.state
            .check(Step::SetSregs)
            .map_err(KvmError::SetSpecialRegisters)?;
        self.state.sregs.set(*sregs);
        Ok(())
    }

    fn map_run_buffer(&self, size: usize) -> Result<MockRunBuffer, KvmError> {
        self.state.journal.record("map run buffer");
        if self.state.fail.get() == Some(Step::MapRunBuffer) {
            return Err(KvmError::MapRunBuffer(nix::Error::ENOMEM));
        }
        *self.state.run_bytes.borrow_mut() = vec![0u8; size];
        Ok(MockRunBuffer {
            state: Rc::clone(&self.state),
        })
    }

    /// Pops the next scripted exit. An empty script fails like an
    /// interrupted `KVM_RUN`.
    fn run(&mut self) -> Result<(), KvmError> {
        self.state.journal.record("run");
        let exit = self
            .state
            .exits
            .borrow_mut()
            .pop_front()
            .ok_or(KvmError::Run(kvm_ioctls::Error::new(libc::EINTR)))?;
        encode_exit(
            &mut self.state.run.borrow_mut(),
            &mut self.state.run_bytes.borrow_mut(),
            exit,
        );
        Ok(())
    }
}

pub struct MockRunBuffer {
    state: Rc<MockState>,
}

impl Drop for MockRunBuffer {
    fn drop(&mut self) {
        self.state.journal.record("unmap run buffer");
    }
}

impl RunBuffer for MockRunBuffer {
    fn read_exit(&self) -> Result<VcpuExit, KvmError> {
        decode_exit(&self.state.run.borrow(), &self.state.run_bytes.borrow())
    }
}

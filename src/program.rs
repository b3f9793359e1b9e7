//! Scripted request programs.
//!
//! A program arrives as `<ascii-decimal-length>\n<json>` where the JSON is
//! `[ {"<exec_point>": {"<OPCODE>": "<operand>"}}, ... ]`. Parsing builds a
//! min-heap of instructions keyed by exec point; `feed` pops and runs every
//! instruction whose trigger point has been reached by the byte stream.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::debug;

use crate::buffer::DynamicString;
use crate::vm::VirtualMachine;

/// Per-`on_sent` download chunk size.
pub const SEND_BUFFER_SIZE: usize = 64 * 1024;

/// Outcome of a parse attempt over the body stream.
pub enum ParseOutcome {
    /// A complete program was decoded; `consumed` bytes of the stream
    /// belong to it.
    Success { program: Program, consumed: usize },
    /// The stream does not yet hold the full program text.
    NeedMoreData,
    /// The program text is malformed or has an impossible length.
    Failed,
}

trait Instruction: Send {
    fn exec_point(&self) -> u64;
    fn run(&self, program: &mut Program);
    /// Hand the instruction back to its type's process-wide pool.
    fn recycle(self: Box<Self>);
}

macro_rules! define_op {
    ($name:ident, $pool:ident) => {
        #[derive(Default)]
        struct $name {
            exec_point: u64,
            operand: u64,
        }

        impl $name {
            fn pooled(exec_point: u64, operand: u64) -> Box<Self> {
                let mut op = op_pools().$pool.take().unwrap_or_default();
                op.exec_point = exec_point;
                op.operand = operand;
                op
            }
        }
    };
}

define_op!(DownloadOp, download);
define_op!(LockOp, lock);
define_op!(UnlockOp, unlock);
define_op!(SleepOp, sleep);
define_op!(LoopOp, spin);

impl Instruction for DownloadOp {
    fn exec_point(&self) -> u64 {
        self.exec_point
    }

    fn run(&self, program: &mut Program) {
        program.result_code = 200;
        program.download_remaining.store(self.operand, Ordering::SeqCst);
    }

    fn recycle(self: Box<Self>) {
        op_pools().download.put(self);
    }
}

impl Instruction for LockOp {
    fn exec_point(&self) -> u64 {
        self.exec_point
    }

    fn run(&self, program: &mut Program) {
        if let Some(vm) = program.vm.clone() {
            vm.lock(program.identity, self.operand, &program.cancel);
        }
    }

    fn recycle(self: Box<Self>) {
        op_pools().lock.put(self);
    }
}

impl Instruction for UnlockOp {
    fn exec_point(&self) -> u64 {
        self.exec_point
    }

    fn run(&self, program: &mut Program) {
        if let Some(vm) = program.vm.clone() {
            vm.unlock(program.identity, self.operand);
        }
    }

    fn recycle(self: Box<Self>) {
        op_pools().unlock.put(self);
    }
}

impl Instruction for SleepOp {
    fn exec_point(&self) -> u64 {
        self.exec_point
    }

    fn run(&self, program: &mut Program) {
        if let Some(vm) = program.vm.clone() {
            vm.sleep(self.operand);
        }
    }

    fn recycle(self: Box<Self>) {
        op_pools().sleep.put(self);
    }
}

impl Instruction for LoopOp {
    fn exec_point(&self) -> u64 {
        self.exec_point
    }

    fn run(&self, program: &mut Program) {
        if let Some(vm) = program.vm.clone() {
            vm.spin(self.operand);
        }
    }

    fn recycle(self: Box<Self>) {
        op_pools().spin.put(self);
    }
}

/// One LIFO free list per instruction type.
struct OpSlot<T> {
    free: Mutex<Vec<Box<T>>>,
}

impl<T> OpSlot<T> {
    fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    fn take(&self) -> Option<Box<T>> {
        self.free.lock().unwrap().pop()
    }

    fn put(&self, op: Box<T>) {
        self.free.lock().unwrap().push(op);
    }
}

struct OpPools {
    download: OpSlot<DownloadOp>,
    lock: OpSlot<LockOp>,
    unlock: OpSlot<UnlockOp>,
    sleep: OpSlot<SleepOp>,
    spin: OpSlot<LoopOp>,
}

fn op_pools() -> &'static OpPools {
    static POOLS: OnceLock<OpPools> = OnceLock::new();
    POOLS.get_or_init(|| OpPools {
        download: OpSlot::new(),
        lock: OpSlot::new(),
        unlock: OpSlot::new(),
        sleep: OpSlot::new(),
        spin: OpSlot::new(),
    })
}

fn instantiate(opcode: &str, exec_point: u64, operand: u64) -> Option<Box<dyn Instruction>> {
    match opcode {
        "DOWNLOAD" => Some(DownloadOp::pooled(exec_point, operand)),
        "LOCK" => Some(LockOp::pooled(exec_point, operand)),
        "UNLOCK" => Some(UnlockOp::pooled(exec_point, operand)),
        "SLEEP" => Some(SleepOp::pooled(exec_point, operand)),
        "LOOP" => Some(LoopOp::pooled(exec_point, operand)),
        _ => None,
    }
}

/// Min-heap adapter: the instruction with the smallest exec point sits on
/// top of `BinaryHeap`.
struct HeapEntry(Box<dyn Instruction>);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.exec_point() == other.0.exec_point()
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.0.exec_point().cmp(&self.0.exec_point())
    }
}

fn next_identity() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

pub struct Program {
    instructions: BinaryHeap<HeapEntry>,
    bytes_processed: u64,
    result_code: u16,
    download_remaining: AtomicU64,
    finished: bool,
    vm: Option<Arc<VirtualMachine>>,
    cancel: Arc<AtomicBool>,
    /// Unique, stable token identifying this program to the VM.
    identity: u64,
}

impl Default for Program {
    fn default() -> Self {
        Self {
            instructions: BinaryHeap::new(),
            bytes_processed: 0,
            result_code: 200,
            download_remaining: AtomicU64::new(0),
            finished: false,
            vm: None,
            cancel: Arc::new(AtomicBool::new(false)),
            identity: next_identity(),
        }
    }
}

impl Program {
    /// The do-nothing program used for `/sinkhole/` requests: swallows the
    /// whole body and responds 200 with no payload.
    pub fn sinkhole() -> Self {
        Self::default()
    }

    /// Attempt to decode a program from the front of `data`.
    pub fn try_parse(data: &[u8]) -> ParseOutcome {
        let newline = match data.iter().position(|&b| b == b'\n') {
            Some(pos) => pos,
            None => return ParseOutcome::NeedMoreData,
        };

        let header = &data[..newline];
        let prog_len = match std::str::from_utf8(header)
            .ok()
            .and_then(|s| s.trim_end_matches('\r').parse::<usize>().ok())
        {
            Some(len) => len,
            None => return ParseOutcome::Failed,
        };

        if prog_len == 0 {
            debug!("invalid program size: 0");
            return ParseOutcome::Failed;
        }

        let body_start = newline + 1;
        if data.len() < body_start + prog_len {
            return ParseOutcome::NeedMoreData;
        }

        match Self::from_json(&data[body_start..body_start + prog_len]) {
            Some(program) => ParseOutcome::Success {
                program,
                consumed: body_start + prog_len,
            },
            None => {
                debug!("invalid program text");
                ParseOutcome::Failed
            }
        }
    }

    fn from_json(json: &[u8]) -> Option<Self> {
        use std::collections::HashMap;

        let lines: Vec<HashMap<String, HashMap<String, String>>> =
            serde_json::from_slice(json).ok()?;

        let mut program = Program::default();
        for line in &lines {
            for (point, inst) in line {
                let exec_point = point.parse::<u64>().ok()?;
                let (opcode, operand) = inst.iter().next()?;
                let operand = operand.parse::<u64>().ok()?;
                let op = instantiate(opcode, exec_point, operand)?;
                program.instructions.push(HeapEntry(op));
            }
        }
        Some(program)
    }

    /// Bind the VM the instructions execute against. A program counts as
    /// "set" once it has a VM.
    pub fn set_vm(&mut self, vm: Arc<VirtualMachine>) {
        self.vm = Some(vm);
    }

    pub fn is_set(&self) -> bool {
        self.vm.is_some()
    }

    /// Use `flag` as the cancellation signal (shared with the owning
    /// session so a forced teardown can interrupt VM lock waits).
    pub fn set_cancel_flag(&mut self, flag: Arc<AtomicBool>) {
        self.cancel = flag;
    }

    /// Account `chunk_len` more stream bytes, then run every instruction
    /// whose exec point has been reached. Returns the finished state.
    pub fn feed(&mut self, chunk_len: usize, eof: bool) -> bool {
        self.bytes_processed += chunk_len as u64;

        while let Some(top) = self.instructions.peek() {
            if self.cancel.load(Ordering::SeqCst) {
                break;
            }
            if top.0.exec_point() > self.bytes_processed {
                break;
            }
            let op = self.instructions.pop().expect("peeked entry").0;
            op.run(self);
            op.recycle();
        }

        self.finished = eof;
        self.finished
    }

    /// `(result code, download size)` summarising the execution.
    pub fn response(&self) -> (u16, u64) {
        (self.result_code, self.download_remaining.load(Ordering::SeqCst))
    }

    /// Whether the output stream still owes bytes. Only meaningful once
    /// `feed` has seen eof.
    pub fn has_more_data(&self) -> bool {
        debug_assert!(self.finished);
        self.download_remaining.load(Ordering::SeqCst) > 0
    }

    /// Fill `d` with the next download chunk (at most 64 KiB) and deduct
    /// it from the remaining budget.
    pub fn get_data(&self, d: &mut DynamicString) {
        let remaining = self.download_remaining.load(Ordering::SeqCst);
        debug_assert!(remaining > 0);
        let count = remaining.min(SEND_BUFFER_SIZE as u64);
        d.fill(count as usize);
        self.download_remaining.fetch_sub(count, Ordering::SeqCst);
    }

    /// Request cancellation: instruction execution stops between
    /// instructions and any VM lock wait owned by this program returns.
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Release VM resources held by this program, drain the instruction
    /// heap back into the pools, and detach the VM.
    pub fn reset(&mut self) {
        if let Some(vm) = self.vm.take() {
            vm.cleanup(self.identity);
        }
        while let Some(entry) = self.instructions.pop() {
            entry.0.recycle();
        }
    }

    pub fn identity(&self) -> u64 {
        self.identity
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(json: &str) -> Vec<u8> {
        format!("{}\n{}", json.len(), json).into_bytes()
    }

    #[test]
    fn parse_consumes_exactly_header_plus_body() {
        let json = r#"[{"0":{"DOWNLOAD":"1024"}}]"#;
        let mut data = framed(json);
        data.extend_from_slice(b"trailing");

        match Program::try_parse(&data) {
            ParseOutcome::Success { consumed, .. } => {
                assert_eq!(consumed, json.len().to_string().len() + 1 + json.len());
            }
            _ => panic!("expected successful parse"),
        }
    }

    #[test]
    fn parse_waits_for_full_body() {
        let data = framed(r#"[{"0":{"DOWNLOAD":"1"}}]"#);
        assert!(matches!(
            Program::try_parse(&data[..data.len() - 1]),
            ParseOutcome::NeedMoreData
        ));
        assert!(matches!(Program::try_parse(b"123"), ParseOutcome::NeedMoreData));
    }

    #[test]
    fn zero_length_is_failed() {
        assert!(matches!(Program::try_parse(b"0\n"), ParseOutcome::Failed));
    }

    #[test]
    fn malformed_json_is_failed() {
        assert!(matches!(
            Program::try_parse(b"7\nnotjson"),
            ParseOutcome::Failed
        ));
    }

    #[test]
    fn unknown_opcode_is_failed() {
        let data = framed(r#"[{"0":{"EXPLODE":"1"}}]"#);
        assert!(matches!(Program::try_parse(&data), ParseOutcome::Failed));
    }

    #[test]
    fn non_numeric_operand_is_failed() {
        let data = framed(r#"[{"0":{"DOWNLOAD":"many"}}]"#);
        assert!(matches!(Program::try_parse(&data), ParseOutcome::Failed));
    }

    fn parse(json: &str) -> Program {
        match Program::try_parse(&framed(json)) {
            ParseOutcome::Success { program, .. } => program,
            _ => panic!("parse failed"),
        }
    }

    #[test]
    fn instructions_trigger_at_their_exec_points() {
        let mut program = parse(r#"[{"5":{"DOWNLOAD":"77"}}]"#);
        program.set_vm(VirtualMachine::shared().clone());

        program.feed(4, false);
        assert_eq!(program.response(), (200, 0));

        program.feed(1, false);
        assert_eq!(program.response(), (200, 77));
    }

    #[test]
    fn out_of_order_lines_execute_in_exec_point_order() {
        // DOWNLOAD at 2 runs after DOWNLOAD at 1, so the later value wins.
        let mut program =
            parse(r#"[{"2":{"DOWNLOAD":"222"}},{"1":{"DOWNLOAD":"111"}}]"#);
        program.set_vm(VirtualMachine::shared().clone());

        program.feed(1, false);
        assert_eq!(program.response().1, 111);
        program.feed(1, true);
        assert_eq!(program.response().1, 222);
    }

    #[test]
    fn download_budget_drains_in_chunks() {
        let mut program = parse(r#"[{"0":{"DOWNLOAD":"100000"}}]"#);
        program.set_vm(VirtualMachine::shared().clone());
        assert!(program.feed(1, true));
        assert!(program.has_more_data());

        let mut d = DynamicString::with_capacity(SEND_BUFFER_SIZE);
        program.get_data(&mut d);
        assert_eq!(d.len(), SEND_BUFFER_SIZE);
        assert!(program.has_more_data());

        program.get_data(&mut d);
        assert_eq!(d.len(), 100_000 - SEND_BUFFER_SIZE);
        assert!(!program.has_more_data());
    }

    #[test]
    fn reset_releases_held_vm_resources() {
        let vm = Arc::new(VirtualMachine::new());
        let mut program = parse(r#"[{"1":{"LOCK":"42"}}]"#);
        program.set_vm(vm.clone());
        program.feed(1, true);

        // The resource is held by this program's identity; a second
        // contender would block. After reset it must be acquirable.
        program.reset();

        let cancel = AtomicBool::new(false);
        let start = std::time::Instant::now();
        vm.lock(9999, 42, &cancel);
        assert!(start.elapsed() < std::time::Duration::from_millis(90));
    }

    #[test]
    fn sinkhole_is_inert() {
        let mut program = Program::sinkhole();
        assert!(!program.is_set());
        program.set_vm(VirtualMachine::shared().clone());
        assert!(program.is_set());
        assert!(program.feed(4096, true));
        assert_eq!(program.response(), (200, 0));
    }

    #[test]
    fn cancellation_stops_instruction_execution() {
        let mut program =
            parse(r#"[{"1":{"DOWNLOAD":"1"}},{"2":{"DOWNLOAD":"2"}}]"#);
        program.set_vm(VirtualMachine::shared().clone());
        program.stop();
        program.feed(10, true);
        // Nothing ran.
        assert_eq!(program.response().1, 0);
    }
}

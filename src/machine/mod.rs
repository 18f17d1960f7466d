use std::collections::HashMap;
use std::fmt;

use libc::c_char;

pub mod dispatch;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("unsupported component width {width}: specializations exist for 1..=16")]
    UnsupportedWidth { width: usize },
}

/// Opaque pointer-register slot.
///
/// The expression language stores C-string handles here; any pointer-sized
/// value that stays alive for the duration of the evaluation works. Null is
/// the initial value of every allocated slot.
pub type StrHandle = *const c_char;

/// Entry point of one instruction.
///
/// `args` is the instruction's portion of the operand table, starting at the
/// offset recorded when the instruction was opened and running to the end of
/// the table (an instruction only ever reads its own leading operands).
/// `fp` and `strs` are the full scalar and pointer register arrays.
///
/// The return value is the signed program-counter advance. Compiled programs
/// are straight-line code with occasional forward skips: a well-formed
/// program only returns advances >= 1, and `Program::eval` relies on that
/// for termination.
pub type OpFn = fn(args: &[i32], fp: &mut [f64], strs: &mut [StrHandle]) -> i32;

/// Identity of an external variable during the build phase. Assigned by the
/// code generator (typically from its own symbol table); never inspected
/// here beyond equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(pub u64);

/// One instruction: an entry point plus the start of its operand range.
#[derive(Clone, Copy)]
struct Op {
    f: OpFn,
    args_at: usize,
}

#[derive(PartialEq)]
enum BuildState {
    Idle,
    Building,
}

// ── Builder ──────────────────────────────────────────────────────────

/// Assembles a program one instruction at a time.
///
/// The only mutator of the register file, operand table and instruction
/// list. All three grow append-only; nothing is ever shrunk, reused or
/// resized once the owning instruction is closed. The builder protocol is a
/// strict two-state machine: `begin_op` opens an instruction, `add_operand`
/// appends its operands, `end_op` closes it (optionally executing it once
/// against the current register values, for build-time constant folding).
///
/// Protocol violations — opening an instruction inside another one, adding
/// an operand with no instruction open, freezing mid-instruction — are code
/// generator bugs and panic immediately rather than corrupting the
/// per-instruction operand-range invariant.
pub struct Machine {
    /// Scalar registers: constants, inputs and evaluated results, with
    /// vector/color values flattened into contiguous slots.
    fp: Vec<f64>,
    /// Pointer registers for string handles.
    strs: Vec<StrHandle>,
    /// Operands for all instructions, sliced per instruction by start offset.
    op_data: Vec<i32>,
    ops: Vec<Op>,
    /// Build-phase only; not carried into the frozen program.
    vars: HashMap<VarId, usize>,
    state: BuildState,
}

impl Machine {
    pub fn new() -> Self {
        Machine {
            fp: Vec::new(),
            strs: Vec::new(),
            op_data: Vec::new(),
            ops: Vec::new(),
            vars: HashMap::new(),
            state: BuildState::Idle,
        }
    }

    /// Append `count` zeroed scalar registers, returning the offset of the
    /// first. Offsets are stable for the lifetime of the program.
    pub fn alloc_fp(&mut self, count: usize) -> usize {
        let at = self.fp.len();
        self.fp.resize(at + count, 0.0);
        at
    }

    /// Append one null pointer register, returning its offset.
    pub fn alloc_str(&mut self) -> usize {
        let at = self.strs.len();
        self.strs.push(std::ptr::null());
        at
    }

    /// Seed an already-allocated scalar register, e.g. with a literal the
    /// code generator wants available before any evaluation.
    pub fn set_fp(&mut self, at: usize, v: f64) {
        self.fp[at] = v;
    }

    /// Read a scalar register during the build, e.g. to inspect the result
    /// of a folded instruction.
    pub fn fp(&self, at: usize) -> f64 {
        self.fp[at]
    }

    pub fn set_str(&mut self, at: usize, handle: StrHandle) {
        self.strs[at] = handle;
    }

    pub fn str_at(&self, at: usize) -> StrHandle {
        self.strs[at]
    }

    /// Position the next `begin_op` will return. Lets the code generator
    /// compute forward jump deltas before the target instruction exists.
    pub fn next_pc(&self) -> usize {
        self.ops.len()
    }

    /// Open a new instruction pointing at the current end of the operand
    /// table, returning its program-counter position.
    ///
    /// # Panics
    ///
    /// Panics if an instruction is already open.
    pub fn begin_op(&mut self, f: OpFn) -> usize {
        assert!(
            self.state == BuildState::Idle,
            "begin_op called while another instruction is still open"
        );
        self.state = BuildState::Building;
        let pc = self.ops.len();
        self.ops.push(Op { f, args_at: self.op_data.len() });
        pc
    }

    /// Append one operand to the open instruction, returning the operand
    /// table offset it was written to.
    ///
    /// # Panics
    ///
    /// Panics if no instruction is open.
    pub fn add_operand(&mut self, v: i32) -> usize {
        assert!(
            self.state == BuildState::Building,
            "add_operand called with no open instruction"
        );
        let at = self.op_data.len();
        self.op_data.push(v);
        at
    }

    /// Close the open instruction. With `execute == true` the instruction
    /// runs once, immediately, against the current register values — a
    /// build-time fold for instructions whose operands are already known
    /// constants. The instruction stays in the program either way; folded
    /// instructions simply recompute the same value during the real walk.
    ///
    /// # Panics
    ///
    /// Panics if no instruction is open.
    pub fn end_op(&mut self, execute: bool) {
        assert!(
            self.state == BuildState::Building,
            "end_op called with no open instruction"
        );
        self.state = BuildState::Idle;
        if execute {
            // state was Building, so begin_op pushed at least one op
            let op = self.ops[self.ops.len() - 1];
            (op.f)(&self.op_data[op.args_at..], &mut self.fp, &mut self.strs);
        }
    }

    /// Remember which scalar register holds `id`, so later references to the
    /// same variable reuse the slot instead of allocating another.
    pub fn bind_var(&mut self, id: VarId, at: usize) {
        self.vars.insert(id, at);
    }

    pub fn var_offset(&self, id: VarId) -> Option<usize> {
        self.vars.get(&id).copied()
    }

    /// Freeze the build: consume the builder, splitting it into the
    /// immutable [`Program`] (instructions + operand table + register-file
    /// shape) and the mutable [`Frame`] holding the register values seeded
    /// so far. The variable map is build-phase scaffolding and is dropped.
    ///
    /// # Panics
    ///
    /// Panics if an instruction is still open.
    pub fn freeze(self) -> (Program, Frame) {
        assert!(
            self.state == BuildState::Idle,
            "freeze called with an instruction still open"
        );
        let program = Program {
            ops: self.ops,
            op_data: self.op_data,
            fp_len: self.fp.len(),
            strs_len: self.strs.len(),
        };
        let frame = Frame { fp: self.fp, strs: self.strs };
        (program, frame)
    }
}

impl Default for Machine {
    fn default() -> Self {
        Machine::new()
    }
}

// ── Frozen program ───────────────────────────────────────────────────

/// The frozen instruction tape: structure only, no register values.
///
/// Safe to share read-only across threads; every concurrent evaluation
/// needs its own [`Frame`].
pub struct Program {
    ops: Vec<Op>,
    op_data: Vec<i32>,
    fp_len: usize,
    strs_len: usize,
}

impl Program {
    /// Number of instructions.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Total operand table size.
    pub fn operand_len(&self) -> usize {
        self.op_data.len()
    }

    pub fn fp_len(&self) -> usize {
        self.fp_len
    }

    pub fn strs_len(&self) -> usize {
        self.strs_len
    }

    /// A fresh zero/null-initialized frame of the right shape. Unlike the
    /// frame returned by [`Machine::freeze`], it carries no folded
    /// constants, so it only suits programs whose every register is written
    /// before being read.
    pub fn new_frame(&self) -> Frame {
        Frame {
            fp: vec![0.0; self.fp_len],
            strs: vec![std::ptr::null(); self.strs_len],
        }
    }

    /// Run the program once against `frame`.
    ///
    /// Walks the tape from position 0, handing each instruction its operand
    /// slice and the frame's register arrays, and advancing by whatever the
    /// entry point returns; stops when the counter reaches the instruction
    /// count. No operand values are re-validated here — the program is
    /// trusted as built. A malformed program (out-of-range register operand,
    /// backward or zero advance) panics or loops rather than touching memory
    /// out of bounds.
    pub fn eval(&self, frame: &mut Frame) {
        assert_eq!(frame.fp.len(), self.fp_len, "frame does not match program shape");
        assert_eq!(frame.strs.len(), self.strs_len, "frame does not match program shape");

        let end = self.ops.len() as i32;
        let mut pc: i32 = 0;
        while pc < end {
            let op = self.ops[pc as usize];
            let args = &self.op_data[op.args_at..];
            pc += (op.f)(args, &mut frame.fp, &mut frame.strs);
        }
    }
}

impl fmt::Display for Program {
    /// Shape summary for diagnostics: counts plus each instruction's operand
    /// span. Never invokes entry points.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "program: {} ops, {} fp regs, {} str regs, {} operands",
            self.ops.len(),
            self.fp_len,
            self.strs_len,
            self.op_data.len()
        )?;
        for (pc, op) in self.ops.iter().enumerate() {
            let args_end = self
                .ops
                .get(pc + 1)
                .map(|next| next.args_at)
                .unwrap_or(self.op_data.len());
            writeln!(f, "  {:4}: args {:?}", pc, &self.op_data[op.args_at..args_end])?;
        }
        Ok(())
    }
}

// ── Frame ────────────────────────────────────────────────────────────

/// Per-evaluation register values: the mutable half of a frozen build.
///
/// Every `eval` overwrites registers in place, so a single frame must never
/// be shared between overlapping evaluations. Clone it (or ask the program
/// for a fresh one) to evaluate the same program independently, including
/// from multiple threads against one shared [`Program`].
#[derive(Clone)]
pub struct Frame {
    /// Scalar registers (the interpreter's `d` data).
    pub fp: Vec<f64>,
    /// Pointer registers (the interpreter's `s` data). Handles must point
    /// at immutable, NUL-terminated data that outlives the frame; that is
    /// also what makes moving a frame to another thread sound.
    pub strs: Vec<StrHandle>,
}

// SAFETY: the pointer registers hold opaque handles to caller-owned
// immutable strings; the frame never frees or mutates what they point at,
// so moving a frame between threads moves only the handle values.
unsafe impl Send for Frame {}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // Writes the current value of fp[0] into its own slot, then bumps
    // fp[0]. Lets tests observe visit order.
    fn mark(args: &[i32], fp: &mut [f64], _strs: &mut [StrHandle]) -> i32 {
        fp[args[0] as usize] = fp[0];
        fp[0] += 1.0;
        1
    }

    // fp[out] = fp[a] + fp[b]
    fn add1(args: &[i32], fp: &mut [f64], _strs: &mut [StrHandle]) -> i32 {
        fp[args[2] as usize] = fp[args[0] as usize] + fp[args[1] as usize];
        1
    }

    fn jump(args: &[i32], _fp: &mut [f64], _strs: &mut [StrHandle]) -> i32 {
        args[0]
    }

    #[test]
    fn alloc_offsets_are_monotonic() {
        let mut m = Machine::new();
        assert_eq!(m.alloc_fp(1), 0);
        assert_eq!(m.alloc_fp(3), 1);
        assert_eq!(m.alloc_fp(2), 4);
        assert_eq!(m.alloc_str(), 0);
        assert_eq!(m.alloc_str(), 1);
        assert_eq!(m.fp(2), 0.0);
        assert!(m.str_at(1).is_null());
    }

    #[test]
    fn operand_ranges_are_contiguous() {
        let mut m = Machine::new();
        m.alloc_fp(4);

        m.begin_op(add1);
        assert_eq!(m.add_operand(0), 0);
        assert_eq!(m.add_operand(1), 1);
        assert_eq!(m.add_operand(2), 2);
        m.end_op(false);

        m.begin_op(add1);
        assert_eq!(m.add_operand(2), 3);
        m.end_op(false);

        assert_eq!(m.ops[0].args_at, 0);
        assert_eq!(m.ops[1].args_at, 3);
    }

    #[test]
    fn next_pc_tracks_instruction_count() {
        let mut m = Machine::new();
        m.alloc_fp(1);
        assert_eq!(m.next_pc(), 0);
        let pc = m.begin_op(mark);
        assert_eq!(pc, 0);
        m.add_operand(0);
        m.end_op(false);
        assert_eq!(m.next_pc(), 1);
    }

    #[test]
    #[should_panic(expected = "another instruction is still open")]
    fn nested_begin_op_panics() {
        let mut m = Machine::new();
        m.begin_op(mark);
        m.begin_op(mark);
    }

    #[test]
    #[should_panic(expected = "no open instruction")]
    fn add_operand_while_idle_panics() {
        let mut m = Machine::new();
        m.add_operand(0);
    }

    #[test]
    #[should_panic(expected = "no open instruction")]
    fn end_op_while_idle_panics() {
        let mut m = Machine::new();
        m.end_op(false);
    }

    #[test]
    #[should_panic(expected = "instruction still open")]
    fn freeze_mid_instruction_panics() {
        let mut m = Machine::new();
        m.begin_op(mark);
        let _ = m.freeze();
    }

    #[test]
    fn end_op_execute_folds_immediately() {
        let mut m = Machine::new();
        let a = m.alloc_fp(1);
        let b = m.alloc_fp(1);
        let out = m.alloc_fp(1);
        m.set_fp(a, 2.0);
        m.set_fp(b, 3.0);

        m.begin_op(add1);
        m.add_operand(a as i32);
        m.add_operand(b as i32);
        m.add_operand(out as i32);
        m.end_op(true);

        // folded before any eval
        assert_eq!(m.fp(out), 5.0);
    }

    #[test]
    fn end_op_deferred_leaves_registers_untouched() {
        let mut m = Machine::new();
        let a = m.alloc_fp(1);
        let b = m.alloc_fp(1);
        let out = m.alloc_fp(1);
        m.set_fp(a, 2.0);
        m.set_fp(b, 3.0);

        m.begin_op(add1);
        m.add_operand(a as i32);
        m.add_operand(b as i32);
        m.add_operand(out as i32);
        m.end_op(false);

        assert_eq!(m.fp(out), 0.0);

        let (program, mut frame) = m.freeze();
        program.eval(&mut frame);
        assert_eq!(frame.fp[out], 5.0);
    }

    #[test]
    fn eval_empty_program_is_a_noop() {
        let (program, mut frame) = Machine::new().freeze();
        assert!(program.is_empty());
        program.eval(&mut frame);
    }

    #[test]
    fn straight_line_visits_every_op_in_order() {
        let mut m = Machine::new();
        m.alloc_fp(1); // fp[0] = visit counter
        let slots = m.alloc_fp(3);
        for k in 0..3 {
            m.begin_op(mark);
            m.add_operand((slots + k) as i32);
            m.end_op(false);
        }

        let (program, mut frame) = m.freeze();
        assert_eq!(program.len(), 3);
        program.eval(&mut frame);
        assert_eq!(&frame.fp[slots..slots + 3], &[0.0, 1.0, 2.0]);
        assert_eq!(frame.fp[0], 3.0);
    }

    #[test]
    fn advance_two_skips_the_next_op() {
        let mut m = Machine::new();
        m.alloc_fp(1);
        let slots = m.alloc_fp(2);
        m.set_fp(0, 5.0); // distinguishes "ran" from the zeroed default

        m.begin_op(jump);
        m.add_operand(2);
        m.end_op(false);
        for k in 0..2 {
            m.begin_op(mark);
            m.add_operand((slots + k) as i32);
            m.end_op(false);
        }

        let (program, mut frame) = m.freeze();
        assert_eq!(program.len(), 3);
        program.eval(&mut frame);
        // position 1 was skipped; only position 2 ran
        assert_eq!(frame.fp[slots], 0.0);
        assert_eq!(frame.fp[slots + 1], 5.0);
        assert_eq!(frame.fp[0], 6.0);
    }

    #[test]
    fn var_map_reuses_offsets() {
        let mut m = Machine::new();
        let x = VarId(7);
        assert_eq!(m.var_offset(x), None);
        let at = m.alloc_fp(1);
        m.bind_var(x, at);
        assert_eq!(m.var_offset(x), Some(at));
        assert_eq!(m.var_offset(VarId(8)), None);
    }

    #[test]
    fn new_frame_is_zeroed_and_matches_shape() {
        let mut m = Machine::new();
        let a = m.alloc_fp(2);
        m.alloc_str();
        m.set_fp(a, 9.0);

        let (program, seeded) = m.freeze();
        assert_eq!(seeded.fp[a], 9.0);

        let fresh = program.new_frame();
        assert_eq!(fresh.fp, vec![0.0, 0.0]);
        assert_eq!(fresh.strs.len(), 1);
        assert!(fresh.strs[0].is_null());
    }

    #[test]
    #[should_panic(expected = "frame does not match")]
    fn eval_rejects_mismatched_frame() {
        let mut m = Machine::new();
        m.alloc_fp(2);
        let (program, _frame) = m.freeze();
        let mut wrong = Frame { fp: vec![0.0], strs: Vec::new() };
        program.eval(&mut wrong);
    }

    #[test]
    fn display_reports_shape() {
        let mut m = Machine::new();
        m.alloc_fp(3);
        m.begin_op(add1);
        m.add_operand(0);
        m.add_operand(1);
        m.add_operand(2);
        m.end_op(false);

        let (program, _frame) = m.freeze();
        let text = program.to_string();
        assert!(text.contains("1 ops"), "got: {text}");
        assert!(text.contains("3 fp regs"), "got: {text}");
        assert!(text.contains("[0, 1, 2]"), "got: {text}");
    }
}

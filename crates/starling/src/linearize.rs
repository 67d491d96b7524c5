//! Linearization and emission: turn a function's block graph into bytes.
//!
//! Three passes over the arena built by [`crate::compiler`]:
//!
//! 1. *Placement*: a depth-first walk from the entry that always follows
//!    the fall-through edge first, assigning each reachable block its
//!    order and code address, threading edges through empty blocks, and
//!    abstractly interpreting the operand stack (entry depths must agree
//!    at merges; the running maximum becomes `max_stack`).
//! 2. *Patching*: branch targets are now known, so each block's trailing
//!    `CJMP`/`ITERJMP` operand and its `EXCEPTPUSH` operand are filled in.
//!    These operands occupy fixed four-byte slots for exactly this reason.
//! 3. *Emission*: write the byte stream in placement order, adding an
//!    explicit `JMP` wherever a fall-through successor was not placed
//!    next, and build the delta-encoded pc→line table.
//!
//! Unreachable blocks are never placed and emit nothing.

use crate::codec::{self, BRANCH_OPERAND_WIDTH};
use crate::compiler::{Block, BlockId};
use crate::opcode::{Opcode, StackEffect};

/// Assemble the graph rooted at `entry`: returns the code, the pc→line
/// table, and the maximum operand stack depth.
pub(crate) fn assemble(blocks: &mut [Block], entry: BlockId) -> (Vec<u8>, Vec<u16>, u32) {
    let (order, pc, max_stack) = place(blocks, entry);
    patch(blocks, &order);
    let (code, pcline) = emit(blocks, &order, pc);
    (code, pcline, max_stack)
}

fn is_patchable(op: Opcode) -> bool {
    matches!(op, Opcode::CJmp | Opcode::IterJmp | Opcode::ExceptPush)
}

/// Bytes the operand of `op` will occupy.
fn operand_size(op: Opcode, arg: u32) -> u32 {
    if !op.has_arg() {
        0
    } else if is_patchable(op) {
        BRANCH_OPERAND_WIDTH as u32
    } else {
        codec::operand_width(arg) as u32
    }
}

/// The concrete `(pops, pushes)` of one instruction. `ITERJMP` is excluded:
/// its effect depends on the edge taken and is handled by the block walk.
fn effect(op: Opcode, arg: u32) -> (i32, i32) {
    match op.stack_effect() {
        StackEffect::Fixed { pops, pushes } => (i32::from(pops), i32::from(pushes)),
        StackEffect::Variable => match op {
            Opcode::Call | Opcode::CallVar | Opcode::CallKw | Opcode::CallVarKw => {
                let p = (arg >> 8) as i32;
                let n = (arg & 0xff) as i32;
                let extras = match op {
                    Opcode::Call => 0,
                    Opcode::CallVarKw => 2,
                    _ => 1,
                };
                (1 + p + 2 * n + extras, 1)
            }
            Opcode::Load => (arg as i32 + 1, arg as i32),
            Opcode::MakeList | Opcode::MakeTuple => (arg as i32, 1),
            Opcode::Unpack => (1, arg as i32),
            _ => unreachable!("{op} has no operand-derived effect"),
        },
    }
}

/// Shortcut an edge through empty blocks to its ultimate target. Empty
/// blocks carrying a `jmp` form a DAG (the builder never creates an empty
/// self-cycle), so this terminates.
fn thread(blocks: &[Block], mut b: BlockId) -> BlockId {
    while blocks[b].insns.is_empty() {
        match blocks[b].jmp {
            Some(next) if next != b => b = next,
            _ => break,
        }
    }
    b
}

fn set_initial(blocks: &mut [Block], b: BlockId, depth: i32, max_stack: &mut i32) {
    if blocks[b].initial_stack == -1 {
        blocks[b].initial_stack = depth;
        if depth > *max_stack {
            *max_stack = depth;
        }
    } else {
        assert_eq!(
            blocks[b].initial_stack, depth,
            "stack depth mismatch at merge block {b}"
        );
    }
}

fn place(blocks: &mut [Block], entry: BlockId) -> (Vec<BlockId>, u32, u32) {
    let mut order: Vec<BlockId> = Vec::new();
    let mut pc: u32 = 0;
    let mut max_stack: i32 = 0;

    blocks[entry].initial_stack = 0;
    let mut work = vec![entry];
    while let Some(b) = work.pop() {
        if blocks[b].index != -1 {
            continue;
        }
        blocks[b].index = order.len() as i32;
        blocks[b].addr = pc;
        order.push(b);

        let mut depth = blocks[b].initial_stack;
        assert!(depth >= 0, "block {b} reached without a known entry depth");
        let mut ends_with_iterjmp = false;
        let mut except_depth = depth;
        for i in 0..blocks[b].insns.len() {
            let insn = blocks[b].insns[i];
            pc += 1 + operand_size(insn.op, insn.arg);
            ends_with_iterjmp = insn.op == Opcode::IterJmp;
            if ends_with_iterjmp {
                // The pushed element exists only on the fall-through edge.
                continue;
            }
            if insn.op == Opcode::ExceptPush {
                // The runtime restores this depth before entering the
                // handler.
                except_depth = depth;
            }
            let (pops, pushes) = effect(insn.op, insn.arg);
            depth -= pops;
            assert!(depth >= 0, "stack underflow at {} in block {b}", insn.op);
            depth += pushes;
            if depth > max_stack {
                max_stack = depth;
            }
        }

        // Resolve successors through empty blocks and propagate depths.
        // The fall-through edge comes first: its target, if unplaced, is
        // placed immediately next; otherwise five bytes are reserved for
        // an explicit trailing JMP.
        if let Some(t) = blocks[b].jmp {
            let t = thread(blocks, t);
            blocks[b].jmp = Some(t);
            let d = depth + i32::from(ends_with_iterjmp);
            set_initial(blocks, t, d, &mut max_stack);
            if blocks[t].index != -1 {
                pc += 1 + BRANCH_OPERAND_WIDTH as u32;
            }
        }
        if let Some(t) = blocks[b].cjmp {
            let t = thread(blocks, t);
            blocks[b].cjmp = Some(t);
            set_initial(blocks, t, depth, &mut max_stack);
        }
        if let Some(t) = blocks[b].except {
            let t = thread(blocks, t);
            blocks[b].except = Some(t);
            set_initial(blocks, t, except_depth, &mut max_stack);
        }

        // LIFO order so the fall-through successor is visited next.
        if let Some(t) = blocks[b].except {
            work.push(t);
        }
        if let Some(t) = blocks[b].cjmp {
            work.push(t);
        }
        if let Some(t) = blocks[b].jmp {
            work.push(t);
        }
    }

    (order, pc, max_stack as u32)
}

/// Fill in branch operands now that every placed block has an address.
fn patch(blocks: &mut [Block], order: &[BlockId]) {
    for &b in order {
        if let Some(t) = blocks[b].cjmp {
            let addr = blocks[t].addr;
            let insn = blocks[b]
                .insns
                .last_mut()
                .expect("conditional edge on an empty block");
            debug_assert!(matches!(insn.op, Opcode::CJmp | Opcode::IterJmp));
            insn.arg = addr;
        }
        if let Some(t) = blocks[b].except {
            let addr = blocks[t].addr;
            let insn = blocks[b]
                .insns
                .iter_mut()
                .find(|insn| insn.op == Opcode::ExceptPush)
                .expect("except edge without an EXCEPTPUSH");
            insn.arg = addr;
        }
    }
}

fn emit(blocks: &[Block], order: &[BlockId], predicted: u32) -> (Vec<u8>, Vec<u16>) {
    let mut code: Vec<u8> = Vec::with_capacity(predicted as usize);
    let mut table = LineTable::default();

    for &b in order {
        debug_assert_eq!(blocks[b].addr as usize, code.len());
        for insn in &blocks[b].insns {
            if insn.line != 0 {
                table.add(code.len() as u32, insn.line);
            }
            code.push(insn.op as u8);
            if insn.op.has_arg() {
                let min = if is_patchable(insn.op) {
                    assert!(
                        codec::operand_width(insn.arg) <= BRANCH_OPERAND_WIDTH,
                        "function too large: branch target {} overflows its slot",
                        insn.arg
                    );
                    BRANCH_OPERAND_WIDTH
                } else {
                    0
                };
                codec::append_operand(&mut code, insn.arg, min);
            }
        }
        if let Some(t) = blocks[b].jmp {
            if blocks[t].index != blocks[b].index + 1 {
                // Successor not placed next: fall-through won't do.
                code.push(Opcode::Jmp as u8);
                codec::append_operand(&mut code, blocks[t].addr, BRANCH_OPERAND_WIDTH);
            }
        }
    }

    assert_eq!(
        code.len() as u32,
        predicted,
        "emitted length disagrees with the layout pass"
    );
    (code, table.entries)
}

/// Writer for the delta-encoded pc→line table. Each 16-bit record holds an
/// unsigned Δpc (8 bits), a signed Δline (7 bits), and an *incomplete* bit
/// set on every record of a saturated chain except the last.
#[derive(Default)]
struct LineTable {
    entries: Vec<u16>,
    prev_pc: u32,
    prev_line: i64,
}

impl LineTable {
    fn add(&mut self, pc: u32, line: u32) {
        if i64::from(line) == self.prev_line {
            return;
        }
        loop {
            let dpc = pc - self.prev_pc;
            let dline = i64::from(line) - self.prev_line;
            let cpc = dpc.min(0xff);
            let cline = dline.clamp(-0x40, 0x3f);
            let incomplete = cpc != dpc || cline != dline;
            let entry = ((cpc as u16) << 8)
                | ((cline as i16 as u16 & 0x7f) << 1)
                | u16::from(incomplete);
            self.entries.push(entry);
            self.prev_pc += cpc;
            self.prev_line += cline;
            if !incomplete {
                break;
            }
        }
    }
}

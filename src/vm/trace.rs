//! Execution trace recording for the virtual machine.
//!
//! One run produces one trace: every executed step with the memory words it
//! touched, the witnesses of its arithmetic, the heap composites it looked
//! into, plus the public input and output words.

use ark_bls12_381::Fr;

use crate::compiler::program::{Kind, Opcode};
use crate::hash::composite_tag;

/// Output words beyond this many spill out of the public stack top.
pub const STACK_TOP: usize = 16;

/// Rows of one compression in the hash lane.
pub const BLOCK_ROWS: usize = 16;

/// Smallest trace: the byte table needs one row per byte value.
pub const BYTE_ROWS: usize = 256;

/// A memory read or write. Slot 3 of a step only ever writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub addr: u64,
    pub value: Fr,
    pub write: bool,
}

/// One heap lookup: item `index` of `reference` is `value`, or, when `tag`
/// is set, the composite's kind and length are `value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapKey {
    pub reference: Fr,
    pub index: u64,
    pub value: Fr,
    pub tag: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub pc: usize,
    pub opcode: Opcode,
    pub operands: [Fr; 3],
    pub sp: u64,
    pub fp: u64,
    pub accesses: [Option<Access>; 4],
    /// Quotient, carry or inverse witness, depending on the opcode.
    pub helper: Fr,
    /// Values the step proves to fit in 64 bits.
    pub ranges: [u64; 3],
    pub heap: Option<HeapKey>,
}

impl Step {
    pub fn value(&self, slot: usize) -> Option<Fr> {
        self.accesses.get(slot).copied().flatten().map(|access| access.value)
    }
}

/// A sealed composite, as the hash lane absorbs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapObject {
    pub reference: Fr,
    pub kind: Kind,
    pub items: Vec<Fr>,
}

impl HeapObject {
    pub fn tag(&self) -> Fr {
        composite_tag(self.kind.code(), self.items.len())
    }

    /// Compressions needed: the tag, then one per item.
    pub fn blocks(&self) -> usize {
        1 + self.items.len()
    }
}

/// Trace of a single run. Never shared between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionTrace {
    pub steps: Vec<Step>,
    /// `(pc, opcode, a1, a2, a3)` per instruction.
    pub rom: Vec<[Fr; 5]>,
    /// Composites the steps looked into, by first use.
    pub heap: Vec<HeapObject>,
    pub stack_base: u64,
    pub stack_inputs: Vec<u64>,
    pub output_stack: Vec<u64>,
}

impl ExecutionTrace {
    pub fn cycle_count(&self) -> u64 {
        self.steps.len() as u64
    }

    pub fn access_count(&self) -> usize {
        self.steps
            .iter()
            .map(|step| step.accesses.iter().flatten().count())
            .sum()
    }

    pub fn hash_rows(&self) -> usize {
        BLOCK_ROWS * self.heap.iter().map(HeapObject::blocks).sum::<usize>()
    }

    /// Rows every lane of the matrix needs, before padding to a power of
    /// two. The CPU lane ends on an idle row.
    pub fn height(&self) -> usize {
        (self.steps.len() + 1)
            .max(self.access_count())
            .max(self.hash_rows())
            .max(self.rom.len())
            .max(BYTE_ROWS)
    }

    pub fn overflow_addrs(&self) -> Vec<u64> {
        overflow_addrs(self.output_stack.len())
    }
}

/// Positions of the output words past the stack top.
pub fn overflow_addrs(outputs: usize) -> Vec<u64> {
    (STACK_TOP..outputs).map(|position| position as u64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_addrs_follow_stack_top() {
        assert!(overflow_addrs(16).is_empty());
        assert_eq!(overflow_addrs(18), vec![16, 17]);
    }

    #[test]
    fn test_height_covers_every_lane() {
        let mut trace = ExecutionTrace::default();
        assert_eq!(trace.height(), BYTE_ROWS);
        trace.heap.push(HeapObject {
            reference: Fr::from(1u64),
            kind: Kind::String,
            items: vec![Fr::from(104u64); 20],
        });
        assert_eq!(trace.hash_rows(), 21 * BLOCK_ROWS);
        assert_eq!(trace.height(), 21 * BLOCK_ROWS);
    }
}

//! Control-flow block model consumed by the locators.
//!
//! A method body is a list of [`Block`]s indexed by position. Each block carries its
//! instructions, an optional fallthrough successor and explicit branch targets; a block
//! ending in a multi-way branch additionally carries a [`SwitchData`] descriptor filled in
//! by shape detection. Predecessors are derived, not stored, so rewrites keep the graph
//! consistent without bookkeeping.

use crate::cil::{Instruction, MethodContext, MethodRef, Op};

/// Index of a block within its method.
pub type BlockId = usize;

/// How a dispatcher derives its case index from the raw key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchKind {
    /// The key is mixed through an embedded native helper method.
    Native {
        /// The `int32 (int32)` native helper.
        key_method: MethodRef,
    },
    /// The key is `raw ^ xor_key`, and the case index is `key % divisor`.
    Normal {
        /// XOR constant folded into the raw dispatch value.
        xor_key: i32,
        /// Modulus selecting the case index.
        divisor: i32,
    },
}

/// Per-block switch state.
///
/// On a dispatcher block, `kind` describes the detected shape. On case blocks, `key`
/// holds the concrete dispatch key once fallthrough propagation has discovered it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwitchData {
    /// Detected dispatcher shape, if this block is one.
    pub kind: Option<SwitchKind>,
    /// Concrete key value, once known.
    pub key: Option<i32>,
    /// `true` when the dispatcher embeds its key as a leading constant load.
    pub hardcoded_key: bool,
}

/// One basic block.
#[derive(Debug, Clone, Default)]
pub struct Block {
    /// The block's instructions, including any trailing branch or switch.
    pub instructions: Vec<Instruction>,
    /// Implicit or unconditional successor.
    pub fallthrough: Option<BlockId>,
    /// Conditional-branch / switch targets, in operand order.
    pub targets: Vec<BlockId>,
    /// Switch bookkeeping.
    pub switch_data: SwitchData,
    /// Set once a locator has rewritten this block.
    pub processed: bool,
}

impl Block {
    /// Creates a block with the given instructions and no successors.
    #[must_use]
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Block {
            instructions,
            ..Block::default()
        }
    }

    /// Creates a block falling through to `target`.
    #[must_use]
    pub fn with_fallthrough(instructions: Vec<Instruction>, target: BlockId) -> Self {
        Block {
            instructions,
            fallthrough: Some(target),
            ..Block::default()
        }
    }

    /// The first instruction, if any.
    #[must_use]
    pub fn first_instr(&self) -> Option<&Instruction> {
        self.instructions.first()
    }

    /// The last instruction, if any.
    #[must_use]
    pub fn last_instr(&self) -> Option<&Instruction> {
        self.instructions.last()
    }

    /// Total successor count: explicit targets plus the fallthrough.
    #[must_use]
    pub fn count_targets(&self) -> usize {
        self.targets.len() + usize::from(self.fallthrough.is_some())
    }

    /// Returns `true` when the block ends in a `switch`.
    #[must_use]
    pub fn ends_with_switch(&self) -> bool {
        matches!(self.last_instr(), Some(i) if i.op == Op::Switch)
    }

    /// Returns `true` when the block ends in a conditional branch.
    #[must_use]
    pub fn ends_with_conditional_branch(&self) -> bool {
        matches!(self.last_instr(), Some(i) if i.is_branch() && i.op != Op::Br)
    }

    /// Returns `true` when the block ends in `ret`.
    #[must_use]
    pub fn ends_with_ret(&self) -> bool {
        matches!(self.last_instr(), Some(i) if i.op == Op::Ret)
    }

    /// Rewrites the block tail into an unconditional branch to `target`.
    ///
    /// Any trailing branch or switch instruction is dropped first; explicit targets are
    /// cleared and the fallthrough becomes `target`.
    pub fn replace_last_with_branch(&mut self, target: BlockId) {
        if matches!(
            self.last_instr(),
            Some(i) if i.is_branch() || i.op == Op::Switch
        ) {
            self.instructions.pop();
        }
        self.instructions.push(Instruction::new(Op::Br));
        self.targets.clear();
        self.fallthrough = Some(target);
    }
}

/// A method body as a block graph, plus its slot counts.
#[derive(Debug, Clone, Default)]
pub struct MethodBlocks {
    /// The blocks, indexed by [`BlockId`].
    pub blocks: Vec<Block>,
    /// Number of local variable slots in the method.
    pub locals: usize,
    /// Number of argument slots in the method.
    pub args: usize,
}

impl MethodBlocks {
    /// Creates a graph from blocks and slot counts.
    #[must_use]
    pub fn new(blocks: Vec<Block>, locals: usize, args: usize) -> Self {
        MethodBlocks { blocks, locals, args }
    }

    /// Slot counts in the form the emulator consumes.
    #[must_use]
    pub fn method_context(&self) -> MethodContext {
        MethodContext::new(self.locals, self.args)
    }

    /// Predecessors of `id`, in block order.
    #[must_use]
    pub fn sources_of(&self, id: BlockId) -> Vec<BlockId> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.fallthrough == Some(id) || b.targets.contains(&id))
            .map(|(i, _)| i)
            .collect()
    }

    /// Returns `true` for a constant-duplicating stub block.
    ///
    /// Such a block has a single predecessor and exactly two instructions: a constant
    /// load followed by `dup` (or a second load of the same constant).
    #[must_use]
    pub fn is_dup(&self, id: BlockId) -> bool {
        let Some(block) = self.blocks.get(id) else {
            return false;
        };
        if self.sources_of(id).len() != 1 || block.instructions.len() != 2 {
            return false;
        }
        let Some(first_value) = block.instructions[0].ldc_i4_value() else {
            return false;
        };
        let second = &block.instructions[1];
        second.op == Op::Dup || second.ldc_i4_value() == Some(first_value)
    }

    /// Returns `true` for a block that merges the two arms of a ternary predicate.
    ///
    /// Both predecessors must be constant-duplicating stubs fed by one shared
    /// conditional-branch block and falling straight through into `id`.
    #[must_use]
    pub fn is_ternary(&self, id: BlockId) -> bool {
        let Some(block) = self.blocks.get(id) else {
            return false;
        };
        let sources = self.sources_of(id);
        if sources.len() != 2 {
            return false;
        }
        for &source in &sources {
            if !self.is_dup(source) {
                return false;
            }
            let source_block = &self.blocks[source];
            if source_block.count_targets() > 1 || source_block.fallthrough != Some(id) {
                return false;
            }
        }
        let predicate0 = self.sources_of(sources[0]);
        let predicate1 = self.sources_of(sources[1]);
        match (predicate0.first(), predicate1.first()) {
            (Some(&p0), Some(&p1)) if p0 == p1 => {
                if !self.blocks[p0].ends_with_conditional_branch() {
                    return false;
                }
            }
            _ => return false,
        }
        !block.ends_with_ret()
    }
}

//! Flattened-switch dispatcher detection and rewriting.
//!
//! The obfuscator flattens a method into case blocks feeding one dispatcher block that
//! ends in `stloc; ldc.i4; rem.un; switch`. Each case block leaves a raw dispatch value
//! on the stack; the dispatcher derives the case index either by XOR with a constant and
//! an unsigned remainder (the normal shape) or by mixing the value through an embedded
//! native helper first (the native shape). [`ControlFlowFixer`] replays each case block
//! through the CIL emulator, computes the concrete target, rewrites the block into a
//! direct branch, and propagates the discovered key along fallthrough chains so dependent
//! blocks can be resolved in later rounds.

use std::collections::HashSet;

use crate::blocks::{BlockId, MethodBlocks, SwitchKind};
use crate::cil::{EmValue, Instruction, InstructionEmulator, Op};
use crate::passes::{EventKind, EventLog, NativeOracle};
use crate::token::Token;
use crate::{Error, Result};

/// Resolves flattened switch dispatchers in one method at a time.
pub struct ControlFlowFixer<'a> {
    oracle: &'a dyn NativeOracle,
    emulator: InstructionEmulator,
    events: EventLog,
    native_methods: Vec<Token>,
    switch_key_local: Option<u16>,
}

impl<'a> ControlFlowFixer<'a> {
    /// Creates a fixer backed by the given native-helper oracle.
    #[must_use]
    pub fn new(oracle: &'a dyn NativeOracle) -> Self {
        ControlFlowFixer {
            oracle,
            emulator: InstructionEmulator::new(),
            events: EventLog::new(),
            native_methods: Vec::new(),
            switch_key_local: None,
        }
    }

    /// Outcomes recorded so far.
    #[must_use]
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Drains the recorded outcomes.
    pub fn take_events(&mut self) -> EventLog {
        std::mem::take(&mut self.events)
    }

    /// Tokens of native helpers discovered during detection, for host-side removal.
    #[must_use]
    pub fn native_methods(&self) -> &[Token] {
        &self.native_methods
    }

    /// Detects and rewrites every dispatcher in `blocks`.
    ///
    /// Returns `true` when at least one block was rewritten. Unresolvable constructs are
    /// recorded as skipped and left untouched.
    pub fn deobfuscate(&mut self, blocks: &mut MethodBlocks) -> bool {
        let dispatchers = self.find_dispatchers(blocks);
        let mut modified = false;

        for dispatcher in dispatchers {
            if blocks.blocks[dispatcher].switch_data.hardcoded_key {
                match self.process_hardcoded_switch(blocks, dispatcher) {
                    Ok(()) => modified = true,
                    Err(_) => self.events.record(EventKind::SwitchSkipped { block: dispatcher }),
                }
                continue;
            }

            let len = blocks.blocks[dispatcher].instructions.len();
            self.switch_key_local = blocks.blocks[dispatcher].instructions[len - 4].local_index();

            if self.deobfuscate_dispatcher(blocks, dispatcher) {
                modified = true;
            }
        }
        modified
    }

    /// Finds dispatcher blocks, filling in their [`SwitchKind`] descriptors.
    fn find_dispatchers(&mut self, blocks: &mut MethodBlocks) -> Vec<BlockId> {
        let mut found = Vec::new();
        for id in 0..blocks.blocks.len() {
            if let Some(data) = self.match_dispatcher(&blocks.blocks[id]) {
                blocks.blocks[id].switch_data = data;
                found.push(id);
            }
        }
        found
    }

    fn match_dispatcher(&mut self, block: &crate::blocks::Block) -> Option<crate::blocks::SwitchData> {
        if !block.ends_with_switch() || block.targets.is_empty() {
            return None;
        }
        let instrs = &block.instructions;
        let len = instrs.len();
        if len < 4
            || !instrs[len - 4].is_stloc()
            || !instrs[len - 3].is_ldc_i4()
            || instrs[len - 2].op != Op::RemUn
        {
            return None;
        }

        if let Some(data) = self.match_native(instrs) {
            return Some(data);
        }
        Self::match_normal(instrs)
    }

    /// The native shape: an optional hardcoded key constant, a call to a static native
    /// `int32 (int32)` helper, then nothing but key-mixing instructions up to the switch.
    fn match_native(&mut self, instrs: &[Instruction]) -> Option<crate::blocks::SwitchData> {
        if instrs.len() <= 4 {
            return None;
        }
        let hardcoded = instrs[0].is_ldc_i4() && instrs[1].call_target().is_some();
        if !hardcoded && instrs[0].call_target().is_none() {
            return None;
        }
        let call_index = usize::from(hardcoded);
        let target = instrs[call_index].call_target()?;
        if !target.is_static || !target.is_native || target.signature != "System.Int32 (System.Int32)"
        {
            return None;
        }
        for instr in &instrs[call_index + 1..instrs.len() - 1] {
            if !instr.is_valid_instr() {
                return None;
            }
        }

        if !self.native_methods.contains(&target.token) {
            self.native_methods.push(target.token);
            self.events.record(EventKind::NativeHelperFound { method: target.token });
        }
        Some(crate::blocks::SwitchData {
            kind: Some(SwitchKind::Native { key_method: target.clone() }),
            key: if hardcoded { instrs[0].ldc_i4_value() } else { None },
            hardcoded_key: hardcoded,
        })
    }

    /// The normal shape: exactly `ldc.i4 K; xor; dup; stloc; ldc.i4 D; rem.un; switch`.
    fn match_normal(instrs: &[Instruction]) -> Option<crate::blocks::SwitchData> {
        if instrs.len() != 7 {
            return None;
        }
        let xor_key = instrs[0].ldc_i4_value()?;
        if instrs[1].op != Op::Xor || instrs[2].op != Op::Dup || !instrs[3].is_stloc() {
            return None;
        }
        let divisor = instrs[4].ldc_i4_value()?;
        if instrs[5].op != Op::RemUn {
            return None;
        }
        Some(crate::blocks::SwitchData {
            kind: Some(SwitchKind::Normal { xor_key, divisor }),
            key: None,
            hardcoded_key: false,
        })
    }

    /// Pops the raw dispatch value off the emulator and derives the concrete key.
    fn calculate_key(&mut self, kind: &SwitchKind) -> Result<i32> {
        let raw = match self.emulator.peek() {
            EmValue::Int32(v) if v.all_bits_valid() => {
                self.emulator.pop();
                v.bits as i32
            }
            _ => return Err(Error::UnknownValue),
        };
        match kind {
            SwitchKind::Native { key_method } => self.oracle.execute(key_method, raw),
            SwitchKind::Normal { xor_key, .. } => Ok(raw ^ xor_key),
        }
    }

    /// Derives the case index from a concrete key.
    fn calculate_case_index(
        &mut self,
        blocks: &MethodBlocks,
        dispatcher: BlockId,
        kind: &SwitchKind,
        key: i32,
    ) -> Result<usize> {
        let index = match kind {
            SwitchKind::Native { .. } => {
                let block = &blocks.blocks[dispatcher];
                let start = if block.switch_data.hardcoded_key { 2 } else { 1 };
                self.emulator.push(EmValue::known(key));
                self.emulator
                    .emulate(&block.instructions, start, block.instructions.len() - 1)?;
                match self.emulator.pop() {
                    EmValue::Int32(v) if v.all_bits_valid() => v.bits as i32,
                    _ => return Err(Error::UnknownValue),
                }
            }
            SwitchKind::Normal { divisor, .. } => key
                .checked_rem(*divisor)
                .ok_or_else(|| Error::MalformedPattern("zero switch divisor".into()))?,
        };

        let targets = blocks.blocks[dispatcher].targets.len();
        let index = usize::try_from(index).map_err(|_| Error::CaseOutOfRange {
            index: index as u32,
            targets,
        })?;
        if index >= targets {
            return Err(Error::CaseOutOfRange { index: index as u32, targets });
        }
        Ok(index)
    }

    /// Collapses a single-case dispatcher whose key is a leading constant load.
    fn process_hardcoded_switch(&mut self, blocks: &mut MethodBlocks, dispatcher: BlockId) -> Result<()> {
        let data = blocks.blocks[dispatcher].switch_data.clone();
        let kind = data.kind.ok_or_else(|| {
            Error::MalformedPattern("dispatcher without a detected shape".into())
        })?;
        let hardcoded = data
            .key
            .ok_or_else(|| Error::MalformedPattern("hardcoded dispatcher without a key".into()))?;

        self.emulator.initialize(&blocks.method_context(), true);
        self.emulator.push(EmValue::known(hardcoded));
        let key = self.calculate_key(&kind)?;
        let index = self.calculate_case_index(blocks, dispatcher, &kind, key)?;

        let target = blocks.blocks[dispatcher].targets[index];
        blocks.blocks[target].switch_data.key = Some(key);
        blocks.blocks[dispatcher].instructions.clear();
        blocks.blocks[dispatcher].replace_last_with_branch(target);
        self.events
            .record(EventKind::HardcodedSwitchResolved { block: dispatcher, target });
        Ok(())
    }

    /// Round-robins over the dispatcher's case blocks until none can make progress.
    ///
    /// A block whose resolution needs the propagated switch key is retried once another
    /// block has supplied it; the failure budget bounds the retries so an unresolvable
    /// graph terminates.
    fn deobfuscate_dispatcher(&mut self, blocks: &mut MethodBlocks, dispatcher: BlockId) -> bool {
        let case_blocks: Vec<BlockId> = (0..blocks.blocks.len())
            .filter(|&id| blocks.blocks[id].fallthrough == Some(dispatcher))
            .collect();
        self.emulator.initialize(&blocks.method_context(), true);

        let mut blocks_left = case_blocks.len();
        let mut cursor = 0usize;
        let mut failed = 0usize;
        let mut resolved = 0usize;

        while blocks_left > 0 {
            if cursor >= case_blocks.len() {
                cursor = 0;
            }
            if failed > case_blocks.len() {
                for &id in &case_blocks {
                    if !blocks.blocks[id].processed {
                        self.events.record(EventKind::SwitchSkipped { block: id });
                    }
                }
                break;
            }

            let case = case_blocks[cursor];
            if blocks.blocks[case].processed {
                cursor += 1;
                continue;
            }

            if self.needs_switch_key(&blocks.blocks[case]) {
                match blocks.blocks[case].switch_data.key {
                    Some(key) => self.set_switch_key(key),
                    None => {
                        failed += 1;
                        cursor += 1;
                        continue;
                    }
                }
            }

            let outcome = if blocks.is_ternary(case) {
                self.process_ternary_block(blocks, &case_blocks, case, dispatcher)
            } else {
                self.process_block(blocks, &case_blocks, case, dispatcher)
            };
            match outcome {
                Ok(()) => {
                    failed = 0;
                    resolved += 1;
                }
                Err(_) => {
                    self.events.record(EventKind::SwitchSkipped { block: case });
                    blocks.blocks[case].processed = true;
                }
            }
            blocks_left -= 1;
            cursor += 1;
        }

        resolved > 0
    }

    /// Resolves one plain case block into a direct branch.
    fn process_block(
        &mut self,
        blocks: &mut MethodBlocks,
        case_blocks: &[BlockId],
        case: BlockId,
        dispatcher: BlockId,
    ) -> Result<()> {
        let kind = self.dispatcher_kind(blocks, dispatcher)?;
        let instructions = blocks.blocks[case].instructions.clone();
        self.emulator.emulate(&instructions, 0, instructions.len())?;
        if self.emulator.peek().is_unknown() {
            return Err(Error::UnknownValue);
        }

        let key = self.calculate_key(&kind)?;
        let index = self.calculate_case_index(blocks, dispatcher, &kind, key)?;
        let target = blocks.blocks[dispatcher].targets[index];
        blocks.blocks[target].switch_data.key = Some(key);

        // The key arithmetic stays behind; the pop neutralizes its stack result
        blocks.blocks[case].instructions.push(Instruction::new(Op::Pop));
        blocks.blocks[case].replace_last_with_branch(target);
        blocks.blocks[case].processed = true;
        self.events.record(EventKind::SwitchResolved { block: case, target, key });

        self.process_fallthroughs(blocks, case_blocks, dispatcher, target, key);
        Ok(())
    }

    /// Resolves a merge block fed by the two constant arms of a ternary predicate.
    ///
    /// Each arm supplies its own dispatch value, so each is resolved and rewritten
    /// separately; the merge block keeps only a neutralizing pop.
    fn process_ternary_block(
        &mut self,
        blocks: &mut MethodBlocks,
        case_blocks: &[BlockId],
        ternary: BlockId,
        dispatcher: BlockId,
    ) -> Result<()> {
        let kind = self.dispatcher_kind(blocks, dispatcher)?;
        let arms = blocks.sources_of(ternary);
        let ternary_instrs = blocks.blocks[ternary].instructions.clone();
        let old_key = blocks.blocks[ternary].switch_data.key;

        for &arm in &arms {
            if let Some(key) = old_key {
                self.set_switch_key(key);
            }

            let arm_instrs = blocks.blocks[arm].instructions.clone();
            self.emulator.emulate(&arm_instrs, 0, arm_instrs.len())?;
            self.emulator.emulate(&ternary_instrs, 0, ternary_instrs.len())?;
            if self.emulator.peek().is_unknown() {
                return Err(Error::UnknownValue);
            }

            let key = self.calculate_key(&kind)?;
            let index = self.calculate_case_index(blocks, dispatcher, &kind, key)?;
            let target = blocks.blocks[dispatcher].targets[index];
            blocks.blocks[target].switch_data.key = Some(key);

            let last = blocks.blocks[arm].instructions.len() - 1;
            blocks.blocks[arm].instructions[last] = Instruction::new(Op::Pop);
            blocks.blocks[arm].replace_last_with_branch(target);
            self.events.record(EventKind::SwitchResolved { block: arm, target, key });

            self.process_fallthroughs(blocks, case_blocks, dispatcher, target, key);
        }

        blocks.blocks[ternary].instructions.push(Instruction::new(Op::Pop));
        blocks.blocks[ternary].processed = true;
        Ok(())
    }

    fn dispatcher_kind(&self, blocks: &MethodBlocks, dispatcher: BlockId) -> Result<SwitchKind> {
        blocks.blocks[dispatcher]
            .switch_data
            .kind
            .clone()
            .ok_or_else(|| Error::MalformedPattern("dispatcher without a detected shape".into()))
    }

    /// Pushes the discovered key into every case block reachable along fallthrough
    /// chains and nested branch targets. Depth-first with a per-call visited set, so
    /// cycles back to the dispatcher terminate.
    fn process_fallthroughs(
        &mut self,
        blocks: &mut MethodBlocks,
        case_blocks: &[BlockId],
        dispatcher: BlockId,
        target: BlockId,
        key: i32,
    ) {
        let mut visited = HashSet::new();
        self.propagate_key(blocks, case_blocks, dispatcher, target, key, &mut visited);
    }

    fn propagate_key(
        &mut self,
        blocks: &mut MethodBlocks,
        case_blocks: &[BlockId],
        dispatcher: BlockId,
        target: BlockId,
        key: i32,
        visited: &mut HashSet<BlockId>,
    ) {
        if !visited.insert(target) {
            return;
        }

        if blocks.blocks[target].fallthrough == Some(dispatcher)
            && case_blocks.contains(&target)
            && blocks.blocks[target].switch_data.key.is_none()
        {
            blocks.blocks[target].switch_data.key = Some(key);
        }

        let Some(fallthrough) = blocks.blocks[target].fallthrough else {
            return;
        };
        if !blocks.blocks[fallthrough].ends_with_ret() && fallthrough != dispatcher {
            self.propagate_key(blocks, case_blocks, dispatcher, fallthrough, key, visited);
        }

        if blocks.blocks[target].count_targets() > 1 {
            for branch_target in blocks.blocks[target].targets.clone() {
                if branch_target == dispatcher {
                    return;
                }
                self.propagate_key(blocks, case_blocks, dispatcher, branch_target, key, visited);
            }
        }
    }

    fn needs_switch_key(&self, block: &crate::blocks::Block) -> bool {
        let Some(slot) = self.switch_key_local else {
            return false;
        };
        block
            .instructions
            .iter()
            .any(|i| i.is_ldloc() && i.local_index() == Some(slot))
    }

    fn set_switch_key(&mut self, key: i32) {
        if let Some(slot) = self.switch_key_local {
            self.emulator.set_local(usize::from(slot), EmValue::known(key));
        }
    }
}

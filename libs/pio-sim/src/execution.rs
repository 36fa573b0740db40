//! Instruction execution and scheduling.
//!
//! Every run function returns `true` when the instruction completed its core
//! operation this tick. A `false` return is a stall, not an error: the PC is
//! left alone and the scheduler re-enters the same instruction on the SM's
//! next turn, with any partial progress preserved on the SM.

use crate::fifo::FifoState;
use crate::hardware::{NUM_GPIOS, NUM_PIOS, NUM_SMS, NUM_USER_PROCESSORS};
use crate::instruction::{
    DataOp, Destination, Instruction, InstructionOp, JmpCondition, MovOperation, Source,
    UserInstruction, UserOp, WaitSource, DATA_MAX,
};
use crate::Simulator;

/// Copy the n lowest (shift right) or highest (shift left) bits out of
/// `source`, right-aligned, then shift `source` by n in that direction.
fn copy_n_then_shift(shift_right: bool, source: &mut u32, n: u8) -> u32 {
    if n >= 32 {
        let bits = *source;
        *source = 0;
        return bits;
    }
    let n = n as u32;
    let bits = if shift_right { *source & (!0u32 >> (32 - n)) } else { *source >> (32 - n) };
    *source = if shift_right { *source >> n } else { *source << n };
    bits
}

/// Shift `destination` by n to make room, then copy the n lowest bits of
/// `source` into the gap this leaves. The bit order of the input does not
/// depend on the shift direction.
fn shift_n_then_copy(shift_right: bool, source: u32, destination: &mut u32, n: u8) {
    if n >= 32 {
        *destination = source;
        return;
    }
    let n = n as u32;
    let bits = source & (!0u32 >> (32 - n));
    *destination = if shift_right {
        (*destination >> n) | (bits << (32 - n))
    } else {
        (*destination << n) | bits
    };
}

impl Simulator {
    // ------------------------------------------------------------------
    // scheduling
    // ------------------------------------------------------------------

    fn sm_runnable(&self, flat: usize) -> bool {
        let sm = self.hw.sm_flat(flat);
        let pio = &self.hw.pios[sm.pio_index];
        sm.pc >= 0
            && (sm.pc as usize) < pio.instructions.len()
            && !pio.instructions[sm.pc as usize].is_empty()
    }

    fn up_runnable(&self, index: usize) -> bool {
        let up = &self.hw.user_processors[index];
        up.pc >= 0
            && (up.pc as usize) < up.instructions.len()
            && !up.instructions[up.pc as usize].is_empty()
    }

    /// Next SM with work, round robin from the cursor.
    fn peek_sm(&self) -> Option<usize> {
        (0..NUM_PIOS * NUM_SMS)
            .map(|i| (self.sm_cursor + i) % (NUM_PIOS * NUM_SMS))
            .find(|&flat| self.sm_runnable(flat))
    }

    fn peek_up(&self) -> Option<usize> {
        (0..NUM_USER_PROCESSORS)
            .map(|i| (self.up_cursor + i) % NUM_USER_PROCESSORS)
            .find(|&u| self.up_runnable(u))
    }

    fn sm_line(&self, flat: usize) -> i32 {
        let sm = self.hw.sm_flat(flat);
        self.hw.pios[sm.pio_index].instructions[sm.pc as usize].line
    }

    fn up_line(&self, index: usize) -> i32 {
        let up = &self.hw.user_processors[index];
        up.instructions[up.pc as usize].line
    }

    /// Line of the instruction the next `step` will execute, -1 if nothing is
    /// runnable. User processors are reported first, matching the scheduler's
    /// initial preference.
    pub fn first_instruction_line(&self) -> i32 {
        self.peek_up()
            .map(|u| self.up_line(u))
            .or_else(|| self.peek_sm().map(|f| self.sm_line(f)))
            .unwrap_or(-1)
    }

    /// Execute one tick and return the source line of the instruction that
    /// will run next (the last-executed line when nothing remains runnable).
    pub fn step(&mut self) -> i32 {
        self.step_inner().0
    }

    fn step_inner(&mut self) -> (i32, bool) {
        if self.exited {
            return (self.last_line, false);
        }
        let user = self.peek_up();
        let smi = self.peek_sm();
        if user.is_none() && smi.is_none() {
            return (self.last_line, false);
        }
        // alternate which source goes first so each side gets a fair share
        let use_user = (self.try_user_first && user.is_some())
            || (!self.try_user_first && smi.is_none());
        let completed = if use_user {
            let u = match user {
                Some(u) => u,
                None => return (self.last_line, false),
            };
            let hold = {
                let up = &self.hw.user_processors[u];
                let instr = &up.instructions[up.pc as usize];
                // continue holds only while the instruction is mid-delay, not
                // on a tick that can complete it
                let delay_left = if up.in_delay_state {
                    up.delay_left
                } else if !up.delay_completed {
                    instr.delay
                } else {
                    0
                };
                instr.continue_user && instr.delay > 0 && delay_left > 1
            };
            let completed = self.run_user_tick(u);
            if hold && !self.exited {
                // a scripted transaction stays on this processor, uninterleaved
                self.up_cursor = u;
                self.try_user_first = true;
            } else {
                self.up_cursor = (u + 1) % NUM_USER_PROCESSORS;
                self.try_user_first = false;
            }
            completed
        } else {
            let flat = match smi {
                Some(f) => f,
                None => return (self.last_line, false),
            };
            let completed = self.run_sm_tick(flat);
            self.hw.sm_flat_mut(flat).clock_tick += 1;
            self.sm_cursor = (flat + 1) % (NUM_PIOS * NUM_SMS);
            self.try_user_first = true;
            completed
        };
        if completed {
            self.total_ticks += 1;
            let levels: [bool; NUM_GPIOS] = std::array::from_fn(|i| self.hw.gpios[i].level);
            self.history.record(levels, self.total_ticks);
            for dev in self.devices.iter_mut() {
                if dev.enabled {
                    dev.device.run(&mut self.hw);
                }
            }
        }
        let next = {
            let ul = self.peek_up().map(|u| self.up_line(u));
            let sl = self.peek_sm().map(|f| self.sm_line(f));
            if self.try_user_first { ul.or(sl) } else { sl.or(ul) }
        };
        if let Some(line) = next {
            self.last_line = line;
        }
        (self.last_line, true)
    }

    /// Step until the next runnable line carries a breakpoint, EXIT fires, or
    /// nothing is left to run. Always executes at least one tick.
    pub fn run_until_breakpoint(&mut self) -> i32 {
        self.run_until_breakpoint_with(|| false)
    }

    /// As `run_until_breakpoint`, polling `break_check` after every tick so
    /// the controller can abort a runaway program.
    pub fn run_until_breakpoint_with(&mut self, mut break_check: impl FnMut() -> bool) -> i32 {
        loop {
            let (line, worked) = self.step_inner();
            if !worked || self.exited || self.is_breakpoint(line) || break_check() {
                return line;
            }
        }
    }

    pub fn simulation_exited(&self) -> bool {
        self.exited
    }

    /// Completed instructions so far, the clock used to stamp GPIO history.
    pub fn total_ticks(&self) -> u64 {
        self.total_ticks
    }

    // ------------------------------------------------------------------
    // one SM tick
    // ------------------------------------------------------------------

    fn run_sm_tick(&mut self, flat: usize) -> bool {
        let (p, s) = (flat / NUM_SMS, flat % NUM_SMS);
        let pc = self.hw.sm_flat(flat).pc as usize;
        let instr = self.hw.pios[p].instructions[pc].clone();
        // while an EXEC payload is attached, the delay state belongs to the
        // payload and the outer OUT/MOV handler steps it
        let outer_delay =
            self.hw.sm(p, s).in_delay_state && self.hw.sm(p, s).exec_instruction.is_none();
        let completed = if outer_delay {
            let sm = self.hw.sm_mut(p, s);
            if sm.delay_left > 0 {
                sm.delay_left -= 1;
                false
            } else {
                sm.in_delay_state = false;
                true
            }
        } else if self.run_core(p, s, &instr) {
            self.finish_instruction(p, s, &instr)
        } else {
            false
        };
        if completed {
            self.advance_pc(p, s);
        }
        completed
    }

    fn run_core(&mut self, p: usize, s: usize, instr: &Instruction) -> bool {
        match &instr.op {
            InstructionOp::Jmp { condition, target } => {
                self.run_jmp(p, s, instr, *condition, *target)
            }
            InstructionOp::Wait { polarity, source, index } => {
                self.run_wait(p, s, instr, *polarity, *source, *index)
            }
            InstructionOp::Nop => true,
            InstructionOp::In { source, bit_count } => {
                self.run_in(p, s, instr, *source, *bit_count)
            }
            InstructionOp::Out { destination, bit_count } => {
                self.run_out(p, s, instr, *destination, *bit_count)
            }
            InstructionOp::Push { if_full, block } => self.run_push(p, s, *if_full, *block),
            InstructionOp::Pull { if_empty, block } => self.run_pull(p, s, *if_empty, *block),
            InstructionOp::Mov { destination, operation, source } => {
                self.run_mov(p, s, instr, *destination, *operation, *source)
            }
            InstructionOp::Set { destination, value } => {
                self.run_set(p, s, instr, *destination, *value)
            }
            InstructionOp::Irq { clear, wait, index } => {
                self.run_irq(instr, *clear, *wait, *index)
            }
            InstructionOp::Empty => true,
        }
    }

    /// Side-set plus delay, on the tick the core operation completed. Returns
    /// whether the instruction is done or has entered its delay state.
    fn finish_instruction(&mut self, p: usize, s: usize, instr: &Instruction) -> bool {
        self.apply_side_set(p, s, instr);
        if instr.delay > 0 {
            let sm = self.hw.sm_mut(p, s);
            sm.in_delay_state = true;
            sm.delay_left = instr.delay - 1;
            false
        } else {
            true
        }
    }

    fn apply_side_set(&mut self, p: usize, s: usize, instr: &Instruction) {
        let cfg = self.hw.sm(p, s).cfg.clone();
        let value = match instr.side_set {
            Some(v) => v,
            None => {
                if !cfg.side_set_optional && cfg.side_set_count > 0 {
                    log::warn!(
                        "line {}: side set is not optional and no value given, assuming zero",
                        instr.line
                    );
                    0
                } else {
                    return;
                }
            }
        };
        let mut value = value as u32;
        for i in 0..cfg.side_set_pins_num {
            let pin = ((cfg.side_set_pins_base + i) as usize) % NUM_GPIOS;
            if cfg.side_set_pindirs {
                self.hw.set_gpio_dir(pin, value & 1 != 0);
            } else {
                self.hw.set_gpio(pin, value & 1 != 0);
            }
            value >>= 1;
        }
    }

    fn advance_pc(&mut self, p: usize, s: usize) {
        let sm = self.hw.sm_mut(p, s);
        sm.pc = match sm.next_pc.take() {
            Some(target) => target,
            None => {
                if sm.cfg.wrap_source >= 0 && sm.pc == sm.cfg.wrap_source {
                    sm.cfg.wrap_target
                } else {
                    sm.pc + 1
                }
            }
        };
    }

    // ------------------------------------------------------------------
    // PIO instructions
    // ------------------------------------------------------------------

    fn run_jmp(
        &mut self,
        p: usize,
        s: usize,
        instr: &Instruction,
        condition: JmpCondition,
        target: Option<u8>,
    ) -> bool {
        let pin_condition = {
            let cfg = &self.hw.sm(p, s).cfg;
            cfg.pin_condition.map(|pin| self.hw.get_gpio(pin as usize))
        };
        let sm = self.hw.sm_mut(p, s);
        let target = match target {
            Some(t) => t as i32,
            None => {
                log::warn!("line {}: jmp target unresolved, falling through", instr.line);
                sm.next_pc = Some(sm.pc + 1);
                return true;
            }
        };
        let branch = match condition {
            JmpCondition::Always => true,
            JmpCondition::XZero => sm.scratch_x == 0,
            JmpCondition::YZero => sm.scratch_y == 0,
            // branch while the pre-decrement value is non-zero
            JmpCondition::XDecrement => {
                if sm.scratch_x != 0 {
                    sm.scratch_x -= 1;
                    true
                } else {
                    false
                }
            }
            JmpCondition::YDecrement => {
                if sm.scratch_y != 0 {
                    sm.scratch_y -= 1;
                    true
                } else {
                    false
                }
            }
            JmpCondition::XNotEqualY => sm.scratch_x != sm.scratch_y,
            JmpCondition::PinCondition => match pin_condition {
                Some(level) => level,
                None => {
                    log::warn!("line {}: jmp pin used but no pin configured", instr.line);
                    false
                }
            },
            JmpCondition::NotOsre => sm.shift_out_count < sm.cfg.pull_threshold_effective(),
        };
        sm.next_pc = Some(if branch { target } else { sm.pc + 1 });
        log::trace!(
            "line {}: jmp {} to {}",
            instr.line,
            if branch { "taken" } else { "not taken" },
            if branch { target } else { sm.pc + 1 }
        );
        true
    }

    fn run_wait(
        &mut self,
        p: usize,
        s: usize,
        instr: &Instruction,
        polarity: bool,
        source: WaitSource,
        index: u8,
    ) -> bool {
        match source {
            WaitSource::Gpio => self.hw.get_gpio(index as usize) == polarity,
            WaitSource::Pin => {
                let base = self.hw.sm(p, s).cfg.in_pins_base;
                let pin = ((index + base) as usize) % NUM_GPIOS;
                self.hw.get_gpio(pin) == polarity
            }
            WaitSource::Irq => {
                let set = self.hw.irq_flag_is_set(index as usize);
                let matched = set == polarity;
                if matched && polarity && self.hw.wait_irq_clears_flag {
                    self.hw.irq_flag_set(index as usize, false);
                }
                matched
            }
            WaitSource::Reserved => {
                log::warn!("line {}: reserved wait source, treated as nop", instr.line);
                true
            }
        }
    }

    fn run_in(
        &mut self,
        p: usize,
        s: usize,
        instr: &Instruction,
        source: Source,
        bit_count: u8,
    ) -> bool {
        let (in_base, shift_right, autopush, threshold) = {
            let cfg = &self.hw.sm(p, s).cfg;
            (cfg.in_pins_base, cfg.in_shift_right, cfg.autopush, cfg.push_threshold_effective())
        };
        // a stalled autopush means the bits are already in the ISR
        let resuming = self.hw.sm(p, s).shift_in_resume_count > 0;
        if !resuming {
            let value = match source {
                Source::Pins => {
                    let mut v = 0u32;
                    for n in 0..bit_count {
                        let pin = ((in_base as usize) + n as usize) % NUM_GPIOS;
                        if self.hw.get_gpio(pin) {
                            v |= 1 << n;
                        }
                    }
                    v
                }
                Source::X => self.hw.sm(p, s).scratch_x,
                Source::Y => self.hw.sm(p, s).scratch_y,
                Source::Null => 0,
                // the shift sources are snapshots taken before the ISR moves
                Source::Isr => self.hw.sm(p, s).isr,
                Source::Osr => self.hw.sm(p, s).osr,
                Source::Status | Source::Reserved => {
                    log::warn!("line {}: invalid source for in, treated as nop", instr.line);
                    return true;
                }
            };
            let sm = self.hw.sm_mut(p, s);
            shift_n_then_copy(shift_right, value, &mut sm.isr, bit_count);
            log::debug!("line {}: shifted {} bits into isr, now {:08X}", instr.line, bit_count, sm.isr);
            sm.shift_in_count = (sm.shift_in_count + bit_count).min(32);
            if sm.shift_in_count >= threshold {
                sm.isr_full = true;
            }
        }
        let sm = self.hw.sm_mut(p, s);
        if sm.isr_full && autopush {
            if sm.fifo.rx_state == FifoState::Full {
                log::debug!("line {}: autopush stalled, rx full", instr.line);
                sm.shift_in_resume_count = bit_count;
                return false;
            }
            let isr = sm.isr;
            sm.fifo.push(isr);
            sm.isr = 0;
            sm.shift_in_count = 0;
            sm.isr_full = false;
            sm.shift_in_resume_count = 0;
        }
        true
    }

    fn run_out(
        &mut self,
        p: usize,
        s: usize,
        instr: &Instruction,
        destination: Destination,
        bit_count: u8,
    ) -> bool {
        // a non-zero resume count means the bits already left the OSR and an
        // EXEC payload is still in flight; step it instead of re-shifting
        if self.hw.sm(p, s).shift_out_resume_count > 0
            && self.hw.sm(p, s).exec_instruction.is_some()
        {
            return self.step_exec_slot(p, s);
        }
        let (out_base, shift_right, autopull, threshold) = {
            let cfg = &self.hw.sm(p, s).cfg;
            (cfg.out_pins_base, cfg.out_shift_right, cfg.autopull, cfg.pull_threshold_effective())
        };
        {
            let sm = self.hw.sm_mut(p, s);
            if sm.osr_empty {
                if !autopull {
                    log::debug!("line {}: out waiting, osr empty and no autopull", instr.line);
                    return false;
                }
                if sm.fifo.tx_state == FifoState::Empty {
                    log::debug!("line {}: autopull stalled, tx empty", instr.line);
                    return false;
                }
                if let Some(v) = sm.fifo.pull() {
                    sm.osr = v;
                }
                sm.shift_out_count = 0;
                sm.shift_out_resume_count = 0;
                sm.osr_empty = false;
            }
        }
        let nbits = {
            let sm = self.hw.sm_mut(p, s);
            let nbits = copy_n_then_shift(shift_right, &mut sm.osr, bit_count);
            sm.shift_out_count = (sm.shift_out_count + bit_count).min(32);
            if sm.shift_out_count >= threshold {
                sm.osr_empty = true;
            }
            nbits
        };
        log::debug!("line {}: out {} bits = {:08X}", instr.line, bit_count, nbits);
        match destination {
            Destination::Pins => {
                for n in 0..bit_count {
                    let pin = ((out_base as usize) + n as usize) % NUM_GPIOS;
                    self.hw.set_gpio(pin, nbits & (1 << n) != 0);
                }
            }
            Destination::PinDirs => {
                for n in 0..bit_count {
                    let pin = ((out_base as usize) + n as usize) % NUM_GPIOS;
                    self.hw.set_gpio_dir(pin, nbits & (1 << n) != 0);
                }
            }
            Destination::X => self.hw.sm_mut(p, s).scratch_x = nbits,
            Destination::Y => self.hw.sm_mut(p, s).scratch_y = nbits,
            Destination::Null => {}
            Destination::Isr => self.hw.sm_mut(p, s).isr = nbits,
            Destination::Pc => {
                // defer the redirect until the bits are accounted for
                let program_len = self.hw.pios[p].instructions.len() as u32;
                let sm = self.hw.sm_mut(p, s);
                sm.pc_temp = nbits;
                if sm.pc_temp < program_len {
                    sm.next_pc = Some(sm.pc_temp as i32);
                } else {
                    log::warn!(
                        "line {}: no instruction at pc {}, ignoring",
                        instr.line,
                        sm.pc_temp
                    );
                }
            }
            Destination::Exec => {
                self.hw.sm_mut(p, s).exec_machine_instruction = nbits as u16;
                self.hw.sm_mut(p, s).shift_out_resume_count = bit_count;
                return self.start_exec_slot(p, s);
            }
            Destination::Osr | Destination::Reserved => {
                log::warn!("line {}: invalid destination for out, treated as nop", instr.line);
            }
        }
        true
    }

    fn run_push(&mut self, p: usize, s: usize, if_full: bool, block: bool) -> bool {
        let sm = self.hw.sm_mut(p, s);
        if if_full && !sm.isr_full {
            log::debug!("push does nothing, isr below threshold with iffull");
            return true;
        }
        if sm.fifo.rx_state == FifoState::Full {
            if block {
                log::debug!("push blocked, rx full");
                return false;
            }
            log::debug!("push dropped, rx full");
            return true;
        }
        let isr = sm.isr;
        sm.fifo.push(isr);
        sm.isr = 0;
        sm.shift_in_count = 0;
        sm.isr_full = false;
        true
    }

    fn run_pull(&mut self, p: usize, s: usize, if_empty: bool, block: bool) -> bool {
        let sm = self.hw.sm_mut(p, s);
        if if_empty && !sm.osr_empty {
            log::debug!("pull does nothing, osr not empty with ifempty");
            return true;
        }
        if sm.fifo.tx_state == FifoState::Empty {
            if block {
                log::debug!("pull blocked, tx empty");
                return false;
            }
            // documented fallback: a non-blocking pull from nothing copies X
            sm.osr = sm.scratch_x;
            sm.shift_out_count = 0;
            sm.shift_out_resume_count = 0;
            sm.osr_empty = false;
            return true;
        }
        if let Some(v) = sm.fifo.pull() {
            sm.osr = v;
        }
        sm.shift_out_count = 0;
        sm.shift_out_resume_count = 0;
        sm.osr_empty = false;
        true
    }

    fn run_mov(
        &mut self,
        p: usize,
        s: usize,
        instr: &Instruction,
        destination: Destination,
        operation: MovOperation,
        source: Source,
    ) -> bool {
        // re-entry with an attached EXEC payload: the move already happened
        if self.hw.sm(p, s).exec_instruction.is_some() {
            return self.step_exec_slot(p, s);
        }
        let value = match source {
            Source::Pins => {
                // always 32 consecutive pins from the in base, wrapping at 31
                let base = self.hw.sm(p, s).cfg.in_pins_base as usize;
                let mut v = 0u32;
                for i in 0..32 {
                    if self.hw.get_gpio((base + i) % NUM_GPIOS) {
                        v |= 1 << i;
                    }
                }
                v
            }
            Source::X => self.hw.sm(p, s).scratch_x,
            Source::Y => self.hw.sm(p, s).scratch_y,
            Source::Null => 0,
            Source::Status => self.hw.sm(p, s).fifo.status,
            Source::Isr => self.hw.sm(p, s).isr,
            Source::Osr => self.hw.sm(p, s).osr,
            Source::Reserved => {
                log::warn!("line {}: invalid source for mov, treated as nop", instr.line);
                return true;
            }
        };
        let value = match operation {
            MovOperation::None => value,
            MovOperation::Invert => !value,
            MovOperation::BitReverse => value.reverse_bits(),
            MovOperation::Reserved => {
                log::warn!("line {}: reserved mov operation, treated as nop", instr.line);
                return true;
            }
        };
        match destination {
            Destination::Pins => {
                let (base, num) = {
                    let cfg = &self.hw.sm(p, s).cfg;
                    (cfg.out_pins_base as usize, cfg.out_pins_num)
                };
                for i in 0..num {
                    self.hw.set_gpio((base + i as usize) % NUM_GPIOS, value & (1 << i) != 0);
                }
            }
            Destination::X => self.hw.sm_mut(p, s).scratch_x = value,
            Destination::Y => self.hw.sm_mut(p, s).scratch_y = value,
            Destination::Isr => self.hw.sm_mut(p, s).isr = value,
            Destination::Osr => self.hw.sm_mut(p, s).osr = value,
            Destination::Pc => {
                self.hw.sm_mut(p, s).next_pc = Some(value as i32);
            }
            Destination::Exec => {
                self.hw.sm_mut(p, s).exec_machine_instruction = value as u16;
                return self.start_exec_slot(p, s);
            }
            Destination::Null | Destination::PinDirs | Destination::Reserved => {
                log::warn!("line {}: invalid destination for mov, treated as nop", instr.line);
            }
        }
        true
    }

    fn run_set(
        &mut self,
        p: usize,
        s: usize,
        instr: &Instruction,
        destination: Destination,
        value: u8,
    ) -> bool {
        let (base, num) = {
            let cfg = &self.hw.sm(p, s).cfg;
            (cfg.set_pins_base as usize, cfg.set_pins_num)
        };
        match destination {
            Destination::Pins => {
                for i in 0..num {
                    self.hw.set_gpio((base + i as usize) % NUM_GPIOS, value & (1 << i) != 0);
                }
            }
            Destination::PinDirs => {
                for i in 0..num {
                    self.hw.set_gpio_dir((base + i as usize) % NUM_GPIOS, value & (1 << i) != 0);
                }
            }
            Destination::X => self.hw.sm_mut(p, s).scratch_x = value as u32,
            Destination::Y => self.hw.sm_mut(p, s).scratch_y = value as u32,
            _ => {
                log::warn!("line {}: invalid destination for set, treated as nop", instr.line);
            }
        }
        true
    }

    fn run_irq(&mut self, instr: &Instruction, clear: bool, wait: bool, index: u8) -> bool {
        // TODO: when wait is set, stall until a consumer clears the flag
        let _ = wait;
        log::debug!(
            "line {}: {} irq {}",
            instr.line,
            if clear { "clearing" } else { "setting" },
            index
        );
        self.hw.irq_flag_set(index as usize, !clear);
        true
    }

    // ------------------------------------------------------------------
    // EXEC payloads
    // ------------------------------------------------------------------

    /// Decode the word latched in the EXEC buffer and give it its first tick.
    /// The payload stays attached to the SM between ticks until it completes;
    /// the outer instruction's completion tracks it.
    fn start_exec_slot(&mut self, p: usize, s: usize) -> bool {
        let (word, ssc) = {
            let sm = self.hw.sm(p, s);
            (sm.exec_machine_instruction, sm.cfg.side_set_count)
        };
        log::debug!("decoding exec payload {:#06X}", word);
        let decoded = Instruction::decode(word, ssc);
        self.hw.sm_mut(p, s).exec_instruction = Some(decoded);
        self.step_exec_slot(p, s)
    }

    /// One tick of the pending EXEC payload. Recursion is one level deep: a
    /// payload may not itself target EXEC. The payload is detached while it
    /// runs so its own OUT/MOV handling does not re-enter this path.
    fn step_exec_slot(&mut self, p: usize, s: usize) -> bool {
        let inner = match self.hw.sm_mut(p, s).exec_instruction.take() {
            Some(instr) => instr,
            None => return true,
        };
        if matches!(
            inner.op,
            InstructionOp::Out { destination: Destination::Exec, .. }
                | InstructionOp::Mov { destination: Destination::Exec, .. }
        ) {
            log::warn!("exec payload may not itself target exec, treated as nop");
            self.hw.sm_mut(p, s).shift_out_resume_count = 0;
            return true;
        }
        let done = if self.hw.sm(p, s).in_delay_state {
            let sm = self.hw.sm_mut(p, s);
            if sm.delay_left > 0 {
                sm.delay_left -= 1;
                false
            } else {
                sm.in_delay_state = false;
                true
            }
        } else if self.run_core(p, s, &inner) {
            self.finish_instruction(p, s, &inner)
        } else {
            false
        };
        let sm = self.hw.sm_mut(p, s);
        if done {
            sm.shift_out_resume_count = 0;
        } else {
            sm.exec_instruction = Some(inner);
        }
        done
    }

    // ------------------------------------------------------------------
    // user instructions
    // ------------------------------------------------------------------

    fn run_user_tick(&mut self, u: usize) -> bool {
        let pc = self.hw.user_processors[u].pc as usize;
        let instr = self.hw.user_processors[u].instructions[pc].clone();
        {
            // user instructions delay before the operation, not after
            let up = &mut self.hw.user_processors[u];
            if instr.delay > 0 && !up.delay_completed {
                if !up.in_delay_state {
                    up.in_delay_state = true;
                    up.delay_left = instr.delay;
                    log::debug!("line {}: user delay of {} ticks", instr.line, instr.delay);
                    return false;
                }
                up.delay_left -= 1;
                if up.delay_left == 0 {
                    up.in_delay_state = false;
                    up.delay_completed = true;
                } else {
                    return false;
                }
            }
        }
        let completed = match &instr.op {
            UserOp::Write { value } => self.user_write(&instr, *value),
            UserOp::Read { var } => self.user_read(&instr, var),
            UserOp::Print { var } => {
                match self.symbols.var_get(var) {
                    Some(v) => log::info!("{} = {:08X}", var, v),
                    None => log::warn!("unable to print {}, variable not defined", var),
                }
                true
            }
            UserOp::Pin { pin, set_high } => {
                log::debug!("line {}: user sets pin {} to {}", instr.line, pin, set_high);
                self.hw.set_gpio(*pin as usize, *set_high);
                true
            }
            UserOp::Data { op } => self.user_data(u, &instr, op),
            UserOp::Repeat => true,
            UserOp::Exit => {
                log::info!("program has exited, simulation stopped");
                self.exited = true;
                true
            }
            UserOp::Empty => true,
        };
        if completed {
            let up = &mut self.hw.user_processors[u];
            up.in_delay_state = false;
            up.delay_completed = false;
            up.delay_left = 0;
            up.data_index = 0;
            up.pc = if matches!(instr.op, UserOp::Repeat) { 0 } else { up.pc + 1 };
        }
        completed
    }

    fn user_write(&mut self, instr: &UserInstruction, value: u32) -> bool {
        let sm = self.hw.sm_mut(instr.target_pio, instr.target_sm);
        if sm.fifo.tx_state == FifoState::Full {
            log::debug!("line {}: user write waiting, tx full", instr.line);
            return false;
        }
        sm.fifo.write(value);
        true
    }

    fn user_read(&mut self, instr: &UserInstruction, var: &str) -> bool {
        let value = {
            let sm = self.hw.sm_mut(instr.target_pio, instr.target_sm);
            if sm.fifo.rx_state == FifoState::Empty {
                log::debug!("line {}: user read waiting, rx empty", instr.line);
                return false;
            }
            sm.fifo.read()
        };
        if let Some(v) = value {
            if !self.symbols.var_set(var, v) {
                log::warn!("unable to set {} to {:08X}", var, v);
            }
        }
        true
    }

    fn user_data(&mut self, u: usize, instr: &UserInstruction, op: &DataOp) -> bool {
        match op {
            DataOp::Write => {
                let byte = {
                    let up = &self.hw.user_processors[u];
                    if up.data_index >= up.data.len() {
                        return true;
                    }
                    up.data[up.data_index]
                };
                {
                    let sm = self.hw.sm_mut(instr.target_pio, instr.target_sm);
                    if sm.fifo.tx_state == FifoState::Full {
                        return false;
                    }
                    sm.fifo.write(byte as u32);
                }
                let up = &mut self.hw.user_processors[u];
                up.data_index += 1;
                up.data_index == up.data.len()
            }
            DataOp::Read { max } => match self.user_data_read(u, instr) {
                Some(len) => len >= *max || len >= DATA_MAX,
                None => false,
            },
            DataOp::ReadLn => match self.user_data_read(u, instr) {
                Some(len) => {
                    let up = &self.hw.user_processors[u];
                    up.data.last() == Some(&b'.') || len >= DATA_MAX
                }
                None => false,
            },
            DataOp::Print => {
                let up = &self.hw.user_processors[u];
                log::info!("{}", String::from_utf8_lossy(&up.data));
                true
            }
            DataOp::Set { bytes } => {
                let up = &mut self.hw.user_processors[u];
                up.data = bytes.as_bytes().to_vec();
                up.data.truncate(DATA_MAX);
                true
            }
            DataOp::Clear => {
                let up = &mut self.hw.user_processors[u];
                up.data.clear();
                up.data_index = 0;
                true
            }
        }
    }

    /// Pull one word from the target RX FIFO into the data buffer. Returns
    /// the new buffer length, or `None` when the FIFO had nothing.
    fn user_data_read(&mut self, u: usize, instr: &UserInstruction) -> Option<usize> {
        let value = {
            let sm = self.hw.sm_mut(instr.target_pio, instr.target_sm);
            if sm.fifo.rx_state == FifoState::Empty {
                log::debug!("line {}: waiting on rx data", instr.line);
                return None;
            }
            sm.fifo.read()
        };
        let up = &mut self.hw.user_processors[u];
        if let Some(v) = value {
            if up.data.len() < DATA_MAX {
                up.data.push(v as u8);
            }
            up.data_index += 1;
        }
        Some(up.data.len())
    }
}

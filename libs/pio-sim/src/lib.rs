//! Cycle-accurate simulator core for an RP2040-style PIO block.
//!
//! Two PIO blocks of four state machines run decoded PIO programs one
//! cooperative tick at a time, alongside up to two "user processors" that
//! script the host side of a transaction (FIFO traffic, pin pokes, delays).
//! The controller owns a [`Simulator`], feeds it decoded programs (or
//! assembled [`pio::Program`]s), and drives it through `step` /
//! `run_until_breakpoint`, observing state through the change tracker and the
//! GPIO history.
//!
//! The parser that produces instruction tables and the terminal UI live
//! outside this crate; so do concrete peripherals, which plug in through the
//! [`Device`] trait.

use pio::RP2040_MAX_PROGRAM_SIZE;

pub mod changed;
mod execution;
pub mod fifo;
pub mod hardware;
pub mod instruction;

pub use changed::{
    ChangeTracker, GpioChanged, GpioHistory, GpioHistoryEntry, HardwareChanged, SmChanged,
    GPIO_HISTORY_DEPTH,
};
pub use fifo::{Fifo, FifoCompare, FifoMode, FifoState, TOTAL_FIFO_SIZE_PER_SM};
pub use hardware::{
    Device, Gpio, Hardware, IrqFlag, Pio, RegisteredDevice, Sm, SmConfig, UserProcessor,
    MAX_DEVICES, NUM_GPIOS, NUM_IRQS, NUM_IRQ_FLAGS, NUM_PIOS, NUM_SMS, NUM_USER_PROCESSORS,
};
pub use instruction::{
    DataOp, Define, Destination, Instruction, InstructionOp, JmpCondition, Label, MovOperation,
    Source, Symbols, UserInstruction, UserOp, UserVariable, WaitSource, DATA_MAX, NUM_DEFINES,
    NUM_INSTRUCTIONS, NUM_USER_INSTRUCTIONS, NUM_VARS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PioError {
    /// Specified state machine is not valid.
    InvalidSm,
    /// Specified PIO block is not valid.
    InvalidPio,
    /// Specified user processor is not valid.
    InvalidUserProcessor,
    /// Program can't fit in the instruction table.
    Oom,
    /// A JMP label could not be resolved; carries the offending source line.
    UnresolvedLabel(i32),
    /// The device registry is full.
    TooManyDevices,
}

/// The simulator: hardware state, symbols, scheduler and instrumentation in
/// one controller-owned handle. There is no global instance.
pub struct Simulator {
    pub hw: Hardware,
    pub symbols: Symbols,
    pub(crate) devices: Vec<RegisteredDevice>,
    pub(crate) tracker: ChangeTracker,
    pub(crate) history: GpioHistory,
    // scheduler state: round-robin cursors, alternation and the exit latch
    pub(crate) sm_cursor: usize,
    pub(crate) up_cursor: usize,
    pub(crate) try_user_first: bool,
    pub(crate) last_line: i32,
    pub(crate) exited: bool,
    pub(crate) total_ticks: u64,
}

impl Default for Simulator {
    fn default() -> Self {
        Simulator::new()
    }
}

impl Simulator {
    pub fn new() -> Self {
        Simulator {
            hw: Hardware::new(),
            symbols: Symbols::new(),
            devices: Vec::new(),
            tracker: ChangeTracker::new(),
            history: GpioHistory::default(),
            sm_cursor: 0,
            up_cursor: 0,
            try_user_first: true,
            last_line: 0,
            exited: false,
            total_ticks: 0,
        }
    }

    /// Clear transient state: PCs return to their configured first
    /// instruction, FIFOs re-initialize, history and the exit latch clear.
    /// Loaded programs, symbols and configuration survive.
    pub fn reset(&mut self) {
        self.hw.reset();
        self.tracker.clear();
        self.history.clear();
        self.sm_cursor = 0;
        self.up_cursor = 0;
        self.try_user_first = true;
        self.last_line = 0;
        self.exited = false;
        self.total_ticks = 0;
    }

    // ------------------------------------------------------------------
    // program loading
    // ------------------------------------------------------------------

    /// Load an assembled program into a PIO's instruction table and attach it
    /// to one of its state machines. The program's side-set and wrap settings
    /// are applied to the SM, JMP targets are relocated to where the code
    /// landed, and instructions are given consecutive source lines starting
    /// at `first_line`. Returns the load offset.
    pub fn load_program(
        &mut self,
        pio: usize,
        sm: usize,
        program: &pio::Program<RP2040_MAX_PROGRAM_SIZE>,
        name: &str,
        first_line: i32,
    ) -> Result<usize, PioError> {
        if pio >= NUM_PIOS {
            return Err(PioError::InvalidPio);
        }
        if sm >= NUM_SMS {
            return Err(PioError::InvalidSm);
        }
        let offset = self.hw.pios[pio].instructions.len();
        if offset + program.code.len() > NUM_INSTRUCTIONS {
            return Err(PioError::Oom);
        }
        if let Some(origin) = program.origin {
            if origin as usize != offset {
                log::debug!("program origin {} ignored, loading at {}", origin, offset);
            }
        }
        {
            let cfg = &mut self.hw.sm_mut(pio, sm).cfg;
            if program.side_set.bits() > 0 {
                cfg.config_set_sideset(
                    program.side_set.bits() as usize,
                    program.side_set.optional(),
                    program.side_set.pindirs(),
                );
            }
            cfg.config_set_wrap(
                offset + program.wrap.target as usize,
                offset + program.wrap.source as usize,
            );
            cfg.first_pc = offset as i32;
        }
        let side_set_count = self.hw.sm(pio, sm).cfg.side_set_count;
        for (i, &word) in program.code.iter().enumerate() {
            let mut instr = Instruction::decode(word, side_set_count);
            // jmp targets are assembled relative to address zero
            if let InstructionOp::Jmp { target: Some(t), .. } = &mut instr.op {
                *t += offset as u8;
            }
            instr.line = first_line + i as i32;
            instr.address = (offset + i) as i32;
            self.hw.pios[pio].instructions.push(instr);
        }
        let sm = self.hw.sm_mut(pio, sm);
        sm.program_name = name.to_owned();
        if sm.pc < 0 {
            sm.pc = sm.cfg.first_pc;
        }
        Ok(offset)
    }

    /// Append one already-decoded instruction to a PIO's table, as the parser
    /// front end does. Returns the address it landed at.
    pub fn add_instruction(
        &mut self,
        pio: usize,
        mut instr: Instruction,
    ) -> Result<usize, PioError> {
        if pio >= NUM_PIOS {
            return Err(PioError::InvalidPio);
        }
        let table = &mut self.hw.pios[pio].instructions;
        if table.len() == NUM_INSTRUCTIONS {
            log::warn!("line {}: instruction table full", instr.line);
            return Err(PioError::Oom);
        }
        let address = table.len();
        instr.address = address as i32;
        table.push(instr);
        Ok(address)
    }

    /// Append a user instruction to a user processor's script. The first
    /// instruction added arms the processor.
    pub fn add_user_instruction(
        &mut self,
        up: usize,
        mut instr: UserInstruction,
    ) -> Result<usize, PioError> {
        if up >= NUM_USER_PROCESSORS {
            return Err(PioError::InvalidUserProcessor);
        }
        if instr.target_pio >= NUM_PIOS {
            return Err(PioError::InvalidPio);
        }
        if instr.target_sm >= NUM_SMS {
            return Err(PioError::InvalidSm);
        }
        let up = &mut self.hw.user_processors[up];
        if up.instructions.len() == NUM_USER_INSTRUCTIONS {
            log::warn!("line {}: user instruction table full", instr.line);
            return Err(PioError::Oom);
        }
        let address = up.instructions.len();
        instr.address = address as i32;
        up.instructions.push(instr);
        if up.pc < 0 {
            up.pc = 0;
        }
        Ok(address)
    }

    /// Resolve JMP instructions that still reference a label by name. Returns
    /// the first line whose label cannot be found.
    pub fn resolve_labels(&mut self) -> Result<(), PioError> {
        let symbols = &self.symbols;
        let mut fixed = 0;
        for pio in self.hw.pios.iter_mut() {
            for instr in pio.instructions.iter_mut() {
                if let InstructionOp::Jmp { target, .. } = &mut instr.op {
                    if target.is_none() {
                        match instr.label.as_deref().and_then(|l| symbols.find_label(l)) {
                            Some(address) => {
                                *target = Some(address);
                                fixed += 1;
                            }
                            None => {
                                log::warn!(
                                    "line {}: unable to fix reference to {:?}",
                                    instr.line,
                                    instr.label
                                );
                                return Err(PioError::UnresolvedLabel(instr.line));
                            }
                        }
                    }
                }
            }
        }
        if fixed > 0 {
            log::info!("fixed {} forward references", fixed);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // breakpoints
    // ------------------------------------------------------------------

    /// Toggle the breakpoint on the instruction at `line`; false when no
    /// instruction matches. Applying it twice restores the original state.
    pub fn toggle_breakpoint(&mut self, line: i32) -> bool {
        for pio in self.hw.pios.iter_mut() {
            for instr in pio.instructions.iter_mut() {
                if instr.line == line {
                    instr.is_breakpoint = !instr.is_breakpoint;
                    return true;
                }
            }
        }
        for up in self.hw.user_processors.iter_mut() {
            for instr in up.instructions.iter_mut() {
                if instr.line == line {
                    instr.is_breakpoint = !instr.is_breakpoint;
                    return true;
                }
            }
        }
        false
    }

    pub fn is_breakpoint(&self, line: i32) -> bool {
        for pio in self.hw.pios.iter() {
            for instr in pio.instructions.iter() {
                if instr.line == line {
                    return instr.is_breakpoint;
                }
            }
        }
        for up in self.hw.user_processors.iter() {
            for instr in up.instructions.iter() {
                if instr.line == line {
                    return instr.is_breakpoint;
                }
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // host-side access
    // ------------------------------------------------------------------

    /// Host read from an SM's RX FIFO.
    pub fn read_pio(&mut self, pio: usize, sm: usize) -> Option<u32> {
        if pio >= NUM_PIOS || sm >= NUM_SMS {
            log::warn!("invalid pio/sm {}:{}", pio, sm);
            return None;
        }
        self.hw.sm_mut(pio, sm).fifo.read()
    }

    /// Host write into an SM's TX FIFO; false when the FIFO cannot take it.
    pub fn write_pio(&mut self, pio: usize, sm: usize, value: u32) -> bool {
        if pio >= NUM_PIOS || sm >= NUM_SMS {
            log::warn!("invalid pio/sm {}:{}", pio, sm);
            return false;
        }
        self.hw.sm_mut(pio, sm).fifo.write(value)
    }

    pub fn sm_txfifo_is_full(&self, pio: usize, sm: usize) -> bool {
        self.hw.sm(pio, sm).fifo.tx_state == FifoState::Full
    }

    pub fn sm_txfifo_is_empty(&self, pio: usize, sm: usize) -> bool {
        self.hw.sm(pio, sm).fifo.tx_state == FifoState::Empty
    }

    pub fn sm_txfifo_level(&self, pio: usize, sm: usize) -> usize {
        self.hw.sm(pio, sm).fifo.tx_level()
    }

    pub fn sm_rxfifo_is_full(&self, pio: usize, sm: usize) -> bool {
        self.hw.sm(pio, sm).fifo.rx_state == FifoState::Full
    }

    pub fn sm_rxfifo_is_empty(&self, pio: usize, sm: usize) -> bool {
        self.hw.sm(pio, sm).fifo.rx_state == FifoState::Empty
    }

    pub fn sm_rxfifo_level(&self, pio: usize, sm: usize) -> usize {
        self.hw.sm(pio, sm).fifo.rx_level()
    }

    pub fn get_gpio(&self, num: usize) -> bool {
        self.hw.get_gpio(num)
    }

    pub fn set_gpio(&mut self, num: usize, level: bool) {
        self.hw.set_gpio(num, level)
    }

    pub fn get_gpio_dir(&self, num: usize) -> bool {
        self.hw.get_gpio_dir(num)
    }

    pub fn set_gpio_dir(&mut self, num: usize, output: bool) {
        self.hw.set_gpio_dir(num, output)
    }

    pub fn sm_interrupt_get(&self, int_number: usize) -> bool {
        self.hw.irq_flag_is_set(int_number)
    }

    /// Remaining delay ticks of the instruction in flight on this SM.
    pub fn current_delay_remaining(&self, pio: usize, sm: usize) -> u8 {
        let sm = self.hw.sm(pio, sm);
        if sm.in_delay_state {
            sm.delay_left
        } else {
            0
        }
    }

    // ------------------------------------------------------------------
    // instrumentation
    // ------------------------------------------------------------------

    /// Record the current hardware state as the change-tracking baseline.
    pub fn snapshot(&mut self) {
        self.tracker.snapshot(&self.hw);
    }

    /// Diff the hardware against the last `snapshot`.
    pub fn get_changed(&self) -> HardwareChanged {
        self.tracker.changed(&self.hw)
    }

    /// GPIO history, oldest first.
    pub fn gpio_history(&self) -> impl Iterator<Item = &GpioHistoryEntry> {
        self.history.iter()
    }

    pub fn gpio_history_capacity(&self) -> usize {
        self.history.capacity()
    }

    // ------------------------------------------------------------------
    // simulated peripherals
    // ------------------------------------------------------------------

    /// Register a simulated peripheral. Enabled devices get one `run` call
    /// per completed instruction.
    pub fn register_device(
        &mut self,
        name: &str,
        enabled: bool,
        device: Box<dyn Device>,
    ) -> Result<(), PioError> {
        if self.devices.len() == MAX_DEVICES {
            return Err(PioError::TooManyDevices);
        }
        self.devices.push(RegisteredDevice { name: name.to_owned(), enabled, device });
        Ok(())
    }

    pub fn set_device_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.devices.iter_mut().find(|d| d.name == name) {
            Some(dev) => {
                dev.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn devices(&self) -> &[RegisteredDevice] {
        &self.devices
    }
}

//! Static hardware state: two PIO blocks of four state machines each, the
//! GPIO bank, the IRQ flag bank, and the user processors.
//!
//! This module only holds state and typed accessors; instruction execution
//! lives in `execution`. All out-of-range accesses are logged and ignored
//! rather than panicking.

use crate::fifo::{Fifo, FifoMode, TOTAL_FIFO_SIZE_PER_SM};
use crate::instruction::{Instruction, UserInstruction};

pub const NUM_PIOS: usize = 2;
/// State machines per PIO.
pub const NUM_SMS: usize = 4;
pub const NUM_USER_PROCESSORS: usize = 2;
pub const NUM_GPIOS: usize = 32;
/// Local IRQ lines per PIO.
pub const NUM_IRQS: usize = 2;
/// Process-wide IRQ flags shared by all state machines.
pub const NUM_IRQ_FLAGS: usize = 8;
pub const MAX_DEVICES: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Gpio {
    pub level: bool,
    /// true means the pin is an output.
    pub pindir: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IrqFlag {
    pub set: bool,
    /// Hint for the UI: this flag is routed to a system interrupt line.
    pub mapped_to_irq: bool,
}

/// Per-SM configuration, mirroring what the parser front end hands over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmConfig {
    /// First instruction to execute after reset; -1 when no program is
    /// attached.
    pub first_pc: i32,
    /// GPIO tested by the JMP PIN condition.
    pub pin_condition: Option<u8>,
    pub set_pins_base: u8,
    pub set_pins_num: u8,
    pub out_pins_base: u8,
    pub out_pins_num: u8,
    pub in_pins_base: u8,
    pub side_set_pins_base: u8,
    pub side_set_pins_num: u8,
    pub side_set_optional: bool,
    pub side_set_pindirs: bool,
    /// Bits of each instruction reserved for side-set.
    pub side_set_count: u8,
    pub autopush: bool,
    pub autopull: bool,
    /// 1..=32; `None` means unset and reads as 32.
    pub pull_threshold: Option<u8>,
    pub push_threshold: Option<u8>,
    /// true shifts toward the LSB.
    pub out_shift_right: bool,
    pub in_shift_right: bool,
    /// Wrap range: after the instruction at `wrap_source` completes without
    /// branching, execution continues at `wrap_target`. -1 disables wrap.
    pub wrap_source: i32,
    pub wrap_target: i32,
}

impl Default for SmConfig {
    fn default() -> Self {
        SmConfig {
            first_pc: -1,
            pin_condition: None,
            set_pins_base: 0,
            set_pins_num: 0,
            out_pins_base: 0,
            out_pins_num: 0,
            in_pins_base: 0,
            side_set_pins_base: 0,
            side_set_pins_num: 0,
            side_set_optional: true,
            side_set_pindirs: false,
            side_set_count: 0,
            autopush: false,
            autopull: false,
            pull_threshold: None,
            push_threshold: None,
            out_shift_right: true,
            in_shift_right: true,
            wrap_source: -1,
            wrap_target: 0,
        }
    }
}

impl SmConfig {
    pub fn config_set_defaults(&mut self) {
        *self = SmConfig::default();
    }

    pub fn config_set_set_pins(&mut self, base: usize, count: usize) {
        assert!(base < NUM_GPIOS);
        assert!(count <= 5);
        self.set_pins_base = base as u8;
        self.set_pins_num = count as u8;
    }

    pub fn config_set_out_pins(&mut self, base: usize, count: usize) {
        assert!(base < NUM_GPIOS);
        assert!(count <= 32);
        self.out_pins_base = base as u8;
        self.out_pins_num = count as u8;
    }

    pub fn config_set_in_pins(&mut self, base: usize) {
        assert!(base < NUM_GPIOS);
        self.in_pins_base = base as u8;
    }

    pub fn config_set_sideset_pins(&mut self, base: usize) {
        assert!(base < NUM_GPIOS);
        self.side_set_pins_base = base as u8;
    }

    /// `bit_count` is the number of instruction bits reserved for side-set,
    /// including the enable bit when `optional`.
    pub fn config_set_sideset(&mut self, bit_count: usize, optional: bool, pindirs: bool) {
        assert!(bit_count <= 5);
        assert!(!optional || bit_count >= 1);
        self.side_set_count = bit_count as u8;
        self.side_set_pins_num =
            if optional { bit_count.saturating_sub(1) as u8 } else { bit_count as u8 };
        self.side_set_optional = optional;
        self.side_set_pindirs = pindirs;
    }

    pub fn config_set_out_shift(&mut self, shift_right: bool, autopull: bool, threshold: usize) {
        assert!((1..=32).contains(&threshold));
        self.out_shift_right = shift_right;
        self.autopull = autopull;
        self.pull_threshold = Some(threshold as u8);
    }

    pub fn config_set_in_shift(&mut self, shift_right: bool, autopush: bool, threshold: usize) {
        assert!((1..=32).contains(&threshold));
        self.in_shift_right = shift_right;
        self.autopush = autopush;
        self.push_threshold = Some(threshold as u8);
    }

    pub fn config_set_jmp_pin(&mut self, pin: usize) {
        assert!(pin < NUM_GPIOS);
        self.pin_condition = Some(pin as u8);
    }

    pub fn config_set_wrap(&mut self, target: usize, source: usize) {
        self.wrap_target = target as i32;
        self.wrap_source = source as i32;
    }

    /// Effective pull threshold: an unset threshold reads as a full OSR.
    pub fn pull_threshold_effective(&self) -> u8 {
        self.pull_threshold.unwrap_or(32)
    }

    pub fn push_threshold_effective(&self) -> u8 {
        self.push_threshold.unwrap_or(32)
    }
}

/// One state machine: registers, configuration and in-flight execution state.
#[derive(Debug, Clone)]
pub struct Sm {
    pub pc: i32,
    pub fifo: Fifo,
    pub scratch_x: u32,
    pub scratch_y: u32,
    pub osr: u32,
    pub isr: u32,
    pub shift_in_count: u8,
    pub shift_out_count: u8,
    pub osr_empty: bool,
    pub isr_full: bool,
    pub cfg: SmConfig,
    /// Ticks this SM has been scheduled for.
    pub clock_tick: u32,
    /// OUT to PC lands here until shifting completes.
    pub pc_temp: u32,
    /// Non-zero while an IN has shifted its bits but a stalled autopush keeps
    /// the instruction from completing; re-entry skips the shift.
    pub shift_in_resume_count: u8,
    /// Same idea for OUT when its EXEC payload keeps the instruction open.
    pub shift_out_resume_count: u8,
    /// The word most recently OUT/MOVed to the EXEC destination.
    pub exec_machine_instruction: u16,
    /// Decoded EXEC payload, present while it has not completed.
    pub exec_instruction: Option<Instruction>,
    /// Where the PC goes when the current instruction completes; `None` means
    /// fall through (or wrap).
    pub next_pc: Option<i32>,
    /// Delay epilogue state for the in-flight instruction.
    pub in_delay_state: bool,
    pub delay_left: u8,
    pub program_name: String,
    /// Index of the owning PIO; SMs reach their PIO through the hardware
    /// container rather than a back-pointer.
    pub pio_index: usize,
    pub index: usize,
}

impl Sm {
    fn new(pio_index: usize, index: usize) -> Self {
        Sm {
            pc: -1,
            fifo: Fifo::new(FifoMode::Bidi),
            scratch_x: 0,
            scratch_y: 0,
            osr: 0,
            isr: 0,
            shift_in_count: 0,
            shift_out_count: 0,
            osr_empty: false,
            isr_full: false,
            cfg: SmConfig::default(),
            clock_tick: 0,
            pc_temp: 0,
            shift_in_resume_count: 0,
            shift_out_resume_count: 0,
            exec_machine_instruction: 0,
            exec_instruction: None,
            next_pc: None,
            in_delay_state: false,
            delay_left: 0,
            program_name: String::new(),
            pio_index,
            index,
        }
    }

    /// Clear transient execution state, keeping configuration and the loaded
    /// program. The FIFO re-initializes in its configured mode.
    pub fn reset(&mut self) {
        self.pc = self.cfg.first_pc;
        self.pc_temp = 0;
        self.clock_tick = 0;
        self.fifo.init(self.fifo.mode);
        self.scratch_x = 0;
        self.scratch_y = 0;
        self.osr = 0;
        self.isr = 0;
        self.shift_in_count = 0;
        self.shift_out_count = 0;
        self.osr_empty = false;
        self.isr_full = false;
        self.shift_in_resume_count = 0;
        self.shift_out_resume_count = 0;
        self.exec_machine_instruction = 0;
        self.exec_instruction = None;
        self.next_pc = None;
        self.in_delay_state = false;
        self.delay_left = 0;
    }
}

/// One PIO block: its program table and two local IRQ lines.
#[derive(Debug, Clone)]
pub struct Pio {
    pub irqs: [bool; NUM_IRQS],
    pub instructions: Vec<Instruction>,
    pub index: usize,
}

impl Pio {
    fn new(index: usize) -> Self {
        Pio { irqs: [false; NUM_IRQS], instructions: Vec::new(), index }
    }
}

/// A scripted host-side sequencer driving FIFOs and pins.
#[derive(Debug, Clone)]
pub struct UserProcessor {
    pub instructions: Vec<UserInstruction>,
    pub pc: i32,
    pub index: usize,
    /// Scratch buffer for the DATA meta-instructions.
    pub data: Vec<u8>,
    // in-flight instruction state
    pub in_delay_state: bool,
    pub delay_left: u8,
    pub delay_completed: bool,
    pub data_index: usize,
}

impl UserProcessor {
    fn new(index: usize) -> Self {
        UserProcessor {
            instructions: Vec::new(),
            pc: -1,
            index,
            data: Vec::new(),
            in_delay_state: false,
            delay_left: 0,
            delay_completed: false,
            data_index: 0,
        }
    }

    pub fn reset(&mut self) {
        self.pc = if self.instructions.is_empty() { -1 } else { 0 };
        self.data.clear();
        self.in_delay_state = false;
        self.delay_left = 0;
        self.delay_completed = false;
        self.data_index = 0;
    }
}

/// The whole simulated machine. Owned by the controller and passed explicitly
/// to everything that needs it; there is no global instance.
#[derive(Debug, Clone)]
pub struct Hardware {
    pub pios: [Pio; NUM_PIOS],
    sms: Vec<Sm>,
    pub gpios: [Gpio; NUM_GPIOS],
    pub irq_flags: [IrqFlag; NUM_IRQ_FLAGS],
    pub user_processors: [UserProcessor; NUM_USER_PROCESSORS],
    /// Policy switch: WAIT 1 IRQ clears the flag when the wait is satisfied,
    /// as the datasheet specifies. Clear to leave the flag set instead.
    pub wait_irq_clears_flag: bool,
}

impl Default for Hardware {
    fn default() -> Self {
        Hardware::new()
    }
}

impl Hardware {
    pub fn new() -> Self {
        let sms = (0..NUM_PIOS * NUM_SMS).map(|i| Sm::new(i / NUM_SMS, i % NUM_SMS)).collect();
        Hardware {
            pios: [Pio::new(0), Pio::new(1)],
            sms,
            gpios: [Gpio::default(); NUM_GPIOS],
            irq_flags: [IrqFlag::default(); NUM_IRQ_FLAGS],
            user_processors: [UserProcessor::new(0), UserProcessor::new(1)],
            wait_irq_clears_flag: true,
        }
    }

    pub fn sm(&self, pio: usize, sm: usize) -> &Sm {
        &self.sms[pio * NUM_SMS + sm]
    }

    pub fn sm_mut(&mut self, pio: usize, sm: usize) -> &mut Sm {
        &mut self.sms[pio * NUM_SMS + sm]
    }

    pub fn sm_flat(&self, index: usize) -> &Sm {
        &self.sms[index]
    }

    pub fn sm_flat_mut(&mut self, index: usize) -> &mut Sm {
        &mut self.sms[index]
    }

    pub fn sms(&self) -> impl Iterator<Item = &Sm> {
        self.sms.iter()
    }

    pub fn get_gpio(&self, num: usize) -> bool {
        if num >= NUM_GPIOS {
            log::warn!("invalid gpio index {}", num);
            return false;
        }
        self.gpios[num].level
    }

    pub fn set_gpio(&mut self, num: usize, level: bool) {
        if num >= NUM_GPIOS {
            log::warn!("invalid gpio index {}", num);
            return;
        }
        self.gpios[num].level = level;
    }

    pub fn get_gpio_dir(&self, num: usize) -> bool {
        if num >= NUM_GPIOS {
            log::warn!("invalid gpio index {}", num);
            return false;
        }
        self.gpios[num].pindir
    }

    pub fn set_gpio_dir(&mut self, num: usize, output: bool) {
        if num >= NUM_GPIOS {
            log::warn!("invalid gpio index {}", num);
            return;
        }
        self.gpios[num].pindir = output;
    }

    pub fn irq_flag_is_set(&self, irq: usize) -> bool {
        if irq >= NUM_IRQ_FLAGS {
            log::warn!("invalid irq flag index {}", irq);
            return false;
        }
        self.irq_flags[irq].set
    }

    pub fn irq_flag_set(&mut self, irq: usize, set: bool) -> bool {
        if irq >= NUM_IRQ_FLAGS {
            log::warn!("invalid irq flag index {}", irq);
            return false;
        }
        self.irq_flags[irq].set = set;
        true
    }

    pub fn get_pio_irq(&self, pio: usize, irq: usize) -> bool {
        if pio >= NUM_PIOS || irq >= NUM_IRQS {
            log::warn!("invalid pio irq {}:{}", pio, irq);
            return false;
        }
        self.pios[pio].irqs[irq]
    }

    pub fn set_pio_irq(&mut self, pio: usize, irq: usize, value: bool) {
        if pio >= NUM_PIOS || irq >= NUM_IRQS {
            log::warn!("invalid pio irq {}:{}", pio, irq);
            return;
        }
        self.pios[pio].irqs[irq] = value;
    }

    /// Reconfigure an SM's FIFO mode, dropping queued data.
    pub fn fifo_join(&mut self, pio: usize, sm: usize, mode: FifoMode) {
        self.sm_mut(pio, sm).fifo.init(mode);
    }

    /// Select which FIFO queue the STATUS word tracks, and its threshold.
    pub fn set_status_sel(&mut self, pio: usize, sm: usize, status_sel_is_rx: bool, n: usize) {
        let fifo = &mut self.sm_mut(pio, sm).fifo;
        fifo.status_sel_is_rx = status_sel_is_rx;
        fifo.n = n.clamp(1, TOTAL_FIFO_SIZE_PER_SM);
    }

    /// Return every SM and user processor to its configured first
    /// instruction; see `Simulator::reset` for the full reset path.
    pub fn reset(&mut self) {
        for sm in self.sms.iter_mut() {
            sm.reset();
        }
        for up in self.user_processors.iter_mut() {
            up.reset();
        }
    }
}

/// A simulated peripheral attached to GPIO pins. Devices get one `run` call
/// per completed instruction, after change tracking, and may observe or drive
/// pins through the typed accessors.
pub trait Device {
    fn run(&mut self, hw: &mut Hardware);
    /// Renderable state summary for the UI.
    fn display(&self) -> String {
        String::new()
    }
}

pub struct RegisteredDevice {
    pub name: String,
    pub enabled: bool,
    pub device: Box<dyn Device>,
}

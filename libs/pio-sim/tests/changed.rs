//! Change tracking and GPIO history as observed through the control surface.

use pio_sim::{FifoCompare, Simulator};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// snapshot / op / get_changed reports exactly the fields the op mutated.
#[test]
fn diff_is_exact_for_a_register_write() {
    init();
    let mut sim = Simulator::new();
    let code = pio_proc::pio_asm!("set x, 9");
    sim.load_program(0, 0, &code.program, "sx", 1).unwrap();

    sim.snapshot();
    sim.step();
    let changed = sim.get_changed();
    assert!(changed.sms[0].scratch_x);
    assert!(!changed.sms[0].scratch_y);
    assert!(!changed.sms[0].osr);
    assert!(!changed.sms[0].isr);
    assert_eq!(changed.sms[0].fifo, FifoCompare::Match);
    assert!(changed.sms.iter().skip(1).all(|sm| !sm.any()));
    assert!(changed.gpios.iter().all(|g| !g.level && !g.pindir));
    assert!(changed.irqs.iter().all(|pio| pio.iter().all(|&irq| !irq)));
}

/// A host FIFO write shows up as a TX-side FIFO difference and nothing else.
#[test]
fn diff_sees_host_fifo_traffic() {
    init();
    let mut sim = Simulator::new();
    sim.snapshot();
    sim.write_pio(0, 1, 5);
    let changed = sim.get_changed();
    assert_eq!(changed.sms[1].fifo, FifoCompare::TxState);
    assert!(changed.sms.iter().enumerate().all(|(i, sm)| (i == 1) == sm.any()));
}

/// Pin pokes and IRQ flags register as their own deltas.
#[test]
fn diff_sees_gpio_and_irq_changes() {
    init();
    let mut sim = Simulator::new();
    sim.snapshot();
    sim.set_gpio(9, true);
    sim.set_gpio_dir(10, true);
    sim.hw.set_pio_irq(1, 1, true);
    let changed = sim.get_changed();
    assert!(changed.gpios[9].level && !changed.gpios[9].pindir);
    assert!(!changed.gpios[10].level && changed.gpios[10].pindir);
    assert!(changed.irqs[1][1]);
    assert!(!changed.irqs[0][0]);
}

/// Re-snapshotting rebaselines the diff.
#[test]
fn snapshot_rebaselines() {
    init();
    let mut sim = Simulator::new();
    sim.snapshot();
    sim.set_gpio(3, true);
    assert!(sim.get_changed().gpios[3].level);
    sim.snapshot();
    assert!(!sim.get_changed().gpios[3].level);
}

/// History records one entry per completed instruction, not per tick.
#[test]
fn history_counts_completed_instructions() {
    init();
    let mut sim = Simulator::new();
    #[rustfmt::skip]
    let code = pio_proc::pio_asm!(
        ".side_set 1",
        ".wrap_target",
        "set pins, 1 side 0 [1]",
        "set pins, 0 side 1 [1]",
        ".wrap"
    );
    sim.load_program(0, 0, &code.program, "blink", 1).unwrap();
    {
        let cfg = &mut sim.hw.sm_mut(0, 0).cfg;
        cfg.config_set_set_pins(0, 1);
        cfg.config_set_sideset_pins(1);
    }
    for _ in 0..8 {
        sim.step();
    }
    // each instruction takes two ticks (delay of one)
    assert_eq!(sim.gpio_history().count(), 4);
    let ticks: Vec<u64> = sim.gpio_history().map(|e| e.clock_tick).collect();
    assert_eq!(ticks, vec![1, 2, 3, 4]);
    // pin 0 alternates between completed instructions
    let pin0: Vec<bool> = sim.gpio_history().map(|e| e.levels[0]).collect();
    assert_eq!(pin0, vec![true, false, true, false]);
}

/// The history ring holds the configured depth and overwrites the oldest.
#[test]
fn history_wraps_at_capacity() {
    init();
    let mut sim = Simulator::new();
    #[rustfmt::skip]
    let code = pio_proc::pio_asm!(
        ".wrap_target",
        "nop",
        ".wrap"
    );
    sim.load_program(0, 0, &code.program, "spin", 1).unwrap();
    let cap = sim.gpio_history_capacity();
    for _ in 0..cap + 10 {
        sim.step();
    }
    assert_eq!(sim.gpio_history().count(), cap);
    let first = sim.gpio_history().next().map(|e| e.clock_tick);
    assert_eq!(first, Some(11), "the ten oldest entries were overwritten");
}

/// reset clears the history.
#[test]
fn reset_clears_history() {
    init();
    let mut sim = Simulator::new();
    #[rustfmt::skip]
    let code = pio_proc::pio_asm!(
        ".wrap_target",
        "nop",
        ".wrap"
    );
    sim.load_program(0, 0, &code.program, "spin", 1).unwrap();
    sim.step();
    sim.step();
    assert_eq!(sim.gpio_history().count(), 2);
    sim.reset();
    assert_eq!(sim.gpio_history().count(), 0);
}

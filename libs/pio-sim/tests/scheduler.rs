//! Round-robin scheduling, breakpoints, and the exit latch.

use pio_sim::{Simulator, UserInstruction, UserOp};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn load_nop_loop(sim: &mut Simulator, pio: usize, sm: usize) {
    #[rustfmt::skip]
    let code = pio_proc::pio_asm!(
        ".wrap_target",
        "nop",
        ".wrap"
    );
    sim.load_program(pio, sm, &code.program, "spin", (sm as i32 + 1) * 10).unwrap();
}

/// Four SMs spinning on a NOP each: twelve steps hand every SM three ticks.
#[test]
fn round_robin_shares_ticks_evenly() {
    init();
    let mut sim = Simulator::new();
    for sm in 0..4 {
        load_nop_loop(&mut sim, 0, sm);
    }
    for _ in 0..12 {
        sim.step();
    }
    for sm in 0..4 {
        assert_eq!(sim.hw.sm(0, sm).clock_tick, 3, "sm{}", sm);
    }
}

/// In any window of eight ticks with every SM runnable, each is served once.
#[test]
fn round_robin_is_stable_across_both_pios() {
    init();
    let mut sim = Simulator::new();
    for pio in 0..2 {
        for sm in 0..4 {
            load_nop_loop(&mut sim, pio, sm);
        }
    }
    for window in 0..3 {
        for _ in 0..8 {
            sim.step();
        }
        for pio in 0..2 {
            for sm in 0..4 {
                assert_eq!(sim.hw.sm(pio, sm).clock_tick, window + 1);
            }
        }
    }
}

/// A stalled SM still consumes its round-robin turn; the others keep their
/// share.
#[test]
fn stalled_sm_keeps_its_slot() {
    init();
    let mut sim = Simulator::new();
    let code = pio_proc::pio_asm!("pull block");
    sim.load_program(0, 0, &code.program, "stall", 1).unwrap();
    load_nop_loop(&mut sim, 0, 1);

    for _ in 0..6 {
        sim.step();
    }
    assert_eq!(sim.hw.sm(0, 0).clock_tick, 3);
    assert_eq!(sim.hw.sm(0, 0).pc, 0, "blocked pull never advances");
    assert_eq!(sim.hw.sm(0, 1).clock_tick, 3);
}

/// Stepping with nothing loaded is a no-op that reports the last line.
#[test]
fn step_without_work_is_a_noop() {
    init();
    let mut sim = Simulator::new();
    assert_eq!(sim.first_instruction_line(), -1);
    let line = sim.step();
    assert_eq!(line, 0);
    assert_eq!(sim.total_ticks(), 0);
}

/// step returns the line the next tick will execute, for UI highlight.
#[test]
fn step_reports_the_next_line() {
    init();
    let mut sim = Simulator::new();
    #[rustfmt::skip]
    let code = pio_proc::pio_asm!(
        ".wrap_target",
        "set x, 1",
        "set y, 2",
        ".wrap"
    );
    sim.load_program(0, 0, &code.program, "two", 10).unwrap();
    assert_eq!(sim.first_instruction_line(), 10);
    assert_eq!(sim.step(), 11, "after line 10 runs, line 11 is next");
    assert_eq!(sim.step(), 10, "wrap brings line 10 back around");
}

/// Breakpoint toggling is an involution and run-until stops on the
/// breakpointed line before executing it.
#[test]
fn breakpoints_stop_the_run_loop() {
    init();
    let mut sim = Simulator::new();
    #[rustfmt::skip]
    let code = pio_proc::pio_asm!(
        ".wrap_target",
        "set x, 1",
        "set y, 2",
        "set pins, 0",
        ".wrap"
    );
    sim.load_program(0, 0, &code.program, "bp", 1).unwrap();

    assert!(!sim.is_breakpoint(2));
    assert!(sim.toggle_breakpoint(2));
    assert!(sim.is_breakpoint(2));
    assert!(sim.toggle_breakpoint(2));
    assert!(!sim.is_breakpoint(2), "toggling twice restores the state");
    assert!(!sim.toggle_breakpoint(99), "no instruction on that line");

    sim.toggle_breakpoint(2);
    let line = sim.run_until_breakpoint();
    assert_eq!(line, 2);
    assert_eq!(sim.hw.sm(0, 0).scratch_x, 1, "line 1 ran");
    assert_eq!(sim.hw.sm(0, 0).scratch_y, 0, "line 2 has not run yet");
}

/// The break signal aborts a run loop that would otherwise spin forever.
#[test]
fn break_signal_aborts_run() {
    init();
    let mut sim = Simulator::new();
    load_nop_loop(&mut sim, 0, 0);
    let mut ticks = 0;
    sim.run_until_breakpoint_with(|| {
        ticks += 1;
        ticks >= 20
    });
    assert_eq!(sim.hw.sm(0, 0).clock_tick, 20);
}

/// EXIT latches the scheduler off until reset.
#[test]
fn exit_is_terminal_until_reset() {
    init();
    let mut sim = Simulator::new();
    load_nop_loop(&mut sim, 0, 0);
    sim.add_user_instruction(0, UserInstruction::new(UserOp::Exit, 0, 0).with_line(50)).unwrap();

    sim.step();
    assert!(sim.simulation_exited());
    let ticks = sim.hw.sm(0, 0).clock_tick;
    for _ in 0..5 {
        sim.step();
    }
    assert_eq!(sim.hw.sm(0, 0).clock_tick, ticks, "steps after exit are no-ops");

    sim.reset();
    assert!(!sim.simulation_exited());
    sim.step();
    assert!(sim.simulation_exited(), "the rearmed script runs from the top");
    assert_eq!(sim.total_ticks(), 1, "that step did real work");
}

/// User processors and SMs alternate ticks when both have work.
#[test]
fn user_and_sm_alternate() {
    init();
    let mut sim = Simulator::new();
    load_nop_loop(&mut sim, 0, 0);
    for i in 0..4 {
        sim.add_user_instruction(
            0,
            UserInstruction::new(UserOp::Pin { pin: 5, set_high: i % 2 == 0 }, 0, 0)
                .with_line(20 + i),
        )
        .unwrap();
    }
    // user goes first, then they alternate: u, s, u, s ...
    sim.step();
    assert!(sim.get_gpio(5));
    assert_eq!(sim.hw.sm(0, 0).clock_tick, 0);
    sim.step();
    assert_eq!(sim.hw.sm(0, 0).clock_tick, 1);
    sim.step();
    assert!(!sim.get_gpio(5));
    assert_eq!(sim.hw.sm(0, 0).clock_tick, 1);
    sim.step();
    assert_eq!(sim.hw.sm(0, 0).clock_tick, 2);
}

/// continue_user holds the scheduler on the user processor while the
/// instruction is mid-delay, so the scripted transaction is not interleaved;
/// the hold releases on the tick that can complete it.
#[test]
fn continue_user_holds_the_processor_through_its_delay() {
    init();
    let mut sim = Simulator::new();
    load_nop_loop(&mut sim, 0, 0);
    sim.add_user_instruction(
        0,
        UserInstruction::new(UserOp::Pin { pin: 1, set_high: true }, 0, 0)
            .with_line(20)
            .with_delay(3)
            .with_continue(),
    )
    .unwrap();
    sim.add_user_instruction(
        0,
        UserInstruction::new(UserOp::Pin { pin: 2, set_high: true }, 0, 0).with_line(21),
    )
    .unwrap();

    // three delay ticks, then the operation: the runnable sm is held off for
    // the whole stretch
    for _ in 0..3 {
        sim.step();
        assert!(!sim.get_gpio(1));
        assert_eq!(sim.hw.sm(0, 0).clock_tick, 0, "sm not interleaved mid-delay");
    }
    sim.step();
    assert!(sim.get_gpio(1));
    assert_eq!(sim.hw.sm(0, 0).clock_tick, 0);
    // the completing tick released the hold, so the sm gets its turn back
    sim.step();
    assert_eq!(sim.hw.sm(0, 0).clock_tick, 1);
    assert!(!sim.get_gpio(2));
    sim.step();
    assert!(sim.get_gpio(2));
    sim.step();
    assert_eq!(sim.hw.sm(0, 0).clock_tick, 2);
}

/// A continue_user instruction with no delay is about to complete on its
/// first tick, so scheduling alternates as usual.
#[test]
fn continue_without_delay_alternates_normally() {
    init();
    let mut sim = Simulator::new();
    load_nop_loop(&mut sim, 0, 0);
    sim.add_user_instruction(
        0,
        UserInstruction::new(UserOp::Pin { pin: 1, set_high: true }, 0, 0)
            .with_line(20)
            .with_continue(),
    )
    .unwrap();
    sim.add_user_instruction(
        0,
        UserInstruction::new(UserOp::Pin { pin: 2, set_high: true }, 0, 0).with_line(21),
    )
    .unwrap();

    sim.step();
    assert!(sim.get_gpio(1));
    sim.step();
    assert_eq!(sim.hw.sm(0, 0).clock_tick, 1, "sm takes the next tick");
    assert!(!sim.get_gpio(2));
    sim.step();
    assert!(sim.get_gpio(2));
}

/// A user pre-delay spends its ticks before the operation runs.
#[test]
fn user_delay_runs_before_the_operation() {
    init();
    let mut sim = Simulator::new();
    sim.add_user_instruction(
        0,
        UserInstruction::new(UserOp::Pin { pin: 3, set_high: true }, 0, 0)
            .with_line(30)
            .with_delay(2),
    )
    .unwrap();

    sim.step();
    assert!(!sim.get_gpio(3));
    sim.step();
    assert!(!sim.get_gpio(3));
    sim.step();
    assert!(sim.get_gpio(3), "operation runs once the delay is spent");
    assert_eq!(sim.hw.user_processors[0].pc, 1);
}

/// REPEAT rewinds a user script to its first instruction.
#[test]
fn repeat_restarts_the_user_script() {
    init();
    let mut sim = Simulator::new();
    sim.add_user_instruction(
        0,
        UserInstruction::new(UserOp::Pin { pin: 4, set_high: true }, 0, 0).with_line(40),
    )
    .unwrap();
    sim.add_user_instruction(0, UserInstruction::new(UserOp::Repeat, 0, 0).with_line(41)).unwrap();

    sim.step();
    assert_eq!(sim.hw.user_processors[0].pc, 1);
    sim.step();
    assert_eq!(sim.hw.user_processors[0].pc, 0, "repeat rewinds to the top");
}

/// reset returns the PCs to their first instruction and clears the clocks.
#[test]
fn reset_restores_first_pc() {
    init();
    let mut sim = Simulator::new();
    #[rustfmt::skip]
    let code = pio_proc::pio_asm!(
        ".wrap_target",
        "set x, 1",
        "set y, 2",
        ".wrap"
    );
    sim.load_program(0, 0, &code.program, "r", 1).unwrap();
    sim.step();
    assert_eq!(sim.hw.sm(0, 0).pc, 1);
    sim.reset();
    let sm = sim.hw.sm(0, 0);
    assert_eq!(sm.pc, 0);
    assert_eq!(sm.clock_tick, 0);
    assert_eq!(sm.scratch_x, 0);
    assert_eq!(sim.total_ticks(), 0);
}

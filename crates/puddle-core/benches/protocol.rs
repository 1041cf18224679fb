//! Benchmarks for the frame codec and a full simulated control cycle
//!
//! Run with: cargo bench --bench protocol

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use puddle_core::protocol::crc_ccitt;
use puddle_core::sim::SimulatedMotors;
use puddle_core::{
    ChecksumVersion, CommandFrame, Feedback, ManualClock, MotorMode, Robot, RobotConfig, Verbosity,
};

fn drive_frame() -> CommandFrame {
    let mut cmd = CommandFrame::new(3, MotorMode::Drive);
    cmd.set_kp(1.0);
    cmd.set_kd(0.01);
    cmd.set_position_degrees(42.5);
    cmd.set_torque(0.25);
    cmd
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("Codec");

    for version in [ChecksumVersion::V1, ChecksumVersion::V2] {
        let cmd = drive_frame();
        group.bench_with_input(
            BenchmarkId::new("command encode", version.number()),
            &version,
            |b, &v| b.iter(|| black_box(black_box(&cmd).encode(v))),
        );

        let bytes = cmd.encode(version);
        group.bench_with_input(
            BenchmarkId::new("command decode", version.number()),
            &version,
            |b, &v| b.iter(|| black_box(CommandFrame::decode(black_box(&bytes), v))),
        );

        let fb = Feedback {
            motor_id: 3,
            mode: 1,
            torque: 0.5,
            velocity: 1.0,
            shaft_position: 2.0,
            temperature: 35,
            foot_force: 120,
            ..Default::default()
        };
        let bytes = fb.encode(version);
        group.bench_with_input(
            BenchmarkId::new("feedback decode", version.number()),
            &version,
            |b, &v| b.iter(|| black_box(Feedback::decode(black_box(&bytes), v))),
        );
    }

    group.bench_function("crc 15 bytes", |b| {
        let data = [0xA5u8; 15];
        b.iter(|| black_box(crc_ccitt(0, black_box(&data))))
    });

    group.finish();
}

fn bench_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("Cycle");

    group.bench_function("robot update (sim)", |b| {
        let config = RobotConfig::default();
        let sims: Vec<SimulatedMotors> = config
            .bus
            .iter()
            .map(|bus| SimulatedMotors::for_bus(&config, bus))
            .collect::<Result<_, _>>()
            .unwrap();
        let clock = ManualClock::new(1);
        let mut robot = Robot::with_links(&config, Arc::new(clock.clone()), Verbosity::QUIET, |cfg| {
            let i = config.bus.iter().position(|b| b.name == cfg.name)?;
            Some(sims[i].link())
        })
        .unwrap();
        robot.stand();

        b.iter(|| {
            clock.advance(10);
            black_box(robot.update())
        })
    });

    group.finish();
}

criterion_group!(benches, bench_codec, bench_cycle);
criterion_main!(benches);

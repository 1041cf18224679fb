//! Simulated motor bus
//!
//! Every frame the host writes is parsed as a motor would parse it: commands
//! whose checksum does not verify are dropped, drive commands move the shaft
//! straight to the commanded position, and the addressed motor answers with a
//! feedback frame. Faults can be injected per motor.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::bus::SerialLink;
use crate::config::{BusConfig, RobotConfig};
use crate::protocol::provision::{ChangeIdRequest, BROADCAST_ID, CHANGE_ID_LEN};
use crate::protocol::{
    ChecksumVersion, CommandFrame, Feedback, MotorError, MotorMode, COMMAND_HEADER, COMMAND_LEN,
    GEAR_RATIO,
};
use crate::Result;

const CHANGE_ID_START: u8 = 0xFB;

#[derive(Debug, Clone)]
struct Motor {
    id: u8,
    shaft_position: f64,
    mode: Option<MotorMode>,
    commands: u64,
    temperature: i8,
    foot_force: u16,
    silent: bool,
    error: MotorError,
    reply_id: Option<u8>,
    corrupt_checksum: bool,
}

impl Motor {
    fn new(id: u8) -> Self {
        Self {
            id,
            shaft_position: 0.0,
            mode: None,
            commands: 0,
            temperature: 30,
            foot_force: 0,
            silent: false,
            error: MotorError::None,
            reply_id: None,
            corrupt_checksum: false,
        }
    }
}

#[derive(Debug)]
struct Shared {
    version: ChecksumVersion,
    motors: Vec<Motor>,
    boot_mode: bool,
}

impl Shared {
    fn motor_mut(&mut self, id: u8) -> Option<&mut Motor> {
        self.motors.iter_mut().find(|m| m.id == id)
    }

    fn handle_command(&mut self, bytes: &[u8; COMMAND_LEN], tx: &mut VecDeque<u8>) {
        let version = self.version;
        let cmd = match CommandFrame::decode(bytes, version) {
            Ok(cmd) => cmd,
            Err(e) => {
                trace!("sim: dropping command: {}", e);
                return;
            }
        };
        if cmd.is_boot() {
            self.boot_mode = true;
            return;
        }
        self.boot_mode = false;

        let Some(motor) = self.motor_mut(cmd.motor_id()) else {
            return;
        };
        motor.commands += 1;
        motor.mode = cmd.mode();
        if motor.mode == Some(MotorMode::Drive) {
            motor.shaft_position = cmd.shaft_position();
        }
        if motor.silent {
            return;
        }

        let feedback = Feedback {
            motor_id: motor.reply_id.unwrap_or(motor.id),
            mode: motor.mode.map_or(0, |m| m as u8),
            torque: cmd.torque(),
            velocity: 0.0,
            shaft_position: motor.shaft_position,
            temperature: motor.temperature,
            error: motor.error,
            foot_force: motor.foot_force,
        };
        let mut frame = feedback.encode(version);
        if motor.corrupt_checksum {
            frame[frame.len() - 1] ^= 0x5A;
        }
        tx.extend(frame);
    }

    fn handle_change_id(&mut self, bytes: &[u8; CHANGE_ID_LEN], tx: &mut VecDeque<u8>) {
        let Ok(req) = ChangeIdRequest::decode(bytes) else {
            return;
        };
        let mut changed = false;
        for motor in self.motors.iter_mut() {
            if req.old_id == BROADCAST_ID || motor.id == req.old_id {
                motor.id = req.new_id;
                changed = true;
            }
        }
        if changed {
            tx.extend(bytes.iter().copied());
        }
    }
}

/// A set of motors sharing one simulated bus
///
/// Cheap to clone; clones and every link handed out share the same motors.
#[derive(Debug, Clone)]
pub struct SimulatedMotors {
    shared: Arc<Mutex<Shared>>,
}

impl SimulatedMotors {
    pub fn new(version: ChecksumVersion, ids: &[u8]) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                version,
                motors: ids.iter().map(|&id| Motor::new(id)).collect(),
                boot_mode: false,
            })),
        }
    }

    /// Motors for every joint the config places on `bus`
    pub fn for_bus(config: &RobotConfig, bus: &BusConfig) -> Result<Self> {
        let mut ids = Vec::new();
        if config.neck.bus == bus.name {
            ids.push(config.neck.joint.id);
        }
        for leg in [&config.leg.left, &config.leg.right] {
            if leg.bus == bus.name {
                ids.extend(leg.joints().iter().map(|j| j.id));
            }
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(Self::new(bus.checksum_version()?, &ids))
    }

    /// A new serial link onto this bus
    pub fn link(&self) -> Box<dyn SerialLink> {
        Box::new(SimLink {
            motors: self.clone(),
            rx: Vec::new(),
            tx: VecDeque::new(),
        })
    }

    pub fn ids(&self) -> Vec<u8> {
        self.shared.lock().motors.iter().map(|m| m.id).collect()
    }

    fn with_motor<R>(&self, id: u8, f: impl FnOnce(&mut Motor) -> R) -> Option<R> {
        self.shared.lock().motor_mut(id).map(f)
    }

    /// Place the joint driven by motor `id` at `degrees`
    pub fn set_angle(&self, id: u8, degrees: f64) {
        self.with_motor(id, |m| m.shaft_position = degrees.to_radians() * GEAR_RATIO);
    }

    /// Joint angle of motor `id` in degrees
    pub fn angle(&self, id: u8) -> Option<f64> {
        self.with_motor(id, |m| (m.shaft_position / GEAR_RATIO).to_degrees())
    }

    /// Mode of the last command motor `id` accepted
    pub fn mode(&self, id: u8) -> Option<MotorMode> {
        self.with_motor(id, |m| m.mode).flatten()
    }

    pub fn commands_received(&self, id: u8) -> u64 {
        self.with_motor(id, |m| m.commands).unwrap_or(0)
    }

    /// Accept commands but never answer
    pub fn set_silent(&self, id: u8, silent: bool) {
        self.with_motor(id, |m| m.silent = silent);
    }

    pub fn set_error(&self, id: u8, error: MotorError) {
        self.with_motor(id, |m| m.error = error);
    }

    /// Answer with a different motor id in the feedback
    pub fn set_reply_id(&self, id: u8, reply_id: Option<u8>) {
        self.with_motor(id, |m| m.reply_id = reply_id);
    }

    pub fn set_corrupt_checksum(&self, id: u8, corrupt: bool) {
        self.with_motor(id, |m| m.corrupt_checksum = corrupt);
    }

    pub fn set_foot_force(&self, id: u8, force: u16) {
        self.with_motor(id, |m| m.foot_force = force);
    }

    pub fn set_temperature(&self, id: u8, celsius: i8) {
        self.with_motor(id, |m| m.temperature = celsius);
    }
}

/// Host side of a simulated bus
pub struct SimLink {
    motors: SimulatedMotors,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
}

impl SimLink {
    fn process(&mut self) {
        let mut shared = self.motors.shared.lock();
        loop {
            if self.rx.len() >= 2 && self.rx[..2] == COMMAND_HEADER {
                if self.rx.len() < COMMAND_LEN {
                    break;
                }
                let mut frame = [0u8; COMMAND_LEN];
                frame.copy_from_slice(&self.rx[..COMMAND_LEN]);
                self.rx.drain(..COMMAND_LEN);
                shared.handle_command(&frame, &mut self.tx);
            } else if shared.boot_mode && self.rx.first() == Some(&CHANGE_ID_START) {
                if self.rx.len() < CHANGE_ID_LEN {
                    break;
                }
                let mut frame = [0u8; CHANGE_ID_LEN];
                frame.copy_from_slice(&self.rx[..CHANGE_ID_LEN]);
                self.rx.drain(..CHANGE_ID_LEN);
                shared.handle_change_id(&frame, &mut self.tx);
            } else if self.rx.len() == 1 && self.rx[0] == COMMAND_HEADER[0] {
                break;
            } else if self.rx.is_empty() {
                break;
            } else {
                // Not the start of anything we understand; resync
                self.rx.remove(0);
            }
        }
    }
}

impl Read for SimLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.tx.len());
        for (slot, byte) in buf.iter_mut().zip(self.tx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.rx.extend_from_slice(buf);
        self.process();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialLink for SimLink {
    fn clear_input(&mut self) -> io::Result<()> {
        self.tx.clear();
        Ok(())
    }

    fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_command_moves_shaft() {
        let motors = SimulatedMotors::new(ChecksumVersion::V1, &[3]);
        let mut link = motors.link();

        let mut cmd = CommandFrame::new(3, MotorMode::Drive);
        cmd.set_position_degrees(45.0);
        link.write_all(&cmd.encode(ChecksumVersion::V1)).unwrap();

        let mut reply = [0u8; 16];
        assert_eq!(link.read(&mut reply).unwrap(), 16);
        let fb = Feedback::decode(&reply, ChecksumVersion::V1).unwrap();
        assert_eq!(fb.motor_id, 3);
        assert!((fb.angle_degrees() - 45.0).abs() < 1e-2);
        assert!((motors.angle(3).unwrap() - 45.0).abs() < 1e-2);
        assert_eq!(motors.commands_received(3), 1);
    }

    #[test]
    fn test_brake_command_keeps_shaft() {
        let motors = SimulatedMotors::new(ChecksumVersion::V2, &[1]);
        motors.set_angle(1, 12.0);
        let mut link = motors.link();
        link.write_all(&CommandFrame::brake(1).encode(ChecksumVersion::V2)).unwrap();
        assert!((motors.angle(1).unwrap() - 12.0).abs() < 1e-9);
        assert_eq!(motors.mode(1), Some(MotorMode::Brake));
    }

    #[test]
    fn test_frames_split_across_writes() {
        let motors = SimulatedMotors::new(ChecksumVersion::V1, &[1]);
        let mut link = motors.link();
        let bytes = CommandFrame::brake(1).encode(ChecksumVersion::V1);
        link.write_all(&bytes[..5]).unwrap();
        assert_eq!(motors.commands_received(1), 0);
        link.write_all(&bytes[5..]).unwrap();
        assert_eq!(motors.commands_received(1), 1);
    }

    #[test]
    fn test_garbage_is_skipped() {
        let motors = SimulatedMotors::new(ChecksumVersion::V1, &[1]);
        let mut link = motors.link();
        let mut bytes = vec![0x00, 0x13, 0xFE];
        bytes.extend_from_slice(&CommandFrame::brake(1).encode(ChecksumVersion::V1));
        link.write_all(&bytes).unwrap();
        assert_eq!(motors.commands_received(1), 1);
    }

    #[test]
    fn test_unknown_motor_stays_quiet() {
        let motors = SimulatedMotors::new(ChecksumVersion::V1, &[1]);
        let mut link = motors.link();
        link.write_all(&CommandFrame::brake(9).encode(ChecksumVersion::V1)).unwrap();
        let mut reply = [0u8; 16];
        assert_eq!(link.read(&mut reply).unwrap(), 0);
    }

    #[test]
    fn test_change_id_needs_boot_mode() {
        let motors = SimulatedMotors::new(ChecksumVersion::V1, &[0, 1]);
        let mut link = motors.link();
        let req = ChangeIdRequest::new(0, 7).unwrap();

        link.write_all(&req.encode()).unwrap();
        assert_eq!(motors.ids(), vec![0, 1]);

        link.write_all(&CommandFrame::boot().encode(ChecksumVersion::V1)).unwrap();
        link.write_all(&req.encode()).unwrap();
        assert_eq!(motors.ids(), vec![7, 1]);
        let mut reply = [0u8; 4];
        assert_eq!(link.read(&mut reply).unwrap(), 4);
        assert_eq!(reply, req.encode());
    }

    #[test]
    fn test_for_bus_collects_ids() {
        let config = RobotConfig::default();
        let left = SimulatedMotors::for_bus(&config, &config.bus[0]).unwrap();
        assert_eq!(left.ids(), vec![0, 1, 2, 3, 4, 5]);
        let right = SimulatedMotors::for_bus(&config, &config.bus[1]).unwrap();
        assert_eq!(right.ids(), vec![1, 2, 3, 4, 5]);
    }
}

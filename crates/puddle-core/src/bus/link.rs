//! Byte-level serial link abstraction

use std::io::{self, Read, Write};
use std::time::Duration;

/// Baud rate the actuators are flashed for
pub const MOTOR_BAUD_RATE: u32 = 4_000_000;

/// A raw, full-duplex byte pipe to one RS-485 adapter
///
/// Reads may return `Ok(0)` or `ErrorKind::TimedOut` when no data is pending;
/// the bus treats both as "try again until the deadline".
pub trait SerialLink: Read + Write + Send {
    /// Discard anything sitting in the receive buffer
    fn clear_input(&mut self) -> io::Result<()>;

    /// Upper bound for a single blocking read
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;
}

#[cfg(feature = "serial")]
mod port {
    use super::*;
    use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

    impl SerialLink for Box<dyn SerialPort> {
        fn clear_input(&mut self) -> io::Result<()> {
            SerialPort::clear(&**self, ClearBuffer::Input).map_err(io::Error::from)
        }

        fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
            SerialPort::set_timeout(&mut **self, timeout).map_err(io::Error::from)
        }
    }

    /// Open `path` raw at the motor baud rate, 8N1, no flow control
    pub fn open(path: &str, timeout: Duration) -> crate::Result<Box<dyn SerialLink>> {
        let port = serialport::new(path, MOTOR_BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(timeout)
            .open()
            .map_err(|e| crate::Error::Transport(format!("failed to open {}: {}", path, e)))?;
        let mut link: Box<dyn SerialPort> = port;
        // Stale bytes from before we opened the port would desync framing
        link.clear_input()?;
        Ok(Box::new(link))
    }
}

#[cfg(feature = "serial")]
pub use port::open;

/// Logging setup and frame tracing
///
/// `init` installs `env_logger` from the configuration's debug flag.
/// `FrameTrace` prints raw and interpreted frames, but only when debug
/// logging is on, so a busy server stays quiet at the default level.

use log::{debug, LevelFilter};
use std::net::SocketAddr;

use crate::protocol::{read_u16_at, ModbusFunction, ADDRESS_OFFSET, FUNCTION_CODE_OFFSET, QUANTITY_OFFSET};
use crate::utils::format::bytes_to_hex;

/// Install the global logger
///
/// `RUST_LOG` still wins when set. Calling this more than once is harmless.
pub fn init(debug: bool) {
    let level = if debug { LevelFilter::Debug } else { LevelFilter::Info };
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init();
}

/// Initialize a debug logger for tests
pub fn init_test_logger() {
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

/// Direction of a traced frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn arrow(self) -> &'static str {
        match self {
            Direction::Inbound => "->",
            Direction::Outbound => "<-",
        }
    }
}

/// Debug-gated frame tracer
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameTrace {
    enabled: bool,
}

impl FrameTrace {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Log a frame as hex plus a one-line interpretation
    pub fn frame(&self, peer: SocketAddr, direction: Direction, frame: &[u8]) {
        if !self.enabled {
            return;
        }
        debug!(
            "[MODBUS-TCP] {} {} ({} bytes): {}",
            peer,
            direction.arrow(),
            frame.len(),
            bytes_to_hex(frame)
        );
        debug!("[MODBUS-TCP] {} {} {}", peer, direction.arrow(), interpret(frame));
    }

    /// Log a request whose function code is not served
    pub fn ignored(&self, peer: SocketAddr, function_code: u8) {
        if self.enabled {
            debug!(
                "[MODBUS-TCP] {} ignoring unsupported function 0x{:02X}",
                peer, function_code
            );
        }
    }

    /// Log a write request that carried fewer coil bits than it declared
    pub fn short_payload(&self, peer: SocketAddr, declared_bits: u16, available_bits: usize) {
        if self.enabled {
            debug!(
                "[MODBUS-TCP] {} short coil payload: {} bits declared, {} present, padding with false",
                peer, declared_bits, available_bits
            );
        }
    }

    /// Log a discrete input read too large to answer
    pub fn oversized(&self, peer: SocketAddr, quantity: u16) {
        if self.enabled {
            debug!(
                "[MODBUS-TCP] {} dropping discrete input read of {} points, reply would not fit",
                peer, quantity
            );
        }
    }

    /// Log a frame too short to carry the request's fixed fields
    pub fn truncated(&self, peer: SocketAddr, function: ModbusFunction, len: usize) {
        if self.enabled {
            debug!(
                "[MODBUS-TCP] {} dropping truncated {} frame ({} bytes)",
                peer, function, len
            );
        }
    }
}

fn interpret(frame: &[u8]) -> String {
    let Some(&code) = frame.get(FUNCTION_CODE_OFFSET) else {
        return "Incomplete header".to_string();
    };
    let address = read_u16_at(frame, ADDRESS_OFFSET);
    let quantity = read_u16_at(frame, QUANTITY_OFFSET);

    match (ModbusFunction::from_u8(code), address, quantity) {
        (Ok(function), Some(address), Some(quantity)) => {
            format!("{}, Address: {}, Quantity: {}", function, address, quantity)
        }
        (Ok(function), _, _) => format!("{}, truncated", function),
        (Err(_), _, _) => format!("Unknown Function (0x{:02X})", code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpret() {
        let frame = [0, 1, 0, 0, 0, 6, 1, 0x02, 0x00, 0x10, 0x00, 0x0C];
        assert_eq!(
            interpret(&frame),
            "Read Discrete Inputs (0x02), Address: 16, Quantity: 12"
        );
        assert_eq!(interpret(&frame[..9]), "Read Discrete Inputs (0x02), truncated");
        assert_eq!(interpret(&[0, 1, 0, 0, 0, 2, 1, 0x03]), "Unknown Function (0x03)");
        assert_eq!(interpret(&[0, 1]), "Incomplete header");
    }

    #[test]
    fn test_disabled_trace_is_silent() {
        init_test_logger();
        let trace = FrameTrace::new(false);
        assert!(!trace.is_enabled());
        trace.frame("127.0.0.1:502".parse().unwrap(), Direction::Inbound, &[0x00]);
    }
}

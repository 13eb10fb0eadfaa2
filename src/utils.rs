/// Utility functions for validation and formatting
///
/// Small helpers shared by the configuration loader, the frame tracer and
/// the lifecycle log lines.

use std::time::Duration;

use crate::error::{ModbusError, ModbusResult};

/// Data validation utilities
pub mod validation {
    use super::*;
    use crate::config::MAX_POINT_COUNT;

    /// Validate a listener port (1-65535)
    pub fn validate_port(port: u16) -> ModbusResult<()> {
        if port == 0 {
            return Err(ModbusError::configuration(
                "Invalid port: 0 (must be 1-65535)",
            ));
        }
        Ok(())
    }

    /// Validate a bank size (1-1000)
    pub fn validate_point_count(field: &str, count: usize) -> ModbusResult<()> {
        if count == 0 || count > MAX_POINT_COUNT {
            return Err(ModbusError::configuration(format!(
                "Invalid {}: {} (must be 1-{})",
                field, count, MAX_POINT_COUNT
            )));
        }
        Ok(())
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format byte array as spaced upper-case hex, e.g. `01 0F FF`
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        let encoded = hex::encode_upper(bytes);
        encoded
            .as_bytes()
            .chunks(2)
            .map(|pair| String::from_utf8_lossy(pair).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        assert!(validation::validate_port(1).is_ok());
        assert!(validation::validate_port(65535).is_ok());
        assert!(validation::validate_port(0).is_err());

        assert!(validation::validate_point_count("coil_count", 1).is_ok());
        assert!(validation::validate_point_count("coil_count", 1000).is_ok());
        assert!(validation::validate_point_count("coil_count", 0).is_err());
        assert!(validation::validate_point_count("coil_count", 1001).is_err());
    }

    #[test]
    fn test_formatting() {
        let bytes = vec![0x01, 0x0F, 0x10, 0xFF];
        assert_eq!(format::bytes_to_hex(&bytes), "01 0F 10 FF");
        assert_eq!(format::bytes_to_hex(&[]), "");

        assert_eq!(format::format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format::format_duration(Duration::from_secs(10)), "10.00s");
        assert_eq!(format::format_duration(Duration::from_millis(250)), "250ms");
    }
}

//! # Voltage Coil Server - Minimal Modbus TCP Coil Server
//!
//! **Author:** Evan Liu <evan.liu@voltageenergy.com>
//! **Version:** 0.1.0
//! **License:** MIT
//!
//! A small Modbus TCP server that lets a remote master write a bank of coils.
//! Every coil keeps its last written value and a latched level that stays
//! set until the host resets it. Coil changes are pushed to a host-supplied
//! variable sink, and the listener rebinds on its own after faults.
//!
//! ## Features
//!
//! - **🔄 Latched Levels**: A coil written true keeps its level until reset
//! - **📡 Multi-client**: Each connection runs in its own task
//! - **🧩 Split Frame Safe**: Requests are reassembled from the MBAP length field
//! - **♻️ Self Healing**: Bounded reconnects with per-cause retry delays
//! - **📊 Built-in Monitoring**: Connection and frame statistics
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Server |
//! |------|----------|--------|
//! | 0x02 | Read Discrete Inputs | ✅ (always zero) |
//! | 0x0F | Write Multiple Coils | ✅ |
//!
//! Every other function code is dropped without a reply.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use voltage_coil_server::{CoilServer, CoilServerConfig, LogProjection, ModbusServer};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CoilServerConfig {
//!         bind_address: "127.0.0.1".to_string(),
//!         port: 5020,
//!         ..Default::default()
//!     };
//!
//!     let mut server = CoilServer::new(config, Arc::new(LogProjection))?;
//!     server.start().await?;
//!
//!     server.set_coil(3, true)?;
//!     server.reset_level_states()?;
//!
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐        ┌─────────────────┐
//! │   Host / Sink   │◄───────│   Coil Bank     │
//! └─────────────────┘        │ (raw + level)   │
//!          │                 └─────────────────┘
//! ┌─────────────────┐                 ▲
//! │   CoilServer    │        ┌─────────────────┐
//! │ (control loop)  │───────►│  Frame Codec    │
//! └─────────────────┘        │ (FC 0x0F, 0x02) │
//!          │                 └─────────────────┘
//! ┌─────────────────┐                 ▲
//! │ Listener Task   │───────►┌─────────────────┐
//! │ (accept loop)   │        │ Client Sessions │
//! └─────────────────┘        └─────────────────┘
//! ```

/// Core error types and result handling
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod error;

/// Server configuration and reconnect policy
pub mod config;

/// Coil storage with latched levels
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod coil_bank;

/// Host variable sink
pub mod projection;

/// Modbus TCP frame layout and function codes
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod protocol;

/// Request decoding and response encoding
pub mod codec;

/// Per-connection request handling
pub mod session;

/// Listener state machine and reconnect bookkeeping
pub mod lifecycle;

/// Modbus TCP coil server
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod server;

/// Logging setup and frame tracing
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod logging;

/// Validation and formatting helpers
pub mod utils;

// Re-export main types for convenience
pub use error::{ModbusError, ModbusResult};
pub use config::{CoilServerConfig, ReconnectPolicy};
pub use coil_bank::{CoilBank, CoilBankStats, CoilSnapshot, WriteSummary};
pub use projection::{
    CallbackProjection, LogProjection, NullProjection, ServerStatus, VariableProjection, VariableUpdate,
};
pub use protocol::ModbusFunction;
pub use codec::{FrameCodec, Handled};
pub use lifecycle::{RuntimeSnapshot, ServerState};
pub use server::{CoilServer, ModbusServer, ServerStats};
pub use logging::FrameTrace;

/// Maximum Modbus TCP frame size (MBAP header + PDU)
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage Coil Server v{} - Modbus TCP coil server by Evan Liu", VERSION)
}

//! Modbus server entry points
//!
//! [`ModbusServer`] ties a [`ProtocolEngine`] to a [`ServerTransport`]. The
//! caller drives it by calling [`poll`](ModbusServer::poll) in a loop, or hands
//! control over with [`run`](ModbusServer::run). Every poll processes at most
//! one frame to completion before returning.
//!
//! ```rust,no_run
//! use voltage_modbus_server::{DataBank, ModbusServer, ProtocolEngine, TcpTransport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = TcpTransport::bind("0.0.0.0:502".parse()?).await?;
//! let engine = ProtocolEngine::new(1, DataBank::default());
//! let mut server = ModbusServer::new(engine, transport);
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::codec::{DropReason, Framing};
use crate::constants::EXCEPTION_BIAS;
use crate::engine::{FrameOutcome, ProtocolEngine};
use crate::error::ModbusResult;
use crate::transport::{ServerTransport, TransportStats};

/// What a single poll did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// No complete frame was available
    Idle,
    /// A response (success or exception) was sent
    Responded,
    /// A frame arrived but was discarded without a response
    Dropped(DropReason),
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    /// Requests answered, exception responses included
    pub requests_handled: u64,
    pub exception_responses: u64,
    pub frames_dropped: u64,
    pub started_at: DateTime<Utc>,
}

impl ServerStats {
    fn new() -> Self {
        Self {
            requests_handled: 0,
            exception_responses: 0,
            frames_dropped: 0,
            started_at: Utc::now(),
        }
    }

    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }
}

/// A Modbus server over one transport
pub struct ModbusServer<T: ServerTransport> {
    engine: ProtocolEngine,
    transport: T,
    stats: ServerStats,
}

impl<T: ServerTransport> ModbusServer<T> {
    pub fn new(engine: ProtocolEngine, transport: T) -> Self {
        Self {
            engine,
            transport,
            stats: ServerStats::new(),
        }
    }

    pub fn engine(&self) -> &ProtocolEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ProtocolEngine {
        &mut self.engine
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.transport.get_stats()
    }

    /// Receive at most one frame, process it and send the response
    ///
    /// Returns immediately with [`PollOutcome::Idle`] when the transport has
    /// nothing to offer. Dropped frames are not errors.
    pub async fn poll(&mut self) -> ModbusResult<PollOutcome> {
        let Some(frame) = self.transport.recv_frame().await? else {
            return Ok(PollOutcome::Idle);
        };

        match self.engine.handle_frame(self.transport.framing(), &frame) {
            FrameOutcome::Dropped(reason) => {
                self.stats.frames_dropped += 1;
                Ok(PollOutcome::Dropped(reason))
            }
            FrameOutcome::Response(response) => {
                let is_exception = response
                    .get(<T::Framing as Framing>::PDU_OFFSET)
                    .is_some_and(|fc| fc & EXCEPTION_BIAS != 0);

                // only delivered responses count as handled
                self.transport.send_frame(&response).await?;
                self.stats.requests_handled += 1;
                if is_exception {
                    self.stats.exception_responses += 1;
                }
                debug!(
                    "[MODBUS-{}] responded with {} bytes",
                    <T::Framing as Framing>::NAME,
                    response.len()
                );
                Ok(PollOutcome::Responded)
            }
        }
    }

    /// Poll forever
    ///
    /// Transient I/O errors (see [`ModbusError::is_recoverable`]) are logged
    /// and polling continues. Anything else ends the loop, e.g. a closed
    /// serial stream or a failing listener.
    ///
    /// [`ModbusError::is_recoverable`]: crate::error::ModbusError::is_recoverable
    pub async fn run(&mut self) -> ModbusResult<()> {
        info!(
            "Modbus {} server running, server id {}",
            <T::Framing as Framing>::NAME,
            self.engine.server_id()
        );

        loop {
            match self.poll().await {
                Ok(_) => {}
                Err(e) if e.is_recoverable() => warn!("Poll failed: {}", e),
                Err(e) => {
                    warn!(
                        "Modbus {} server stopping after {} requests: {}",
                        <T::Framing as Framing>::NAME,
                        self.stats.requests_handled,
                        e
                    );
                    return Err(e);
                }
            }
        }
    }
}

//! Voltage Modbus Server
//!
//! Serves a small demonstration register map over TCP or RTU:
//!
//! | Table | Base | Contents |
//! |-------|------|----------|
//! | discrete inputs | 0 | 10 x off |
//! | coils | 100 | on, off, on, off, ... (10) |
//! | holding registers | 200 | 100 x 42 |
//! | input registers | 1000 | 10 x 1 |
//!
//! Usage:
//!   modbus-server tcp [bind_address]      (default 0.0.0.0:502)
//!   modbus-server rtu <port> [baud_rate]  (requires the `rtu` feature)
//!
//! The server id defaults to 1 and can be overridden with `MODBUS_SERVER_ID`.
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::net::SocketAddr;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use voltage_modbus_server::{
    DataBank, ModbusError, ModbusResult, ModbusServer, ProtocolEngine, RegisterTable,
    ServerTransport, SlaveId, TcpTransport, DEFAULT_TCP_PORT,
};

const DEFAULT_SERVER_ID: SlaveId = 1;

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn demo_bank() -> DataBank {
    DataBank::new(
        RegisterTable::new(100, (0..10).map(|i| i % 2 == 0).collect()),
        RegisterTable::filled(0, 10, false),
        RegisterTable::filled(200, 100, 42),
        RegisterTable::filled(1000, 10, 1),
    )
}

fn server_id() -> ModbusResult<SlaveId> {
    match std::env::var("MODBUS_SERVER_ID") {
        Ok(value) => value.parse().map_err(|_| {
            ModbusError::configuration(format!("MODBUS_SERVER_ID must be 0-255, got {value:?}"))
        }),
        Err(_) => Ok(DEFAULT_SERVER_ID),
    }
}

async fn serve<T: ServerTransport>(engine: ProtocolEngine, transport: T) -> ModbusResult<()> {
    let mut server = ModbusServer::new(engine, transport);

    let result = tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => Ok(()),
    };

    let stats = server.stats();
    info!(
        "Shutting down: {} requests, {} exceptions, {} dropped frames, up {}s",
        stats.requests_handled,
        stats.exception_responses,
        stats.frames_dropped,
        stats.uptime().num_seconds()
    );
    result
}

async fn serve_tcp(engine: ProtocolEngine, address: Option<String>) -> ModbusResult<()> {
    let address = address.unwrap_or_else(|| format!("0.0.0.0:{}", DEFAULT_TCP_PORT));
    let address: SocketAddr = address
        .parse()
        .map_err(|_| ModbusError::configuration(format!("Invalid bind address: {address}")))?;

    let mut transport = TcpTransport::bind(address).await?;
    transport.set_packet_logging(true);
    serve(engine, transport).await
}

#[cfg(feature = "rtu")]
async fn serve_rtu(
    engine: ProtocolEngine,
    port: Option<String>,
    baud_rate: Option<String>,
) -> ModbusResult<()> {
    use voltage_modbus_server::{RtuConfig, RtuTransport};

    let port = port.ok_or_else(|| ModbusError::configuration("Missing serial port"))?;
    let baud_rate = match baud_rate {
        Some(value) => value
            .parse()
            .map_err(|_| ModbusError::configuration(format!("Invalid baud rate: {value}")))?,
        None => 9600,
    };

    let mut transport = RtuTransport::open(&RtuConfig::new(port, baud_rate))?;
    transport.set_packet_logging(true);
    serve(engine, transport).await
}

#[cfg(not(feature = "rtu"))]
async fn serve_rtu(
    _engine: ProtocolEngine,
    _port: Option<String>,
    _baud_rate: Option<String>,
) -> ModbusResult<()> {
    Err(ModbusError::configuration(
        "RTU support not compiled in, rebuild with --features rtu",
    ))
}

#[tokio::main]
async fn main() {
    init_logging();
    info!("{}", voltage_modbus_server::info());

    let mut args = std::env::args().skip(1);
    let mode = args.next().unwrap_or_else(|| "tcp".to_string());

    let result = match server_id() {
        Ok(id) => {
            let engine = ProtocolEngine::new(id, demo_bank());
            match mode.as_str() {
                "tcp" => serve_tcp(engine, args.next()).await,
                "rtu" => serve_rtu(engine, args.next(), args.next()).await,
                other => Err(ModbusError::configuration(format!(
                    "Unknown mode {other:?}, expected \"tcp\" or \"rtu\""
                ))),
            }
        }
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

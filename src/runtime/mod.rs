//! Single-threaded readiness runtime.
//!
//! - `FrameAssembler`: cuts a byte stream into frames
//! - `Connection`: per-connection phase, buffers and write queue
//! - `Dispatcher`: pluggable protocol logic
//! - `Driver`: readiness and transport (mio or in-memory)
//! - `Reactor`: the event loop tying them together

pub mod clock;
pub mod connection;
pub mod dispatcher;
pub mod driver;
pub mod framing;
pub mod memory;
pub mod reactor;
pub mod shutdown;

pub use clock::{Clock, ManualClock, SystemClock};
pub use connection::{ConnId, Phase};
pub use dispatcher::{Dispatch, Dispatcher};
pub use driver::{Driver, MioDriver};
pub use framing::{FrameAssembler, FrameError, Framing, LengthHeader};
pub use memory::{MemoryClient, MemoryDriver, MemoryNetwork};
pub use reactor::{EvictReason, Reactor, ReactorSettings, ReactorStats};
pub use shutdown::Shutdown;

use crate::config::Config;
use std::io;
use tracing::info;

/// Bind the configured sockets and serve `dispatcher` until shutdown.
pub fn serve<P: Dispatcher>(config: &Config, dispatcher: P) -> io::Result<()> {
    let settings = config.reactor_settings();
    let driver = MioDriver::bind(config.listen, config.udp_listen, settings.event_capacity)?;

    info!(
        addr = %driver.local_addr()?,
        udp = ?config.udp_listen,
        protocol = ?config.protocol,
        "Listening"
    );

    let mut reactor = Reactor::new(driver, dispatcher, settings);
    #[cfg(unix)]
    reactor.shutdown_handle().trigger_on_signals()?;
    reactor.run()
}

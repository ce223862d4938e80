//! Hardware drivers.
//!
//! - [`driver`]: the [`Driver`] trait, backend kinds and the factory
//! - [`test_driver`]: echo driver without hardware
//! - [`spp_driver`]: subprocess speaking the Simple Pipe Protocol
//! - [`stream`]: request/response driver over a byte [`stream::Transport`]
//! - [`serial`], [`net`], [`gpib`]: transports for the stream driver

pub mod driver;
pub mod gpib;
pub mod net;
pub mod serial;
pub mod spp_driver;
pub mod stream;
pub mod test_driver;

pub use driver::{create_driver, Driver, DriverConfig, DriverKind};
pub use spp_driver::SppDriver;
pub use stream::{ReadCond, StreamDriver, StreamSettings, Transport};
pub use test_driver::TestDriver;

//! # IPbus client
//!
//! A client library for the IPbus register-access protocol: issue logical
//! register operations against a remote FPGA, get back deferred handles,
//! and `dispatch` to push the packed transactions through UDP, TCP, or a
//! ControlHub gateway.
//!
//! ```no_run
//! use ipbus::prelude::*;
//!
//! # fn main() -> Result<(), ipbus::Error> {
//! let mut client = Client::new("board0", "ipbusudp-2.0://10.0.0.2:50001")?;
//! let wrote = client.write(0x1000, 0xDEAD_BEEF)?;
//! let read = client.read(0x1000)?;
//! client.dispatch()?;
//! assert!(wrote.valid());
//! assert_eq!(read.value()?, 0xDEAD_BEEF);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod buffer;
pub mod client;
pub mod error;
pub mod pack;
pub mod prelude;
pub mod transport;
pub mod uri;
pub mod val;

pub use client::Client;
pub use error::Error;
pub use pack::{
    BlockMode,
    HubTarget,
    Validator,
};
pub use uri::{
    Scheme,
    Uri,
};
pub use val::{
    ValHeader,
    ValVector,
    ValWord,
    Word,
};

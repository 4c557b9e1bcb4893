//! Connect to a device, write a scratch register, and read it back in
//! one dispatch.

use anyhow::Context;
use ipbus::prelude::*;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let uri = std::env::args()
        .nth(1)
        .context("usage: scratch_rw <uri>, e.g. ipbusudp-2.0://192.168.0.2:50001")?;
    let mut client = Client::new("board0", &uri)?;

    let wrote = client.write(0x0, 0xDEAD_BEEF)?;
    let scratch = client.read(0x0)?;
    client.dispatch()?;

    println!("write acknowledged: {}", wrote.valid());
    println!("scratch = {:#010x}", scratch.value()?);
    Ok(())
}

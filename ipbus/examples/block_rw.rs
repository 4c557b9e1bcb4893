//! Stream a block of words into device memory and read it back,
//! letting the packing engine split it across packets.

use anyhow::Context;
use ipbus::prelude::*;

const BASE: u32 = 0x1000;
const WORDS: usize = 1024;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let uri = std::env::args()
        .nth(1)
        .context("usage: block_rw <uri>, e.g. chtcp-2.0://hub:10203?target=192.168.0.2:50001")?;
    let mut client = Client::new("board0", &uri)?;

    let source: Vec<u32> = (0..WORDS as u32).map(|i| i.wrapping_mul(0x9E37_79B9)).collect();
    client.write_block(BASE, &source, BlockMode::Incremental)?;
    let readback = client.read_block(BASE, WORDS, BlockMode::Incremental)?;
    client.dispatch()?;

    anyhow::ensure!(readback.value()? == source, "readback mismatch");
    println!("{WORDS} words round-tripped");
    Ok(())
}

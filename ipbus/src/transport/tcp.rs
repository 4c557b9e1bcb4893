//! The framed TCP transport, used both for plain IPbus-over-TCP and for
//! ControlHub gateways.
//!
//! Plain framing prefixes each direction with a 4-byte big-endian length.
//! In hub framing the ControlHub preamble's leading byte-count field *is*
//! the frame header: the packet already starts with the number of bytes
//! that follow, so nothing extra goes on the wire, and the reply's
//! leading count both delimits the stream and fills the first reply slot.
//!
//! TCP preserves ordering, so the pipelined worker keeps several buffers
//! in flight: it opportunistically writes everything queued before
//! blocking on the oldest outstanding reply.

use super::{
    Shared,
    Transport,
};
use crate::{
    buffer::Buffers,
    error::{
        Error,
        ValidationError,
    },
    pack::Validator,
};
use std::{
    collections::VecDeque,
    io::{
        Read,
        Write,
    },
    net::{
        TcpStream,
        ToSocketAddrs,
    },
    sync::{
        mpsc,
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};
use tracing::{
    debug,
    warn,
};

/// How the byte stream is chopped into packets
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Framing {
    /// 4-byte big-endian length prefix added by the transport
    LengthPrefixed,
    /// The ControlHub preamble carries the length itself
    Hub,
}

/// A connected, framed TCP transport
#[derive(Debug)]
pub struct Tcp {
    stream: TcpStream,
    mode: Mode,
    framing: Framing,
    validator: Validator,
    max_reply: usize,
    timeout: Duration,
}

#[derive(Debug)]
enum Mode {
    Blocking { dead: bool },
    Pipelined(Worker),
}

#[derive(Debug)]
struct Worker {
    queue: Option<mpsc::Sender<Buffers>>,
    handle: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl Tcp {
    /// Connect a stream to the device or gateway, resolving hostnames.
    /// `pipelined` moves the I/O loop onto a background worker.
    /// # Errors
    /// Will return an error if the stream cannot be created or connected.
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        framing: Framing,
        validator: Validator,
        max_reply: usize,
        timeout: Duration,
        pipelined: bool,
    ) -> Result<Self, Error> {
        let stream = TcpStream::connect(addr).map_err(Error::SocketCreation)?;
        stream.set_nodelay(true).map_err(Error::SocketCreation)?;
        stream
            .set_read_timeout(Some(timeout))
            .map_err(Error::SocketCreation)?;
        let mode = if pipelined {
            let worker_stream = stream.try_clone().map_err(Error::SocketCreation)?;
            Mode::Pipelined(Worker::spawn(worker_stream, framing, validator, max_reply))
        } else {
            Mode::Blocking { dead: false }
        };
        Ok(Self {
            stream,
            mode,
            framing,
            validator,
            max_reply,
            timeout,
        })
    }
}

fn io_error(e: std::io::Error) -> Error {
    match e.kind() {
        // Compat for both windows and *nix
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => Error::Timeout,
        _ => Error::SocketIo(e),
    }
}

/// Write one framed packet
fn send_frame(stream: &mut TcpStream, framing: Framing, buffers: &Buffers) -> Result<(), Error> {
    let body = buffers.send_bytes();
    if framing == Framing::LengthPrefixed {
        let prefix = u32::try_from(body.len()).expect("packet fits in u32");
        stream
            .write_all(&prefix.to_be_bytes())
            .map_err(io_error)?;
    }
    stream.write_all(body).map_err(io_error)?;
    debug!(bytes = body.len(), "Sent packet");
    Ok(())
}

/// Read one framed reply, scatter it into the buffer's slots, validate
fn recv_frame(
    stream: &mut TcpStream,
    framing: Framing,
    validator: &Validator,
    scratch: &mut [u8],
    buffers: &Buffers,
) -> Result<(), Error> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).map_err(io_error)?;
    let following = u32::from_be_bytes(prefix) as usize;
    let expected = buffers.reply_counter();
    // in hub framing the length prefix is itself the first reply field
    let (start, total) = match framing {
        Framing::Hub => {
            scratch[..4].copy_from_slice(&prefix);
            (4, following + 4)
        }
        Framing::LengthPrefixed => (0, following),
    };
    if total != expected || total > scratch.len() {
        return Err(ValidationError::Length {
            expected,
            got: total,
        }
        .into());
    }
    stream
        .read_exact(&mut scratch[start..total])
        .map_err(io_error)?;
    debug!(bytes = total, "Received packet");
    buffers.scatter(&scratch[..total])?;
    validator.validate(buffers)
}

impl Transport for Tcp {
    fn dispatch(&mut self, buffers: Buffers) -> Result<(), Error> {
        match &mut self.mode {
            Mode::Blocking { dead } => {
                if *dead {
                    return Err(Error::unusable());
                }
                let mut scratch = vec![0u8; self.max_reply];
                let result = send_frame(&mut self.stream, self.framing, &buffers).and_then(|()| {
                    recv_frame(
                        &mut self.stream,
                        self.framing,
                        &self.validator,
                        &mut scratch,
                        &buffers,
                    )
                });
                if result.is_err() {
                    warn!("TCP transport is now unusable");
                    *dead = true;
                }
                result
            }
            Mode::Pipelined(worker) => worker.dispatch(buffers),
        }
    }

    fn flush(&mut self) -> Result<(), Error> {
        match &mut self.mode {
            // single-threaded dispatch already round-tripped
            Mode::Blocking { .. } => Ok(()),
            Mode::Pipelined(worker) => worker.shared.wait_flush(),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        if let Err(e) = self.stream.set_read_timeout(Some(timeout)) {
            warn!(error = %e, "Could not update the socket deadline");
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Worker {
    fn spawn(
        mut stream: TcpStream,
        framing: Framing,
        validator: Validator,
        max_reply: usize,
    ) -> Self {
        let shared = Arc::new(Shared::default());
        let worker_shared = shared.clone();
        let (queue, jobs) = mpsc::channel::<Buffers>();
        let handle = std::thread::spawn(move || {
            let mut scratch = vec![0u8; max_reply];
            let mut in_flight: VecDeque<Buffers> = VecDeque::new();
            loop {
                // pull the next job, blocking only when nothing is in
                // flight; then drain whatever else is already queued so
                // several packets ride the stream at once
                if in_flight.is_empty() {
                    match jobs.recv() {
                        Ok(buffers) => {
                            Self::write_or_complete(
                                &mut stream,
                                framing,
                                &worker_shared,
                                &mut in_flight,
                                buffers,
                            );
                        }
                        Err(_) => break,
                    }
                }
                while let Ok(buffers) = jobs.try_recv() {
                    Self::write_or_complete(
                        &mut stream,
                        framing,
                        &worker_shared,
                        &mut in_flight,
                        buffers,
                    );
                }
                if let Some(buffers) = in_flight.pop_front() {
                    let result = if worker_shared.is_dead() {
                        Err(Error::unusable())
                    } else {
                        recv_frame(&mut stream, framing, &validator, &mut scratch, &buffers)
                    };
                    worker_shared.complete(result);
                }
            }
        });
        Self {
            queue: Some(queue),
            handle: Some(handle),
            shared,
        }
    }

    fn write_or_complete(
        stream: &mut TcpStream,
        framing: Framing,
        shared: &Shared,
        in_flight: &mut VecDeque<Buffers>,
        buffers: Buffers,
    ) {
        if shared.is_dead() {
            shared.complete(Err(Error::unusable()));
            return;
        }
        match send_frame(stream, framing, &buffers) {
            Ok(()) => in_flight.push_back(buffers),
            Err(e) => shared.complete(Err(e)),
        }
    }

    fn dispatch(&mut self, buffers: Buffers) -> Result<(), Error> {
        self.shared.begin_dispatch()?;
        let queue = self.queue.as_ref().ok_or_else(Error::unusable)?;
        queue
            .send(buffers)
            .map_err(|_| self.shared.abort_dispatch(Error::unusable()))?;
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // closing the queue ends the worker loop once in-flight replies
        // have drained
        drop(self.queue.take());
        if let Some(handle) = self.handle.take() {
            drop(handle.join());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pack::{
            BlockMode,
            HubTarget,
            Packer,
        },
        transport::mock::Emulator,
    };
    use std::net::{
        Ipv4Addr,
        TcpListener,
    };

    /// Stand up a stream device emulator on loopback. It frames with a
    /// plain length prefix, or speaks the hub preamble when built with a
    /// target.
    fn spawn_device(mut emulator: Emulator, hub: bool) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            loop {
                let mut prefix = [0u8; 4];
                if stream.read_exact(&mut prefix).is_err() {
                    break;
                }
                let len = u32::from_be_bytes(prefix) as usize;
                let mut request = vec![0u8; len];
                stream.read_exact(&mut request).unwrap();
                if hub {
                    // the prefix is the preamble's byte-count field
                    let mut full = prefix.to_vec();
                    full.extend_from_slice(&request);
                    if let Some(reply) = emulator.respond(&full) {
                        // the emulator's reply already leads with the
                        // total byte count
                        stream.write_all(&reply).unwrap();
                    }
                } else if let Some(reply) = emulator.respond(&request) {
                    let reply_prefix = u32::try_from(reply.len()).unwrap();
                    stream.write_all(&reply_prefix.to_be_bytes()).unwrap();
                    stream.write_all(&reply).unwrap();
                }
            }
        });
        addr
    }

    #[test]
    fn test_blocking_round_trip() {
        let addr = spawn_device(Emulator::new(None), false);
        let validator = Validator::new(None);
        let mut tcp = Tcp::connect(
            addr,
            Framing::LengthPrefixed,
            validator,
            1400,
            Duration::from_secs(1),
            false,
        )
        .unwrap();

        let mut packer = Packer::new(1400, 1400, None);
        let write = packer.write(&mut tcp, 0x10, 0xAB).unwrap();
        let read = packer.read_word::<u32>(&mut tcp, 0x10, None).unwrap();
        packer.dispatch(&mut tcp).unwrap();
        assert!(write.valid());
        assert_eq!(read.value().unwrap(), 0xAB);
    }

    #[test]
    fn test_pipelined_block_round_trip() {
        let addr = spawn_device(Emulator::new(None), false);
        let validator = Validator::new(None);
        let mut tcp = Tcp::connect(
            addr,
            Framing::LengthPrefixed,
            validator,
            256,
            Duration::from_secs(1),
            true,
        )
        .unwrap();

        let mut packer = Packer::new(64, 64, None);
        let source: Vec<u32> = (100..150).collect();
        packer
            .write_block(&mut tcp, 0x400, &source, BlockMode::Incremental)
            .unwrap();
        let read = packer
            .read_block::<u32>(&mut tcp, 0x400, 50, BlockMode::Incremental)
            .unwrap();
        packer.dispatch(&mut tcp).unwrap();
        assert_eq!(read.value().unwrap(), source);
    }

    #[test]
    fn test_hub_framed_round_trip() {
        let target = HubTarget {
            ip: Ipv4Addr::new(10, 0, 0, 9),
            port: 50001,
        };
        let addr = spawn_device(Emulator::new(Some(target)), true);
        let validator = Validator::new(Some(target));
        let mut tcp = Tcp::connect(
            addr,
            Framing::Hub,
            validator,
            1400,
            Duration::from_secs(1),
            false,
        )
        .unwrap();

        let mut packer = Packer::new(1400, 1400, Some(target));
        let write = packer.write(&mut tcp, 0x42, 7).unwrap();
        let read = packer.read_word::<u32>(&mut tcp, 0x42, None).unwrap();
        packer.dispatch(&mut tcp).unwrap();
        assert!(write.valid());
        assert_eq!(read.value().unwrap(), 7);
    }
}

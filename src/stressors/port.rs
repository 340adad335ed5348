//! Loopback TCP ping-pong

use std::{
    io::{self, Read, Write},
    net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream},
};
use stressrun::{Args, ExitCode, Stressor, StressorClass, StressorOption};

/// Connects to its own listener, exchanging one byte per connection
pub struct Port;
//
impl Stressor for Port {
    fn name(&self) -> &'static str {
        "port"
    }

    fn classes(&self) -> StressorClass {
        StressorClass::OS
    }

    fn options(&self) -> &'static [StressorOption] {
        &[StressorOption {
            name: "verify",
            help: "check that the byte received is the byte sent",
        }]
    }

    fn run(&self, args: &mut Args<'_>) -> ExitCode {
        let region = args.region();
        let port = match region.reserve_port(BASE_PORT) {
            Ok(Some(port)) => port,
            Ok(None) => {
                log::info!("{}: no network port left, skipping", args.name());
                return ExitCode::NoResource;
            }
            Err(e) => {
                log::error!("{} instance {}: {e}", args.name(), args.instance());
                return ExitCode::Failure;
            }
        };
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let code = match TcpListener::bind(addr) {
            Ok(listener) => ping_pong(args, &listener, addr),
            Err(e) => {
                log::info!("{}: failed to listen on {addr} ({e}), skipping", args.name());
                ExitCode::NoResource
            }
        };
        if let Err(e) = region.release_port(port) {
            log::warn!("{} instance {}: {e}", args.name(), args.instance());
        }
        code
    }
}

/// Exchange bytes until told to stop
fn ping_pong(args: &mut Args<'_>, listener: &TcpListener, addr: SocketAddr) -> ExitCode {
    let mut byte = 0u8;
    while args.keep_running() {
        byte = byte.wrapping_add(1);
        match exchange(listener, addr, byte) {
            Ok(received) if args.verify() && received != byte => {
                log::error!(
                    "{} instance {}: sent {byte}, received {received}",
                    args.name(),
                    args.instance()
                );
                return ExitCode::Failure;
            }
            Ok(_) => args.bogo_inc(),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                log::error!("{} instance {}: {e}", args.name(), args.instance());
                return ExitCode::Failure;
            }
        }
    }
    ExitCode::Success
}

/// Send one byte through a fresh connection
fn exchange(listener: &TcpListener, addr: SocketAddr, byte: u8) -> io::Result<u8> {
    let mut client = TcpStream::connect(addr)?;
    let (mut server, _) = listener.accept()?;
    client.write_all(&[byte])?;
    let mut received = [0u8];
    server.read_exact(&mut received)?;
    Ok(received[0])
}

/// First port to try
const BASE_PORT: u16 = 27_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_exchange() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_eq!(exchange(&listener, addr, 42).unwrap(), 42);
    }
}

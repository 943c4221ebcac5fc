//! Loopback endpoint whose port is the readiness token.

use super::context::HostEndpoint;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;

/// Listens on `127.0.0.1` at an OS-assigned port. Each connection gets a
/// one-line greeting naming the loader and the process.
pub struct TcpHostEndpoint {
    address: SocketAddr,
}

impl TcpHostEndpoint {
    /// Bind and start accepting on a background thread.
    pub fn start() -> anyhow::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))?;
        let address = listener.local_addr()?;

        thread::Builder::new()
            .name("reloaded-host".into())
            .spawn(move || accept_loop(listener))?;

        log::info!("Loader host listening on {}", address);
        Ok(Self { address })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

impl HostEndpoint for TcpHostEndpoint {
    fn port(&self) -> i32 {
        i32::from(self.address.port())
    }
}

pub fn greeting() -> String {
    format!(
        "Reloaded-II loader {} pid {}\n",
        env!("CARGO_PKG_VERSION"),
        std::process::id()
    )
}

fn accept_loop(listener: TcpListener) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => greet(stream),
            Err(e) => log::debug!("Host accept failed: {}", e),
        }
    }
}

fn greet(mut stream: TcpStream) {
    if let Err(e) = stream.write_all(greeting().as_bytes()) {
        log::debug!("Failed to greet controller: {}", e);
    }
}

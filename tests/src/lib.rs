//! Shared harness for the end-to-end tunnel tests.
//!
//! Engines are driven synchronously over loopback: every `pump` round gives
//! each end one tick (an empty `send`) and drains both sockets, so control
//! exchanges settle without an event loop.

use std::io::ErrorKind;
use std::sync::Once;
use std::thread::sleep;
use std::time::Duration;

use braid_tunnel::{Error, Tunnel, TunnelConfig};

static TRACING: Once = Once::new();

/// Route engine tracing to the test output; filtered by `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Two engines joined over loopback with a shared pre-shared key; `a` has an
/// operator-configured path toward `b`, `b` learns its path from ingest.
pub struct Pair {
    pub a: Tunnel,
    pub b: Tunnel,
}

impl Pair {
    pub fn new() -> Self {
        Self::with_config(TunnelConfig::default(), TunnelConfig::default())
    }

    pub fn with_config(cfg_a: TunnelConfig, cfg_b: TunnelConfig) -> Self {
        init_tracing();
        let mut a = Tunnel::new(cfg_a).expect("engine a");
        let mut b = Tunnel::new(cfg_b).expect("engine b");
        let key = a.key();
        b.set_key(&key).expect("psk");
        let b_port = b.local_addr().expect("addr b").port();
        a.add_peer("127.0.0.1", "127.0.0.1", b_port, false).expect("peer");
        // Loopback exchanges settle fast; short timers keep tests snappy.
        a.set_send_timeout(Duration::from_millis(20)).expect("timeout");
        b.set_send_timeout(Duration::from_millis(20)).expect("timeout");
        Self { a, b }
    }

    /// Port `a` is bound to, for configuring a reverse path.
    pub fn a_port(&self) -> u16 {
        self.a.local_addr().expect("addr a").port()
    }

    /// One settling round: tick both ends, drain both sockets. Returns the
    /// data payloads delivered to (`a`, `b`).
    pub fn round(&mut self) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        self.a.send(&[], 0).expect("tick a");
        self.b.send(&[], 0).expect("tick b");
        sleep(Duration::from_millis(2));
        (drain(&mut self.a), drain(&mut self.b))
    }

    /// Run settling rounds until `done` holds or `rounds` are exhausted.
    pub fn settle(&mut self, rounds: usize, mut done: impl FnMut(&Self) -> bool) -> bool {
        for _ in 0..rounds {
            self.round();
            if done(self) {
                return true;
            }
        }
        false
    }
}

impl Default for Pair {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive until the socket runs dry, collecting data payloads.
pub fn drain(tun: &mut Tunnel) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 2048];
    loop {
        match tun.recv(&mut buf) {
            Ok(0) => continue,
            Ok(n) => out.push(buf[..n].to_vec()),
            Err(Error::Io(e)) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => panic!("recv failed: {e}"),
        }
    }
    out
}

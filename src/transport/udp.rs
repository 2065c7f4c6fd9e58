use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::packet::Packet;

const RECV_BUF_LEN: usize = 2048;
const RECV_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not running")]
    NotRunning,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_errors: u64,
    pub receive_errors: u64,
    pub invalid_packets: u64,
}

#[derive(Default)]
struct Counters {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    send_errors: AtomicU64,
    receive_errors: AtomicU64,
    invalid_packets: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> TransportStats {
        TransportStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            invalid_packets: self.invalid_packets.load(Ordering::Relaxed),
        }
    }
}

pub type PacketCallback = Box<dyn Fn(Packet, SocketAddr) + Send + Sync>;

/// Owns a single UDP socket and a dedicated receive thread. Sends are
/// synchronous and non-blocking from the caller's point of view; received
/// packets are dispatched to a callback running on the receive thread, which
/// must not block.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
    callback: Arc<Mutex<Option<PacketCallback>>>,
}

impl UdpTransport {
    /// Binds to `port` (0 = OS-assigned, letting several instances share a
    /// host) on all interfaces.
    pub fn bind(port: u16) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;
        let local_addr = socket.local_addr()?;
        info!(addr = %local_addr, "udp transport bound");
        Ok(Self {
            socket,
            local_addr,
            running: Arc::new(AtomicBool::new(false)),
            receiver: Mutex::new(None),
            counters: Arc::new(Counters::default()),
            callback: Arc::new(Mutex::new(None)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn set_on_packet_received(&self, callback: PacketCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn start(&self) -> Result<(), TransportError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let socket = self.socket.try_clone()?;
        let running = self.running.clone();
        let counters = self.counters.clone();
        let callback = self.callback.clone();
        let local_addr = self.local_addr;

        let handle = std::thread::Builder::new()
            .name(format!("udp-recv-{local_addr}"))
            .spawn(move || receive_loop(socket, running, counters, callback))
            .expect("failed to spawn udp receive thread");
        *self.receiver.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.receiver.lock().unwrap().take() {
            handle.join().ok();
        }
        info!(addr = %self.local_addr, "udp transport stopped");
    }

    pub fn send_packet(&self, packet: &mut Packet, addr: SocketAddr) -> Result<(), TransportError> {
        if !self.is_running() {
            return Err(TransportError::NotRunning);
        }
        packet.update_timestamp();
        let bytes = packet.encode();
        match self.socket.send_to(&bytes, addr) {
            Ok(n) => {
                self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.counters.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, %addr, "udp send failed");
                Err(TransportError::Io(err))
            }
        }
    }

    pub fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(
    socket: UdpSocket,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    callback: Arc<Mutex<Option<PacketCallback>>>,
) {
    let mut buf = [0u8; RECV_BUF_LEN];
    while running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((n, addr)) => {
                counters.packets_received.fetch_add(1, Ordering::Relaxed);
                counters.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                match Packet::decode(&buf[..n]) {
                    Ok(packet) => {
                        if let Some(cb) = callback.lock().unwrap().as_ref() {
                            cb(packet, addr);
                        }
                    }
                    Err(err) => {
                        counters.invalid_packets.fetch_add(1, Ordering::Relaxed);
                        debug!(error = %err, %addr, "dropped undecodable packet");
                    }
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {
                continue;
            }
            Err(err) => {
                counters.receive_errors.fetch_add(1, Ordering::Relaxed);
                error!(error = %err, "udp receive error");
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn bind_to_port_zero_yields_os_assigned_port() {
        let transport = UdpTransport::bind(0).unwrap();
        assert_ne!(transport.local_addr().port(), 0);
    }

    #[test]
    fn send_before_start_fails_not_running() {
        let transport = UdpTransport::bind(0).unwrap();
        let mut packet = Packet::data(1, 2, 0, 0, vec![1]);
        let result = transport.send_packet(&mut packet, "127.0.0.1:1".parse().unwrap());
        assert!(matches!(result, Err(TransportError::NotRunning)));
    }

    #[test]
    fn sent_packet_is_received_by_peer() {
        let receiver = UdpTransport::bind(0).unwrap();
        let (tx, rx) = mpsc::channel();
        receiver.set_on_packet_received(Box::new(move |packet, _addr| {
            tx.send(packet).ok();
        }));
        receiver.start().unwrap();

        let sender = UdpTransport::bind(0).unwrap();
        sender.start().unwrap();

        let mut packet = Packet::data(11, 22, 3, 4, vec![0x90, 0x40, 0x7F]);
        sender.send_packet(&mut packet, receiver.local_addr()).unwrap();

        let received = rx.recv_timeout(Duration::from_secs(2)).expect("packet not received");
        assert_eq!(received.payload, vec![0x90, 0x40, 0x7F]);
        assert_eq!(received.device_id, 4);

        sender.stop();
        receiver.stop();
    }

    #[test]
    fn stop_is_idempotent_and_join_completes() {
        let transport = UdpTransport::bind(0).unwrap();
        transport.start().unwrap();
        transport.stop();
        transport.stop();
    }
}

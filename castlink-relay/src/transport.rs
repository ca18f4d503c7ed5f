//! Duplex text-message transport.
//!
//! The RPC engine never touches a socket directly. It talks to a
//! [`Transport`], and a socket pump (server-side axum WebSocket, client-side
//! tokio-tungstenite stream, or the in-memory bridge below) drives the
//! matching [`SocketEnd`]:
//!
//! ```text
//!  RpcEngine ── Transport ══ mpsc ══ SocketEnd ── pump ── WebSocket
//!               send(text)   ─────►  outgoing
//!               incoming     ◄─────  incoming
//! ```
//!
//! Dropping the socket side ends the incoming stream, which is how the
//! engine learns the connection closed.

use tokio::sync::mpsc;

/// Close code telling a peer not to reconnect.
pub const NO_RECONNECT: u16 = 3001;

/// Frames queued for the socket pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    Close(u16),
}

/// Engine-side end of a connection.
pub struct Transport {
    sender: TransportSender,
    incoming: mpsc::UnboundedReceiver<String>,
}

/// Socket-side end of a connection, owned by a pump.
pub struct SocketEnd {
    pub incoming: mpsc::UnboundedSender<String>,
    pub outgoing: mpsc::UnboundedReceiver<Outgoing>,
}

/// Cloneable write half of a [`Transport`].
#[derive(Clone)]
pub struct TransportSender {
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl TransportSender {
    /// Queue a text frame; returns `false` once the socket is gone.
    pub fn send(&self, text: String) -> bool {
        self.outgoing.send(Outgoing::Text(text)).is_ok()
    }

    /// Ask the pump to close the socket with `code`.
    pub fn close(&self, code: u16) {
        let _ = self.outgoing.send(Outgoing::Close(code));
    }

    pub fn is_closed(&self) -> bool {
        self.outgoing.is_closed()
    }
}

impl Transport {
    /// Create a transport and the socket end a pump drives.
    pub fn channel() -> (Transport, SocketEnd) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Transport {
                sender: TransportSender { outgoing: out_tx },
                incoming: in_rx,
            },
            SocketEnd {
                incoming: in_tx,
                outgoing: out_rx,
            },
        )
    }

    /// Two transports wired to each other in memory.
    ///
    /// Closing either side (or dropping it) closes both.
    pub fn pair() -> (Transport, Transport) {
        let (a, a_end) = Self::channel();
        let (b, b_end) = Self::channel();
        tokio::spawn(bridge(a_end, b_end));
        (a, b)
    }

    pub fn sender(&self) -> &TransportSender {
        &self.sender
    }

    pub fn into_parts(self) -> (TransportSender, mpsc::UnboundedReceiver<String>) {
        (self.sender, self.incoming)
    }
}

async fn bridge(mut a: SocketEnd, mut b: SocketEnd) {
    loop {
        tokio::select! {
            frame = a.outgoing.recv() => match frame {
                Some(Outgoing::Text(text)) => {
                    let _ = b.incoming.send(text);
                }
                _ => break,
            },
            frame = b.outgoing.recv() => match frame {
                Some(Outgoing::Text(text)) => {
                    let _ = a.incoming.send(text);
                }
                _ => break,
            },
        }
    }
    log::trace!("in-memory transport closed");
}

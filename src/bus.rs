// CAN transport seam
//
// The protocol and loop code talk to `CanBus` only; `SocketcanBus` is the thin
// adapter over the kernel socketcan interface. One handle per bus segment, one
// owner per handle: the wire protocol carries no request-correlation ids, so
// concurrent exchanges on the same segment would misattribute stale responses.
// Ownership (`&mut self` on every operation) enforces that discipline.

use std::io;
use std::time::Duration;

use socketcan::{EmbeddedFrame, ExtendedId, Socket};
use tracing::debug;

/// 29-bit extended identifier mask
pub const EXT_ID_MASK: u32 = 0x1FFF_FFFF;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to open CAN interface {interface}: {source}")]
    Open {
        interface: String,
        #[source]
        source: io::Error,
    },

    #[error("CAN send failed: {0}")]
    Send(#[source] io::Error),

    #[error("CAN receive failed: {0}")]
    Receive(#[source] io::Error),

    #[error("arbitration id 0x{0:08X} does not fit in 29 bits")]
    InvalidId(u32),

    #[error("payload of {0} bytes exceeds the CAN maximum of 8")]
    PayloadTooLong(usize),
}

/// One frame on the wire. Outbound frames always carry 8 data bytes; inbound
/// frames may be shorter and may be hardware error reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    /// 29-bit extended arbitration id
    pub id: u32,
    pub data: Vec<u8>,
    /// Set when the hardware flagged this as an error frame
    pub is_error: bool,
}

impl CanFrame {
    pub fn new(id: u32, data: Vec<u8>) -> Self {
        Self {
            id: id & EXT_ID_MASK,
            data,
            is_error: false,
        }
    }
}

pub trait CanBus {
    fn send(&mut self, frame: &CanFrame) -> Result<(), BusError>;

    /// Receive one frame, waiting at most `timeout`. A zero timeout means
    /// "return what is queued right now, never wait" and is how the flush and
    /// feedback-drain paths stay non-blocking.
    fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>, BusError>;
}

/// Adapter over a kernel socketcan interface. The socket is released when the
/// adapter is dropped.
pub struct SocketcanBus {
    interface: String,
    socket: socketcan::CanSocket,
    nonblocking: bool,
}

impl SocketcanBus {
    pub fn open(interface: &str) -> Result<Self, BusError> {
        let socket = socketcan::CanSocket::open(interface).map_err(|e| BusError::Open {
            interface: interface.to_string(),
            source: e.into(),
        })?;
        debug!("opened CAN interface {interface}");
        Ok(Self {
            interface: interface.to_string(),
            socket,
            nonblocking: false,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), BusError> {
        if self.nonblocking != nonblocking {
            self.socket
                .set_nonblocking(nonblocking)
                .map_err(BusError::Receive)?;
            self.nonblocking = nonblocking;
        }
        Ok(())
    }

    fn convert(frame: socketcan::CanFrame) -> CanFrame {
        let id = match frame.id() {
            socketcan::Id::Extended(ext) => ext.as_raw(),
            socketcan::Id::Standard(sid) => u32::from(sid.as_raw()),
        };
        CanFrame {
            id,
            data: frame.data().to_vec(),
            is_error: matches!(frame, socketcan::CanFrame::Error(_)),
        }
    }
}

impl CanBus for SocketcanBus {
    fn send(&mut self, frame: &CanFrame) -> Result<(), BusError> {
        let id = ExtendedId::new(frame.id).ok_or(BusError::InvalidId(frame.id))?;
        let wire = socketcan::CanFrame::new(id, &frame.data)
            .ok_or(BusError::PayloadTooLong(frame.data.len()))?;
        self.socket.write_frame(&wire).map_err(BusError::Send)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>, BusError> {
        if timeout.is_zero() {
            self.set_nonblocking(true)?;
            match self.socket.read_frame() {
                Ok(frame) => Ok(Some(Self::convert(frame))),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(BusError::Receive(e)),
            }
        } else {
            self.set_nonblocking(false)?;
            match self.socket.read_frame_timeout(timeout) {
                Ok(frame) => Ok(Some(Self::convert(frame))),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    Ok(None)
                }
                Err(e) => Err(BusError::Receive(e)),
            }
        }
    }
}

#[cfg(test)]
pub mod mock {
    //! Scriptable in-memory bus for exercising the protocol and loop code.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    pub struct MockBus {
        pub inbound: VecDeque<CanFrame>,
        pub sent: Vec<CanFrame>,
        /// Fail the Nth send attempt (0-based) with an I/O error; later
        /// attempts go through again
        pub fail_send_at: Option<usize>,
        send_attempts: usize,
        /// Set to true when the handle is dropped
        pub released: Option<Arc<AtomicBool>>,
    }

    impl MockBus {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn queue(&mut self, frame: CanFrame) {
            self.inbound.push_back(frame);
        }

        pub fn sent_with_mux(&self, mux: u8) -> usize {
            self.sent
                .iter()
                .filter(|f| (f.id >> 24) as u8 == mux)
                .count()
        }
    }

    impl CanBus for MockBus {
        fn send(&mut self, frame: &CanFrame) -> Result<(), BusError> {
            let attempt = self.send_attempts;
            self.send_attempts += 1;
            if self.fail_send_at == Some(attempt) {
                return Err(BusError::Send(io::Error::other("scripted send failure")));
            }
            self.sent.push(frame.clone());
            Ok(())
        }

        fn receive(&mut self, _timeout: Duration) -> Result<Option<CanFrame>, BusError> {
            Ok(self.inbound.pop_front())
        }
    }

    impl Drop for MockBus {
        fn drop(&mut self) {
            if let Some(flag) = &self.released {
                flag.store(true, Ordering::SeqCst);
            }
        }
    }
}

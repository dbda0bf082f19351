use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use thiserror::Error;
use tracing::{debug, warn};

use crate::decode::{Frame, Protocol};
use crate::ring::{ConfigError, MapRegion, RingConfig, RxRing};
use crate::socket;

/// One delivery from the capture session. Frame and invalid-frame views
/// borrow ring memory and are only valid for the duration of the call.
#[derive(Debug)]
pub enum Event<'a> {
    /// A captured frame that decoded cleanly.
    Frame(Frame<'a>),
    /// A real captured packet that failed to decode.
    InvalidFrame(&'a [u8]),
    /// An unrecoverable capture fault; the session is in ERROR afterwards.
    Error(CaptureError),
}

/// Consumer callback. Invoked synchronously, once per captured frame, in
/// kernel-fill order.
pub trait Handler {
    fn event(&mut self, event: Event<'_>);
}

/// Readiness notification facility provided by the embedding event loop.
/// Registration is level-triggered read readiness on the capture descriptor.
pub trait EventCore {
    fn register_read(&mut self, fd: RawFd) -> io::Result<()>;
    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;
}

/// Readiness kinds the embedding loop forwards via [`Capture::on_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdEvent {
    Read,
    Error,
    HangUp,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// start() was called on a session that is not OPEN.
    #[error("unable to start capture")]
    NotOpen,
    /// Socket creation, ring negotiation, mapping, bind, link-type detection
    /// or event-core registration failed at start time.
    #[error("unable to {operation}: {reason}")]
    Setup {
        operation: &'static str,
        reason: String,
    },
    /// The capture descriptor signalled error or hangup readiness.
    #[error("socket event: {0:?}")]
    Fd(FdEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    Started,
    Error,
}

/// A packet capture session over one interface.
///
/// Lifecycle: [`Capture::open`] fixes the geometry without touching the
/// kernel; [`Capture::start`] acquires the socket, ring and readiness
/// registration; [`Capture::close`] releases everything and is idempotent.
/// After an error only close() followed by a fresh open()/start() recovers.
pub struct Capture<H: Handler> {
    state: State,
    interface: String,
    config: RingConfig,
    fd: RawFd,
    map: Option<MapRegion>,
    ring: Option<RxRing>,
    link: Protocol,
    handler: H,
}

impl<H: Handler> Capture<H> {
    /// Create a session for `interface`. Validates the ring geometry; no
    /// kernel resources are acquired until [`Capture::start`].
    pub fn open(interface: &str, config: RingConfig, handler: H) -> Result<Capture<H>, ConfigError> {
        config.validate()?;
        Ok(Capture {
            state: State::Open,
            interface: interface.to_string(),
            config,
            fd: -1,
            map: None,
            ring: None,
            link: Protocol::Data,
            handler,
        })
    }

    /// Bind the capture socket, map the ring, detect the link type and
    /// register for read readiness. Faults are reported through the handler
    /// as [`Event::Error`]; on success the session is STARTED.
    pub fn start(&mut self, core: &mut dyn EventCore) {
        if self.state != State::Open {
            // Rejected without touching state, cursor or mapping
            self.handler.event(Event::Error(CaptureError::NotOpen));
            return;
        }

        let rs = match socket::open_ring(&self.interface, &self.config) {
            Ok(rs) => rs,
            Err(err) => {
                self.fail(err);
                return;
            }
        };

        if let Err(err) = core.register_read(rs.fd) {
            unsafe { libc::close(rs.fd) };
            self.fail(CaptureError::Setup {
                operation: "register capture descriptor",
                reason: err.to_string(),
            });
            return;
        }

        let ring = unsafe {
            RxRing::new(
                rs.map.as_ptr(),
                self.config.block_size,
                self.config.block_count,
            )
        };
        self.fd = rs.fd;
        self.link = rs.link;
        self.map = Some(rs.map);
        self.ring = Some(ring);
        self.state = State::Started;
        debug!(interface = %self.interface, link = ?self.link, "capture started");
    }

    /// Route a readiness notification from the event core. Read readiness
    /// drains every ready block; error or hangup readiness is an
    /// unrecoverable capture fault.
    pub fn on_event(&mut self, event: FdEvent) {
        match event {
            FdEvent::Read => {
                if self.state != State::Started {
                    return;
                }
                if let Some(ring) = self.ring.as_mut() {
                    ring.drain(self.link, &mut self.handler);
                }
            }
            other => {
                // Faults are reported once; ERROR is terminal until close()
                if self.state == State::Started {
                    self.fail(CaptureError::Fd(other));
                }
            }
        }
    }

    /// Release the readiness registration, ring mapping and socket.
    /// Idempotent; safe to call from any state.
    pub fn close(&mut self, core: &mut dyn EventCore) {
        if self.state == State::Closed {
            return;
        }

        self.ring = None;
        self.map = None; // munmaps
        if self.fd >= 0 {
            if let Err(err) = core.deregister(self.fd) {
                warn!(%err, "deregistering capture descriptor failed");
            }
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
        self.state = State::Closed;
        debug!(interface = %self.interface, "capture closed");
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Link-layer protocol detected at start; `Protocol::Data` before then.
    pub fn link(&self) -> Protocol {
        self.link
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    fn fail(&mut self, err: CaptureError) {
        self.state = State::Error;
        self.handler.event(Event::Error(err));
    }
}

impl<H: Handler> AsRawFd for Capture<H> {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl<H: Handler> Drop for Capture<H> {
    fn drop(&mut self) {
        // The mapping unmaps itself; deregistration needs the event core and
        // is only possible through close()
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::os::unix::io::RawFd;

    use super::{Capture, CaptureError, Event, EventCore, FdEvent, Handler, State};
    use crate::ring::{ConfigError, RingConfig};

    #[derive(Default)]
    struct Sink {
        errors: Vec<CaptureError>,
        frames: usize,
    }

    impl Handler for Sink {
        fn event(&mut self, event: Event<'_>) {
            match event {
                Event::Error(err) => self.errors.push(err),
                Event::Frame(_) | Event::InvalidFrame(_) => self.frames += 1,
            }
        }
    }

    #[derive(Default)]
    struct Core {
        registered: Vec<RawFd>,
    }

    impl EventCore for Core {
        fn register_read(&mut self, fd: RawFd) -> io::Result<()> {
            self.registered.push(fd);
            Ok(())
        }

        fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
            self.registered.retain(|&f| f != fd);
            Ok(())
        }
    }

    #[test]
    fn open_validates_geometry() {
        let bad = RingConfig {
            block_count: 0,
            ..RingConfig::default()
        };
        let r = Capture::open("lo", bad, Sink::default());
        assert_eq!(r.err().unwrap(), ConfigError::ZeroBlockCount);
    }

    #[test]
    fn open_reaches_open_state_without_resources() {
        let capture = Capture::open("lo", RingConfig::default(), Sink::default()).unwrap();
        assert_eq!(capture.state(), State::Open);
        assert_eq!(capture.fd, -1);
        assert!(capture.map.is_none());
        assert!(capture.ring.is_none());
    }

    #[test]
    fn start_after_close_is_rejected_without_state_change() {
        let mut core = Core::default();
        let mut capture = Capture::open("lo", RingConfig::default(), Sink::default()).unwrap();
        capture.close(&mut core);
        assert_eq!(capture.state(), State::Closed);

        capture.start(&mut core);
        assert_eq!(capture.state(), State::Closed);
        assert_eq!(capture.handler().errors, vec![CaptureError::NotOpen]);
        assert!(core.registered.is_empty());
    }

    #[test]
    fn start_when_started_is_rejected_without_state_change() {
        let mut core = Core::default();
        let mut capture = Capture::open("lo", RingConfig::default(), Sink::default()).unwrap();
        capture.state = State::Started;

        capture.start(&mut core);
        assert_eq!(capture.state(), State::Started);
        assert_eq!(capture.handler().errors, vec![CaptureError::NotOpen]);
    }

    #[test]
    fn close_is_idempotent() {
        let mut core = Core::default();
        let mut capture = Capture::open("lo", RingConfig::default(), Sink::default()).unwrap();

        capture.close(&mut core);
        capture.close(&mut core);
        assert_eq!(capture.state(), State::Closed);
        assert!(capture.handler().errors.is_empty());
    }

    #[test]
    fn error_readiness_moves_session_to_error() {
        let mut core = Core::default();
        let mut capture = Capture::open("lo", RingConfig::default(), Sink::default()).unwrap();
        capture.state = State::Started;

        capture.on_event(FdEvent::HangUp);
        assert_eq!(capture.state(), State::Error);
        assert_eq!(
            capture.handler().errors,
            vec![CaptureError::Fd(FdEvent::HangUp)]
        );

        // ERROR disables further delivery
        capture.on_event(FdEvent::Read);
        assert_eq!(capture.handler().frames, 0);

        // close() recovers to CLOSED
        capture.close(&mut core);
        assert_eq!(capture.state(), State::Closed);
    }
}

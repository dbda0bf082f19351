//
// Simple consumer that counts captured packets and UDP payload bytes on one
// interface and reports the totals once per second.
//
// The embedding event loop here is a minimal poll(2) wrapper implementing
// EventCore; the report timer is folded into the poll timeout.
//
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use rlimit::{setrlimit, Resource};
use structopt::StructOpt;

use afpacket::capture::{Capture, Event, EventCore, FdEvent, Handler};
use afpacket::decode::Protocol;
use afpacket::ring::RingConfig;

#[derive(StructOpt, Debug)]
#[structopt(name = "udp_count")]
struct Opt {
    /// The interface to capture on
    #[structopt(long)]
    interface: String,

    /// Space reserved per frame in the ring
    #[structopt(long, default_value = "2048")]
    frame_size: usize,

    /// Ring block size
    #[structopt(long, default_value = "262144")]
    block_size: usize,

    /// Number of ring blocks
    #[structopt(long, default_value = "4")]
    block_count: usize,
}

#[derive(Default)]
struct Stats {
    packets: usize,
    udp_bytes: usize,
    invalid: usize,
    failed: Option<String>,
}

impl Handler for Stats {
    fn event(&mut self, event: Event<'_>) {
        match event {
            Event::Frame(frame) => {
                self.packets += 1;
                if let (Some(l0), Some(l1), Some(l2), Some(l3)) = (
                    frame.layer(0),
                    frame.layer(1),
                    frame.layer(2),
                    frame.layer(3),
                ) {
                    if l0.protocol == Protocol::Ether
                        && l1.protocol == Protocol::Ip
                        && l2.protocol == Protocol::Udp
                        && l3.protocol == Protocol::Data
                    {
                        self.udp_bytes += l3.data.len();
                    }
                }
            }
            Event::InvalidFrame(_) => {
                self.invalid += 1;
            }
            Event::Error(err) => {
                self.failed = Some(err.to_string());
            }
        }
    }
}

#[derive(Default)]
struct Poller {
    fds: Vec<libc::pollfd>,
}

impl EventCore for Poller {
    fn register_read(&mut self, fd: RawFd) -> io::Result<()> {
        self.fds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.fds.retain(|p| p.fd != fd);
        Ok(())
    }
}

impl Poller {
    fn poll(&mut self, timeout_ms: i32) -> Vec<(RawFd, FdEvent)> {
        let mut ready = Vec::new();

        let n = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if n <= 0 {
            return ready;
        }

        for p in &self.fds {
            if p.revents & libc::POLLERR != 0 {
                ready.push((p.fd, FdEvent::Error));
            } else if p.revents & libc::POLLHUP != 0 {
                ready.push((p.fd, FdEvent::HangUp));
            } else if p.revents & libc::POLLIN != 0 {
                ready.push((p.fd, FdEvent::Read));
            }
        }

        ready
    }
}

fn main() {
    tracing_subscriber::fmt::init();
    let opt = Opt::from_args();

    // The ring mapping uses MAP_LOCKED
    assert!(setrlimit(Resource::MEMLOCK, rlimit::INFINITY, rlimit::INFINITY).is_ok());

    let config = RingConfig {
        frame_size: opt.frame_size,
        block_size: opt.block_size,
        block_count: opt.block_count,
    };

    let mut capture = match Capture::open(&opt.interface, config, Stats::default()) {
        Ok(capture) => capture,
        Err(err) => {
            eprintln!("invalid ring geometry: {}", err);
            std::process::exit(1);
        }
    };

    let mut poller = Poller::default();
    capture.start(&mut poller);
    if let Some(reason) = capture.handler().failed.as_ref() {
        eprintln!("capture error: {}", reason);
        std::process::exit(1);
    }

    let mut next_report = Instant::now() + Duration::from_secs(1);
    loop {
        let timeout = next_report
            .saturating_duration_since(Instant::now())
            .as_millis() as i32;

        for (_, event) in poller.poll(timeout.max(1)) {
            capture.on_event(event);
        }

        if let Some(reason) = capture.handler().failed.as_ref() {
            eprintln!("capture error: {}", reason);
            break;
        }

        if Instant::now() >= next_report {
            let stats = capture.handler();
            println!(
                "[stats] packets {}, udp data {}, invalid {}",
                stats.packets, stats.udp_bytes, stats.invalid
            );
            next_report += Duration::from_secs(1);
        }
    }

    capture.close(&mut poller);
}

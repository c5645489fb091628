// NFQUEUE divert backend
//
// Packets reach userspace over netlink and stay queued in the kernel until a
// verdict is issued, so holding the verdict back delays the packet.

use super::nft;
use crate::backends::divert::{DivertBackend, DivertHandle, DivertedPacket, ReinjectToken};
use crate::backends::BackendPriority;
use anyhow::{Context, Result, anyhow};
use nfq::{Queue, Verdict};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::io::ErrorKind;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Duration;

const QUEUE_NUM: u16 = 4217;

pub struct NfqueueDivert {
    queue_num: u16,
}

impl NfqueueDivert {
    pub fn new() -> Result<Self> {
        if !Self::is_available() {
            anyhow::bail!("NFQUEUE divert needs root and the nft tool");
        }
        Ok(Self {
            queue_num: QUEUE_NUM,
        })
    }
}

impl DivertBackend for NfqueueDivert {
    fn name(&self) -> &'static str {
        "nfqueue"
    }

    fn priority(&self) -> BackendPriority {
        BackendPriority::Best
    }

    fn is_available() -> bool {
        nix::unistd::geteuid().is_root() && nft::check_nft_available()
    }

    fn open(&self, filter: &str) -> Result<Box<dyn DivertHandle>> {
        let (family, rule) = nft::rule_for_filter(filter, self.queue_num)?;

        let mut queue = Queue::open().context("Failed to open netfilter queue socket")?;
        queue
            .bind(self.queue_num)
            .with_context(|| format!("Failed to bind NFQUEUE {}", self.queue_num))?;
        queue.set_nonblocking(true);

        // Rule goes in last: packets only start queueing once someone listens
        nft::install_queue_rule(family, &rule)?;

        Ok(Box::new(NfqueueHandle { queue, family }))
    }
}

struct NfqueueHandle {
    queue: Queue,
    family: &'static str,
}

impl NfqueueHandle {
    fn wait_readable(&self, timeout: Duration) -> Result<bool> {
        // SAFETY: the queue owns the descriptor and outlives this call
        let fd = unsafe { BorrowedFd::borrow_raw(self.queue.as_raw_fd()) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let timeout = PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX);

        match poll(&mut fds, timeout) {
            Ok(n) => Ok(n > 0),
            Err(nix::errno::Errno::EINTR) => Ok(false),
            Err(e) => Err(anyhow!("poll on NFQUEUE socket failed: {}", e)),
        }
    }
}

impl DivertHandle for NfqueueHandle {
    fn recv(&mut self, timeout: Duration) -> Result<Option<DivertedPacket>> {
        if !self.wait_readable(timeout)? {
            return Ok(None);
        }

        match self.queue.recv() {
            Ok(msg) => Ok(Some(DivertedPacket {
                data: msg.get_payload().to_vec(),
                token: ReinjectToken::Nfqueue(msg),
            })),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e).context("NFQUEUE receive failed"),
        }
    }

    fn send(&mut self, packet: DivertedPacket) -> Result<()> {
        match packet.token {
            ReinjectToken::Nfqueue(mut msg) => {
                // Payload is untouched, so the kernel sends its own copy
                msg.set_verdict(Verdict::Accept);
                self.queue
                    .verdict(msg)
                    .context("Failed to issue NFQUEUE verdict")
            }
            _ => Err(anyhow!("Packet was not received from this NFQUEUE handle")),
        }
    }
}

impl Drop for NfqueueHandle {
    fn drop(&mut self) {
        if let Err(e) = nft::remove_table(self.family) {
            log::warn!("Failed to remove divert rule: {:#}", e);
        }
    }
}

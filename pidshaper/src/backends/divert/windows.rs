// WinDivert divert backend
//
// Opens WinDivert at the network layer in normal (intercepting) mode: matched
// packets are removed from the stack until sent back with `send`.

use crate::backends::divert::{DivertBackend, DivertHandle, DivertedPacket, ReinjectToken};
use crate::backends::BackendPriority;
use anyhow::{Context, Result, anyhow};
use std::borrow::Cow;
use std::time::Duration;
use windivert::prelude::*;

const MAX_PACKET: usize = 65535;

pub struct WinDivertBackend;

impl WinDivertBackend {
    pub fn new() -> Result<Self> {
        Ok(Self)
    }
}

impl DivertBackend for WinDivertBackend {
    fn name(&self) -> &'static str {
        "windivert"
    }

    fn priority(&self) -> BackendPriority {
        BackendPriority::Best
    }

    fn is_available() -> bool {
        // Driver and privileges are only checked when the handle opens
        true
    }

    fn open(&self, filter: &str) -> Result<Box<dyn DivertHandle>> {
        let handle = WinDivert::network(filter, 0, WinDivertFlags::new())
            .context("Failed to open WinDivert handle (is the app running as administrator?)")?;
        log::info!("WinDivert capture started with filter: {}", filter);

        Ok(Box::new(WinDivertHandle {
            handle,
            buf: vec![0u8; MAX_PACKET],
        }))
    }
}

/// Dropping the inner handle closes it and stops diverting
struct WinDivertHandle {
    handle: WinDivert<NetworkLayer>,
    buf: Vec<u8>,
}

impl DivertHandle for WinDivertHandle {
    fn recv(&mut self, timeout: Duration) -> Result<Option<DivertedPacket>> {
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let packet = self
            .handle
            .recv_wait(Some(&mut self.buf), millis)
            .map_err(|e| anyhow!("WinDivert recv failed: {}", e))?;

        Ok(packet.map(|packet| DivertedPacket {
            data: packet.data.to_vec(),
            token: ReinjectToken::WinDivert(packet.address),
        }))
    }

    fn send(&mut self, packet: DivertedPacket) -> Result<()> {
        let ReinjectToken::WinDivert(address) = packet.token else {
            return Err(anyhow!("Packet was not received from this WinDivert handle"));
        };

        let packet = WinDivertPacket::<NetworkLayer> {
            address,
            data: Cow::Owned(packet.data),
        };
        self.handle
            .send(&packet)
            .map_err(|e| anyhow!("WinDivert send failed: {}", e))?;
        Ok(())
    }
}


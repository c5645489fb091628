// Linux divert backend: nftables sends outbound packets to an NFQUEUE

mod nfqueue;
pub mod nft;

pub use nfqueue::NfqueueDivert;

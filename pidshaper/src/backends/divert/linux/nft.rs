// nftables plumbing for the NFQUEUE divert backend

use anyhow::{Context, Result, anyhow};
use std::process::Command;

const NFT_TABLE: &str = "pidshaper";
const NFT_CHAIN_OUTPUT: &str = "divert_output";

/// Address family and queue rule for a capture filter.
///
/// Only the outbound direction can be diverted; the family decides which
/// traffic reaches the queue.
pub fn rule_for_filter(filter: &str, queue_num: u16) -> Result<(&'static str, String)> {
    let family = match filter.trim() {
        "outbound and ip" => "ip",
        "outbound and ipv6" => "ip6",
        "outbound" => "inet",
        other => return Err(anyhow!("Unsupported divert filter: {}", other)),
    };
    // bypass: accept packets if nobody is listening on the queue
    Ok((family, format!("queue num {} bypass", queue_num)))
}

/// Check if nftables is available
pub fn check_nft_available() -> bool {
    Command::new("nft").arg("--version").output().is_ok()
}

/// Create the table and output chain and add the queue rule
pub fn install_queue_rule(family: &str, rule: &str) -> Result<()> {
    // Leftovers from a crashed run would double-queue packets
    remove_table(family)?;

    let status = Command::new("nft")
        .args(["add", "table", family, NFT_TABLE])
        .status()
        .context("Failed to create nftables table")?;
    if !status.success() {
        return Err(anyhow!("Failed to create nftables table"));
    }

    let status = Command::new("nft")
        .args([
            "add",
            "chain",
            family,
            NFT_TABLE,
            NFT_CHAIN_OUTPUT,
            "{",
            "type",
            "filter",
            "hook",
            "output",
            "priority",
            "0",
            ";",
            "}",
        ])
        .status()
        .context("Failed to create output chain")?;
    if !status.success() {
        remove_table(family)?;
        return Err(anyhow!("Failed to create output chain"));
    }

    let status = Command::new("nft")
        .args(["add", "rule", family, NFT_TABLE, NFT_CHAIN_OUTPUT, rule])
        .status()
        .context("Failed to add queue rule")?;
    if !status.success() {
        remove_table(family)?;
        return Err(anyhow!("Failed to add nftables rule: {}", rule));
    }

    log::info!("Diverting outbound {} traffic: {}", family, rule);
    Ok(())
}

/// Delete the table (and with it the queue rule). Missing table is not an error.
pub fn remove_table(family: &str) -> Result<()> {
    let output = Command::new("nft")
        .args(["delete", "table", family, NFT_TABLE])
        .output()
        .context("Failed to run nft")?;

    if output.status.success() {
        log::debug!("Removed nftables table {} {}", family, NFT_TABLE);
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.contains("No such file or directory") {
            log::debug!("nft delete table: {}", stderr.trim());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_for_filter() {
        let (family, rule) = rule_for_filter("outbound and ip", 7).unwrap();
        assert_eq!(family, "ip");
        assert_eq!(rule, "queue num 7 bypass");

        assert_eq!(rule_for_filter("outbound", 0).unwrap().0, "inet");
        assert!(rule_for_filter("inbound and ip", 0).is_err());
    }
}

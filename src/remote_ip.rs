//! Origin checks for inbound events.

use async_trait::async_trait;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::{DeployError, Result};

/// Origins accepted without consulting the provider.
pub const LOCAL_ORIGINS: [&str; 2] = ["127.0.0.1", "0.0.0.0"];

/// A CIDR block such as `192.30.252.0/22` or `2a0a:a440::/29`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpBlock {
    network: IpAddr,
    prefix: u8,
}

impl IpBlock {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_u32(prefix: u8) -> u32 {
    if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) }
}

fn prefix_mask_u128(prefix: u8) -> u128 {
    if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) }
}

impl FromStr for IpBlock {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || DeployError::Validation(format!("'{}' is not a CIDR block", s));
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let network: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p.trim().parse::<u8>().map_err(|_| invalid())?,
            None => max,
        };
        if prefix > max {
            return Err(invalid());
        }
        Ok(Self { network, prefix })
    }
}

/// Where the provider's published webhook ranges come from.
#[async_trait]
pub trait AllowListSource: Send + Sync {
    async fn hook_blocks(&self) -> Result<Vec<String>>;
}

/// Checks event origins against the provider's webhook ranges.
///
/// The block list is fetched on first use and kept for the life of the
/// process. A failed fetch is not cached and rejects the event.
pub struct RemoteIpValidator {
    source: Arc<dyn AllowListSource>,
    blocks: OnceCell<Vec<IpBlock>>,
}

impl RemoteIpValidator {
    pub fn new(source: Arc<dyn AllowListSource>) -> Self {
        Self {
            source,
            blocks: OnceCell::new(),
        }
    }

    pub async fn is_allowed(&self, remote_ip: &str) -> Result<bool> {
        if LOCAL_ORIGINS.contains(&remote_ip) {
            return Ok(true);
        }
        let blocks = self
            .blocks
            .get_or_try_init(|| async {
                let raw = self.source.hook_blocks().await?;
                let mut blocks = Vec::with_capacity(raw.len());
                for block in &raw {
                    match block.parse::<IpBlock>() {
                        Ok(parsed) => blocks.push(parsed),
                        Err(e) => warn!("Skipping allow-list entry: {}", e),
                    }
                }
                debug!("Loaded {} webhook IP blocks", blocks.len());
                Ok::<_, DeployError>(blocks)
            })
            .await?;

        let Ok(ip) = remote_ip.parse::<IpAddr>() else {
            warn!("Remote address '{}' is not an IP address", remote_ip);
            return Ok(false);
        };
        Ok(blocks.iter().any(|block| block.contains(&ip)))
    }

    /// Like [`is_allowed`](Self::is_allowed) but turns a rejection into
    /// [`DeployError::UntrustedOrigin`].
    pub async fn check(&self, remote_ip: &str) -> Result<()> {
        if self.is_allowed(remote_ip).await? {
            Ok(())
        } else {
            Err(DeployError::UntrustedOrigin(remote_ip.to_string()))
        }
    }
}

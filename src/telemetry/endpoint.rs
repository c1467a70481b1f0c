//! Broker endpoint parsing.

use anyhow::{anyhow, Context, Result};

/// Resolved broker endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
}

/// Parse a broker address of the form `host:port`, optionally prefixed with
/// `mqtt://` or `tcp://`. IPv6 hosts use brackets: `[::1]:1883`.
pub fn parse_broker_endpoint(addr: &str) -> Result<BrokerEndpoint> {
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            other => return Err(anyhow!("unsupported broker scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    if host.is_empty() {
        return Err(anyhow!("missing broker host in {}", addr));
    }
    Ok(BrokerEndpoint { host, port })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid broker address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing broker port in {}", addr))?;
        let port: u16 = port.parse().context("invalid broker port")?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing broker port in {}", addr))?;
    let port: u16 = port.parse().context("invalid broker port")?;
    Ok((host.to_string(), port))
}

//! Host routes from the service CIDR to a guest.
use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::command::{Cmd, Runner};

/// Packets for `dest_cidr` are sent to `gateway`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    #[serde(rename = "Gateway")]
    pub gateway: String,
    #[serde(rename = "DestCIDR")]
    pub dest_cidr: String,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.dest_cidr, self.gateway)
    }
}

/// What the routing table says about a destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Existing {
    Missing,
    /// Already routed through the wanted gateway.
    Same,
    /// Routed through another gateway.
    Conflict(String),
}

/// Manages host routes with the platform's routing tool.
pub struct Router {
    os: String,
    runner: Arc<dyn Runner>,
}

impl Router {
    pub fn new(os: &str, runner: Arc<dyn Runner>) -> Self {
        Router {
            os: os.to_string(),
            runner,
        }
    }

    fn table_cmd(&self) -> Cmd {
        match self.os.as_str() {
            "darwin" => Cmd::new("netstat").args(["-nr", "-f", "inet"]),
            "windows" => Cmd::new("route").args(["print", "-4"]),
            _ => Cmd::new("ip").args(["route"]),
        }
    }

    fn add_cmd(&self, route: &Route) -> anyhow::Result<Cmd> {
        Ok(match self.os.as_str() {
            "darwin" => Cmd::sudo("route").args(["-n", "add", &route.dest_cidr, &route.gateway]),
            "windows" => {
                let (ip, mask) = split_cidr(&route.dest_cidr)?;
                Cmd::new("route").args(["ADD", &ip, "MASK", &mask, &route.gateway])
            }
            _ => Cmd::sudo("ip").args(["route", "add", &route.dest_cidr, "via", &route.gateway]),
        })
    }

    fn delete_cmd(&self, route: &Route) -> anyhow::Result<Cmd> {
        Ok(match self.os.as_str() {
            "darwin" => Cmd::sudo("route").args(["-n", "delete", &route.dest_cidr]),
            "windows" => {
                let (ip, _) = split_cidr(&route.dest_cidr)?;
                Cmd::new("route").args(["DELETE", &ip])
            }
            _ => Cmd::sudo("ip").args(["route", "delete", &route.dest_cidr]),
        })
    }

    /// Looks `route` up in the routing table.
    pub async fn inspect(&self, route: &Route) -> anyhow::Result<Existing> {
        let table = self
            .runner
            .run(self.table_cmd())
            .await
            .context("reading the routing table")?
            .stdout_str();
        Ok(match self.os.as_str() {
            "darwin" => parse_netstat(&table, route),
            "windows" => parse_route_print(&table, route),
            _ => parse_ip_route(&table, route),
        })
    }

    /// Adds `route` unless it is already there.
    #[instrument(level = "info", skip(self))]
    pub async fn ensure(&self, route: &Route) -> anyhow::Result<()> {
        match self.inspect(route).await? {
            Existing::Same => {
                debug!("route already present");
                Ok(())
            }
            Existing::Conflict(other) => anyhow::bail!(
                "conflicting route for {}: already routed through {}",
                route.dest_cidr,
                other
            ),
            Existing::Missing => {
                self.runner
                    .run(self.add_cmd(route)?)
                    .await
                    .with_context(|| format!("adding route {}", route))?;
                info!("route added");
                Ok(())
            }
        }
    }

    /// Removes `route` if it still points at its gateway.
    #[instrument(level = "info", skip(self))]
    pub async fn cleanup(&self, route: &Route) -> anyhow::Result<()> {
        if self.inspect(route).await? != Existing::Same {
            debug!("route not present, nothing to remove");
            return Ok(());
        }
        self.runner
            .run(self.delete_cmd(route)?)
            .await
            .with_context(|| format!("deleting route {}", route))?;
        info!("route removed");
        Ok(())
    }
}

/// `10.96.0.0/12` to `("10.96.0.0", "255.240.0.0")`.
fn split_cidr(cidr: &str) -> anyhow::Result<(String, String)> {
    let (ip, bits) = cidr
        .split_once('/')
        .ok_or_else(|| anyhow::anyhow!("{} is not in CIDR notation", cidr))?;
    let bits: u32 = bits.parse().with_context(|| format!("bad prefix length in {}", cidr))?;
    if bits > 32 {
        anyhow::bail!("bad prefix length in {}", cidr);
    }
    let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
    Ok((ip.to_string(), std::net::Ipv4Addr::from(mask).to_string()))
}

fn existing(found: Option<&str>, route: &Route) -> Existing {
    match found {
        None => Existing::Missing,
        Some(gw) if gw == route.gateway => Existing::Same,
        Some(gw) => Existing::Conflict(gw.to_string()),
    }
}

/// Lines look like `10.96.0.0/12 via 192.168.39.2 dev virbr1`.
fn parse_ip_route(table: &str, route: &Route) -> Existing {
    let gw = table.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        if fields.next()? != route.dest_cidr {
            return None;
        }
        let mut rest = fields.skip_while(|f| *f != "via");
        rest.next()?;
        rest.next()
    });
    existing(gw, route)
}

/// macOS prints `10.96/12  192.168.64.2  UGSc  bridge100`, dropping zero
/// octets from the destination.
fn parse_netstat(table: &str, route: &Route) -> Existing {
    let short = short_cidr(&route.dest_cidr);
    let gw = table.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let dst = fields.next()?;
        if dst != route.dest_cidr && dst != short {
            return None;
        }
        fields.next()
    });
    existing(gw, route)
}

fn short_cidr(cidr: &str) -> String {
    match cidr.split_once('/') {
        Some((ip, bits)) => {
            let mut octets: Vec<&str> = ip.split('.').collect();
            while octets.len() > 1 && octets.last() == Some(&"0") {
                octets.pop();
            }
            format!("{}/{}", octets.join("."), bits)
        }
        None => cidr.to_string(),
    }
}

/// Rows of the IPv4 table: `10.96.0.0  255.240.0.0  172.17.0.2  172.17.0.1  26`.
fn parse_route_print(table: &str, route: &Route) -> Existing {
    let (ip, mask) = match split_cidr(&route.dest_cidr) {
        Ok(v) => v,
        Err(_) => return Existing::Missing,
    };
    let gw = table.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 3 && fields[0] == ip && fields[1] == mask {
            Some(fields[2])
        } else {
            None
        }
    });
    existing(gw, route)
}

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use log::debug;

use crate::error::{KernelError, KernelResult};

use super::{Frame, WifiNetwork, BROADCAST_MAC};

pub type SharedHub = Rc<RefCell<NetworkHub>>;

const LEASE_NETWORK: &str = "10.0.2";
const LEASE_FIRST_HOST: u8 = 15;
const LEASE_NETMASK: &str = "255.255.255.0";

/// Handle for one NIC attachment. NIC ids are only unique inside a single
/// kernel, so the hub never keys on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortId(u64);

#[derive(Debug)]
struct HubPort {
    mac: String,
    ip: Option<String>,
    inbound: VecDeque<Frame>,
}

/// Host-level switch every NIC registers with. It outlives kernel
/// instances, so reboots and restores only re-register their NICs.
#[derive(Debug)]
pub struct NetworkHub {
    ports: BTreeMap<PortId, HubPort>,
    next_port: u64,
    leases: BTreeMap<String, String>,
    next_lease: u16,
    wifi: Vec<WifiNetwork>,
    dropped: u64,
}

impl Default for NetworkHub {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl NetworkHub {
    pub fn new(wifi: Vec<WifiNetwork>) -> Self {
        Self {
            ports: BTreeMap::new(),
            next_port: 1,
            leases: BTreeMap::new(),
            next_lease: LEASE_FIRST_HOST as u16,
            wifi,
            dropped: 0,
        }
    }

    pub fn shared(wifi: Vec<WifiNetwork>) -> SharedHub {
        Rc::new(RefCell::new(Self::new(wifi)))
    }

    /// Attach a NIC and hand back the port it owns until `unregister`.
    pub fn register(&mut self, mac: &str, ip: Option<String>) -> PortId {
        let id = PortId(self.next_port);
        self.next_port += 1;
        self.ports.insert(
            id,
            HubPort {
                mac: mac.to_string(),
                ip,
                inbound: VecDeque::new(),
            },
        );
        id
    }

    pub fn unregister(&mut self, port: PortId) {
        self.ports.remove(&port);
    }

    pub fn is_registered(&self, port: PortId) -> bool {
        self.ports.contains_key(&port)
    }

    pub fn set_ip(&mut self, port: PortId, ip: Option<String>) {
        if let Some(entry) = self.ports.get_mut(&port) {
            entry.ip = ip;
        }
    }

    /// Route a frame to its destination port. Returns how many ports
    /// received a copy.
    pub fn deliver(&mut self, frame: Frame) -> usize {
        let targets: Vec<PortId> = if frame.dst_mac == BROADCAST_MAC {
            let by_ip: Vec<PortId> = self
                .ports
                .iter()
                .filter(|(_, port)| port.ip.as_deref() == Some(frame.dst_ip.as_str()))
                .map(|(id, _)| *id)
                .collect();
            if by_ip.is_empty() {
                self.ports
                    .iter()
                    .filter(|(_, port)| port.mac != frame.src_mac)
                    .map(|(id, _)| *id)
                    .collect()
            } else {
                by_ip
            }
        } else {
            self.ports
                .iter()
                .filter(|(_, port)| port.mac.eq_ignore_ascii_case(&frame.dst_mac))
                .map(|(id, _)| *id)
                .collect()
        };

        if targets.is_empty() {
            self.dropped += 1;
            debug!("hub dropped frame for {} ({})", frame.dst_mac, frame.dst_ip);
            return 0;
        }
        for id in &targets {
            if let Some(port) = self.ports.get_mut(id) {
                port.inbound.push_back(frame.clone());
            }
        }
        targets.len()
    }

    pub fn pull(&mut self, port: PortId) -> Option<Frame> {
        self.ports.get_mut(&port)?.inbound.pop_front()
    }

    /// DHCP: the same mac always gets the same address back.
    pub fn lease(&mut self, mac: &str) -> KernelResult<(String, String)> {
        if let Some(ip) = self.leases.get(mac) {
            return Ok((ip.clone(), LEASE_NETMASK.to_string()));
        }
        if self.next_lease > 254 {
            return Err(KernelError::invalid("dhcp pool exhausted"));
        }
        let ip = format!("{LEASE_NETWORK}.{}", self.next_lease);
        self.next_lease += 1;
        self.leases.insert(mac.to_string(), ip.clone());
        Ok((ip, LEASE_NETMASK.to_string()))
    }

    pub fn scan(&self) -> Vec<WifiNetwork> {
        self.wifi.clone()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(dst_mac: &str, dst_ip: &str) -> Frame {
        Frame {
            src_mac: "AA:00:00:00:00:01".into(),
            dst_mac: dst_mac.into(),
            src_ip: None,
            dst_ip: dst_ip.into(),
            payload: b"ping".to_vec(),
        }
    }

    #[test]
    fn frames_route_by_mac() {
        let mut hub = NetworkHub::default();
        let eth0 = hub.register("AA:00:00:00:00:01", None);
        let eth1 = hub.register("AA:00:00:00:00:02", None);

        assert_eq!(hub.deliver(frame("aa:00:00:00:00:02", "10.0.0.2")), 1);
        assert!(hub.pull(eth0).is_none());
        assert_eq!(hub.pull(eth1).expect("frame").payload, b"ping");
    }

    #[test]
    fn broadcast_prefers_matching_ip_then_floods() {
        let mut hub = NetworkHub::default();
        let eth0 = hub.register("AA:00:00:00:00:01", None);
        let eth1 = hub.register("AA:00:00:00:00:02", Some("10.0.0.2".into()));
        hub.register("AA:00:00:00:00:03", None);

        assert_eq!(hub.deliver(frame(BROADCAST_MAC, "10.0.0.2")), 1);
        assert!(hub.pull(eth1).is_some());

        assert_eq!(hub.deliver(frame(BROADCAST_MAC, "10.9.9.9")), 2);
        assert!(hub.pull(eth0).is_none());
    }

    #[test]
    fn each_registration_gets_its_own_port() {
        let mut hub = NetworkHub::default();
        let first = hub.register("AA:00:00:00:00:01", None);
        let second = hub.register("BB:00:00:00:00:02", None);
        assert_ne!(first, second);

        hub.unregister(second);
        assert!(hub.is_registered(first));
        assert_eq!(hub.deliver(frame("AA:00:00:00:00:01", "10.0.0.1")), 1);
        assert!(hub.pull(first).is_some());
    }

    #[test]
    fn unknown_destination_is_dropped() {
        let mut hub = NetworkHub::default();
        assert_eq!(hub.deliver(frame("FF:00:00:00:00:00", "1.2.3.4")), 0);
        assert_eq!(hub.dropped(), 1);
    }

    #[test]
    fn leases_are_stable_per_mac() {
        let mut hub = NetworkHub::default();
        let (first, mask) = hub.lease("AA").expect("lease");
        let (second, _) = hub.lease("BB").expect("lease");
        assert_eq!(first, "10.0.2.15");
        assert_eq!(second, "10.0.2.16");
        assert_eq!(mask, "255.255.255.0");
        assert_eq!(hub.lease("AA").expect("lease").0, first);
    }
}

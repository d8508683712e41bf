//! Virtual network primitives: interfaces bridged to a host hub, same-host
//! TCP/UDP socket tables and a prefix router.

mod hub;
mod nic;
mod router;
mod socket;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};
use crate::process::Pid;

pub use hub::{NetworkHub, PortId, SharedHub};
pub use nic::{Nic, NicInfo};
pub use router::{Route, Router};
pub use socket::{
    Delivery, DeliveryHandler, Listener, ListenerHandler, ListenerOwner, ListenerState,
    ListenerToken, MuxState, PeerAddr, Protocol, Socket, SocketMux,
};

pub const BROADCAST_MAC: &str = "FF:FF:FF:FF:FF:FF";
pub const LOOPBACK_IP: &str = "127.0.0.1";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NicKind {
    #[default]
    Wired,
    Wifi,
}

impl NicKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NicKind::Wired => "wired",
            NicKind::Wifi => "wifi",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "wired" | "ethernet" => Some(NicKind::Wired),
            "wifi" | "wireless" => Some(NicKind::Wifi),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Up,
    Down,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Up => "up",
            LinkStatus::Down => "down",
        }
    }
}

/// A logical link-layer frame. Addresses are plain strings; nothing here
/// is a real wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub src_mac: String,
    pub dst_mac: String,
    pub src_ip: Option<String>,
    pub dst_ip: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(dst_mac: impl Into<String>, dst_ip: impl Into<String>, payload: &[u8]) -> Self {
        Self {
            src_mac: String::new(),
            dst_mac: dst_mac.into(),
            src_ip: None,
            dst_ip: dst_ip.into(),
            payload: payload.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiNetwork {
    pub ssid: String,
    #[serde(default)]
    pub signal: i32,
    #[serde(default)]
    pub secured: bool,
}

fn parse_ipv4(value: &str) -> KernelResult<()> {
    value
        .parse::<Ipv4Addr>()
        .map(|_| ())
        .map_err(|_| KernelError::invalid(format!("not an ipv4 address: {value}")))
}

/// Every network table the kernel owns, plus its handle on the host hub.
#[derive(Debug)]
pub struct NetworkStack {
    hub: SharedHub,
    nics: BTreeMap<String, Nic>,
    tcp: SocketMux,
    udp: SocketMux,
    router: Router,
}

impl NetworkStack {
    pub fn new(hub: SharedHub) -> Self {
        Self {
            hub,
            nics: BTreeMap::new(),
            tcp: SocketMux::new(Protocol::Tcp),
            udp: SocketMux::new(Protocol::Udp),
            router: Router::new(),
        }
    }

    pub fn hub(&self) -> &SharedHub {
        &self.hub
    }

    pub fn create_nic(&mut self, id: &str, mac: &str, kind: NicKind) -> KernelResult<NicInfo> {
        if id.is_empty() || mac.is_empty() {
            return Err(KernelError::invalid("nic id and mac are required"));
        }
        if self.nics.contains_key(id) {
            return Err(KernelError::AlreadyExists(id.to_string()));
        }
        let mut nic = Nic::new(id, mac, kind);
        nic.attach(self.hub.clone());
        let info = nic.info();
        self.nics.insert(id.to_string(), nic);
        info!("nic {id} ({}) created", kind.as_str());
        Ok(info)
    }

    pub fn remove_nic(&mut self, id: &str) -> KernelResult<()> {
        let mut nic = self
            .nics
            .remove(id)
            .ok_or_else(|| KernelError::NoDevice(id.to_string()))?;
        nic.detach();
        self.router.remove_nic(id);
        info!("nic {id} removed");
        Ok(())
    }

    pub fn nic(&self, id: &str) -> KernelResult<&Nic> {
        self.nics
            .get(id)
            .ok_or_else(|| KernelError::NoDevice(id.to_string()))
    }

    fn nic_mut(&mut self, id: &str) -> KernelResult<&mut Nic> {
        self.nics
            .get_mut(id)
            .ok_or_else(|| KernelError::NoDevice(id.to_string()))
    }

    pub fn nics(&self) -> impl Iterator<Item = &Nic> {
        self.nics.values()
    }

    pub fn list_nics(&self) -> Vec<NicInfo> {
        self.nics.values().map(Nic::info).collect()
    }

    pub fn nic_up(&mut self, id: &str) -> KernelResult<NicInfo> {
        let nic = self.nic_mut(id)?;
        nic.status = LinkStatus::Up;
        Ok(nic.info())
    }

    pub fn nic_down(&mut self, id: &str) -> KernelResult<NicInfo> {
        let nic = self.nic_mut(id)?;
        nic.status = LinkStatus::Down;
        Ok(nic.info())
    }

    pub fn nic_config(&mut self, id: &str, ip: &str, netmask: &str) -> KernelResult<NicInfo> {
        parse_ipv4(ip)?;
        parse_ipv4(netmask)?;
        let nic = self.nic_mut(id)?;
        nic.configure(Some(ip.to_string()), Some(netmask.to_string()));
        Ok(nic.info())
    }

    pub fn dhcp_request(&mut self, id: &str) -> KernelResult<NicInfo> {
        let mac = self.nic(id)?.mac.clone();
        let (ip, netmask) = self.hub.borrow_mut().lease(&mac)?;
        let nic = self.nic_mut(id)?;
        nic.configure(Some(ip), Some(netmask));
        nic.status = LinkStatus::Up;
        Ok(nic.info())
    }

    pub fn wifi_scan(&self, id: &str) -> KernelResult<Vec<WifiNetwork>> {
        let nic = self.nic(id)?;
        if nic.kind != NicKind::Wifi {
            return Err(KernelError::invalid(format!("{id} is not a wifi interface")));
        }
        Ok(self.hub.borrow().scan())
    }

    pub fn wifi_join(&mut self, id: &str, ssid: &str) -> KernelResult<NicInfo> {
        let visible = self.wifi_scan(id)?;
        if !visible.iter().any(|network| network.ssid == ssid) {
            return Err(KernelError::NotFound(ssid.to_string()));
        }
        let nic = self.nic_mut(id)?;
        nic.ssid = Some(ssid.to_string());
        nic.status = LinkStatus::Up;
        Ok(nic.info())
    }

    pub fn route_add(&mut self, prefix: &str, nic: &str) -> KernelResult<()> {
        if prefix.is_empty() {
            return Err(KernelError::invalid("route prefix is empty"));
        }
        self.nic(nic)?;
        self.router.add(prefix, nic);
        Ok(())
    }

    pub fn route_del(&mut self, prefix: &str) -> bool {
        self.router.remove(prefix)
    }

    pub fn routes(&self) -> &[Route] {
        self.router.routes()
    }

    /// Push `frame` into the rx queue of the interface the router picks.
    pub fn forward(&mut self, frame: Frame) -> KernelResult<String> {
        let route = self
            .router
            .lookup(&frame.dst_ip)
            .ok_or_else(|| KernelError::HostUnreachable(frame.dst_ip.clone()))?;
        let target = route.nic.clone();
        self.nic_mut(&target)?.enqueue_rx(frame);
        Ok(target)
    }

    pub fn send_frame(&mut self, id: &str, frame: Frame) -> KernelResult<usize> {
        self.nic_mut(id)?.send(frame)
    }

    pub fn receive_frame(&mut self, id: &str) -> KernelResult<Option<Frame>> {
        Ok(self.nic_mut(id)?.receive())
    }

    pub fn mux(&self, protocol: Protocol) -> &SocketMux {
        match protocol {
            Protocol::Tcp => &self.tcp,
            Protocol::Udp => &self.udp,
        }
    }

    pub fn mux_mut(&mut self, protocol: Protocol) -> &mut SocketMux {
        match protocol {
            Protocol::Tcp => &mut self.tcp,
            Protocol::Udp => &mut self.udp,
        }
    }

    /// Address used as the sender of outgoing datagrams.
    pub fn local_ip(&self) -> String {
        self.nics
            .values()
            .filter(|nic| nic.is_up())
            .filter_map(|nic| nic.ip.clone())
            .find(|ip| ip != LOOPBACK_IP)
            .unwrap_or_else(|| LOOPBACK_IP.to_string())
    }

    pub fn release_owner(&mut self, pid: Pid) -> usize {
        self.tcp.release_owner(pid) + self.udp.release_owner(pid)
    }

    /// Replace every table with restored state and re-register the NICs
    /// with the hub.
    pub fn restore(&mut self, nics: Vec<Nic>, tcp: MuxState, udp: MuxState, routes: Vec<Route>) {
        self.shutdown();
        for mut nic in nics {
            nic.attach(self.hub.clone());
            self.nics.insert(nic.id.clone(), nic);
        }
        self.tcp.import(tcp);
        self.udp.import(udp);
        self.router.replace(routes);
    }

    /// Detach every NIC from the hub and clear all tables.
    pub fn shutdown(&mut self) {
        for nic in self.nics.values_mut() {
            nic.detach();
        }
        self.nics.clear();
        self.tcp = SocketMux::new(Protocol::Tcp);
        self.udp = SocketMux::new(Protocol::Udp);
        self.router = Router::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack() -> NetworkStack {
        NetworkStack::new(NetworkHub::shared(vec![WifiNetwork {
            ssid: "cafe".into(),
            signal: -40,
            secured: false,
        }]))
    }

    #[test]
    fn nic_lifecycle_shows_in_listing() {
        let mut net = stack();
        net.create_nic("eth0", "AA:BB:CC:DD:EE:01", NicKind::Wired)
            .expect("create");
        net.nic_up("eth0").expect("up");
        net.nic_config("eth0", "192.168.0.2", "255.255.255.0")
            .expect("config");

        let listing = serde_json::to_value(net.list_nics()).expect("json");
        assert_eq!(listing[0]["id"], "eth0");
        assert_eq!(listing[0]["ip"], "192.168.0.2");
        assert_eq!(listing[0]["status"], "up");

        let port = net.nic("eth0").expect("nic").port().expect("attached");
        net.remove_nic("eth0").expect("remove");
        assert!(net.list_nics().is_empty());
        assert!(!net.hub().borrow().is_registered(port));
    }

    #[test]
    fn duplicate_and_unknown_nics_are_rejected() {
        let mut net = stack();
        net.create_nic("eth0", "AA", NicKind::Wired).expect("create");
        assert_eq!(
            net.create_nic("eth0", "BB", NicKind::Wired).unwrap_err().errno_name(),
            "EEXIST"
        );
        assert_eq!(net.nic_up("eth9").unwrap_err().errno_name(), "ENODEV");
        assert_eq!(
            net.nic_config("eth0", "999.1.1.1", "255.0.0.0")
                .unwrap_err()
                .errno_name(),
            "EINVAL"
        );
    }

    #[test]
    fn dhcp_assigns_lease_and_brings_link_up() {
        let mut net = stack();
        net.create_nic("eth0", "AA", NicKind::Wired).expect("create");
        let info = net.dhcp_request("eth0").expect("dhcp");
        assert_eq!(info.ip.as_deref(), Some("10.0.2.15"));
        assert_eq!(info.status, LinkStatus::Up);
        assert_eq!(net.local_ip(), "10.0.2.15");
    }

    #[test]
    fn wifi_join_requires_wifi_nic_and_known_ssid() {
        let mut net = stack();
        net.create_nic("eth0", "AA", NicKind::Wired).expect("create");
        net.create_nic("wlan0", "BB", NicKind::Wifi).expect("create");

        assert!(net.wifi_scan("eth0").is_err());
        assert_eq!(net.wifi_scan("wlan0").expect("scan").len(), 1);
        assert_eq!(
            net.wifi_join("wlan0", "airport").unwrap_err().errno_name(),
            "ENOENT"
        );
        let joined = net.wifi_join("wlan0", "cafe").expect("join");
        assert_eq!(joined.ssid.as_deref(), Some("cafe"));
    }

    #[test]
    fn forward_uses_first_matching_route() {
        let mut net = stack();
        net.create_nic("eth0", "AA", NicKind::Wired).expect("create");
        net.create_nic("eth1", "BB", NicKind::Wired).expect("create");
        net.route_add("10.0.", "eth0").expect("route");
        net.route_add("10.0.2.", "eth1").expect("route");

        let nic = net
            .forward(Frame::new(BROADCAST_MAC, "10.0.2.2", b"x"))
            .expect("forward");
        assert_eq!(nic, "eth0");
        assert!(net.receive_frame("eth0").expect("nic").is_some());

        let err = net
            .forward(Frame::new(BROADCAST_MAC, "8.8.8.8", b"x"))
            .unwrap_err();
        assert_eq!(err.errno_name(), "EHOSTUNREACH");
        assert_eq!(
            net.route_add("1.", "eth7").unwrap_err().errno_name(),
            "ENODEV"
        );
    }

    #[test]
    fn stacks_sharing_a_hub_keep_their_own_ports() {
        let hub = NetworkHub::shared(Vec::new());
        let mut a = NetworkStack::new(hub.clone());
        let mut b = NetworkStack::new(hub.clone());
        a.create_nic("eth0", "AA:00:00:00:00:01", NicKind::Wired)
            .expect("create");
        a.create_nic("eth1", "AA:00:00:00:00:03", NicKind::Wired)
            .expect("create");
        b.create_nic("eth0", "BB:00:00:00:00:02", NicKind::Wired)
            .expect("create");
        a.nic_up("eth1").expect("up");

        let delivered = a
            .send_frame("eth1", Frame::new("AA:00:00:00:00:01", "10.0.0.1", b"hi"))
            .expect("send");
        assert_eq!(delivered, 1);
        assert_eq!(
            a.receive_frame("eth0").expect("nic").expect("frame").payload,
            b"hi"
        );
        assert!(b.receive_frame("eth0").expect("nic").is_none());

        let port = a.nic("eth0").expect("nic").port().expect("attached");
        b.remove_nic("eth0").expect("remove");
        assert!(hub.borrow().is_registered(port));
    }
}

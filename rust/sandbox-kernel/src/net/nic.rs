use std::collections::VecDeque;

use serde::Serialize;

use crate::error::{KernelError, KernelResult};

use super::{Frame, LinkStatus, NicKind, PortId, SharedHub};

const TX_HISTORY: usize = 256;

/// A virtual network interface.
#[derive(Debug)]
pub struct Nic {
    pub id: String,
    pub mac: String,
    pub ip: Option<String>,
    pub netmask: Option<String>,
    pub status: LinkStatus,
    pub kind: NicKind,
    pub ssid: Option<String>,
    rx: VecDeque<Frame>,
    tx: VecDeque<Frame>,
    hub: Option<(SharedHub, PortId)>,
}

impl Nic {
    pub fn new(id: impl Into<String>, mac: impl Into<String>, kind: NicKind) -> Self {
        Self {
            id: id.into(),
            mac: mac.into(),
            ip: None,
            netmask: None,
            status: LinkStatus::Down,
            kind,
            ssid: None,
            rx: VecDeque::new(),
            tx: VecDeque::new(),
            hub: None,
        }
    }

    pub fn attach(&mut self, hub: SharedHub) {
        self.detach();
        let port = hub.borrow_mut().register(&self.mac, self.ip.clone());
        self.hub = Some((hub, port));
    }

    pub fn detach(&mut self) {
        if let Some((hub, port)) = self.hub.take() {
            hub.borrow_mut().unregister(port);
        }
    }

    /// Hub port held while attached.
    pub fn port(&self) -> Option<PortId> {
        self.hub.as_ref().map(|(_, port)| *port)
    }

    pub fn is_up(&self) -> bool {
        self.status == LinkStatus::Up
    }

    pub fn configure(&mut self, ip: Option<String>, netmask: Option<String>) {
        self.ip = ip;
        self.netmask = netmask;
        if let Some((hub, port)) = &self.hub {
            hub.borrow_mut().set_ip(*port, self.ip.clone());
        }
    }

    /// Queue `frame` for transmission and hand it to the hub.
    pub fn send(&mut self, mut frame: Frame) -> KernelResult<usize> {
        if !self.is_up() {
            return Err(KernelError::NetworkDown(self.id.clone()));
        }
        frame.src_mac = self.mac.clone();
        if frame.src_ip.is_none() {
            frame.src_ip = self.ip.clone();
        }

        if self.tx.len() == TX_HISTORY {
            self.tx.pop_front();
        }
        self.tx.push_back(frame.clone());
        let delivered = match &self.hub {
            Some((hub, _)) => hub.borrow_mut().deliver(frame),
            None => 0,
        };
        Ok(delivered)
    }

    /// Next inbound frame, pulling from the hub once the local queue is dry.
    pub fn receive(&mut self) -> Option<Frame> {
        if self.rx.is_empty() {
            if let Some((hub, port)) = &self.hub {
                if let Some(frame) = hub.borrow_mut().pull(*port) {
                    self.rx.push_back(frame);
                }
            }
        }
        self.rx.pop_front()
    }

    pub fn enqueue_rx(&mut self, frame: Frame) {
        self.rx.push_back(frame);
    }

    pub fn rx_frames(&self) -> impl Iterator<Item = &Frame> {
        self.rx.iter()
    }

    pub fn tx_frames(&self) -> impl Iterator<Item = &Frame> {
        self.tx.iter()
    }

    pub fn restore_queues(&mut self, rx: Vec<Frame>, tx: Vec<Frame>) {
        self.rx = rx.into();
        self.tx = tx.into();
    }

    pub fn info(&self) -> NicInfo {
        NicInfo {
            id: self.id.clone(),
            mac: self.mac.clone(),
            ip: self.ip.clone(),
            netmask: self.netmask.clone(),
            status: self.status,
            kind: self.kind,
            ssid: self.ssid.clone(),
            rx_queued: self.rx.len(),
            tx_sent: self.tx.len(),
        }
    }
}

/// Row returned by `list_nics`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NicInfo {
    pub id: String,
    pub mac: String,
    pub ip: Option<String>,
    pub netmask: Option<String>,
    pub status: LinkStatus,
    #[serde(rename = "type")]
    pub kind: NicKind,
    pub ssid: Option<String>,
    pub rx_queued: usize,
    pub tx_sent: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::NetworkHub;

    #[test]
    fn down_nic_refuses_to_send() {
        let mut nic = Nic::new("eth0", "AA:00:00:00:00:01", NicKind::Wired);
        let err = nic.send(Frame::new("AA:00:00:00:00:02", "10.0.0.2", b"x")).unwrap_err();
        assert_eq!(err.errno_name(), "ENETDOWN");
    }

    #[test]
    fn frames_cross_the_hub_between_nics() {
        let hub = NetworkHub::shared(Vec::new());
        let mut a = Nic::new("eth0", "AA:00:00:00:00:01", NicKind::Wired);
        let mut b = Nic::new("eth1", "AA:00:00:00:00:02", NicKind::Wired);
        a.attach(hub.clone());
        b.attach(hub);
        a.status = LinkStatus::Up;

        let sent = a
            .send(Frame::new("AA:00:00:00:00:02", "10.0.0.2", b"hello"))
            .expect("send");
        assert_eq!(sent, 1);
        assert_eq!(a.tx_frames().count(), 1);

        let frame = b.receive().expect("frame");
        assert_eq!(frame.src_mac, "AA:00:00:00:00:01");
        assert_eq!(frame.payload, b"hello");
        assert!(b.receive().is_none());
    }

    #[test]
    fn local_queue_drains_before_hub() {
        let hub = NetworkHub::shared(Vec::new());
        let mut nic = Nic::new("eth0", "AA:00:00:00:00:01", NicKind::Wired);
        nic.attach(hub.clone());
        hub.borrow_mut()
            .deliver(Frame::new("AA:00:00:00:00:01", "10.0.0.1", b"from-hub"));
        nic.enqueue_rx(Frame::new("AA:00:00:00:00:01", "10.0.0.1", b"local"));

        assert_eq!(nic.receive().expect("local").payload, b"local");
        assert_eq!(nic.receive().expect("hub").payload, b"from-hub");
    }
}

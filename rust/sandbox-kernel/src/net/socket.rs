use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};
use crate::process::Pid;

const EPHEMERAL_BASE: u16 = 49152;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerToken(u64);

impl ListenerToken {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum ListenerOwner {
    Process(Pid),
    Service(String),
}

/// Logical sender address attached to UDP deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub port: u16,
    pub socket: u64,
    pub data: Vec<u8>,
    pub from: Option<PeerAddr>,
}

pub type DeliveryHandler = Rc<dyn Fn(&Delivery)>;

/// A listener either has a live callback or buffers deliveries until one
/// is reattached.
pub enum ListenerHandler {
    Attached(DeliveryHandler),
    Detached(Vec<Delivery>),
}

impl fmt::Debug for ListenerHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerHandler::Attached(_) => f.write_str("Attached(..)"),
            ListenerHandler::Detached(backlog) => write!(f, "Detached({} queued)", backlog.len()),
        }
    }
}

#[derive(Debug)]
pub struct Listener {
    pub token: ListenerToken,
    pub port: u16,
    pub owner: ListenerOwner,
    handler: ListenerHandler,
}

impl Listener {
    pub fn is_attached(&self) -> bool {
        matches!(self.handler, ListenerHandler::Attached(_))
    }

    pub fn backlog(&self) -> &[Delivery] {
        match &self.handler {
            ListenerHandler::Attached(_) => &[],
            ListenerHandler::Detached(backlog) => backlog,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Socket {
    pub id: u64,
    pub ip: String,
    pub port: u16,
    pub local_port: u16,
    pub owner: Option<Pid>,
}

/// Plain-data form of a listener used by snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerState {
    pub token: ListenerToken,
    pub port: u16,
    pub owner: ListenerOwner,
    pub backlog: Vec<Delivery>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxState {
    pub listeners: Vec<ListenerState>,
    pub sockets: Vec<Socket>,
    pub next_socket: u64,
    pub next_token: u64,
    pub next_ephemeral: u16,
}

/// Same-host socket table for one protocol.
#[derive(Debug)]
pub struct SocketMux {
    protocol: Protocol,
    listeners: BTreeMap<u16, Listener>,
    sockets: BTreeMap<u64, Socket>,
    next_socket: u64,
    next_token: u64,
    next_ephemeral: u16,
}

impl SocketMux {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            listeners: BTreeMap::new(),
            sockets: BTreeMap::new(),
            next_socket: 1,
            next_token: 1,
            next_ephemeral: EPHEMERAL_BASE,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn listen(
        &mut self,
        port: u16,
        owner: ListenerOwner,
        handler: Option<DeliveryHandler>,
    ) -> KernelResult<ListenerToken> {
        if self.listeners.contains_key(&port) {
            return Err(KernelError::AddressInUse(port));
        }
        let token = ListenerToken::new(self.next_token);
        self.next_token += 1;
        let handler = match handler {
            Some(callback) => ListenerHandler::Attached(callback),
            None => ListenerHandler::Detached(Vec::new()),
        };
        self.listeners.insert(
            port,
            Listener {
                token,
                port,
                owner,
                handler,
            },
        );
        debug!("{} listener {} bound to port {port}", self.protocol.as_str(), token.raw());
        Ok(token)
    }

    pub fn unlisten(&mut self, token: ListenerToken) -> bool {
        let port = self
            .listeners
            .values()
            .find(|listener| listener.token == token)
            .map(|listener| listener.port);
        match port {
            Some(port) => self.listeners.remove(&port).is_some(),
            None => false,
        }
    }

    pub fn listener(&self, token: ListenerToken) -> Option<&Listener> {
        self.listeners.values().find(|listener| listener.token == token)
    }

    pub fn listeners(&self) -> impl Iterator<Item = &Listener> {
        self.listeners.values()
    }

    pub fn connect(&mut self, ip: &str, port: u16, owner: Option<Pid>) -> u64 {
        let id = self.next_socket;
        self.next_socket += 1;
        let local_port = self.next_ephemeral;
        self.next_ephemeral = self.next_ephemeral.checked_add(1).unwrap_or(EPHEMERAL_BASE);
        self.sockets.insert(
            id,
            Socket {
                id,
                ip: ip.to_string(),
                port,
                local_port,
                owner,
            },
        );
        id
    }

    pub fn socket(&self, id: u64) -> Option<&Socket> {
        self.sockets.get(&id)
    }

    /// Deliver `data` to whoever listens on the socket's peer port. Returns
    /// whether a listener took it; an unbound port drops it silently.
    pub fn send(&mut self, socket: u64, data: &[u8], from_ip: &str) -> KernelResult<bool> {
        let target = self
            .sockets
            .get(&socket)
            .ok_or(KernelError::BadDescriptor(socket))?;
        let delivery = Delivery {
            port: target.port,
            socket,
            data: data.to_vec(),
            from: match self.protocol {
                Protocol::Udp => Some(PeerAddr {
                    ip: from_ip.to_string(),
                    port: target.local_port,
                }),
                Protocol::Tcp => None,
            },
        };

        let Some(listener) = self.listeners.get_mut(&delivery.port) else {
            debug!(
                "{} send to unbound port {} dropped",
                self.protocol.as_str(),
                delivery.port
            );
            return Ok(false);
        };
        match &mut listener.handler {
            ListenerHandler::Attached(callback) => {
                let callback = Rc::clone(callback);
                callback(&delivery);
            }
            ListenerHandler::Detached(backlog) => backlog.push(delivery),
        }
        Ok(true)
    }

    /// Install a callback on a detached listener, replaying its backlog in
    /// arrival order. Returns how many deliveries were replayed.
    pub fn reattach(&mut self, token: ListenerToken, handler: DeliveryHandler) -> KernelResult<usize> {
        let listener = self
            .listeners
            .values_mut()
            .find(|listener| listener.token == token)
            .ok_or_else(|| KernelError::invalid(format!("unknown listener {}", token.raw())))?;
        let previous = std::mem::replace(
            &mut listener.handler,
            ListenerHandler::Attached(Rc::clone(&handler)),
        );
        let backlog = match previous {
            ListenerHandler::Detached(backlog) => backlog,
            ListenerHandler::Attached(_) => Vec::new(),
        };
        let replayed = backlog.len();
        for delivery in backlog {
            handler(&delivery);
        }
        Ok(replayed)
    }

    /// Drop every listener and socket owned by `pid`.
    pub fn release_owner(&mut self, pid: Pid) -> usize {
        let before = self.listeners.len() + self.sockets.len();
        let owner = ListenerOwner::Process(pid);
        self.listeners.retain(|_, listener| listener.owner != owner);
        self.sockets.retain(|_, socket| socket.owner != Some(pid));
        before - (self.listeners.len() + self.sockets.len())
    }

    pub fn export(&self) -> MuxState {
        MuxState {
            listeners: self
                .listeners
                .values()
                .map(|listener| ListenerState {
                    token: listener.token,
                    port: listener.port,
                    owner: listener.owner.clone(),
                    backlog: listener.backlog().to_vec(),
                })
                .collect(),
            sockets: self.sockets.values().cloned().collect(),
            next_socket: self.next_socket,
            next_token: self.next_token,
            next_ephemeral: self.next_ephemeral,
        }
    }

    /// Rebuild the table from plain state. Every listener comes back
    /// detached; callers reattach the ones they can.
    pub fn import(&mut self, state: MuxState) {
        self.listeners = state
            .listeners
            .into_iter()
            .map(|listener| {
                (
                    listener.port,
                    Listener {
                        token: listener.token,
                        port: listener.port,
                        owner: listener.owner,
                        handler: ListenerHandler::Detached(listener.backlog),
                    },
                )
            })
            .collect();
        self.sockets = state
            .sockets
            .into_iter()
            .map(|socket| (socket.id, socket))
            .collect();
        self.next_socket = state.next_socket;
        self.next_token = state.next_token;
        self.next_ephemeral = state.next_ephemeral;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    fn recorder() -> (Rc<RefCell<Vec<Delivery>>>, DeliveryHandler) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let handler: DeliveryHandler = Rc::new(move |delivery: &Delivery| {
            sink.borrow_mut().push(delivery.clone());
        });
        (seen, handler)
    }

    #[test]
    fn listener_receives_bytes_synchronously() {
        let mut tcp = SocketMux::new(Protocol::Tcp);
        let (seen, handler) = recorder();
        let token = tcp
            .listen(8080, ListenerOwner::Process(Pid::new(1)), Some(handler))
            .expect("listen");

        let socket = tcp.connect("127.0.0.1", 8080, None);
        assert!(tcp.send(socket, b"GET /", "127.0.0.1").expect("send"));
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].data, b"GET /");
        assert_eq!(seen.borrow()[0].from, None);

        assert!(tcp.unlisten(token));
        assert!(!tcp.send(socket, b"again", "127.0.0.1").expect("send"));
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn duplicate_port_is_addr_in_use() {
        let mut udp = SocketMux::new(Protocol::Udp);
        udp.listen(53, ListenerOwner::Service("dns".into()), None)
            .expect("listen");
        let err = udp
            .listen(53, ListenerOwner::Process(Pid::new(3)), None)
            .unwrap_err();
        assert_eq!(err, KernelError::AddressInUse(53));
    }

    #[test]
    fn connect_ids_are_monotonic_and_unknown_socket_is_ebadf() {
        let mut tcp = SocketMux::new(Protocol::Tcp);
        let first = tcp.connect("10.0.0.1", 80, None);
        let second = tcp.connect("10.0.0.1", 80, None);
        assert!(second > first);
        assert_eq!(
            tcp.send(99, b"x", "127.0.0.1").unwrap_err().errno_name(),
            "EBADF"
        );
    }

    #[test]
    fn udp_deliveries_carry_sender_address() {
        let mut udp = SocketMux::new(Protocol::Udp);
        let (seen, handler) = recorder();
        udp.listen(5353, ListenerOwner::Process(Pid::new(1)), Some(handler))
            .expect("listen");
        let socket = udp.connect("127.0.0.1", 5353, None);
        udp.send(socket, b"q", "10.0.2.15").expect("send");

        let from = seen.borrow()[0].from.clone().expect("sender");
        assert_eq!(from.ip, "10.0.2.15");
        assert_eq!(from.port, EPHEMERAL_BASE);
    }

    #[test]
    fn detached_listener_buffers_until_reattached() {
        let mut tcp = SocketMux::new(Protocol::Tcp);
        let token = tcp
            .listen(7000, ListenerOwner::Process(Pid::new(2)), None)
            .expect("listen");
        let socket = tcp.connect("127.0.0.1", 7000, None);
        tcp.send(socket, b"one", "127.0.0.1").expect("send");
        tcp.send(socket, b"two", "127.0.0.1").expect("send");

        let (seen, handler) = recorder();
        assert_eq!(tcp.reattach(token, handler).expect("reattach"), 2);
        let payloads: Vec<Vec<u8>> = seen.borrow().iter().map(|d| d.data.clone()).collect();
        assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec()]);

        tcp.send(socket, b"three", "127.0.0.1").expect("send");
        assert_eq!(seen.borrow().len(), 3);
    }

    #[test]
    fn export_import_keeps_tables_and_detaches() {
        let mut tcp = SocketMux::new(Protocol::Tcp);
        let (_, handler) = recorder();
        tcp.listen(80, ListenerOwner::Service("http".into()), Some(handler))
            .expect("listen");
        tcp.connect("127.0.0.1", 80, Some(Pid::new(4)));
        let state = tcp.export();

        let mut restored = SocketMux::new(Protocol::Tcp);
        restored.import(state.clone());
        assert_eq!(restored.export(), state);
        assert!(restored.listeners().all(|listener| !listener.is_attached()));
    }

    #[test]
    fn release_owner_drops_process_listeners() {
        let mut tcp = SocketMux::new(Protocol::Tcp);
        tcp.listen(80, ListenerOwner::Process(Pid::new(4)), None)
            .expect("listen");
        tcp.listen(81, ListenerOwner::Service("ftp".into()), None)
            .expect("listen");
        tcp.connect("127.0.0.1", 81, Some(Pid::new(4)));

        assert_eq!(tcp.release_owner(Pid::new(4)), 2);
        assert_eq!(tcp.listeners().count(), 1);
    }
}

//! Pseudo-terminal pairs.
//!
//! Each pair owns two bounded byte rings: bytes written by the master are
//! read by the slave and the other way round. Readers can wait for data
//! without polling.

use std::cell::Cell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::{KernelError, KernelResult};

pub const MASTER_DIR: &str = "/dev/ptmx";
pub const SLAVE_DIR: &str = "/dev/pts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PtySide {
    Master,
    Slave,
}

impl PtySide {
    pub fn opposite(self) -> Self {
        match self {
            PtySide::Master => PtySide::Slave,
            PtySide::Slave => PtySide::Master,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PtySide::Master => "master",
            PtySide::Slave => "slave",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "master" => Some(PtySide::Master),
            "slave" => Some(PtySide::Slave),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PtyAllocation {
    pub id: u32,
    pub master_path: String,
    pub slave_path: String,
}

pub fn master_path(id: u32) -> String {
    format!("{MASTER_DIR}/{id}")
}

pub fn slave_path(id: u32) -> String {
    format!("{SLAVE_DIR}/{id}")
}

/// Map `/dev/ptmx/<id>` or `/dev/pts/<id>` to its pair and side.
pub fn parse_path(path: &str) -> Option<(u32, PtySide)> {
    let (dir, id) = path.rsplit_once('/')?;
    let side = match dir {
        MASTER_DIR => PtySide::Master,
        SLAVE_DIR => PtySide::Slave,
        _ => return None,
    };
    id.parse().ok().map(|id| (id, side))
}

#[derive(Debug)]
struct RingBuffer {
    data: VecDeque<u8>,
    capacity: usize,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        let bytes = if bytes.len() > self.capacity {
            &bytes[bytes.len() - self.capacity..]
        } else {
            bytes
        };
        let overflow = (self.data.len() + bytes.len()).saturating_sub(self.capacity);
        self.data.drain(..overflow);
        self.data.extend(bytes);
    }

    fn drain(&mut self, max: usize) -> Vec<u8> {
        let take = max.min(self.data.len());
        self.data.drain(..take).collect()
    }
}

#[derive(Debug, Default)]
struct Signal {
    notify: Notify,
    generation: Cell<u64>,
}

impl Signal {
    fn raise(&self) {
        self.generation.set(self.generation.get() + 1);
        self.notify.notify_waiters();
    }
}

/// Handle returned by [`PtyManager::wait`].
#[derive(Debug)]
pub struct PtyWaiter {
    signal: Option<Rc<Signal>>,
    seen: u64,
}

impl PtyWaiter {
    pub fn is_ready(&self) -> bool {
        match &self.signal {
            Some(signal) => signal.generation.get() != self.seen,
            None => true,
        }
    }

    /// Resolve once data has been written towards the waited side, or the
    /// pair was released.
    pub async fn wait(self) {
        let Some(signal) = self.signal else {
            return;
        };
        while signal.generation.get() == self.seen {
            signal.notify.notified().await;
        }
    }
}

#[derive(Debug)]
struct PtyPair {
    /// Bytes waiting to be read by the master.
    to_master: RingBuffer,
    /// Bytes waiting to be read by the slave.
    to_slave: RingBuffer,
    master_signal: Rc<Signal>,
    slave_signal: Rc<Signal>,
}

impl PtyPair {
    fn new(capacity: usize) -> Self {
        Self {
            to_master: RingBuffer::new(capacity),
            to_slave: RingBuffer::new(capacity),
            master_signal: Rc::default(),
            slave_signal: Rc::default(),
        }
    }

    fn inbound(&mut self, reader: PtySide) -> &mut RingBuffer {
        match reader {
            PtySide::Master => &mut self.to_master,
            PtySide::Slave => &mut self.to_slave,
        }
    }

    fn signal(&self, reader: PtySide) -> &Rc<Signal> {
        match reader {
            PtySide::Master => &self.master_signal,
            PtySide::Slave => &self.slave_signal,
        }
    }
}

/// Buffered contents of one pair, as captured by snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyState {
    pub id: u32,
    pub to_master: Vec<u8>,
    pub to_slave: Vec<u8>,
}

#[derive(Debug)]
pub struct PtyManager {
    pairs: BTreeMap<u32, PtyPair>,
    next_id: u32,
    capacity: usize,
}

impl PtyManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            pairs: BTreeMap::new(),
            next_id: 0,
            capacity,
        }
    }

    pub fn allocate(&mut self) -> PtyAllocation {
        let id = self.next_id;
        self.next_id += 1;
        self.pairs.insert(id, PtyPair::new(self.capacity));
        PtyAllocation {
            id,
            master_path: master_path(id),
            slave_path: slave_path(id),
        }
    }

    pub fn contains(&self, id: u32) -> bool {
        self.pairs.contains_key(&id)
    }

    fn pair_mut(&mut self, id: u32) -> KernelResult<&mut PtyPair> {
        self.pairs
            .get_mut(&id)
            .ok_or_else(|| KernelError::NotFound(slave_path(id)))
    }

    /// Write from `side`; the bytes become readable on the opposite side.
    pub fn write(&mut self, id: u32, side: PtySide, bytes: &[u8]) -> KernelResult<usize> {
        let pair = self.pair_mut(id)?;
        let reader = side.opposite();
        pair.inbound(reader).push(bytes);
        if !bytes.is_empty() {
            pair.signal(reader).raise();
        }
        Ok(bytes.len())
    }

    /// Non-blocking read of up to `max` bytes buffered for `side`.
    pub fn read(&mut self, id: u32, side: PtySide, max: usize) -> KernelResult<Vec<u8>> {
        Ok(self.pair_mut(id)?.inbound(side).drain(max))
    }

    pub fn available(&self, id: u32, side: PtySide) -> usize {
        self.pairs.get(&id).map_or(0, |pair| match side {
            PtySide::Master => pair.to_master.data.len(),
            PtySide::Slave => pair.to_slave.data.len(),
        })
    }

    /// A waiter that is already ready when data is buffered for `side`.
    pub fn wait(&mut self, id: u32, side: PtySide) -> KernelResult<PtyWaiter> {
        let pair = self.pair_mut(id)?;
        if !pair.inbound(side).data.is_empty() {
            return Ok(PtyWaiter {
                signal: None,
                seen: 0,
            });
        }
        let signal = Rc::clone(pair.signal(side));
        let seen = signal.generation.get();
        Ok(PtyWaiter {
            signal: Some(signal),
            seen,
        })
    }

    /// Drop a pair, waking anyone still waiting on it.
    pub fn release(&mut self, id: u32) -> bool {
        match self.pairs.remove(&id) {
            Some(pair) => {
                pair.master_signal.raise();
                pair.slave_signal.raise();
                true
            }
            None => false,
        }
    }

    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    pub fn export(&self) -> Vec<PtyState> {
        self.pairs
            .iter()
            .map(|(id, pair)| PtyState {
                id: *id,
                to_master: pair.to_master.data.iter().copied().collect(),
                to_slave: pair.to_slave.data.iter().copied().collect(),
            })
            .collect()
    }

    pub fn import(&mut self, pairs: Vec<PtyState>, next_id: u32) {
        for id in self.pairs.keys().copied().collect::<Vec<_>>() {
            self.release(id);
        }
        for state in pairs {
            let mut pair = PtyPair::new(self.capacity);
            pair.to_master.push(&state.to_master);
            pair.to_slave.push(&state.to_slave);
            self.pairs.insert(state.id, pair);
        }
        self.next_id = next_id;
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::process::Pid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrawOptions {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for DrawOptions {
    fn default() -> Self {
        Self {
            title: "untitled".into(),
            width: 640,
            height: 480,
        }
    }
}

/// A GUI surface created by `draw`. Rendering happens outside the kernel;
/// this is only the record the shell reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub id: u32,
    pub pid: Pid,
    pub title: String,
    pub html: String,
    pub width: u32,
    pub height: u32,
    pub crashed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowTable {
    windows: BTreeMap<u32, Window>,
    next_id: u32,
}

impl Default for WindowTable {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowTable {
    pub fn new() -> Self {
        Self {
            windows: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn create(&mut self, pid: Pid, html: impl Into<String>, options: DrawOptions) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.windows.insert(
            id,
            Window {
                id,
                pid,
                title: options.title,
                html: html.into(),
                width: options.width,
                height: options.height,
                crashed: false,
            },
        );
        id
    }

    pub fn get(&self, id: u32) -> Option<&Window> {
        self.windows.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Window> {
        self.windows.values()
    }

    pub fn owns_window(&self, pid: Pid) -> bool {
        self.windows.values().any(|window| window.pid == pid)
    }

    /// Flag every window of `pid` as crashed and return their ids.
    pub fn mark_crashed(&mut self, pid: Pid) -> Vec<u32> {
        self.windows
            .values_mut()
            .filter(|window| window.pid == pid)
            .map(|window| {
                window.crashed = true;
                window.id
            })
            .collect()
    }

    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    pub fn restore(&mut self, windows: Vec<Window>, next_id: u32) {
        self.windows = windows.into_iter().map(|w| (w.id, w)).collect();
        self.next_id = next_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_marks_only_the_owners_windows() {
        let mut table = WindowTable::new();
        let mine = table.create(Pid::new(3), "<p>hi</p>", DrawOptions::default());
        let other = table.create(Pid::new(4), "<p>yo</p>", DrawOptions::default());

        assert!(table.owns_window(Pid::new(3)));
        assert_eq!(table.mark_crashed(Pid::new(3)), vec![mine]);
        assert!(table.get(mine).expect("window").crashed);
        assert!(!table.get(other).expect("window").crashed);
    }

    #[test]
    fn draw_options_default_missing_fields() {
        let options: DrawOptions =
            serde_json::from_value(serde_json::json!({"title": "clock"})).expect("parse");
        assert_eq!(options.title, "clock");
        assert_eq!(options.width, 640);
    }
}

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub prefix: String,
    pub nic: String,
}

/// Ordered forwarding table. The first route whose prefix is a raw string
/// prefix of the destination wins, so insertion order decides overlaps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, prefix: impl Into<String>, nic: impl Into<String>) {
        self.routes.push(Route {
            prefix: prefix.into(),
            nic: nic.into(),
        });
    }

    /// Remove the first route with exactly this prefix.
    pub fn remove(&mut self, prefix: &str) -> bool {
        match self.routes.iter().position(|route| route.prefix == prefix) {
            Some(index) => {
                self.routes.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn remove_nic(&mut self, nic: &str) {
        self.routes.retain(|route| route.nic != nic);
    }

    pub fn lookup(&self, destination: &str) -> Option<&Route> {
        self.routes
            .iter()
            .find(|route| destination.starts_with(route.prefix.as_str()))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn replace(&mut self, routes: Vec<Route>) {
        self.routes = routes;
    }
}

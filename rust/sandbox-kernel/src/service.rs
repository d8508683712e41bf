//! Protocol services layered on the socket tables.

use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::net::{Delivery, DeliveryHandler, ListenerToken, Protocol};

/// A host-provided service that answers deliveries on one port.
pub trait NetworkService {
    fn name(&self) -> &str;
    fn port(&self) -> u16;
    fn protocol(&self) -> Protocol;
    fn handle(&self, delivery: &Delivery);
}

pub fn delivery_handler(service: Rc<dyn NetworkService>) -> DeliveryHandler {
    Rc::new(move |delivery: &Delivery| service.handle(delivery))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    pub port: u16,
    pub protocol: Protocol,
    pub token: ListenerToken,
}

/// Services registered with a running kernel.
#[derive(Default)]
pub struct ServiceRegistry {
    records: BTreeMap<String, ServiceRecord>,
    instances: BTreeMap<String, Rc<dyn NetworkService>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn insert(&mut self, record: ServiceRecord, instance: Option<Rc<dyn NetworkService>>) {
        if let Some(instance) = instance {
            self.instances.insert(record.name.clone(), instance);
        }
        self.records.insert(record.name.clone(), record);
    }

    pub fn get(&self, name: &str) -> Option<&ServiceRecord> {
        self.records.get(name)
    }

    pub fn is_live(&self, name: &str) -> bool {
        self.instances.contains_key(name)
    }

    pub fn records(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.records.values()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.instances.clear();
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("records", &self.records)
            .field("live", &self.instances.keys().collect::<Vec<_>>())
            .finish()
    }
}

type ServiceFactory = Box<dyn Fn() -> Rc<dyn NetworkService>>;

/// Host-owned factories used to rebuild service handlers after a restore.
#[derive(Default)]
pub struct ServiceCatalog {
    factories: BTreeMap<String, ServiceFactory>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Rc<dyn NetworkService> + 'static,
    ) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(anyhow!("service `{}` registered twice", name));
        }
        self.factories.insert(name, Box::new(factory));
        Ok(())
    }

    pub fn instantiate(&self, name: &str) -> Option<Rc<dyn NetworkService>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.factories.keys()
    }
}

impl std::fmt::Debug for ServiceCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCatalog")
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    struct Echo {
        seen: Rc<RefCell<Vec<Vec<u8>>>>,
    }

    impl NetworkService for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn port(&self) -> u16 {
            7
        }

        fn protocol(&self) -> Protocol {
            Protocol::Udp
        }

        fn handle(&self, delivery: &Delivery) {
            self.seen.borrow_mut().push(delivery.data.clone());
        }
    }

    #[test]
    fn catalog_rejects_duplicates_and_instantiates() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut catalog = ServiceCatalog::new();
        let sink = Rc::clone(&seen);
        catalog
            .register("echo", move || {
                Rc::new(Echo {
                    seen: Rc::clone(&sink),
                }) as Rc<dyn NetworkService>
            })
            .expect("register");
        assert!(catalog
            .register("echo", || -> Rc<dyn NetworkService> {
                Rc::new(Echo {
                    seen: Rc::new(RefCell::new(Vec::new())),
                })
            })
            .is_err());

        let service = catalog.instantiate("echo").expect("factory");
        let handler = delivery_handler(service);
        handler(&Delivery {
            port: 7,
            socket: 1,
            data: b"ping".to_vec(),
            from: None,
        });
        assert_eq!(seen.borrow().as_slice(), &[b"ping".to_vec()]);
        assert!(catalog.instantiate("ftp").is_none());
    }
}

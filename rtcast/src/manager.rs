//! In-process resource manager: the sole destruction authority for
//! long-lived objects (sessions, connections, muxers).
//!
//! Components never free each other directly. They call
//! [ResourceManager::remove], which de-indexes the resource and queues it on
//! the zombies list; the disposer drain ([ResourceManager::dispose], driven
//! by the event loop) notifies subscribers with `before_dispose` then
//! `disposing` before the final strong reference is dropped, so hooks may
//! safely dereference the resource.

use log::trace;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

/// A managed resource. Identity keys (id, fast-id, name) are assigned at
/// registration, not carried by the resource.
pub trait Resource: 'static {
    fn as_any(&self) -> &dyn Any;

    /// Concrete-type recovery for owners that registered the resource.
    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any>;

    /// A short human description for tracing.
    fn desc(&self) -> String {
        "resource".to_string()
    }
}

/// Dispose-event subscriber. Events fire for every resource being disposed,
/// including the subscriber itself.
pub trait ManagerSubscriber {
    fn on_before_dispose(&self, resource: &Rc<dyn Resource>);
    fn on_disposing(&self, resource: &Rc<dyn Resource>);
}

fn data_ptr<T: ?Sized>(rc: &Rc<T>) -> *const () {
    Rc::as_ptr(rc) as *const ()
}

fn weak_data_ptr<T: ?Sized>(weak: &Weak<T>) -> *const () {
    weak.as_ptr() as *const ()
}

pub struct ResourceManager {
    label: String,
    conns: RefCell<Vec<Rc<dyn Resource>>>,
    ids: RefCell<HashMap<String, Rc<dyn Resource>>>,
    fast_ids: RefCell<HashMap<u64, Rc<dyn Resource>>>,
    names: RefCell<HashMap<String, Rc<dyn Resource>>>,
    zombies: RefCell<Vec<Rc<dyn Resource>>>,
    /// Batch currently being notified; re-removal of these is a no-op.
    disposing: RefCell<Vec<Rc<dyn Resource>>>,
    subscribers: RefCell<Vec<Weak<dyn ManagerSubscriber>>>,
}

impl ResourceManager {
    pub fn new(label: &str) -> Rc<Self> {
        Rc::new(Self {
            label: label.to_string(),
            conns: RefCell::new(vec![]),
            ids: RefCell::new(HashMap::new()),
            fast_ids: RefCell::new(HashMap::new()),
            names: RefCell::new(HashMap::new()),
            zombies: RefCell::new(vec![]),
            disposing: RefCell::new(vec![]),
            subscribers: RefCell::new(vec![]),
        })
    }

    pub fn size(&self) -> usize {
        self.conns.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.borrow().is_empty()
    }

    pub fn zombies_len(&self) -> usize {
        self.zombies.borrow().len()
    }

    pub fn at(&self, index: usize) -> Option<Rc<dyn Resource>> {
        self.conns.borrow().get(index).cloned()
    }

    pub fn add(&self, resource: Rc<dyn Resource>) {
        let mut conns = self.conns.borrow_mut();
        if !conns.iter().any(|c| Rc::ptr_eq(c, &resource)) {
            conns.push(resource);
        }
    }

    /// Registers under a string id. A later add with the same id overrides
    /// the older mapping; both resources stay alive until their own remove.
    pub fn add_with_id(&self, id: &str, resource: Rc<dyn Resource>) {
        self.add(resource.clone());
        self.ids.borrow_mut().insert(id.to_string(), resource);
    }

    /// Registers under a 64-bit fast id (e.g. an SSRC) for O(1) lookup on
    /// inbound media.
    pub fn add_with_fast_id(&self, fast_id: u64, resource: Rc<dyn Resource>) {
        self.add(resource.clone());
        self.fast_ids.borrow_mut().insert(fast_id, resource);
    }

    pub fn add_with_name(&self, name: &str, resource: Rc<dyn Resource>) {
        self.add(resource.clone());
        self.names.borrow_mut().insert(name.to_string(), resource);
    }

    pub fn find_by_id(&self, id: &str) -> Option<Rc<dyn Resource>> {
        self.ids.borrow().get(id).cloned()
    }

    pub fn find_by_fast_id(&self, fast_id: u64) -> Option<Rc<dyn Resource>> {
        self.fast_ids.borrow().get(&fast_id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Rc<dyn Resource>> {
        self.names.borrow().get(name).cloned()
    }

    pub fn subscribe(&self, subscriber: &Rc<dyn ManagerSubscriber>) {
        let mut subs = self.subscribers.borrow_mut();
        let ptr = data_ptr(subscriber);
        if !subs.iter().any(|w| weak_data_ptr(w) == ptr) {
            subs.push(Rc::downgrade(subscriber));
        }
    }

    pub fn unsubscribe(&self, subscriber: &Rc<dyn ManagerSubscriber>) {
        let ptr = data_ptr(subscriber);
        self.subscribers
            .borrow_mut()
            .retain(|w| weak_data_ptr(w) != ptr);
    }

    /// The only destruction entry point. De-indexes the resource and queues
    /// it for disposal. Safe to call re-entrantly from dispose hooks; a
    /// resource already queued or mid-notification is not queued twice.
    pub fn remove(&self, resource: &Rc<dyn Resource>) {
        let ptr = data_ptr(resource);

        self.conns
            .borrow_mut()
            .retain(|c| data_ptr(c) != ptr);
        self.ids.borrow_mut().retain(|_, v| data_ptr(v) != ptr);
        self.fast_ids
            .borrow_mut()
            .retain(|_, v| data_ptr(v) != ptr);
        self.names.borrow_mut().retain(|_, v| data_ptr(v) != ptr);

        let queued = self
            .zombies
            .borrow()
            .iter()
            .any(|z| data_ptr(z) == ptr)
            || self
                .disposing
                .borrow()
                .iter()
                .any(|z| data_ptr(z) == ptr);
        if !queued {
            trace!("manager {}: queue zombie {}", self.label, resource.desc());
            self.zombies.borrow_mut().push(resource.clone());
        }
    }

    /// Drains the zombies list, delivering `before_dispose` then `disposing`
    /// to the subscriber snapshot for each resource. Zombies queued from
    /// within a hook are picked up by the next loop iteration, so a missed
    /// wakeup cannot strand them.
    pub fn dispose(&self) {
        loop {
            let batch: Vec<Rc<dyn Resource>> = std::mem::take(&mut *self.zombies.borrow_mut());
            if batch.is_empty() {
                break;
            }
            *self.disposing.borrow_mut() = batch.clone();

            for zombie in &batch {
                self.notify(zombie, NotifyPhase::BeforeDispose);
                self.notify(zombie, NotifyPhase::Disposing);
            }

            self.disposing.borrow_mut().clear();
            // The batch drops here; for resources with no other owners this
            // runs their destructor after all notifications completed.
        }
    }

    fn notify(&self, zombie: &Rc<dyn Resource>, phase: NotifyPhase) {
        // Snapshot, then re-check membership before every call: a hook may
        // subscribe or unsubscribe without depriving the remaining
        // subscribers of their event.
        let snapshot: Vec<Weak<dyn ManagerSubscriber>> = self.subscribers.borrow().clone();
        for weak in snapshot {
            let still_subscribed = self
                .subscribers
                .borrow()
                .iter()
                .any(|w| weak_data_ptr(w) == weak_data_ptr(&weak));
            if !still_subscribed {
                continue;
            }
            if let Some(subscriber) = weak.upgrade() {
                match phase {
                    NotifyPhase::BeforeDispose => subscriber.on_before_dispose(zombie),
                    NotifyPhase::Disposing => subscriber.on_disposing(zombie),
                }
            }
        }
    }
}

#[derive(Copy, Clone)]
enum NotifyPhase {
    BeforeDispose,
    Disposing,
}

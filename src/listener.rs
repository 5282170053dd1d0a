use crate::channel::{Channel, ChannelState};
use crate::connection::ConnectionState;
use arc_swap::ArcSwap;
use bytes::Bytes;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

/// Observer of a [crate::Connection] lifecycle.
pub trait ConnectionListener: Send + Sync {
    /// Called with one of `Open`, `Disconnected`, `Closed` or `Failed`.
    fn on_state_change(&self, state: ConnectionState);

    /// Called for every data channel opened by the remote peer.
    fn on_channel(&self, channel: Channel);
}

/// Observer of a single [Channel].
pub trait ChannelListener: Send + Sync {
    fn on_state_change(&self, state: ChannelState);

    fn on_message(&self, message: &str);

    /// Payloads which are not valid UTF-8 text.
    fn on_binary(&self, _data: &Bytes) {}
}

/// Copy-on-write observer set. Every mutation swaps in a new list, so a fan-out iterating over
/// a snapshot is never affected by listeners added or removed in the meantime.
pub(crate) struct Listeners<L: ?Sized> {
    list: ArcSwap<Vec<Arc<L>>>,
}

impl<L: ?Sized> Listeners<L> {
    pub fn new() -> Self {
        Listeners {
            list: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<L>) {
        self.list.rcu(|old| {
            let mut list = Vec::with_capacity(old.len() + 1);
            list.extend(old.iter().cloned());
            list.push(listener.clone());
            list
        });
    }

    /// Removes the first registration of `listener`. Returns `false` if it wasn't registered.
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut removed = false;
        self.list.rcu(|old| {
            let mut list: Vec<Arc<L>> = old.iter().cloned().collect();
            removed = match list.iter().position(|l| same(l, listener)) {
                Some(i) => {
                    list.remove(i);
                    true
                }
                None => false,
            };
            list
        });
        removed
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<L>>> {
        self.list.load_full()
    }

    pub fn len(&self) -> usize {
        self.list.load().len()
    }
}

fn same<L: ?Sized>(a: &Arc<L>, b: &Arc<L>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

type Notification = Box<dyn FnOnce() + Send + 'static>;

/// Ordered notification queue drained by a single task, so engine and signaling callbacks never
/// run application listeners inline. Must be created within a tokio runtime.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    queue: UnboundedSender<Notification>,
}

impl Dispatcher {
    pub fn spawn() -> Self {
        let (queue, mut rx) = unbounded_channel::<Notification>();
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                if catch_unwind(AssertUnwindSafe(notification)).is_err() {
                    log::error!("listener panicked during notification");
                }
            }
        });
        Dispatcher { queue }
    }

    pub fn dispatch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.queue.send(Box::new(f)).is_err() {
            log::trace!("notification dropped: dispatcher stopped");
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("closed", &self.queue.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::{ConnectionListener, Dispatcher, Listeners};
    use crate::channel::Channel;
    use crate::connection::ConnectionState;
    use std::sync::{Arc, Mutex, Weak};

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<(&'static str, ConnectionState)>>>,
        set: Weak<Listeners<dyn ConnectionListener>>,
        remove_self: bool,
        me: Mutex<Option<Arc<dyn ConnectionListener>>>,
    }

    impl ConnectionListener for Recorder {
        fn on_state_change(&self, state: ConnectionState) {
            self.log.lock().unwrap().push((self.name, state));
            if self.remove_self {
                if let (Some(set), Some(me)) = (self.set.upgrade(), self.me.lock().unwrap().take())
                {
                    assert!(set.remove(&me));
                }
            }
        }

        fn on_channel(&self, _channel: Channel) {}
    }

    fn fan_out(set: &Listeners<dyn ConnectionListener>, state: ConnectionState) {
        for l in set.snapshot().iter() {
            l.on_state_change(state);
        }
    }

    #[test]
    fn fan_out_survives_self_removal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let set: Arc<Listeners<dyn ConnectionListener>> = Arc::new(Listeners::new());
        for (name, remove_self) in [("l1", false), ("l2", true), ("l3", false)] {
            let r = Arc::new(Recorder {
                name,
                log: log.clone(),
                set: Arc::downgrade(&set),
                remove_self,
                me: Mutex::new(None),
            });
            let l: Arc<dyn ConnectionListener> = r.clone();
            *r.me.lock().unwrap() = Some(l.clone());
            set.add(l);
        }

        fan_out(&set, ConnectionState::Open);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                ("l1", ConnectionState::Open),
                ("l2", ConnectionState::Open),
                ("l3", ConnectionState::Open)
            ]
        );
        assert_eq!(set.len(), 2);

        log.lock().unwrap().clear();
        fan_out(&set, ConnectionState::Closed);
        assert_eq!(
            *log.lock().unwrap(),
            vec![("l1", ConnectionState::Closed), ("l3", ConnectionState::Closed)]
        );
    }

    #[test]
    fn removing_unknown_listener_is_noop() {
        let set: Listeners<dyn ConnectionListener> = Listeners::new();
        let stranger: Arc<dyn ConnectionListener> = Arc::new(Recorder {
            name: "x",
            log: Arc::default(),
            set: Weak::new(),
            remove_self: false,
            me: Mutex::new(None),
        });
        assert!(!set.remove(&stranger));
        set.add(stranger.clone());
        assert!(set.remove(&stranger));
        assert_eq!(set.len(), 0);
    }

    #[tokio::test]
    async fn dispatcher_preserves_order_and_survives_panics() {
        let dispatcher = Dispatcher::spawn();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for i in 0..3 {
            let tx = tx.clone();
            dispatcher.dispatch(move || {
                let _ = tx.send(i);
            });
        }
        dispatcher.dispatch(|| panic!("bad listener"));
        dispatcher.dispatch(move || {
            let _ = tx.send(3);
        });
        for expected in 0..4 {
            assert_eq!(rx.recv().await, Some(expected));
        }
    }
}

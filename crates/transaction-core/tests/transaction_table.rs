use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use sipconn_transaction_core::{
    RemovalListener, TimerId, TimerProfile, Transaction, TransactionKey, TransactionKind, TransactionLifecycle,
    TransactionState,
};

struct ServerTransaction {
    lifecycle: TransactionLifecycle,
    io_errors: AtomicUsize,
}

impl Transaction for ServerTransaction {
    fn lifecycle(&self) -> &TransactionLifecycle {
        &self.lifecycle
    }

    fn on_io_error(&self, _error: &io::Error) {
        self.io_errors.fetch_add(1, Ordering::SeqCst);
        self.terminate();
    }
}

/// Minimal transaction table: find-or-create plus removal on termination
#[derive(Default)]
struct Table {
    entries: Mutex<HashMap<TransactionKey, Arc<ServerTransaction>>>,
    removed: AtomicUsize,
}

struct TableRemoval(Weak<Table>);

impl RemovalListener for TableRemoval {
    fn transaction_removed(&self, key: &TransactionKey) {
        if let Some(table) = self.0.upgrade() {
            table.entries.lock().remove(key);
            table.removed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Table {
    fn find_or_create(self: &Arc<Self>, key: TransactionKey, profile: &Arc<TimerProfile>) -> Arc<ServerTransaction> {
        let mut entries = self.entries.lock();
        entries
            .entry(key.clone())
            .or_insert_with(|| {
                let lifecycle = TransactionLifecycle::new(key, profile.clone());
                lifecycle.set_removal_listener(Arc::new(TableRemoval(Arc::downgrade(self))));
                Arc::new(ServerTransaction {
                    lifecycle,
                    io_errors: AtomicUsize::new(0),
                })
            })
            .clone()
    }
}

#[test]
fn only_first_lookup_sees_a_new_transaction() {
    let table = Arc::new(Table::default());
    let profile = Arc::new(TimerProfile::default());
    let key = TransactionKey::new("z9hG4bK-retrans", "INVITE", true);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let table = table.clone();
            let profile = profile.clone();
            let key = key.clone();
            std::thread::spawn(move || table.find_or_create(key, &profile).lifecycle().is_new())
        })
        .collect();
    let fresh = handles.into_iter().map(|h| h.join().unwrap()).filter(|n| *n).count();
    assert_eq!(fresh, 1);
    assert_eq!(table.entries.lock().len(), 1);
}

#[test]
fn cancel_races_with_processing() {
    let table = Arc::new(Table::default());
    let profile = Arc::new(TimerProfile::default());
    let tx = table.find_or_create(TransactionKey::new("z9hG4bK-cancel", "INVITE", true), &profile);

    let processing = {
        let tx = tx.clone();
        std::thread::spawn(move || tx.lifecycle().mark_started().is_ok())
    };
    let cancelled = tx.lifecycle().try_mark_cancelled();
    let started = processing.join().unwrap();

    assert!(cancelled != started);
    let state = tx.lifecycle().state();
    if cancelled {
        assert_eq!(state, TransactionState::Cancelled);
    } else {
        assert_eq!(state, TransactionState::Started);
    }
}

#[test]
fn termination_removes_the_table_entry() {
    let table = Arc::new(Table::default());
    let profile = Arc::new(TimerProfile::default());
    let key = TransactionKey::new("z9hG4bK-bye", "bye", true);
    let tx = table.find_or_create(key.clone(), &profile);
    assert_eq!(tx.kind(), TransactionKind::NonInviteServer);

    tx.on_io_error(&io::Error::new(io::ErrorKind::BrokenPipe, "peer went away"));
    tx.on_io_error(&io::Error::new(io::ErrorKind::BrokenPipe, "peer went away"));

    assert_eq!(tx.io_errors.load(Ordering::SeqCst), 2);
    assert_eq!(table.removed.load(Ordering::SeqCst), 1);
    assert!(!table.entries.lock().contains_key(&key));
    assert!(!tx.is_started());
}

#[test]
fn profile_changes_apply_to_later_reads() {
    let profile = Arc::new(TimerProfile::new("access"));
    let table = Arc::new(Table::default());
    let tx = table.find_or_create(TransactionKey::new("z9hG4bK-t1", "INVITE", false), &profile);

    assert_eq!(tx.lifecycle().max_lifetime().as_millis(), 64_000);
    profile.set(TimerId::Tn, 20_000);
    assert_eq!(tx.lifecycle().max_lifetime().as_millis(), 20_000);
    assert_eq!(tx.lifecycle().profile().network(), "access");
}

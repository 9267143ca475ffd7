//! Change notification for store tables.
//!
//! A trigger is a size-1 channel: commits deliver a non-blocking send, so
//! writers never wait on slow consumers and bursts of writes collapse into
//! one pending notification. Consumers therefore may miss intermediate
//! states but never the last one.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::rows::Table;

/// The receiving end of a table-change subscription.
pub struct Trigger {
    rx: mpsc::Receiver<()>,
}

impl Trigger {
    /// Wait for the next notification. Returns `None` once the store side
    /// has gone away.
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }

    /// Drain a pending notification without blocking. Returns whether one
    /// was pending.
    pub fn try_recv(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

struct TriggerEntry {
    tables: HashSet<Table>,
    tx: mpsc::Sender<()>,
}

/// The registry of live triggers, shared by all connection clones.
pub(crate) struct TriggerSet {
    entries: Vec<TriggerEntry>,
}

impl TriggerSet {
    pub(crate) fn new() -> TriggerSet {
        TriggerSet {
            entries: Vec::new(),
        }
    }

    pub(crate) fn register(&mut self, tables: &[Table]) -> Trigger {
        let (tx, rx) = mpsc::channel(1);
        self.entries.push(TriggerEntry {
            tables: tables.iter().copied().collect(),
            tx,
        });
        Trigger { rx }
    }

    /// Register a trigger that additionally fires every `secs` seconds.
    /// The first timer tick is immediate. Must be called within a tokio
    /// runtime.
    pub(crate) fn register_tick(&mut self, secs: u64, tables: &[Table]) -> Trigger {
        let trigger = self.register(tables);
        let tx = self
            .entries
            .last()
            .expect("just registered")
            .tx
            .clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(TrySendError::Closed(())) = tx.try_send(()) {
                    break;
                }
            }
        });
        trigger
    }

    /// Notify every trigger watching any of `tables`. Dead subscriptions
    /// are pruned along the way.
    pub(crate) fn fire(&mut self, tables: &[Table]) {
        self.entries.retain(|e| !e.tx.is_closed());
        for entry in &self.entries {
            if tables.iter().any(|t| entry.tables.contains(t)) {
                // A full buffer means a notification is already pending;
                // the consumer will observe the latest state when it reads.
                let _ = entry.tx.try_send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Conn;

    fn write_machine(conn: &Conn) {
        conn.txn(&[Table::Machine])
            .run(|view| {
                view.insert_machine();
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn trigger_fires_on_commit() {
        let conn = Conn::new();
        let mut trigger = conn.trigger(&[Table::Machine]);

        write_machine(&conn);
        assert!(trigger.try_recv());
        assert!(!trigger.try_recv());
    }

    #[tokio::test]
    async fn trigger_ignores_other_tables() {
        let conn = Conn::new();
        let mut trigger = conn.trigger(&[Table::Container]);

        write_machine(&conn);
        assert!(!trigger.try_recv());
    }

    #[tokio::test]
    async fn trigger_ignores_no_op_commit() {
        let conn = Conn::new();
        write_machine(&conn);

        let mut trigger = conn.trigger(&[Table::Machine]);
        // Reading without writing changes nothing, so no notification.
        conn.txn(&[Table::Machine])
            .run(|view| {
                view.machines();
                Ok(())
            })
            .unwrap();
        assert!(!trigger.try_recv());
    }

    #[tokio::test]
    async fn burst_of_writes_coalesces() {
        let conn = Conn::new();
        let mut trigger = conn.trigger(&[Table::Machine]);

        for _ in 0..5 {
            write_machine(&conn);
        }
        assert!(trigger.try_recv());
        assert!(!trigger.try_recv());
    }

    #[tokio::test]
    async fn trigger_tick_first_tick_is_immediate() {
        let conn = Conn::new();
        let mut trigger = conn.trigger_tick(3600, &[Table::Machine]);

        // No writes needed; the timer's first tick arrives right away.
        tokio::time::timeout(Duration::from_secs(1), trigger.recv())
            .await
            .expect("first tick should be immediate")
            .expect("channel open");
    }

    #[tokio::test]
    async fn dropped_trigger_does_not_block_writers() {
        let conn = Conn::new();
        let trigger = conn.trigger(&[Table::Machine]);
        drop(trigger);

        // Writes proceed; the dead subscription is pruned.
        write_machine(&conn);
        write_machine(&conn);
    }
}

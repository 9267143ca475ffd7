//! The connection, transaction, and view machinery of the state store.
//!
//! All state lives in one `Mutex`-guarded map of tables. A transaction
//! names the tables it touches, runs a closure against a cloned view of
//! them, and writes the clones back on success. Only one transaction
//! executes at a time, which makes the history trivially serializable.

use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{DbError, DbResult};
use crate::rows::*;
use crate::trigger::{Trigger, TriggerSet};

type TableData = BTreeMap<RowId, Row>;

struct State {
    tables: HashMap<Table, TableData>,
    next_id: RowId,
}

struct Shared {
    state: Mutex<State>,
    triggers: Mutex<TriggerSet>,
}

/// A handle on the state store. Cheap to clone; all clones share the same
/// underlying tables.
#[derive(Clone)]
pub struct Conn {
    shared: Arc<Shared>,
}

impl Default for Conn {
    fn default() -> Self {
        Self::new()
    }
}

impl Conn {
    /// Create a fresh, empty store.
    pub fn new() -> Conn {
        let mut tables = HashMap::new();
        for table in Table::all() {
            tables.insert(table, TableData::new());
        }
        Conn {
            shared: Arc::new(Shared {
                state: Mutex::new(State { tables, next_id: 1 }),
                triggers: Mutex::new(TriggerSet::new()),
            }),
        }
    }

    /// Begin a transaction covering `tables`. Accessing any other table
    /// from within the transaction closure panics.
    pub fn txn(&self, tables: &[Table]) -> Txn {
        Txn {
            conn: self.clone(),
            tables: tables.to_vec(),
        }
    }

    /// Register interest in writes to `tables`. The returned trigger's
    /// channel holds at most one pending notification, so bursts of
    /// writes between reads coalesce into a single wakeup.
    pub fn trigger(&self, tables: &[Table]) -> Trigger {
        self.lock_triggers().register(tables)
    }

    /// Like [`Conn::trigger`], but also fires every `secs` seconds even
    /// absent writes. The first tick is immediate.
    pub fn trigger_tick(&self, secs: u64, tables: &[Table]) -> Trigger {
        self.lock_triggers().register_tick(secs, tables)
    }

    /// The namespace of the current blueprint, if one has been imported.
    pub fn get_blueprint_namespace(&self) -> DbResult<String> {
        let mut namespace = String::new();
        self.txn(&[Table::Blueprint]).run(|view| {
            namespace = view.blueprint()?.spec.namespace;
            Ok(())
        })?;
        Ok(namespace)
    }

    /// Whether the local process currently holds the leader lock.
    pub fn etcd_leader(&self) -> bool {
        self.etcds().first().map(|e| e.leader).unwrap_or(false)
    }

    /// The minion row describing the local host.
    pub fn minion_self(&self) -> DbResult<Minion> {
        self.minions()
            .into_iter()
            .find(|m| m.is_self)
            .ok_or(DbError::NoSelfMinion)
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        // Transaction closures run under catch_unwind, so the lock can
        // only be poisoned by a panic in this module itself; recover
        // rather than propagate.
        self.shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn lock_triggers(&self) -> MutexGuard<'_, TriggerSet> {
        self.shared
            .triggers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

/// A pending transaction over a set of tables.
pub struct Txn {
    conn: Conn,
    tables: Vec<Table>,
}

impl Txn {
    /// Run `f` against a view of the covered tables. The view's changes
    /// commit if `f` returns `Ok`, and are discarded if it returns an
    /// error or panics (the panic is re-raised after the lock releases).
    pub fn run<F>(&self, f: F) -> DbResult<()>
    where
        F: FnOnce(&mut Database) -> DbResult<()>,
    {
        let mut state = self.conn.lock_state();

        let mut view_tables = HashMap::new();
        for &table in &self.tables {
            view_tables.insert(table, state.tables[&table].clone());
        }
        let mut view = Database {
            tables: view_tables,
            next_id: state.next_id,
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&mut view)));
        let result = match outcome {
            Ok(result) => result,
            Err(payload) => {
                drop(state);
                panic::resume_unwind(payload);
            }
        };

        let mut changed = Vec::new();
        if result.is_ok() {
            state.next_id = view.next_id;
            for (table, data) in view.tables {
                if state.tables[&table] != data {
                    state.tables.insert(table, data);
                    changed.push(table);
                }
            }
        }
        drop(state);

        if !changed.is_empty() {
            self.conn.lock_triggers().fire(&changed);
        }
        result
    }
}

/// A transactional view of the covered tables.
pub struct Database {
    tables: HashMap<Table, TableData>,
    next_id: RowId,
}

impl Database {
    fn table(&self, table: Table) -> &TableData {
        self.tables
            .get(&table)
            .unwrap_or_else(|| panic!("table {table:?} is not covered by this transaction"))
    }

    fn table_mut(&mut self, table: Table) -> &mut TableData {
        self.tables
            .get_mut(&table)
            .unwrap_or_else(|| panic!("table {table:?} is not covered by this transaction"))
    }

    fn fresh_id(&mut self) -> RowId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Upsert a row by id.
    pub fn commit(&mut self, row: impl Into<Row>) {
        let row = row.into();
        self.table_mut(row.table()).insert(row.id(), row);
    }

    /// Delete a row by id.
    pub fn remove(&mut self, row: impl Into<Row>) {
        let row = row.into();
        self.table_mut(row.table()).remove(&row.id());
    }

    /// The blueprint singleton, or an error when none has been imported.
    pub fn blueprint(&self) -> DbResult<Blueprint> {
        self.blueprints().into_iter().next().ok_or(DbError::NoBlueprint)
    }

    /// The firewall policy singleton.
    pub fn acl(&self) -> DbResult<Acl> {
        self.acls().into_iter().next().ok_or(DbError::NoAcl)
    }

    /// Whether the local process currently holds the leader lock.
    pub fn etcd_leader(&self) -> bool {
        self.etcds().first().map(|e| e.leader).unwrap_or(false)
    }

    /// The minion row describing the local host.
    pub fn minion_self(&self) -> DbResult<Minion> {
        self.minions()
            .into_iter()
            .find(|m| m.is_self)
            .ok_or(DbError::NoSelfMinion)
    }
}

/// Generate the per-table insert/select accessors on the view, plus the
/// connection-level selects that wrap themselves in a one-table read
/// transaction.
macro_rules! table_accessors {
    ($(($variant:ident, $ty:ident, $insert:ident, $select:ident)),* $(,)?) => {
        impl Database {
            $(
                /// Insert a fresh row with a newly assigned id.
                pub fn $insert(&mut self) -> $ty {
                    let id = self.fresh_id();
                    let row = <$ty>::default();
                    let row = $ty { id, ..row };
                    self.table_mut(Table::$variant)
                        .insert(id, Row::$variant(row.clone()));
                    row
                }

                /// All rows of the table, in id order.
                pub fn $select(&self) -> Vec<$ty> {
                    self.table(Table::$variant)
                        .values()
                        .map(|row| match row {
                            Row::$variant(r) => r.clone(),
                            other => unreachable!("{:?} in {} table", other.table(), stringify!($variant)),
                        })
                        .collect()
                }
            )*
        }

        impl Conn {
            $(
                /// Snapshot read of the whole table.
                pub fn $select(&self) -> Vec<$ty> {
                    let mut rows = Vec::new();
                    // A read of a single table cannot fail.
                    let _ = self.txn(&[Table::$variant]).run(|view| {
                        rows = view.$select();
                        Ok(())
                    });
                    rows
                }
            )*
        }
    };
}

table_accessors! {
    (Machine, Machine, insert_machine, machines),
    (Container, Container, insert_container, containers),
    (Image, Image, insert_image, images),
    (Placement, Placement, insert_placement, placements),
    (Acl, Acl, insert_acl, acls),
    (Blueprint, Blueprint, insert_blueprint, blueprints),
    (Etcd, Etcd, insert_etcd, etcds),
    (Minion, Minion, insert_minion, minions),
}

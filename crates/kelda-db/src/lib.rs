//! The in-memory relational state store at the heart of the controller.
//!
//! Tables hold typed rows (machines, containers, images, placements, the
//! firewall policy, and the blueprint/leader/minion singletons). All access
//! goes through serializable transactions that name the tables they touch;
//! change triggers let the reconcilers sleep until something they care
//! about moves.
//!
//! Nothing here is durable by design — on restart the daemon re-derives
//! every row from the blueprint, the cloud providers, and Kubernetes.

mod error;
mod import;
mod rows;
mod store;
mod trigger;

pub use error::{DbError, DbResult};
pub use import::import_blueprint;
pub use rows::{
    status, Acl, Blueprint, Container, Etcd, Image, ImageStatus, Machine, Minion, Placement,
    PortRange, Row, RowId, Table,
};
pub use store::{Conn, Database, Txn};
pub use trigger::Trigger;

//! The cloud reconciler: drives the machine table against cloud truth.
//!
//! Each pass lists every provider, joins the observed machines against
//! the desired rows, and boots, stops, or re-addresses whatever differs.
//! ACLs are only programmed once a pass finds nothing else to do, so a
//! controller restart never briefly wipes the firewall while the machine
//! roster is still settling.

mod cloud;
mod status;

pub use cloud::{run, sync_db, Cloud, CloudConfig, JoinMachine, LaunchLoc, SyncDbResult};
pub use status::{run_machine_status, StatusConfig};

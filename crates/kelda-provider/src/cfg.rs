//! Cloud-init user data for booting machines.

use crate::types::Machine;

/// Render the cloud-config a machine boots with: authorized SSH keys plus
/// a role marker the on-host supervisor picks up.
///
/// The output must be deterministic for a given machine so that identical
/// boot requests coalesce into one provider call.
pub fn cloud_config(machine: &Machine) -> String {
    let mut out = String::from("#cloud-config\n");
    if !machine.ssh_keys.is_empty() {
        out.push_str("ssh_authorized_keys:\n");
        for key in &machine.ssh_keys {
            out.push_str("    - ");
            out.push_str(key);
            out.push('\n');
        }
    }
    out.push_str("write_files:\n");
    out.push_str("    - path: /etc/kelda-role\n");
    out.push_str("      content: ");
    out.push_str(&machine.role.to_string());
    out.push('\n');
    out
}

//! Blueprint import — committing a compiled blueprint into the store.
//!
//! Importing is a diff, not a wholesale replace: machine and container
//! rows that survive the new blueprint keep their ids and everything the
//! reconcilers have learned about them (cloud ids, IPs, statuses).
//! Re-importing an unchanged blueprint commits nothing, so triggers stay
//! quiet.

use std::collections::BTreeSet;

use kelda_blueprint as blueprint;
use kelda_join::{hash_join, join};
use tracing::info;

use crate::error::DbResult;
use crate::rows::*;
use crate::store::{Conn, Database};

/// Default root disk size in GiB for machines that don't specify one.
const DEFAULT_DISK_SIZE: i32 = 32;

/// Commit `spec` into the store. `admin_cidrs` are operator-supplied CIDR
/// ranges granted full access in the firewall policy.
///
/// A namespace change drops every machine, container, image, and placement
/// row first: resources tagged with the old namespace no longer belong to
/// this deployment.
pub fn import_blueprint(
    conn: &Conn,
    spec: &blueprint::Blueprint,
    admin_cidrs: &[String],
) -> DbResult<()> {
    conn.txn(&Table::all()).run(|view| {
        let previous = view.blueprints().into_iter().next();
        if let Some(prev) = &previous {
            if prev.spec.namespace != spec.namespace {
                info!(
                    old = %prev.spec.namespace,
                    new = %spec.namespace,
                    "namespace changed, dropping stale rows"
                );
                for m in view.machines() {
                    view.remove(m);
                }
                for c in view.containers() {
                    view.remove(c);
                }
                for i in view.images() {
                    view.remove(i);
                }
                for p in view.placements() {
                    view.remove(p);
                }
            }
        }

        let mut row = match previous {
            Some(row) => row,
            None => view.insert_blueprint(),
        };
        if row.spec != *spec {
            row.spec = spec.clone();
            view.commit(row);
        }

        update_machines(view, &spec.machines);
        update_containers(view, &spec.containers);
        update_images(view, &spec.containers);
        update_placements(view, &spec.placements);
        update_acl(view, &spec.connections, admin_cidrs);
        allocate_ips(view);
        Ok(())
    })
}

fn update_machines(view: &mut Database, desired: &[blueprint::Machine]) {
    let score = |want: &blueprint::Machine, have: &Machine| -> i32 {
        if want.provider != have.provider
            || want.region != have.region
            || want.size != have.size
            || want.preemptible != have.preemptible
            || want.role != have.role
        {
            return -1;
        }
        let mut score = 0;
        if effective_disk(want.disk_size) != have.disk_size {
            score += 1;
        }
        if want.floating_ip != have.floating_ip {
            score += 1;
        }
        if want.ssh_keys != have.ssh_keys {
            score += 1;
        }
        score
    };

    let res = join(desired.to_vec(), view.machines(), score);

    for (want, have) in res.pairs {
        let updated = Machine {
            disk_size: effective_disk(want.disk_size),
            floating_ip: want.floating_ip.clone(),
            ssh_keys: want.ssh_keys.clone(),
            ..have.clone()
        };
        if updated != have {
            view.commit(updated);
        }
    }

    for want in res.left_only {
        let mut machine = view.insert_machine();
        machine.provider = want.provider;
        machine.region = want.region.clone();
        machine.size = want.size.clone();
        machine.disk_size = effective_disk(want.disk_size);
        machine.preemptible = want.preemptible;
        machine.role = want.role;
        machine.floating_ip = want.floating_ip.clone();
        machine.ssh_keys = want.ssh_keys.clone();
        view.commit(machine);
    }

    for stale in res.right_only {
        view.remove(stale);
    }
}

fn update_containers(view: &mut Database, desired: &[blueprint::Container]) {
    let res = hash_join(
        desired.to_vec(),
        view.containers(),
        |c| c.hostname.clone(),
        |c| c.hostname.clone(),
    );

    for (want, have) in res.pairs {
        let updated = Container {
            image: want.image.name().to_string(),
            dockerfile: want.image.dockerfile().to_string(),
            command: want.command.clone(),
            env: want.env.clone(),
            filepath_to_content: want.filepath_to_content.clone(),
            ..have.clone()
        };
        if updated != have {
            view.commit(updated);
        }
    }

    for want in res.left_only {
        let mut container = view.insert_container();
        container.hostname = want.hostname.clone();
        container.image = want.image.name().to_string();
        container.dockerfile = want.image.dockerfile().to_string();
        container.command = want.command.clone();
        container.env = want.env.clone();
        container.filepath_to_content = want.filepath_to_content.clone();
        view.commit(container);
    }

    for stale in res.right_only {
        view.remove(stale);
    }
}

fn update_images(view: &mut Database, containers: &[blueprint::Container]) {
    let desired: BTreeSet<(String, String)> = containers
        .iter()
        .filter(|c| !c.image.dockerfile().is_empty())
        .map(|c| {
            (
                c.image.name().to_string(),
                c.image.dockerfile().to_string(),
            )
        })
        .collect();

    let key = |img: &(String, String)| img.clone();
    let res = hash_join(
        desired.into_iter().collect(),
        view.images(),
        key,
        |img: &Image| (img.name.clone(), img.dockerfile.clone()),
    );

    for (name, dockerfile) in res.left_only {
        let mut image = view.insert_image();
        image.name = name;
        image.dockerfile = dockerfile;
        view.commit(image);
    }

    for stale in res.right_only {
        view.remove(stale);
    }
}

fn update_placements(view: &mut Database, desired: &[blueprint::Placement]) {
    let shape = |p: &Placement| {
        (
            p.target_container.clone(),
            p.exclusive,
            p.other_container.clone(),
            p.provider.clone(),
            p.size.clone(),
            p.region.clone(),
            p.floating_ip.clone(),
        )
    };
    let want: BTreeSet<_> = desired
        .iter()
        .map(|p| {
            (
                p.target_container.clone(),
                p.exclusive,
                p.other_container.clone(),
                p.provider.clone(),
                p.size.clone(),
                p.region.clone(),
                p.floating_ip.clone(),
            )
        })
        .collect();
    let have: BTreeSet<_> = view.placements().iter().map(shape).collect();
    if want == have {
        return;
    }

    for stale in view.placements() {
        view.remove(stale);
    }
    for p in desired {
        let mut row = view.insert_placement();
        row.target_container = p.target_container.clone();
        row.exclusive = p.exclusive;
        row.other_container = p.other_container.clone();
        row.provider = p.provider.clone();
        row.size = p.size.clone();
        row.region = p.region.clone();
        row.floating_ip = p.floating_ip.clone();
        view.commit(row);
    }
}

fn update_acl(view: &mut Database, connections: &[blueprint::Connection], admin: &[String]) {
    let mut ports: Vec<PortRange> = connections
        .iter()
        .filter(|c| c.from_public())
        .map(|c| PortRange {
            min_port: c.min_port,
            max_port: c.max_port,
        })
        .collect();
    ports.sort_by_key(|p| (p.min_port, p.max_port));
    ports.dedup();

    let mut admin: Vec<String> = admin.to_vec();
    admin.sort();
    admin.dedup();

    let mut row = match view.acls().into_iter().next() {
        Some(row) => row,
        None => view.insert_acl(),
    };
    if row.admin != admin || row.application_ports != ports {
        row.admin = admin;
        row.application_ports = ports;
        view.commit(row);
    }
}

/// Assign blueprint IPs to containers that don't have one yet, from the
/// 10.1.0.0/16 pool, skipping addresses already in use. Assignment is
/// deterministic in row-id order so repeated imports agree.
fn allocate_ips(view: &mut Database) {
    let containers = view.containers();
    let used: BTreeSet<String> = containers
        .iter()
        .filter(|c| !c.ip.is_empty())
        .map(|c| c.ip.clone())
        .collect();

    let mut next: u32 = 1;
    for mut container in containers {
        if !container.ip.is_empty() {
            continue;
        }
        let ip = loop {
            let low = next & 0xff;
            let candidate = format!("10.1.{}.{}", (next >> 8) & 0xff, low);
            next += 1;
            if low == 0 || low == 255 || used.contains(&candidate) {
                continue;
            }
            break candidate;
        };
        container.ip = ip;
        view.commit(container);
    }
}

fn effective_disk(requested: i32) -> i32 {
    if requested == 0 {
        DEFAULT_DISK_SIZE
    } else {
        requested
    }
}

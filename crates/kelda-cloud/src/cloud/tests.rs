use std::sync::Mutex;

use async_trait::async_trait;

use super::*;
use kelda_provider::ProviderResult;

/// A provider double whose `boot` immediately materializes machines so
/// the next `list` observes them.
#[derive(Default)]
struct FakeProvider {
    machines: Mutex<Vec<provider::Machine>>,
    counter: Mutex<u32>,
    boot_calls: Mutex<u32>,
    stop_calls: Mutex<u32>,
    fip_calls: Mutex<u32>,
    acl_calls: Mutex<Vec<Vec<Acl>>>,
    reject_boot: bool,
}

#[async_trait]
impl Provider for FakeProvider {
    async fn list(&self) -> ProviderResult<Vec<provider::Machine>> {
        Ok(self.machines.lock().unwrap().clone())
    }

    async fn boot(&self, machines: Vec<provider::Machine>) -> ProviderResult<Vec<String>> {
        *self.boot_calls.lock().unwrap() += 1;
        if self.reject_boot {
            return Err(ProviderError::Unsupported(
                "preemptible instances".to_string(),
            ));
        }
        let mut ids = Vec::new();
        for mut m in machines {
            let n = {
                let mut counter = self.counter.lock().unwrap();
                *counter += 1;
                *counter
            };
            m.cloud_id = format!("fake-{n}");
            m.public_ip = format!("54.0.0.{n}");
            m.private_ip = format!("10.0.0.{n}");
            ids.push(m.cloud_id.clone());
            self.machines.lock().unwrap().push(m);
        }
        Ok(ids)
    }

    async fn stop(&self, machines: Vec<provider::Machine>) -> ProviderResult<()> {
        *self.stop_calls.lock().unwrap() += 1;
        let ids: Vec<String> = machines.into_iter().map(|m| m.cloud_id).collect();
        self.machines
            .lock()
            .unwrap()
            .retain(|m| !ids.contains(&m.cloud_id));
        Ok(())
    }

    async fn set_acls(&self, acls: Vec<Acl>) -> ProviderResult<()> {
        self.acl_calls.lock().unwrap().push(acls);
        Ok(())
    }

    async fn update_floating_ips(&self, _: Vec<provider::Machine>) -> ProviderResult<()> {
        *self.fip_calls.lock().unwrap() += 1;
        Ok(())
    }

    async fn cleanup(&self) -> ProviderResult<()> {
        Ok(())
    }
}

fn test_config() -> CloudConfig {
    CloudConfig {
        my_ip: Arc::new(|| Box::pin(async { Ok("8.8.8.8".to_string()) })),
        ..Default::default()
    }
}

fn amazon_loc() -> LaunchLoc {
    LaunchLoc {
        provider: ProviderKind::Amazon,
        region: "us-west-1".to_string(),
    }
}

/// A store seeded with a namespace and one desired Amazon machine.
fn seeded_conn() -> Conn {
    let conn = Conn::new();
    conn.txn(&Table::all())
        .run(|view| {
            let mut bp = view.insert_blueprint();
            bp.spec.namespace = "ns".to_string();
            view.commit(bp);

            let mut acl = view.insert_acl();
            acl.admin = vec!["1.2.3.4/32".to_string()];
            acl.application_ports = vec![db::PortRange {
                min_port: 80,
                max_port: 80,
            }];
            view.commit(acl);

            let mut m = view.insert_machine();
            m.provider = ProviderKind::Amazon;
            m.region = "us-west-1".to_string();
            m.size = "m4.large".to_string();
            m.disk_size = 32;
            m.role = Role::Master;
            view.commit(m);
            Ok(())
        })
        .unwrap();
    conn
}

fn cloud_with(conn: &Conn, fake: &Arc<FakeProvider>) -> Cloud {
    let mut providers: HashMap<LaunchLoc, ProviderHandle> = HashMap::new();
    providers.insert(amazon_loc(), Arc::clone(fake) as ProviderHandle);
    Cloud::with_providers(conn.clone(), "ns", test_config(), providers)
}

#[tokio::test]
async fn converges_in_one_run_and_goes_idle() {
    let conn = seeded_conn();
    let fake = Arc::new(FakeProvider::default());
    let cld = cloud_with(&conn, &fake);

    // First pass boots the machine, observes it, and records identity.
    assert!(cld.run_once().await);
    let machines = conn.machines();
    assert_eq!(machines.len(), 1);
    assert_eq!(machines[0].cloud_id, "fake-1");
    assert_eq!(machines[0].public_ip, "54.0.0.1");
    assert_eq!(machines[0].private_ip, "10.0.0.1");
    assert_eq!(*fake.boot_calls.lock().unwrap(), 1);
    assert_eq!(fake.acl_calls.lock().unwrap().len(), 1);

    // A matching world means zero side-effecting calls except ACL sync.
    assert!(cld.run_once().await);
    assert_eq!(*fake.boot_calls.lock().unwrap(), 1);
    assert_eq!(*fake.stop_calls.lock().unwrap(), 0);
    assert_eq!(*fake.fip_calls.lock().unwrap(), 0);
    assert_eq!(fake.acl_calls.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn acl_sync_includes_admin_app_ports_and_machines() {
    let conn = seeded_conn();
    let fake = Arc::new(FakeProvider::default());
    let cld = cloud_with(&conn, &fake);
    cld.run_once().await;

    let calls = fake.acl_calls.lock().unwrap();
    let acls = calls.last().unwrap();
    assert!(acls.contains(&Acl::allow_all("1.2.3.4/32")));
    // The controller's own address is always admitted.
    assert!(acls.contains(&Acl::allow_all("8.8.8.8/32")));
    // Application ports are open to the world.
    assert!(acls.contains(&Acl {
        cidr_ip: "0.0.0.0/0".to_string(),
        min_port: 80,
        max_port: 80,
    }));
    // Known machines may reach each other.
    assert!(acls.contains(&Acl::allow_all("54.0.0.1/32")));
}

#[tokio::test]
async fn untracked_instance_is_stopped() {
    let conn = seeded_conn();
    let fake = Arc::new(FakeProvider::default());
    fake.machines.lock().unwrap().push(provider::Machine {
        cloud_id: "intruder".to_string(),
        size: "m3.medium".to_string(),
        ..Default::default()
    });
    let cld = cloud_with(&conn, &fake);

    cld.run_once().await;
    assert_eq!(*fake.stop_calls.lock().unwrap(), 1);
    assert!(fake
        .machines
        .lock()
        .unwrap()
        .iter()
        .all(|m| m.cloud_id != "intruder"));
}

#[tokio::test]
async fn unsupported_boot_marks_status_and_stops_retrying() {
    let conn = seeded_conn();
    let fake = Arc::new(FakeProvider {
        reject_boot: true,
        ..Default::default()
    });
    let cld = cloud_with(&conn, &fake);

    // Validation failures don't count as pass failures.
    assert!(cld.run_once().await);
    let machines = conn.machines();
    assert!(machines[0].status.starts_with("unsupported"));
    assert_eq!(*fake.boot_calls.lock().unwrap(), 1);

    // The marked row is not retried, so the pass goes quiet and ACLs sync.
    assert!(cld.run_once().await);
    assert_eq!(*fake.boot_calls.lock().unwrap(), 1);
    assert!(!fake.acl_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn missing_namespace_is_tolerated() {
    let conn = Conn::new();
    let (cld, ok) = update_cloud(&conn, None, &test_config()).await;
    assert!(cld.is_none());
    assert!(ok);
}

// ── sync_db ────────────────────────────────────────────────────────

fn desired(id: u32, role: Role) -> db::Machine {
    db::Machine {
        id,
        provider: ProviderKind::Amazon,
        region: "us-west-1".to_string(),
        size: "m4.large".to_string(),
        disk_size: 32,
        role,
        ..Default::default()
    }
}

fn observed(cloud_id: &str, role: Role) -> JoinMachine {
    JoinMachine {
        machine: provider::Machine {
            cloud_id: cloud_id.to_string(),
            size: "m4.large".to_string(),
            disk_size: 32,
            ..Default::default()
        },
        loc: amazon_loc(),
        role,
    }
}

#[test]
fn sync_db_pairs_by_cloud_id_first() {
    let mut want = desired(1, Role::None);
    want.cloud_id = "id-1".to_string();

    let diff = sync_db(vec![observed("id-1", Role::None)], vec![want]);
    assert_eq!(diff.pairs.len(), 1);
    assert!(diff.boot.is_empty());
    assert!(diff.stop.is_empty());
}

#[test]
fn sync_db_boots_unmatched_desired() {
    let diff = sync_db(Vec::new(), vec![desired(1, Role::None)]);
    assert_eq!(diff.boot.len(), 1);
    assert!(diff.pairs.is_empty());
}

#[test]
fn sync_db_stops_unmatched_observed() {
    let diff = sync_db(vec![observed("stray", Role::None)], Vec::new());
    assert_eq!(diff.stop.len(), 1);
    assert_eq!(diff.stop[0].machine.cloud_id, "stray");
}

#[test]
fn sync_db_incompatible_size_never_pairs() {
    let mut jm = observed("id-1", Role::None);
    jm.machine.size = "m3.medium".to_string();

    let diff = sync_db(vec![jm], vec![desired(1, Role::None)]);
    assert!(diff.pairs.is_empty());
    assert_eq!(diff.boot.len(), 1);
    assert_eq!(diff.stop.len(), 1);
}

#[test]
fn sync_db_prefers_matching_role() {
    // Two desired rows, one master and one worker; the observed master
    // machine must pair with the master row.
    let master = desired(1, Role::Master);
    let worker = desired(2, Role::Worker);

    let diff = sync_db(
        vec![observed("id-m", Role::Master)],
        vec![worker, master.clone()],
    );
    assert_eq!(diff.pairs.len(), 1);
    assert_eq!(diff.pairs[0].0.id, master.id);
}

#[test]
fn sync_db_prefers_matching_ips() {
    let mut settled = desired(1, Role::None);
    settled.public_ip = "54.0.0.9".to_string();
    settled.private_ip = "10.0.0.9".to_string();
    let fresh = desired(2, Role::None);

    let mut jm = observed("id-1", Role::None);
    jm.machine.public_ip = "54.0.0.9".to_string();
    jm.machine.private_ip = "10.0.0.9".to_string();

    let diff = sync_db(vec![jm], vec![fresh, settled.clone()]);
    assert_eq!(diff.pairs.len(), 1);
    assert_eq!(diff.pairs[0].0.id, settled.id);
}

#[test]
fn sync_db_emits_floating_ip_updates() {
    let mut want = desired(1, Role::None);
    want.cloud_id = "id-1".to_string();
    want.floating_ip = "99.0.0.1".to_string();

    let diff = sync_db(vec![observed("id-1", Role::None)], vec![want]);
    assert_eq!(diff.update_ips.len(), 1);
    // The update carries the desired floating IP.
    assert_eq!(diff.update_ips[0].machine.floating_ip, "99.0.0.1");
}

#[test]
fn sync_db_skips_rows_that_failed_validation() {
    let mut rejected = desired(1, Role::None);
    rejected.status = "unsupported configuration: preemptible".to_string();

    let diff = sync_db(Vec::new(), vec![rejected]);
    assert!(diff.boot.is_empty());
}

#[test]
fn sync_db_is_deterministic() {
    let cloud = vec![observed("a", Role::None), observed("b", Role::None)];
    let rows = vec![desired(1, Role::None), desired(2, Role::None)];

    let first = sync_db(cloud.clone(), rows.clone());
    for _ in 0..10 {
        let again = sync_db(cloud.clone(), rows.clone());
        assert_eq!(first.pairs, again.pairs);
        assert_eq!(first.boot, again.boot);
        assert_eq!(first.stop, again.stop);
    }
}

//! The cloud reconcile loop.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use kelda_blueprint::{ProviderKind, Role};
use kelda_db::{self as db, Conn, DbError, Table};
use kelda_join::join;
use kelda_provider::{self as provider, Acl, Provider, ProviderError};

/// One (provider, region) pair machines can be launched in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LaunchLoc {
    pub provider: ProviderKind,
    pub region: String,
}

impl fmt::Display for LaunchLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.region.is_empty() {
            write!(f, "{}", self.provider)
        } else {
            write!(f, "{}-{}", self.provider, self.region)
        }
    }
}

/// A machine observed in the cloud, annotated with where it was seen.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinMachine {
    pub machine: provider::Machine,
    pub loc: LaunchLoc,
    /// Role reported by the control agent on the machine, `None` until
    /// the agent has checked in.
    pub role: Role,
}

type ProviderHandle = Arc<dyn Provider>;
type ProviderFactory = Arc<
    dyn Fn(ProviderKind, String, String) -> BoxFuture<'static, Result<ProviderHandle, ProviderError>>
        + Send
        + Sync,
>;

/// Injected collaborators of the reconciler. The defaults are the real
/// implementations; tests substitute doubles.
#[derive(Clone)]
pub struct CloudConfig {
    pub new_provider: ProviderFactory,
    pub valid_regions: Arc<dyn Fn(ProviderKind) -> Vec<String> + Send + Sync>,
    /// The controller's own public IP, appended to the admin ACLs.
    pub my_ip: Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync>,
    /// Role lookup for an observed machine, keyed by public IP.
    pub machine_role: Arc<dyn Fn(&str) -> Role + Send + Sync>,
    /// Pause between passes, to avoid hammering the provider APIs.
    pub pace: Duration,
    /// Pause after a pass with failures.
    pub failure_backoff: Duration,
}

impl Default for CloudConfig {
    fn default() -> Self {
        CloudConfig {
            new_provider: Arc::new(|kind, namespace, region| {
                Box::pin(async move {
                    provider::new_provider(kind, &namespace, &region)
                        .await
                        .map(Arc::from)
                })
            }),
            valid_regions: Arc::new(provider::valid_regions),
            my_ip: Arc::new(|| {
                Box::pin(async {
                    let body = reqwest::get("http://checkip.amazonaws.com/")
                        .await?
                        .text()
                        .await?;
                    Ok(body.trim().to_string())
                })
            }),
            // The control agent feed is wired in by the daemon; with no
            // agent, observed machines carry no role.
            machine_role: Arc::new(|_| Role::None),
            pace: Duration::from_secs(5),
            failure_backoff: Duration::from_secs(60),
        }
    }
}

/// Drive the machine table until shutdown. Wakes on a 30-second tick or
/// any write to the blueprint, machine, or ACL tables.
pub async fn run(conn: Conn, cfg: CloudConfig, mut shutdown: watch::Receiver<bool>) {
    let mut trigger = conn.trigger_tick(30, &[Table::Blueprint, Table::Machine, Table::Acl]);
    let mut cld: Option<Cloud> = None;

    loop {
        tokio::select! {
            event = trigger.recv() => {
                if event.is_none() {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
        if !conn.etcd_leader() {
            continue;
        }

        let (next, ok) = update_cloud(&conn, cld.take(), &cfg).await;
        cld = next;

        let pause = if ok { cfg.pace } else { cfg.failure_backoff };
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!("cloud reconciler stopped");
}

async fn update_cloud(conn: &Conn, cld: Option<Cloud>, cfg: &CloudConfig) -> (Option<Cloud>, bool) {
    let namespace = match conn.get_blueprint_namespace() {
        Ok(namespace) => namespace,
        Err(_) => return (cld, true),
    };

    let cld = match cld {
        Some(cld) if cld.namespace == namespace => cld,
        // A namespace change invalidates every provider-scoped cache.
        _ => Cloud::new(conn.clone(), namespace, cfg.clone()).await,
    };
    let ok = cld.run_once().await;
    (Some(cld), ok)
}

/// The reconciler for one namespace: a set of connected provider
/// adapters plus the store they converge against.
pub struct Cloud {
    namespace: String,
    conn: Conn,
    providers: HashMap<LaunchLoc, ProviderHandle>,
    cfg: CloudConfig,
}

#[derive(Default)]
struct PassView {
    machines: Vec<db::Machine>,
    acl: db::Acl,
    boot: Vec<db::Machine>,
    stop: Vec<JoinMachine>,
    update_ips: Vec<JoinMachine>,
}

/// The outcome of diffing observed cloud machines against desired rows.
pub struct SyncDbResult {
    pub pairs: Vec<(db::Machine, JoinMachine)>,
    pub boot: Vec<db::Machine>,
    pub stop: Vec<JoinMachine>,
    pub update_ips: Vec<JoinMachine>,
}

impl Cloud {
    /// Connect adapters for every (provider, region) pair. Providers that
    /// fail to connect (usually for lack of credentials) are skipped.
    pub async fn new(conn: Conn, namespace: String, cfg: CloudConfig) -> Cloud {
        let mut providers = HashMap::new();
        for kind in ProviderKind::all() {
            for region in (cfg.valid_regions)(kind) {
                let loc = LaunchLoc {
                    provider: kind,
                    region,
                };
                match (cfg.new_provider)(kind, namespace.clone(), loc.region.clone()).await {
                    Ok(p) => {
                        providers.insert(loc, p);
                    }
                    Err(err) => {
                        debug!(provider = %loc, error = %err, "failed to connect to provider");
                    }
                }
            }
        }
        Cloud {
            namespace,
            conn,
            providers,
            cfg,
        }
    }

    /// Build a reconciler over explicit adapters. Used by tests.
    pub fn with_providers(
        conn: Conn,
        namespace: &str,
        cfg: CloudConfig,
        providers: HashMap<LaunchLoc, ProviderHandle>,
    ) -> Cloud {
        Cloud {
            namespace: namespace.to_string(),
            conn,
            providers,
            cfg,
        }
    }

    /// One reconcile pass. Loops twice because applying updates changes
    /// what the next join sees; ACLs are only programmed once a loop
    /// iteration finds nothing else to do. Returns whether the pass was
    /// failure-free.
    pub async fn run_once(&self) -> bool {
        let mut ok = true;
        for _ in 0..2 {
            let view = match self.join().await {
                Ok(view) => view,
                Err(_) => return false,
            };

            if view.boot.is_empty() && view.stop.is_empty() && view.update_ips.is_empty() {
                self.sync_acls(&view.acl, &view.machines).await;
                return ok;
            }

            ok &= self.boot(view.boot).await;
            ok &= self.stop(view.stop).await;
            ok &= self.update_floating_ips(view.update_ips).await;
        }
        ok
    }

    /// List the cloud, then join observed machines against desired rows
    /// inside one transaction, recording learned cloud ids and IPs.
    async fn join(&self) -> anyhow::Result<PassView> {
        let cloud_machines = match self.list_all().await {
            Ok(machines) => machines,
            Err(err) => {
                error!(error = %err, "failed to list machines");
                return Err(err);
            }
        };

        let mut view_out = PassView::default();
        let result = self
            .conn
            .txn(&[Table::Acl, Table::Blueprint, Table::Machine])
            .run(|view| {
                let namespace = view.blueprint()?.spec.namespace;
                if namespace != self.namespace {
                    debug!("cloud run abort");
                    return Err(DbError::Aborted(
                        "namespace change during a cloud run".to_string(),
                    ));
                }

                view_out.acl = view.acl().unwrap_or_default();
                view_out.machines = view.machines();

                let diff = sync_db(cloud_machines, view.machines());
                for (mut dbm, jm) in diff.pairs {
                    // Only adopt the cloud id once the machine's role is
                    // compatible, so a master row never binds to a worker VM.
                    if jm.role == Role::None || jm.role == dbm.role {
                        dbm.cloud_id = jm.machine.cloud_id.clone();
                    }
                    if dbm.public_ip != jm.machine.public_ip {
                        // The row is being re-associated with a different
                        // cloud machine; its old status no longer applies.
                        dbm.status = String::new();
                    }
                    dbm.public_ip = jm.machine.public_ip.clone();
                    dbm.private_ip = jm.machine.private_ip.clone();
                    view.commit(dbm);
                }

                view_out.boot = diff.boot;
                view_out.stop = diff.stop;
                view_out.update_ips = diff.update_ips;
                Ok(())
            });

        match result {
            Ok(()) => Ok(view_out),
            Err(err) => Err(anyhow!("{err}")),
        }
    }

    /// List every provider concurrently; any provider failure aborts the
    /// pass so the join never runs against a partial world view.
    async fn list_all(&self) -> anyhow::Result<Vec<JoinMachine>> {
        let mut tasks = JoinSet::new();
        for (loc, p) in &self.providers {
            let loc = loc.clone();
            let p = Arc::clone(p);
            tasks.spawn(async move {
                let listed = rpc_timeout(p.list()).await;
                (loc, listed)
            });
        }

        let mut machines = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (loc, listed) = joined.map_err(|e| anyhow!("list task: {e}"))?;
            let listed = listed.map_err(|e| anyhow!("list {loc}: {e}"))?;
            for machine in listed {
                let role = (self.cfg.machine_role)(&machine.public_ip);
                machines.push(JoinMachine {
                    machine,
                    loc: loc.clone(),
                    role,
                });
            }
        }
        // Provider listing order is nondeterministic; sort so the scored
        // join below is a pure function of cloud state.
        machines.sort_by(|a, b| (&a.loc, &a.machine.cloud_id).cmp(&(&b.loc, &b.machine.cloud_id)));
        Ok(machines)
    }

    async fn boot(&self, machines: Vec<db::Machine>) -> bool {
        if machines.is_empty() {
            return true;
        }
        info!(count = machines.len(), action = "boot", "updating cloud");
        self.set_statuses(&machines, db::status::BOOTING);

        let mut unsupported: HashMap<db::RowId, String> = HashMap::new();
        let mut ok = true;
        for (loc, group) in group_machines(&machines) {
            let Some(provider) = self.providers.get(&loc) else {
                warn!(provider = %loc, "provider is unavailable");
                ok = false;
                continue;
            };

            let boot_set = group.iter().map(boot_request).collect();
            match rpc_timeout(provider.boot(boot_set)).await {
                Ok(ids) => {
                    debug!(provider = %loc, count = ids.len(), "boot requested");
                }
                Err(err @ ProviderError::Unsupported(_)) => {
                    // Validation failure: surface on the rows and leave
                    // them alone until the blueprint changes.
                    warn!(provider = %loc, error = %err, "cannot boot machines");
                    for m in &group {
                        unsupported.insert(m.id, err.to_string());
                    }
                }
                Err(err) => {
                    warn!(
                        provider = %loc,
                        count = group.len(),
                        action = "boot",
                        error = %err,
                        "failed to update cloud"
                    );
                    ok = false;
                }
            }
        }

        let _ = self.conn.txn(&[Table::Machine]).run(|view| {
            for mut m in view.machines() {
                if let Some(message) = unsupported.get(&m.id) {
                    m.status = message.clone();
                    view.commit(m);
                } else if machines.iter().any(|b| b.id == m.id) && m.status == db::status::BOOTING
                {
                    m.status = String::new();
                    view.commit(m);
                }
            }
            Ok(())
        });
        ok
    }

    async fn stop(&self, machines: Vec<JoinMachine>) -> bool {
        self.apply("stop", machines, |p, ms| {
            Box::pin(async move { p.stop(ms).await })
        })
        .await
    }

    async fn update_floating_ips(&self, machines: Vec<JoinMachine>) -> bool {
        self.apply("update floating IPs", machines, |p, ms| {
            Box::pin(async move { p.update_floating_ips(ms).await })
        })
        .await
    }

    /// Apply a side effect per (provider, region) group. Group failures
    /// are isolated: other groups still progress.
    async fn apply<F>(&self, action: &str, machines: Vec<JoinMachine>, f: F) -> bool
    where
        F: Fn(
            ProviderHandle,
            Vec<provider::Machine>,
        ) -> BoxFuture<'static, Result<(), ProviderError>>,
    {
        if machines.is_empty() {
            return true;
        }
        info!(count = machines.len(), action, "updating cloud");

        let mut ok = true;
        for (loc, group) in group_join_machines(machines) {
            let Some(provider) = self.providers.get(&loc) else {
                warn!(provider = %loc, "provider is unavailable");
                ok = false;
                continue;
            };

            let count = group.len();
            if let Err(err) = rpc_timeout(f(Arc::clone(provider), group)).await {
                warn!(
                    provider = %loc,
                    count,
                    action,
                    error = %err,
                    "failed to update cloud"
                );
                ok = false;
            }
        }
        if ok {
            info!(action, "successfully updated cloud");
        }
        ok
    }

    /// Converge firewall policy everywhere: providers hosting at least
    /// one machine get exactly the assembled ACLs, all others are wiped.
    async fn sync_acls(&self, acl: &db::Acl, machines: &[db::Machine]) {
        let mut admin = acl.admin.clone();
        match (self.cfg.my_ip)().await {
            Ok(ip) => admin.push(format!("{ip}/32")),
            Err(err) => error!(error = %err, "couldn't retrieve our IP address"),
        }

        let mut acls: Vec<Acl> = admin.into_iter().map(Acl::allow_all).collect();
        for ports in &acl.application_ports {
            acls.push(Acl {
                cidr_ip: "0.0.0.0/0".to_string(),
                min_port: ports.min_port,
                max_port: ports.max_port,
            });
        }

        let mut active: HashSet<LaunchLoc> = HashSet::new();
        for m in machines {
            if !m.public_ip.is_empty() {
                acls.push(Acl::allow_all(format!("{}/32", m.public_ip)));
            }
            active.insert(LaunchLoc {
                provider: m.provider,
                region: m.region.clone(),
            });
        }

        for (loc, provider) in &self.providers {
            let set = if active.contains(loc) {
                acls.clone()
            } else {
                Vec::new()
            };
            if let Err(err) = rpc_timeout(provider.set_acls(set)).await {
                warn!(provider = %loc, error = %err, "could not update ACLs");
            }
        }
    }

    fn set_statuses(&self, machines: &[db::Machine], status: &str) {
        let _ = self.conn.txn(&[Table::Machine]).run(|view| {
            for mut m in view.machines() {
                if machines.iter().any(|b| b.id == m.id) && m.status != status {
                    m.status = status.to_string();
                    view.commit(m);
                }
            }
            Ok(())
        });
    }
}

/// Diff observed cloud machines against desired rows.
///
/// Pass 1 pairs on identity: cloud id plus every requested attribute.
/// Pass 2 relaxes the cloud id and ranks the remaining candidates so a
/// row keeps its current machine when possible: matching role is worth
/// 4, a matching IP pair 2, a matching floating IP 1 (lower is better).
pub fn sync_db(cloud: Vec<JoinMachine>, db_machines: Vec<db::Machine>) -> SyncDbResult {
    let pass1 = join(db_machines, cloud, |dbm: &db::Machine, jm: &JoinMachine| {
        let m = &jm.machine;
        let compatible = dbm.cloud_id == m.cloud_id
            && dbm.provider == jm.loc.provider
            && dbm.region == jm.loc.region
            && dbm.size == m.size
            && dbm.preemptible == m.preemptible
            && (m.disk_size == 0 || dbm.disk_size == m.disk_size)
            && (jm.role == Role::None || dbm.role == jm.role);
        if compatible {
            0
        } else {
            -1
        }
    });

    let pass2 = join(
        pass1.left_only,
        pass1.right_only,
        |dbm: &db::Machine, jm: &JoinMachine| {
            let m = &jm.machine;
            if dbm.provider != jm.loc.provider
                || dbm.region != jm.loc.region
                || dbm.size != m.size
                || dbm.preemptible != m.preemptible
                || (m.disk_size != 0 && dbm.disk_size != m.disk_size)
                || (jm.role != Role::None && dbm.role != jm.role)
            {
                return -1;
            }

            let mut score = 10;
            if dbm.role != Role::None && jm.role != Role::None && dbm.role == jm.role {
                score -= 4;
            }
            if dbm.public_ip == m.public_ip && dbm.private_ip == m.private_ip {
                score -= 2;
            }
            if dbm.floating_ip == m.floating_ip {
                score -= 1;
            }
            score
        },
    );

    let mut result = SyncDbResult {
        pairs: Vec::new(),
        boot: Vec::new(),
        stop: pass2.right_only,
        update_ips: Vec::new(),
    };

    for dbm in pass2.left_only {
        // Rows that already failed validation wait for a blueprint change.
        if !dbm.status.starts_with("unsupported") {
            result.boot.push(dbm);
        }
    }

    for (dbm, mut jm) in pass1.pairs.into_iter().chain(pass2.pairs) {
        if dbm.cloud_id == jm.machine.cloud_id && dbm.floating_ip != jm.machine.floating_ip {
            jm.machine.floating_ip = dbm.floating_ip.clone();
            result.update_ips.push(jm.clone());
        }
        result.pairs.push((dbm, jm));
    }

    result
}

/// Hard ceiling on any single provider RPC.
const RPC_TIMEOUT: Duration = Duration::from_secs(5 * 60);

async fn rpc_timeout<T>(
    call: impl std::future::Future<Output = Result<T, ProviderError>>,
) -> Result<T, ProviderError> {
    match tokio::time::timeout(RPC_TIMEOUT, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Api(anyhow!("provider call timed out"))),
    }
}

fn boot_request(dbm: &db::Machine) -> provider::Machine {
    provider::Machine {
        size: dbm.size.clone(),
        disk_size: dbm.disk_size,
        preemptible: dbm.preemptible,
        ssh_keys: dbm.ssh_keys.clone(),
        role: dbm.role,
        ..Default::default()
    }
}

fn group_machines(machines: &[db::Machine]) -> BTreeMap<LaunchLoc, Vec<db::Machine>> {
    let mut groups: BTreeMap<LaunchLoc, Vec<db::Machine>> = BTreeMap::new();
    for m in machines {
        let loc = LaunchLoc {
            provider: m.provider,
            region: m.region.clone(),
        };
        groups.entry(loc).or_default().push(m.clone());
    }
    groups
}

fn group_join_machines(machines: Vec<JoinMachine>) -> BTreeMap<LaunchLoc, Vec<provider::Machine>> {
    let mut groups: BTreeMap<LaunchLoc, Vec<provider::Machine>> = BTreeMap::new();
    for jm in machines {
        groups.entry(jm.loc).or_default().push(jm.machine);
    }
    groups
}

#[cfg(test)]
mod tests;

//! Amazon EC2 adapter.
//!
//! Machines run inside a namespaced VPC with a single public subnet and a
//! security group named after the namespace. Preemptible machines map to
//! spot requests; a spot request and the instance it launched are merged
//! into one machine when listing.

mod client;

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, ensure, Context};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use kelda_join::hash_join;

use crate::cfg::cloud_config;
use crate::error::{ProviderError, ProviderResult};
use crate::namespace_tag;
use crate::types::{Acl, Machine};
use crate::Provider;

pub use client::AwsEc2Client;

/// Fixed bid for spot requests, in dollars per hour.
const SPOT_PRICE: &str = "0.5";
const VPC_BLOCK: &str = "172.31.0.0/16";
const SUBNET_BLOCK: &str = "172.31.0.0/20";

/// The AWS regions machines may be requested in.
pub const REGIONS: &[&str] = &["us-east-1", "ap-southeast-2", "us-west-1", "us-west-2"];

/// Ubuntu 16.04, 64-bit hvm:ebs-ssd.
fn ami_for(region: &str) -> Option<&'static str> {
    match region {
        "us-east-1" => Some("ami-f0768de6"),
        "ap-southeast-2" => Some("ami-943d3bf7"),
        "us-west-1" => Some("ami-79df8219"),
        "us-west-2" => Some("ami-d206bdb2"),
        _ => None,
    }
}

// ── Client interface ───────────────────────────────────────────────

/// A request to launch `count` identical instances.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RunRequest {
    pub image_id: String,
    pub size: String,
    pub subnet_id: String,
    pub group_id: String,
    pub disk_size_gib: i32,
    pub user_data: String,
    pub preemptible: bool,
    pub count: i32,
}

/// A running instance as EC2 reports it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceDescription {
    pub instance_id: String,
    /// Set when the instance was launched by a spot request.
    pub spot_request_id: String,
    pub public_ip: String,
    pub private_ip: String,
    pub size: String,
    /// Root EBS volume, when one is attached.
    pub volume_id: Option<String>,
}

/// An open or active spot request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpotDescription {
    pub id: String,
    pub instance_id: Option<String>,
    pub size: String,
}

/// One flattened security-group ingress rule (single CIDR range).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IpPermission {
    pub protocol: String,
    pub from_port: i32,
    pub to_port: i32,
    pub cidr_ip: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecurityGroupDescription {
    pub id: String,
    pub vpc_id: String,
    pub permissions: Vec<IpPermission>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayDescription {
    pub id: String,
    pub attached_vpcs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubnetDescription {
    pub id: String,
    pub vpc_id: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddressDescription {
    pub public_ip: String,
    pub allocation_id: Option<String>,
    pub instance_id: Option<String>,
    pub association_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumeDescription {
    pub id: String,
    pub size_gib: i32,
}

/// The slice of the EC2 API the adapter drives. Tests substitute a
/// recording double.
#[async_trait]
pub trait Ec2Client: Send + Sync {
    async fn describe_instances(&self, group_name: &str)
        -> anyhow::Result<Vec<InstanceDescription>>;
    async fn run_instances(&self, req: RunRequest) -> anyhow::Result<Vec<String>>;
    async fn terminate_instances(&self, ids: Vec<String>) -> anyhow::Result<()>;

    async fn describe_spot_requests(
        &self,
        ids: Option<Vec<String>>,
        group_name: Option<String>,
    ) -> anyhow::Result<Vec<SpotDescription>>;
    async fn request_spot_instances(
        &self,
        price: &str,
        req: RunRequest,
    ) -> anyhow::Result<Vec<String>>;
    async fn cancel_spot_requests(&self, ids: Vec<String>) -> anyhow::Result<()>;

    async fn describe_vpcs(&self, tag_key: &str) -> anyhow::Result<Vec<String>>;
    async fn create_vpc(&self, cidr_block: &str) -> anyhow::Result<String>;
    async fn delete_vpc(&self, vpc_id: &str) -> anyhow::Result<()>;

    async fn describe_internet_gateways(
        &self,
        tag_key: &str,
    ) -> anyhow::Result<Vec<GatewayDescription>>;
    async fn create_internet_gateway(&self) -> anyhow::Result<String>;
    async fn attach_internet_gateway(&self, gateway_id: &str, vpc_id: &str)
        -> anyhow::Result<()>;
    async fn detach_internet_gateway(&self, gateway_id: &str, vpc_id: &str)
        -> anyhow::Result<()>;
    async fn delete_internet_gateway(&self, gateway_id: &str) -> anyhow::Result<()>;

    async fn describe_route_tables(&self, vpc_id: &str) -> anyhow::Result<Vec<String>>;
    async fn create_route(
        &self,
        route_table_id: &str,
        cidr_block: &str,
        gateway_id: &str,
    ) -> anyhow::Result<()>;

    async fn describe_subnets(&self) -> anyhow::Result<Vec<SubnetDescription>>;
    async fn create_subnet(&self, vpc_id: &str, cidr_block: &str) -> anyhow::Result<String>;
    async fn map_public_ip_on_launch(&self, subnet_id: &str, value: bool) -> anyhow::Result<()>;
    async fn delete_subnet(&self, subnet_id: &str) -> anyhow::Result<()>;

    async fn describe_security_group(
        &self,
        name: &str,
    ) -> anyhow::Result<Vec<SecurityGroupDescription>>;
    async fn create_security_group(
        &self,
        name: &str,
        vpc_id: &str,
        description: &str,
    ) -> anyhow::Result<String>;
    async fn delete_security_group(&self, group_id: &str) -> anyhow::Result<()>;
    async fn authorize_security_group(
        &self,
        group_id: &str,
        permissions: Vec<IpPermission>,
    ) -> anyhow::Result<()>;
    async fn revoke_security_group(
        &self,
        group_id: &str,
        permissions: Vec<IpPermission>,
    ) -> anyhow::Result<()>;

    async fn describe_addresses(&self) -> anyhow::Result<Vec<AddressDescription>>;
    async fn associate_address(&self, instance_id: &str, allocation_id: &str)
        -> anyhow::Result<()>;
    async fn disassociate_address(&self, association_id: &str) -> anyhow::Result<()>;

    async fn describe_volumes(&self) -> anyhow::Result<Vec<VolumeDescription>>;

    async fn create_tags(&self, resource_ids: Vec<String>, key: &str) -> anyhow::Result<()>;
}

// ── Adapter ────────────────────────────────────────────────────────

/// The EC2 adapter for one region.
pub struct Amazon {
    namespace: String,
    region: String,
    client: Box<dyn Ec2Client>,
}

impl Amazon {
    /// Connect to EC2 in `region` and verify credentials with a list call.
    pub async fn new(namespace: &str, region: &str) -> ProviderResult<Amazon> {
        let client = AwsEc2Client::new(region).await;
        let prvdr = Amazon::with_client(namespace, region, Box::new(client));
        prvdr
            .list()
            .await
            .map_err(|e| ProviderError::Api(anyhow!("AWS failed to connect: {e}")))?;
        Ok(prvdr)
    }

    /// Build an adapter over an explicit client. Used by tests.
    pub fn with_client(namespace: &str, region: &str, client: Box<dyn Ec2Client>) -> Amazon {
        Amazon {
            namespace: namespace.to_lowercase(),
            region: region.to_string(),
            client,
        }
    }

    fn tag_key(&self) -> String {
        namespace_tag(&self.namespace)
    }

    async fn setup_network(&self) -> anyhow::Result<NetworkIds> {
        let groups = self.client.describe_security_group(&self.namespace).await?;
        if groups.len() > 1 {
            bail!("multiple security groups with the same name: {}", self.namespace);
        }
        if let Some(group) = groups.into_iter().next() {
            return Ok(NetworkIds {
                vpc_id: group.vpc_id,
                group_id: group.id,
                ingress: group.permissions,
            });
        }

        let mut created = CreatedArtifacts::default();
        match self.create_network(&mut created).await {
            Ok(ids) => Ok(ids),
            Err(err) => {
                // Roll back every artifact this pass created; the next
                // pass retries from scratch.
                if let Err(cleanup_err) = self.delete_artifacts(&created).await {
                    warn!(error = %cleanup_err, "failed to roll back network setup");
                }
                Err(err)
            }
        }
    }

    async fn create_network(&self, created: &mut CreatedArtifacts) -> anyhow::Result<NetworkIds> {
        let vpc_id = self.client.create_vpc(VPC_BLOCK).await?;
        created.vpc_id = Some(vpc_id.clone());

        let gateway_id = self.client.create_internet_gateway().await?;
        created.gateway_id = Some(gateway_id.clone());

        self.client
            .attach_internet_gateway(&gateway_id, &vpc_id)
            .await?;
        created.gateway_attached = true;

        let route_tables = self.client.describe_route_tables(&vpc_id).await?;
        ensure!(
            route_tables.len() == 1,
            "expected 1 route table, found {}",
            route_tables.len()
        );
        self.client
            .create_route(&route_tables[0], "0.0.0.0/0", &gateway_id)
            .await?;

        let subnet_id = self.client.create_subnet(&vpc_id, SUBNET_BLOCK).await?;
        created.subnet_id = Some(subnet_id.clone());
        self.client.map_public_ip_on_launch(&subnet_id, true).await?;

        let group_id = self
            .client
            .create_security_group(&self.namespace, &vpc_id, "Kelda Group")
            .await?;
        created.group_id = Some(group_id.clone());

        self.client
            .create_tags(vec![vpc_id.clone(), gateway_id], &self.tag_key())
            .await?;

        Ok(NetworkIds {
            vpc_id,
            group_id,
            ingress: Vec::new(),
        })
    }

    async fn delete_artifacts(&self, created: &CreatedArtifacts) -> anyhow::Result<()> {
        let mut failed = false;

        if let Some(group_id) = &created.group_id {
            if self.client.delete_security_group(group_id).await.is_err() {
                failed = true;
            }
        }
        if let Some(subnet_id) = &created.subnet_id {
            if self.client.delete_subnet(subnet_id).await.is_err() {
                failed = true;
            }
        }
        if let Some(gateway_id) = &created.gateway_id {
            if created.gateway_attached {
                if let Some(vpc_id) = &created.vpc_id {
                    if self
                        .client
                        .detach_internet_gateway(gateway_id, vpc_id)
                        .await
                        .is_err()
                    {
                        failed = true;
                    }
                }
            }
            if self.client.delete_internet_gateway(gateway_id).await.is_err() {
                failed = true;
            }
        }
        if let Some(vpc_id) = &created.vpc_id {
            if self.client.delete_vpc(vpc_id).await.is_err() {
                failed = true;
            }
        }

        if failed {
            bail!(
                "error cleaning up Amazon {}, {}",
                self.region,
                self.namespace
            );
        }
        Ok(())
    }

    async fn subnet_id(&self, vpc_id: &str) -> anyhow::Result<String> {
        let subnets = self.client.describe_subnets().await?;
        subnets
            .into_iter()
            .find(|s| s.vpc_id == vpc_id)
            .map(|s| s.id)
            .ok_or_else(|| anyhow!("missing subnet in VPC {vpc_id}"))
    }

    async fn list_machines(&self) -> anyhow::Result<Vec<Machine>> {
        let spots = self
            .client
            .describe_spot_requests(None, Some(self.namespace.clone()))
            .await?;
        let instances = self.client.describe_instances(&self.namespace).await?;

        let addresses = self.client.describe_addresses().await?;
        let mut floating: BTreeMap<String, String> = BTreeMap::new();
        for addr in addresses {
            if let (Some(instance_id), Some(_)) = (&addr.instance_id, &addr.allocation_id) {
                floating.insert(instance_id.clone(), addr.public_ip.clone());
            }
        }

        let volumes = self.client.describe_volumes().await?;
        let volume_sizes: BTreeMap<String, i32> =
            volumes.into_iter().map(|v| (v.id, v.size_gib)).collect();

        // Merge spot requests with the instances they launched; requests
        // still waiting for capacity surface as machines without IPs.
        let joined = hash_join(
            spots,
            instances,
            |s| s.id.clone(),
            |i| i.spot_request_id.clone(),
        );

        let mut machines = Vec::new();
        for (spot, inst) in joined.pairs {
            machines.push(instance_machine(&inst, &floating, &volume_sizes, Some(&spot.id)));
        }
        for spot in joined.left_only {
            machines.push(Machine {
                cloud_id: spot.id,
                size: spot.size,
                preemptible: true,
                ..Default::default()
            });
        }
        for inst in joined.right_only {
            machines.push(instance_machine(&inst, &floating, &volume_sizes, None));
        }
        Ok(machines)
    }

    async fn stop_spots(&self, ids: Vec<String>) -> anyhow::Result<()> {
        let spots = self
            .client
            .describe_spot_requests(Some(ids.clone()), None)
            .await?;

        let instance_ids: Vec<String> =
            spots.into_iter().filter_map(|s| s.instance_id).collect();

        let mut terminate_err = None;
        if !instance_ids.is_empty() {
            terminate_err = self.client.terminate_instances(instance_ids).await.err();
        }
        let cancel_err = self.client.cancel_spot_requests(ids).await.err();

        match (terminate_err, cancel_err) {
            (None, None) => Ok(()),
            (Some(e), None) => Err(e),
            (None, Some(e)) => Err(e),
            (Some(stop), Some(cancel)) => bail!("stop: {stop}, cancel: {cancel}"),
        }
    }

    async fn resolve_spot_instance(&self, spot_id: &str) -> anyhow::Result<String> {
        let spots = self
            .client
            .describe_spot_requests(Some(vec![spot_id.to_string()]), None)
            .await?;
        spots
            .into_iter()
            .next()
            .and_then(|s| s.instance_id)
            .ok_or_else(|| anyhow!("no spot requests with ID {spot_id}"))
    }
}

#[async_trait]
impl Provider for Amazon {
    async fn list(&self) -> ProviderResult<Vec<Machine>> {
        Ok(self.list_machines().await?)
    }

    async fn boot(&self, machines: Vec<Machine>) -> ProviderResult<Vec<String>> {
        if machines.is_empty() {
            return Ok(Vec::new());
        }

        let net = self.setup_network().await?;
        let subnet_id = self.subnet_id(&net.vpc_id).await?;
        let image_id = ami_for(&self.region)
            .ok_or_else(|| anyhow!("no AMI for region {}", self.region))?;

        // Identical boot requests coalesce into one API call.
        let mut requests: BTreeMap<RunRequest, i32> = BTreeMap::new();
        for m in &machines {
            let req = RunRequest {
                image_id: image_id.to_string(),
                size: m.size.clone(),
                subnet_id: subnet_id.clone(),
                group_id: net.group_id.clone(),
                disk_size_gib: m.disk_size,
                user_data: cloud_config(m),
                preemptible: m.preemptible,
                count: 0,
            };
            *requests.entry(req).or_insert(0) += 1;
        }

        let mut ids = Vec::new();
        for (mut req, count) in requests {
            req.count = count;
            let new_ids = if req.preemptible {
                self.client.request_spot_instances(SPOT_PRICE, req).await?
            } else {
                self.client.run_instances(req).await?
            };
            ids.extend(new_ids);
        }
        Ok(ids)
    }

    async fn stop(&self, machines: Vec<Machine>) -> ProviderResult<()> {
        let (spot_ids, instance_ids): (Vec<_>, Vec<_>) =
            machines.into_iter().partition(|m| m.preemptible);
        let spot_ids: Vec<String> = spot_ids.into_iter().map(|m| m.cloud_id).collect();
        let instance_ids: Vec<String> = instance_ids.into_iter().map(|m| m.cloud_id).collect();

        let mut spot_err = None;
        if !spot_ids.is_empty() {
            spot_err = self.stop_spots(spot_ids).await.err();
        }
        let mut instance_err = None;
        if !instance_ids.is_empty() {
            instance_err = self.client.terminate_instances(instance_ids).await.err();
        }

        match (spot_err, instance_err) {
            (None, None) => Ok(()),
            (Some(e), None) | (None, Some(e)) => Err(e.into()),
            (Some(spot), Some(reserved)) => {
                Err(anyhow!("reserved: {reserved}, and spot: {spot}").into())
            }
        }
    }

    async fn set_acls(&self, mut acls: Vec<Acl>) -> ProviderResult<()> {
        let net = self.setup_network().await?;

        // Machines within the subnet always talk freely.
        acls.push(Acl {
            cidr_ip: SUBNET_BLOCK.to_string(),
            min_port: 0,
            max_port: 65535,
        });

        let desired = expand_acls(&acls);
        let joined = hash_join(
            desired,
            net.ingress,
            |p: &IpPermission| p.clone(),
            |p: &IpPermission| p.clone(),
        );

        if !joined.left_only.is_empty() {
            log_acls(true, &joined.left_only);
            self.client
                .authorize_security_group(&net.group_id, joined.left_only)
                .await?;
        }
        if !joined.right_only.is_empty() {
            log_acls(false, &joined.right_only);
            self.client
                .revoke_security_group(&net.group_id, joined.right_only)
                .await?;
        }
        Ok(())
    }

    async fn update_floating_ips(&self, machines: Vec<Machine>) -> ProviderResult<()> {
        let addresses = self.client.describe_addresses().await?;

        // Elastic IP -> allocation, and instance -> current association.
        let mut allocations: BTreeMap<String, String> = BTreeMap::new();
        let mut associations: BTreeMap<String, String> = BTreeMap::new();
        for addr in addresses {
            if let Some(allocation_id) = &addr.allocation_id {
                allocations.insert(addr.public_ip.clone(), allocation_id.clone());
            }
            if let (Some(instance_id), Some(association_id)) =
                (&addr.instance_id, &addr.association_id)
            {
                associations.insert(instance_id.clone(), association_id.clone());
            }
        }

        for machine in machines {
            let mut instance_id = machine.cloud_id.clone();
            if machine.preemptible {
                instance_id = self.resolve_spot_instance(&instance_id).await?;
            }

            if machine.floating_ip.is_empty() {
                let Some(association_id) = associations.get(&instance_id) else {
                    continue;
                };
                self.client.disassociate_address(association_id).await?;
            } else {
                let allocation_id = allocations.get(&machine.floating_ip).ok_or_else(|| {
                    anyhow!("no allocation for floating IP {}", machine.floating_ip)
                })?;
                self.client
                    .associate_address(&instance_id, allocation_id)
                    .await?;
            }
        }
        Ok(())
    }

    async fn cleanup(&self) -> ProviderResult<()> {
        let tag = self.tag_key();
        let vpcs = self.client.describe_vpcs(&tag).await?;
        let gateways = self.client.describe_internet_gateways(&tag).await?;
        let subnets = self.client.describe_subnets().await?;
        let groups = self
            .client
            .describe_security_group(&self.namespace)
            .await
            .context("describe security group")?;

        let mut failed = false;
        for group in groups {
            debug!(id = %group.id, namespace = %self.namespace, "delete security group");
            if self.client.delete_security_group(&group.id).await.is_err() {
                failed = true;
            }
        }
        for gateway in gateways {
            debug!(id = %gateway.id, "delete internet gateway");
            for vpc_id in &gateway.attached_vpcs {
                if self
                    .client
                    .detach_internet_gateway(&gateway.id, vpc_id)
                    .await
                    .is_err()
                {
                    failed = true;
                }
            }
            if self
                .client
                .delete_internet_gateway(&gateway.id)
                .await
                .is_err()
            {
                failed = true;
            }
        }
        for vpc_id in vpcs {
            for subnet in subnets.iter().filter(|s| s.vpc_id == vpc_id) {
                debug!(id = %subnet.id, "delete subnet");
                if self.client.delete_subnet(&subnet.id).await.is_err() {
                    failed = true;
                }
            }
            debug!(id = %vpc_id, "delete vpc");
            if self.client.delete_vpc(&vpc_id).await.is_err() {
                failed = true;
            }
        }

        if failed {
            return Err(anyhow!(
                "error cleaning up Amazon {}, {}",
                self.region,
                self.namespace
            )
            .into());
        }
        Ok(())
    }
}

struct NetworkIds {
    vpc_id: String,
    group_id: String,
    ingress: Vec<IpPermission>,
}

#[derive(Default)]
struct CreatedArtifacts {
    vpc_id: Option<String>,
    gateway_id: Option<String>,
    gateway_attached: bool,
    subnet_id: Option<String>,
    group_id: Option<String>,
}

fn instance_machine(
    inst: &InstanceDescription,
    floating: &BTreeMap<String, String>,
    volume_sizes: &BTreeMap<String, i32>,
    spot_id: Option<&str>,
) -> Machine {
    let disk_size = inst
        .volume_id
        .as_ref()
        .and_then(|id| volume_sizes.get(id))
        .copied()
        .unwrap_or(0);
    Machine {
        cloud_id: spot_id.unwrap_or(&inst.instance_id).to_string(),
        public_ip: inst.public_ip.clone(),
        private_ip: inst.private_ip.clone(),
        floating_ip: floating.get(&inst.instance_id).cloned().unwrap_or_default(),
        size: inst.size.clone(),
        disk_size,
        preemptible: spot_id.is_some(),
        ..Default::default()
    }
}

/// Expand each ACL into its TCP, UDP, and ICMP permission rows.
fn expand_acls(acls: &[Acl]) -> Vec<IpPermission> {
    let mut perms = Vec::new();
    for acl in acls {
        for protocol in ["tcp", "udp"] {
            perms.push(IpPermission {
                protocol: protocol.to_string(),
                from_port: i32::from(acl.min_port),
                to_port: i32::from(acl.max_port),
                cidr_ip: acl.cidr_ip.clone(),
            });
        }
        perms.push(IpPermission {
            protocol: "icmp".to_string(),
            from_port: -1,
            to_port: -1,
            cidr_ip: acl.cidr_ip.clone(),
        });
    }
    perms
}

fn log_acls(add: bool, perms: &[IpPermission]) {
    let action = if add { "add" } else { "revoke" };
    for perm in perms {
        // Each rule has TCP, UDP, and ICMP variants; log once.
        if perm.protocol != "tcp" {
            continue;
        }
        let mut ports = perm.from_port.to_string();
        if perm.from_port != perm.to_port {
            ports = format!("{}-{}", perm.from_port, perm.to_port);
        }
        info!(acl = format!("{}:{}", perm.cidr_ip, ports), action, "Amazon ACL");
    }
}

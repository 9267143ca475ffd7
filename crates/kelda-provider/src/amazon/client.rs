//! The real EC2 client, kept to a thin translation layer so the adapter
//! logic never sees SDK types.

use anyhow::anyhow;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::types::{
    AttributeBooleanValue, BlockDeviceMapping, EbsBlockDevice, Filter, InstanceType,
    IpPermission as AwsIpPermission, IpRange, RequestSpotLaunchSpecification, Tag, VolumeType,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use super::{
    AddressDescription, Ec2Client, GatewayDescription, InstanceDescription, IpPermission,
    RunRequest, SecurityGroupDescription, SpotDescription, SubnetDescription, VolumeDescription,
};

/// EC2 client for one region, authenticated through the default AWS
/// credential chain.
pub struct AwsEc2Client {
    client: aws_sdk_ec2::Client,
}

impl AwsEc2Client {
    pub async fn new(region: &str) -> AwsEc2Client {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        AwsEc2Client {
            client: aws_sdk_ec2::Client::new(&config),
        }
    }
}

fn block_device(disk_size_gib: i32) -> BlockDeviceMapping {
    BlockDeviceMapping::builder()
        .device_name("/dev/sda1")
        .ebs(
            EbsBlockDevice::builder()
                .delete_on_termination(true)
                .volume_size(disk_size_gib)
                .volume_type(VolumeType::Gp2)
                .build(),
        )
        .build()
}

fn to_aws_permission(perm: IpPermission) -> AwsIpPermission {
    AwsIpPermission::builder()
        .ip_protocol(perm.protocol)
        .from_port(perm.from_port)
        .to_port(perm.to_port)
        .ip_ranges(IpRange::builder().cidr_ip(perm.cidr_ip).build())
        .build()
}

#[async_trait]
impl Ec2Client for AwsEc2Client {
    async fn describe_instances(
        &self,
        group_name: &str,
    ) -> anyhow::Result<Vec<InstanceDescription>> {
        let resp = self
            .client
            .describe_instances()
            .filters(
                Filter::builder()
                    .name("instance.group-name")
                    .values(group_name)
                    .build(),
            )
            .filters(
                Filter::builder()
                    .name("instance-state-name")
                    .values("running")
                    .build(),
            )
            .send()
            .await?;

        let mut instances = Vec::new();
        for reservation in resp.reservations() {
            for inst in reservation.instances() {
                instances.push(InstanceDescription {
                    instance_id: inst.instance_id().unwrap_or_default().to_string(),
                    spot_request_id: inst
                        .spot_instance_request_id()
                        .unwrap_or_default()
                        .to_string(),
                    public_ip: inst.public_ip_address().unwrap_or_default().to_string(),
                    private_ip: inst.private_ip_address().unwrap_or_default().to_string(),
                    size: inst
                        .instance_type()
                        .map(|t| t.as_str().to_string())
                        .unwrap_or_default(),
                    volume_id: inst
                        .block_device_mappings()
                        .first()
                        .and_then(|m| m.ebs())
                        .and_then(|e| e.volume_id())
                        .map(str::to_string),
                });
            }
        }
        Ok(instances)
    }

    async fn run_instances(&self, req: RunRequest) -> anyhow::Result<Vec<String>> {
        let resp = self
            .client
            .run_instances()
            .image_id(req.image_id)
            .instance_type(InstanceType::from(req.size.as_str()))
            .user_data(BASE64.encode(req.user_data))
            .subnet_id(req.subnet_id)
            .security_group_ids(req.group_id)
            .block_device_mappings(block_device(req.disk_size_gib))
            .min_count(req.count)
            .max_count(req.count)
            .send()
            .await?;

        Ok(resp
            .instances()
            .iter()
            .filter_map(|i| i.instance_id())
            .map(str::to_string)
            .collect())
    }

    async fn terminate_instances(&self, ids: Vec<String>) -> anyhow::Result<()> {
        self.client
            .terminate_instances()
            .set_instance_ids(Some(ids))
            .send()
            .await?;
        Ok(())
    }

    async fn describe_spot_requests(
        &self,
        ids: Option<Vec<String>>,
        group_name: Option<String>,
    ) -> anyhow::Result<Vec<SpotDescription>> {
        let mut call = self.client.describe_spot_instance_requests();
        if let Some(ids) = ids {
            call = call.set_spot_instance_request_ids(Some(ids));
        }
        if let Some(group) = group_name {
            call = call
                .filters(
                    Filter::builder()
                        .name("state")
                        .values("active")
                        .values("open")
                        .build(),
                )
                .filters(
                    Filter::builder()
                        .name("launch.group-name")
                        .values(group)
                        .build(),
                );
        }
        let resp = call.send().await?;

        Ok(resp
            .spot_instance_requests()
            .iter()
            .map(|spot| SpotDescription {
                id: spot.spot_instance_request_id().unwrap_or_default().to_string(),
                instance_id: spot.instance_id().map(str::to_string),
                size: spot
                    .launch_specification()
                    .and_then(|l| l.instance_type())
                    .map(|t| t.as_str().to_string())
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn request_spot_instances(
        &self,
        price: &str,
        req: RunRequest,
    ) -> anyhow::Result<Vec<String>> {
        let spec = RequestSpotLaunchSpecification::builder()
            .image_id(req.image_id)
            .instance_type(InstanceType::from(req.size.as_str()))
            .user_data(BASE64.encode(req.user_data))
            .subnet_id(req.subnet_id)
            .security_group_ids(req.group_id)
            .block_device_mappings(block_device(req.disk_size_gib))
            .build();

        let resp = self
            .client
            .request_spot_instances()
            .spot_price(price)
            .instance_count(req.count)
            .launch_specification(spec)
            .send()
            .await?;

        Ok(resp
            .spot_instance_requests()
            .iter()
            .filter_map(|s| s.spot_instance_request_id())
            .map(str::to_string)
            .collect())
    }

    async fn cancel_spot_requests(&self, ids: Vec<String>) -> anyhow::Result<()> {
        self.client
            .cancel_spot_instance_requests()
            .set_spot_instance_request_ids(Some(ids))
            .send()
            .await?;
        Ok(())
    }

    async fn describe_vpcs(&self, tag_key: &str) -> anyhow::Result<Vec<String>> {
        let resp = self
            .client
            .describe_vpcs()
            .filters(Filter::builder().name("tag-key").values(tag_key).build())
            .send()
            .await?;
        Ok(resp
            .vpcs()
            .iter()
            .filter_map(|v| v.vpc_id())
            .map(str::to_string)
            .collect())
    }

    async fn create_vpc(&self, cidr_block: &str) -> anyhow::Result<String> {
        let resp = self.client.create_vpc().cidr_block(cidr_block).send().await?;
        resp.vpc()
            .and_then(|v| v.vpc_id())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("CreateVpc returned no VPC id"))
    }

    async fn delete_vpc(&self, vpc_id: &str) -> anyhow::Result<()> {
        self.client.delete_vpc().vpc_id(vpc_id).send().await?;
        Ok(())
    }

    async fn describe_internet_gateways(
        &self,
        tag_key: &str,
    ) -> anyhow::Result<Vec<GatewayDescription>> {
        let resp = self
            .client
            .describe_internet_gateways()
            .filters(Filter::builder().name("tag-key").values(tag_key).build())
            .send()
            .await?;
        Ok(resp
            .internet_gateways()
            .iter()
            .map(|ig| GatewayDescription {
                id: ig.internet_gateway_id().unwrap_or_default().to_string(),
                attached_vpcs: ig
                    .attachments()
                    .iter()
                    .filter_map(|a| a.vpc_id())
                    .map(str::to_string)
                    .collect(),
            })
            .collect())
    }

    async fn create_internet_gateway(&self) -> anyhow::Result<String> {
        let resp = self.client.create_internet_gateway().send().await?;
        resp.internet_gateway()
            .and_then(|g| g.internet_gateway_id())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("CreateInternetGateway returned no id"))
    }

    async fn attach_internet_gateway(
        &self,
        gateway_id: &str,
        vpc_id: &str,
    ) -> anyhow::Result<()> {
        self.client
            .attach_internet_gateway()
            .internet_gateway_id(gateway_id)
            .vpc_id(vpc_id)
            .send()
            .await?;
        Ok(())
    }

    async fn detach_internet_gateway(
        &self,
        gateway_id: &str,
        vpc_id: &str,
    ) -> anyhow::Result<()> {
        self.client
            .detach_internet_gateway()
            .internet_gateway_id(gateway_id)
            .vpc_id(vpc_id)
            .send()
            .await?;
        Ok(())
    }

    async fn delete_internet_gateway(&self, gateway_id: &str) -> anyhow::Result<()> {
        self.client
            .delete_internet_gateway()
            .internet_gateway_id(gateway_id)
            .send()
            .await?;
        Ok(())
    }

    async fn describe_route_tables(&self, vpc_id: &str) -> anyhow::Result<Vec<String>> {
        let resp = self
            .client
            .describe_route_tables()
            .filters(Filter::builder().name("vpc-id").values(vpc_id).build())
            .send()
            .await?;
        Ok(resp
            .route_tables()
            .iter()
            .filter_map(|rt| rt.route_table_id())
            .map(str::to_string)
            .collect())
    }

    async fn create_route(
        &self,
        route_table_id: &str,
        cidr_block: &str,
        gateway_id: &str,
    ) -> anyhow::Result<()> {
        self.client
            .create_route()
            .route_table_id(route_table_id)
            .destination_cidr_block(cidr_block)
            .gateway_id(gateway_id)
            .send()
            .await?;
        Ok(())
    }

    async fn describe_subnets(&self) -> anyhow::Result<Vec<SubnetDescription>> {
        let resp = self.client.describe_subnets().send().await?;
        Ok(resp
            .subnets()
            .iter()
            .map(|s| SubnetDescription {
                id: s.subnet_id().unwrap_or_default().to_string(),
                vpc_id: s.vpc_id().unwrap_or_default().to_string(),
            })
            .collect())
    }

    async fn create_subnet(&self, vpc_id: &str, cidr_block: &str) -> anyhow::Result<String> {
        let resp = self
            .client
            .create_subnet()
            .vpc_id(vpc_id)
            .cidr_block(cidr_block)
            .send()
            .await?;
        resp.subnet()
            .and_then(|s| s.subnet_id())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("CreateSubnet returned no id"))
    }

    async fn map_public_ip_on_launch(&self, subnet_id: &str, value: bool) -> anyhow::Result<()> {
        self.client
            .modify_subnet_attribute()
            .subnet_id(subnet_id)
            .map_public_ip_on_launch(AttributeBooleanValue::builder().value(value).build())
            .send()
            .await?;
        Ok(())
    }

    async fn delete_subnet(&self, subnet_id: &str) -> anyhow::Result<()> {
        self.client.delete_subnet().subnet_id(subnet_id).send().await?;
        Ok(())
    }

    async fn describe_security_group(
        &self,
        name: &str,
    ) -> anyhow::Result<Vec<SecurityGroupDescription>> {
        let resp = self
            .client
            .describe_security_groups()
            .filters(Filter::builder().name("group-name").values(name).build())
            .send()
            .await?;

        Ok(resp
            .security_groups()
            .iter()
            .map(|group| {
                // Flatten multi-range permissions into one row per range
                // so the adapter can diff rule-by-rule.
                let mut permissions = Vec::new();
                for perm in group.ip_permissions() {
                    for range in perm.ip_ranges() {
                        permissions.push(IpPermission {
                            protocol: perm.ip_protocol().unwrap_or_default().to_string(),
                            from_port: perm.from_port().unwrap_or(0),
                            to_port: perm.to_port().unwrap_or(0),
                            cidr_ip: range.cidr_ip().unwrap_or_default().to_string(),
                        });
                    }
                }
                SecurityGroupDescription {
                    id: group.group_id().unwrap_or_default().to_string(),
                    vpc_id: group.vpc_id().unwrap_or_default().to_string(),
                    permissions,
                }
            })
            .collect())
    }

    async fn create_security_group(
        &self,
        name: &str,
        vpc_id: &str,
        description: &str,
    ) -> anyhow::Result<String> {
        let resp = self
            .client
            .create_security_group()
            .group_name(name)
            .vpc_id(vpc_id)
            .description(description)
            .send()
            .await?;
        resp.group_id()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("CreateSecurityGroup returned no id"))
    }

    async fn delete_security_group(&self, group_id: &str) -> anyhow::Result<()> {
        self.client
            .delete_security_group()
            .group_id(group_id)
            .send()
            .await?;
        Ok(())
    }

    async fn authorize_security_group(
        &self,
        group_id: &str,
        permissions: Vec<IpPermission>,
    ) -> anyhow::Result<()> {
        self.client
            .authorize_security_group_ingress()
            .group_id(group_id)
            .set_ip_permissions(Some(
                permissions.into_iter().map(to_aws_permission).collect(),
            ))
            .send()
            .await?;
        Ok(())
    }

    async fn revoke_security_group(
        &self,
        group_id: &str,
        permissions: Vec<IpPermission>,
    ) -> anyhow::Result<()> {
        self.client
            .revoke_security_group_ingress()
            .group_id(group_id)
            .set_ip_permissions(Some(
                permissions.into_iter().map(to_aws_permission).collect(),
            ))
            .send()
            .await?;
        Ok(())
    }

    async fn describe_addresses(&self) -> anyhow::Result<Vec<AddressDescription>> {
        let resp = self.client.describe_addresses().send().await?;
        Ok(resp
            .addresses()
            .iter()
            .map(|addr| AddressDescription {
                public_ip: addr.public_ip().unwrap_or_default().to_string(),
                allocation_id: addr.allocation_id().map(str::to_string),
                instance_id: addr.instance_id().map(str::to_string),
                association_id: addr.association_id().map(str::to_string),
            })
            .collect())
    }

    async fn associate_address(
        &self,
        instance_id: &str,
        allocation_id: &str,
    ) -> anyhow::Result<()> {
        self.client
            .associate_address()
            .instance_id(instance_id)
            .allocation_id(allocation_id)
            .send()
            .await?;
        Ok(())
    }

    async fn disassociate_address(&self, association_id: &str) -> anyhow::Result<()> {
        self.client
            .disassociate_address()
            .association_id(association_id)
            .send()
            .await?;
        Ok(())
    }

    async fn describe_volumes(&self) -> anyhow::Result<Vec<VolumeDescription>> {
        let resp = self.client.describe_volumes().send().await?;
        Ok(resp
            .volumes()
            .iter()
            .map(|v| VolumeDescription {
                id: v.volume_id().unwrap_or_default().to_string(),
                size_gib: v.size().unwrap_or(0),
            })
            .collect())
    }

    async fn create_tags(&self, resource_ids: Vec<String>, key: &str) -> anyhow::Result<()> {
        self.client
            .create_tags()
            .set_resources(Some(resource_ids))
            .tags(Tag::builder().key(key).value("").build())
            .send()
            .await?;
        Ok(())
    }
}

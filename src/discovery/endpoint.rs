//! Designate backend endpoint lookup
//!
//! The DNS zone lives behind a designate backend Service in the
//! operator's namespace. In-cluster the operator talks to the cluster IP
//! and target port; from outside the cluster it uses the first external
//! IP and the service port.

use std::net::{IpAddr, SocketAddr};

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ListParams};
use kube::Client;

use crate::{Error, Result, DNS_SERVICE_SELECTOR};

/// Find the DNS backend endpoint in the given namespace
pub async fn designate_endpoint(
    client: Client,
    namespace: &str,
    in_cluster: bool,
) -> Result<SocketAddr> {
    let services: Api<Service> = Api::namespaced(client, namespace);
    let list = services
        .list(&ListParams::default().labels(DNS_SERVICE_SELECTOR))
        .await?;

    let service = list
        .items
        .first()
        .ok_or_else(|| Error::dns(format!("no service matching {} in {}", DNS_SERVICE_SELECTOR, namespace)))?;

    endpoint_from_service(service, in_cluster)
}

/// Extract the endpoint address from a designate backend Service
fn endpoint_from_service(service: &Service, in_cluster: bool) -> Result<SocketAddr> {
    let spec = service
        .spec
        .as_ref()
        .ok_or_else(|| Error::dns("designate backend service has no spec"))?;
    let port = spec
        .ports
        .as_ref()
        .and_then(|ports| ports.first())
        .ok_or_else(|| Error::dns("designate backend service has no ports"))?;

    let (ip, port_number) = if in_cluster {
        let ip = spec
            .cluster_ip
            .as_deref()
            .filter(|ip| !ip.is_empty() && *ip != "None")
            .ok_or_else(|| Error::dns("designate backend service has no cluster IP"))?;
        // A named targetPort would need the endpoints object; the backend
        // services publish numeric ports.
        let number = match &port.target_port {
            Some(IntOrString::Int(n)) => *n,
            _ => port.port,
        };
        (ip, number)
    } else {
        let ip = spec
            .external_ips
            .as_ref()
            .and_then(|ips| ips.first())
            .ok_or_else(|| Error::dns("designate backend service has no external IP"))?;
        (ip.as_str(), port.port)
    };

    let ip: IpAddr = ip
        .parse()
        .map_err(|e| Error::dns(format!("bad service IP {:?}: {}", ip, e)))?;
    let port_number = u16::try_from(port_number)
        .map_err(|_| Error::dns(format!("bad service port {}", port_number)))?;
    Ok(SocketAddr::new(ip, port_number))
}

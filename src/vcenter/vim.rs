//! Minimal vSphere SOAP session
//!
//! There is no maintained vSphere SDK crate, so this speaks the small
//! subset of the vim25 SOAP API the operator needs: `Login`/`Logout`,
//! container views, and batched property retrieval. Everything is
//! read-only; the session never mutates vCenter state.
//!
//! Property retrieval goes through one server-side container view per
//! poll plus batched name lookups, so the round-trip count is bounded by
//! inventory shape, not object count.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, warn};

use super::{ClusterInventory, InventorySource, SessionFactory};
use crate::{Error, Result, VCENTER_TIMEOUT_SECS};

/// Maximum folder hops between a cluster and its datacenter
const MAX_PARENT_HOPS: usize = 6;

/// Connection settings shared by all sessions
#[derive(Clone, Debug)]
pub struct VimSettings {
    /// Verify the vCenter TLS certificate
    ///
    /// Off by default for parity with the fleet's legacy endpoints; the
    /// CLI exposes a flag to turn it on.
    pub verify_tls: bool,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for VimSettings {
    fn default() -> Self {
        Self {
            verify_tls: false,
            timeout: Duration::from_secs(VCENTER_TIMEOUT_SECS),
        }
    }
}

/// A managed object reference: type plus opaque id
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct ManagedRef {
    rtype: String,
    id: String,
}

/// One property value as the collector returns it
#[derive(Clone, Debug, PartialEq, Eq)]
enum PropValue {
    Text(String),
    Ref(ManagedRef),
    Refs(Vec<ManagedRef>),
}

/// One object with its retrieved properties
#[derive(Clone, Debug, Default)]
struct ObjectContent {
    obj: Option<ManagedRef>,
    props: BTreeMap<String, PropValue>,
}

/// Parsed SOAP response body
#[derive(Debug, Default)]
struct ParsedResponse {
    objects: Vec<ObjectContent>,
    returnvals: Vec<ManagedRef>,
    token: Option<String>,
}

/// Well-known managed objects from the service content
#[derive(Clone, Debug)]
struct ServiceContent {
    session_manager: String,
    property_collector: String,
    view_manager: String,
    root_folder: String,
}

/// An authenticated session against one vCenter
pub struct VimSession {
    http: reqwest::Client,
    endpoint: String,
    host: String,
    content: ServiceContent,
}

impl VimSession {
    /// Open a session and log in
    pub async fn connect(
        host: &str,
        username: &str,
        password: &str,
        settings: &VimSettings,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!settings.verify_tls)
            .cookie_store(true)
            .timeout(settings.timeout)
            .build()
            .map_err(|e| Error::vcenter(format!("http client for {} failed: {}", host, e)))?;

        let mut session = Self {
            http,
            endpoint: format!("https://{}/sdk", host),
            host: host.to_string(),
            content: ServiceContent {
                session_manager: "SessionManager".to_string(),
                property_collector: "propertyCollector".to_string(),
                view_manager: "ViewManager".to_string(),
                root_folder: "group-d1".to_string(),
            },
        };
        session.content = session.service_content().await?;
        session.login(username, password).await?;
        debug!(host = %session.host, "vcenter session established");
        Ok(session)
    }

    /// One SOAP round trip; returns the raw response body
    async fn call(&self, operation: &str, body: String) -> Result<String> {
        let envelope = format!(
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8"?>"#,
                r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" "#,
                r#"xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" "#,
                r#"xmlns:xsd="http://www.w3.org/2001/XMLSchema" "#,
                r#"xmlns:vim25="urn:vim25">"#,
                r#"<soapenv:Body>{}</soapenv:Body></soapenv:Envelope>"#
            ),
            body
        );

        let response = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", "urn:vim25/6.7")
            .body(envelope)
            .send()
            .await
            .map_err(|e| Error::vcenter(format!("{} against {} failed: {}", operation, self.host, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::vcenter(format!("{} against {} failed: {}", operation, self.host, e)))?;

        if let Some(fault) = parse_fault(&text) {
            return Err(Error::vcenter(format!(
                "{} against {} faulted: {}",
                operation, self.host, fault
            )));
        }
        if !status.is_success() {
            return Err(Error::vcenter(format!(
                "{} against {} returned {}",
                operation, self.host, status
            )));
        }
        Ok(text)
    }

    async fn service_content(&self) -> Result<ServiceContent> {
        let body = r#"<vim25:RetrieveServiceContent><vim25:_this type="ServiceInstance">ServiceInstance</vim25:_this></vim25:RetrieveServiceContent>"#;
        let xml = self.call("RetrieveServiceContent", body.to_string()).await?;
        let fields = extract_elements(
            &xml,
            &["sessionManager", "propertyCollector", "viewManager", "rootFolder"],
        )?;
        let field = |name: &str| -> Result<String> {
            fields
                .get(name)
                .cloned()
                .ok_or_else(|| Error::vcenter(format!("service content misses {}", name)))
        };
        Ok(ServiceContent {
            session_manager: field("sessionManager")?,
            property_collector: field("propertyCollector")?,
            view_manager: field("viewManager")?,
            root_folder: field("rootFolder")?,
        })
    }

    async fn login(&self, username: &str, password: &str) -> Result<()> {
        let body = format!(
            concat!(
                r#"<vim25:Login><vim25:_this type="SessionManager">{}</vim25:_this>"#,
                r#"<vim25:userName>{}</vim25:userName><vim25:password>{}</vim25:password>"#,
                r#"</vim25:Login>"#
            ),
            xml_escape(&self.content.session_manager),
            xml_escape(username),
            xml_escape(password),
        );
        self.call("Login", body).await?;
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        let body = format!(
            r#"<vim25:Logout><vim25:_this type="SessionManager">{}</vim25:_this></vim25:Logout>"#,
            xml_escape(&self.content.session_manager),
        );
        self.call("Logout", body).await?;
        Ok(())
    }

    async fn create_view(&self, object_type: &str) -> Result<ManagedRef> {
        let body = format!(
            concat!(
                r#"<vim25:CreateContainerView><vim25:_this type="ViewManager">{}</vim25:_this>"#,
                r#"<vim25:container type="Folder">{}</vim25:container>"#,
                r#"<vim25:type>{}</vim25:type><vim25:recursive>true</vim25:recursive>"#,
                r#"</vim25:CreateContainerView>"#
            ),
            xml_escape(&self.content.view_manager),
            xml_escape(&self.content.root_folder),
            object_type,
        );
        let xml = self.call("CreateContainerView", body).await?;
        parse_response(&xml)?
            .returnvals
            .into_iter()
            .next()
            .ok_or_else(|| Error::vcenter(format!("no view returned by {}", self.host)))
    }

    async fn destroy_view(&self, view: &ManagedRef) {
        let body = format!(
            r#"<vim25:DestroyView><vim25:_this type="ContainerView">{}</vim25:_this></vim25:DestroyView>"#,
            xml_escape(&view.id),
        );
        if let Err(e) = self.call("DestroyView", body).await {
            debug!(host = %self.host, error = %e, "failed to destroy container view");
        }
    }

    /// Run one property filter to completion, following continuation tokens
    async fn retrieve(&self, filter: String) -> Result<Vec<ObjectContent>> {
        let body = format!(
            concat!(
                r#"<vim25:RetrievePropertiesEx><vim25:_this type="PropertyCollector">{}</vim25:_this>"#,
                r#"{}<vim25:options/></vim25:RetrievePropertiesEx>"#
            ),
            xml_escape(&self.content.property_collector),
            filter,
        );
        let xml = self.call("RetrievePropertiesEx", body).await?;
        let mut parsed = parse_response(&xml)?;
        let mut objects = std::mem::take(&mut parsed.objects);

        while let Some(token) = parsed.token.take() {
            let body = format!(
                concat!(
                    r#"<vim25:ContinueRetrievePropertiesEx><vim25:_this type="PropertyCollector">{}</vim25:_this>"#,
                    r#"<vim25:token>{}</vim25:token></vim25:ContinueRetrievePropertiesEx>"#
                ),
                xml_escape(&self.content.property_collector),
                xml_escape(&token),
            );
            let xml = self.call("ContinueRetrievePropertiesEx", body).await?;
            parsed = parse_response(&xml)?;
            objects.append(&mut parsed.objects);
        }
        Ok(objects)
    }

    /// Retrieve properties of every object inside a container view
    async fn retrieve_view(
        &self,
        view: &ManagedRef,
        object_type: &str,
        paths: &[&str],
    ) -> Result<Vec<ObjectContent>> {
        let mut prop_set = format!("<vim25:type>{}</vim25:type>", object_type);
        for path in paths {
            prop_set.push_str(&format!("<vim25:pathSet>{}</vim25:pathSet>", path));
        }
        let filter = format!(
            concat!(
                r#"<vim25:specSet><vim25:propSet>{}</vim25:propSet>"#,
                r#"<vim25:objectSet><vim25:obj type="ContainerView">{}</vim25:obj>"#,
                r#"<vim25:skip>true</vim25:skip>"#,
                r#"<vim25:selectSet xsi:type="vim25:TraversalSpec">"#,
                r#"<vim25:name>view</vim25:name><vim25:type>ContainerView</vim25:type>"#,
                r#"<vim25:path>view</vim25:path><vim25:skip>false</vim25:skip>"#,
                r#"</vim25:selectSet></vim25:objectSet></vim25:specSet>"#
            ),
            prop_set,
            xml_escape(&view.id),
        );
        self.retrieve(filter).await
    }

    /// Retrieve one property for an explicit set of objects
    async fn retrieve_for(
        &self,
        refs: &BTreeSet<ManagedRef>,
        path: &str,
    ) -> Result<Vec<ObjectContent>> {
        if refs.is_empty() {
            return Ok(Vec::new());
        }
        let types: BTreeSet<&str> = refs.iter().map(|r| r.rtype.as_str()).collect();
        let mut filter = String::from("<vim25:specSet>");
        for rtype in types {
            filter.push_str(&format!(
                "<vim25:propSet><vim25:type>{}</vim25:type><vim25:pathSet>{}</vim25:pathSet></vim25:propSet>",
                rtype, path
            ));
        }
        for reference in refs {
            filter.push_str(&format!(
                r#"<vim25:objectSet><vim25:obj type="{}">{}</vim25:obj></vim25:objectSet>"#,
                xml_escape(&reference.rtype),
                xml_escape(&reference.id),
            ));
        }
        filter.push_str("</vim25:specSet>");
        self.retrieve(filter).await
    }

    /// Resolve the `name` property for a set of objects
    async fn names_of(&self, refs: &BTreeSet<ManagedRef>) -> Result<HashMap<ManagedRef, String>> {
        let objects = self.retrieve_for(refs, "name").await?;
        let mut names = HashMap::new();
        for object in objects {
            if let (Some(obj), Some(PropValue::Text(name))) =
                (object.obj, object.props.get("name").cloned())
            {
                names.insert(obj, name);
            }
        }
        Ok(names)
    }

    /// Resolve the `parent` reference for a set of objects
    async fn parents_of(
        &self,
        refs: &BTreeSet<ManagedRef>,
    ) -> Result<HashMap<ManagedRef, ManagedRef>> {
        let objects = self.retrieve_for(refs, "parent").await?;
        let mut parents = HashMap::new();
        for object in objects {
            if let (Some(obj), Some(PropValue::Ref(parent))) =
                (object.obj, object.props.get("parent").cloned())
            {
                parents.insert(obj, parent);
            }
        }
        Ok(parents)
    }

    /// Map each starting folder to the name of its enclosing datacenter
    async fn datacenter_names(
        &self,
        folders: &BTreeSet<ManagedRef>,
    ) -> Result<HashMap<ManagedRef, String>> {
        let mut ancestor: HashMap<ManagedRef, ManagedRef> = folders
            .iter()
            .map(|folder| (folder.clone(), folder.clone()))
            .collect();

        for _ in 0..MAX_PARENT_HOPS {
            let unresolved: BTreeSet<ManagedRef> = ancestor
                .values()
                .filter(|r| r.rtype != "Datacenter")
                .cloned()
                .collect();
            if unresolved.is_empty() {
                break;
            }
            let parents = self.parents_of(&unresolved).await?;
            if parents.is_empty() {
                break;
            }
            for current in ancestor.values_mut() {
                if current.rtype != "Datacenter" {
                    if let Some(parent) = parents.get(current) {
                        *current = parent.clone();
                    }
                }
            }
        }

        let datacenters: BTreeSet<ManagedRef> = ancestor
            .values()
            .filter(|r| r.rtype == "Datacenter")
            .cloned()
            .collect();
        let names = self.names_of(&datacenters).await?;

        Ok(ancestor
            .into_iter()
            .filter_map(|(folder, datacenter)| {
                names.get(&datacenter).map(|name| (folder, name.clone()))
            })
            .collect())
    }
}

#[async_trait]
impl InventorySource for VimSession {
    async fn clusters(&self) -> Result<Vec<ClusterInventory>> {
        let view = self.create_view("ClusterComputeResource").await?;
        let retrieved = self
            .retrieve_view(&view, "ClusterComputeResource", &["name", "parent", "datastore", "network"])
            .await;
        self.destroy_view(&view).await;
        let objects = retrieved?;

        let mut datastore_refs = BTreeSet::new();
        let mut network_refs = BTreeSet::new();
        let mut folder_refs = BTreeSet::new();
        for object in &objects {
            if let Some(PropValue::Refs(refs)) = object.props.get("datastore") {
                datastore_refs.extend(refs.iter().cloned());
            }
            if let Some(PropValue::Refs(refs)) = object.props.get("network") {
                network_refs.extend(refs.iter().cloned());
            }
            if let Some(PropValue::Ref(parent)) = object.props.get("parent") {
                folder_refs.insert(parent.clone());
            }
        }

        let datastore_names = self.names_of(&datastore_refs).await?;
        let network_names = self.names_of(&network_refs).await?;
        let datacenters = self.datacenter_names(&folder_refs).await?;

        let mut clusters = Vec::new();
        for object in objects {
            let name = match object.props.get("name") {
                Some(PropValue::Text(name)) => name.clone(),
                _ => {
                    warn!(host = %self.host, "cluster without name in inventory, skipping");
                    continue;
                }
            };
            let datacenter = match object.props.get("parent") {
                Some(PropValue::Ref(parent)) => match datacenters.get(parent) {
                    Some(datacenter) => datacenter.clone(),
                    None => {
                        warn!(host = %self.host, cluster = %name, "no datacenter above cluster, skipping");
                        continue;
                    }
                },
                _ => {
                    warn!(host = %self.host, cluster = %name, "cluster without parent, skipping");
                    continue;
                }
            };

            let resolve = |prop: &str, table: &HashMap<ManagedRef, String>| -> Vec<String> {
                match object.props.get(prop) {
                    Some(PropValue::Refs(refs)) => refs
                        .iter()
                        .filter_map(|r| table.get(r).cloned())
                        .collect(),
                    _ => Vec::new(),
                }
            };

            clusters.push(ClusterInventory {
                name,
                datacenter,
                datastores: resolve("datastore", &datastore_names),
                networks: resolve("network", &network_names),
            });
        }
        Ok(clusters)
    }

    async fn disconnect(&self) {
        if let Err(e) = self.logout().await {
            debug!(host = %self.host, error = %e, "logout failed");
        }
    }
}

/// Opens [`VimSession`]s with shared settings
pub struct VimSessionFactory {
    settings: VimSettings,
}

impl VimSessionFactory {
    /// Create a factory with the given settings
    pub fn new(settings: VimSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl SessionFactory for VimSessionFactory {
    async fn connect(
        &self,
        host: &str,
        username: &str,
        password: &str,
    ) -> Result<Arc<dyn InventorySource>> {
        let session = VimSession::connect(host, username, password, &self.settings).await?;
        Ok(Arc::new(session))
    }
}

/// Escape text for inclusion in an XML element or attribute
fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Extract the text of the first occurrence of each named element
fn extract_elements(xml: &str, names: &[&str]) -> Result<HashMap<String, String>> {
    let mut reader = Reader::from_str(xml);
    let mut found = HashMap::new();
    let mut pending: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let local = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if names.contains(&local.as_str()) && !found.contains_key(&local) {
                    pending = Some(local);
                }
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| Error::vcenter(format!("bad xml text: {}", e)))?;
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                if let Some(name) = pending.take() {
                    found.insert(name, text.to_string());
                }
            }
            Ok(Event::End(_)) => {
                pending = None;
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::vcenter(format!("bad xml: {}", e))),
            _ => {}
        }
    }
    Ok(found)
}

/// Extract the SOAP fault string, if the body is a fault
fn parse_fault(xml: &str) -> Option<String> {
    if !xml.contains("Fault") {
        return None;
    }
    extract_elements(xml, &["faultstring"])
        .ok()
        .and_then(|fields| fields.get("faultstring").cloned())
}

/// Parse a property-collector style response body
///
/// Understands three shapes: `ObjectContent` lists (RetrievePropertiesEx
/// and its continuation), bare managed-reference `returnval`s
/// (CreateContainerView), and the continuation `token`.
fn parse_response(xml: &str) -> Result<ParsedResponse> {
    let mut reader = Reader::from_str(xml);
    let mut response = ParsedResponse::default();

    let mut stack: Vec<String> = Vec::new();
    let mut current_object: Option<ObjectContent> = None;
    let mut prop_name: Option<String> = None;
    let mut prop_value: Option<PropValue> = None;
    let mut array_refs: Vec<ManagedRef> = Vec::new();
    let mut pending_type: Option<String> = None;

    // Attribute named `type` (unprefixed) carries the managed object type
    let type_attr = |e: &quick_xml::events::BytesStart<'_>| -> Option<String> {
        e.attributes().flatten().find_map(|attr| {
            if attr.key.as_ref() == b"type" {
                attr.unescape_value()
                    .ok()
                    .map(|value| value.into_owned())
            } else {
                None
            }
        })
    };

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let local = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                match local.as_str() {
                    "objects" => current_object = Some(ObjectContent::default()),
                    "propSet" => {
                        prop_name = None;
                        prop_value = None;
                        array_refs.clear();
                    }
                    "obj" | "returnval" | "val" | "ManagedObjectReference" => {
                        pending_type = type_attr(&e);
                    }
                    _ => {}
                }
                stack.push(local);
            }
            Ok(Event::Text(t)) => {
                let unescaped = t
                    .unescape()
                    .map_err(|e| Error::vcenter(format!("bad xml text: {}", e)))?;
                let text = unescaped.trim().to_string();
                if text.is_empty() {
                    continue;
                }
                match stack.last().map(String::as_str) {
                    Some("obj") => {
                        if let (Some(object), Some(rtype)) =
                            (current_object.as_mut(), pending_type.take())
                        {
                            object.obj = Some(ManagedRef { rtype, id: text });
                        }
                    }
                    Some("returnval") => {
                        if let Some(rtype) = pending_type.take() {
                            response.returnvals.push(ManagedRef { rtype, id: text });
                        }
                    }
                    Some("name") if stack.iter().rev().nth(1).map(String::as_str) == Some("propSet") => {
                        prop_name = Some(text);
                    }
                    Some("val") => {
                        prop_value = Some(match pending_type.take() {
                            Some(rtype) => PropValue::Ref(ManagedRef { rtype, id: text }),
                            None => PropValue::Text(text),
                        });
                    }
                    Some("ManagedObjectReference") => {
                        if let Some(rtype) = pending_type.take() {
                            array_refs.push(ManagedRef { rtype, id: text });
                        }
                    }
                    Some("token") => {
                        response.token = Some(text);
                    }
                    _ => {}
                }
            }
            Ok(Event::End(_)) => {
                match stack.pop().as_deref() {
                    Some("val") => {
                        if !array_refs.is_empty() {
                            prop_value = Some(PropValue::Refs(std::mem::take(&mut array_refs)));
                        }
                    }
                    Some("propSet") => {
                        if let (Some(object), Some(name), Some(value)) =
                            (current_object.as_mut(), prop_name.take(), prop_value.take())
                        {
                            object.props.insert(name, value);
                        }
                    }
                    Some("objects") => {
                        if let Some(object) = current_object.take() {
                            response.objects.push(object);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::vcenter(format!("bad xml: {}", e))),
            _ => {}
        }
    }
    Ok(response)
}

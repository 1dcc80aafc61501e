//! The resource catalog: which classes a collection run fetches, and how each is keyed
//!
//! A [`Catalog`] is plain data. The only behavior here is the derivation of defaults (output
//! prefix, extraction rule) and a consistency check on output prefixes.

use std::{borrow::Cow, collections::HashMap, fmt::Write};

use aci_client::QueryParam;

use crate::{extract::ExtractionRule, finalize::METADATA_KEY};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "output prefix '{prefix}' is used by both '{first_class}' and '{second_class}', \
        their records would overwrite each other"
    )]
    DuplicatePrefix {
        prefix: String,
        first_class: String,
        second_class: String,
    },

    #[error("output prefix '{prefix}' of '{class}' is reserved for the snapshot metadata")]
    ReservedPrefix { prefix: String, class: String },

    #[error(
        "output prefix '{prefix}' of '{class}' contains ':', its keys could \
        collide with the records of another prefix"
    )]
    SeparatorInPrefix { prefix: String, class: String },
}

/// Separates the output prefix from the distinguished name in a persisted key
pub const KEY_SEPARATOR: char = ':';

/// What a descriptor's response contains
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordKind {
    /// Any number of objects, each identified by its distinguished name
    #[default]
    List,
    /// A single `moCount` object, which carries no distinguished name
    Count,
}

/// A single entry in the [`Catalog`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    resource_class: String,
    output_prefix: Option<String>,
    query_modifiers: Vec<QueryParam>,
    extraction_rule: Option<ExtractionRule>,
    optional: bool,
    kind: RecordKind,
}

impl ResourceDescriptor {
    /// Fetch every object of `resource_class`, keyed under the class name
    pub fn new(resource_class: impl Into<String>) -> Self {
        Self {
            resource_class: resource_class.into(),
            output_prefix: None,
            query_modifiers: Vec::new(),
            extraction_rule: None,
            optional: false,
            kind: RecordKind::List,
        }
    }

    /// Key records under `prefix` instead of the class name
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.output_prefix = Some(prefix.into());
        self
    }

    /// Append a query parameter to the request
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_modifiers.push(QueryParam::new(key, value));
        self
    }

    /// Select records with `rule` instead of the class default
    pub fn with_rule(mut self, rule: ExtractionRule) -> Self {
        self.extraction_rule = Some(rule);
        self
    }

    /// Tolerate a failed fetch of this resource instead of aborting the run
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Only fetch the number of objects of this class
    ///
    /// The APIC answers with a single `moCount` object, which is stored under the output prefix
    /// alone.
    pub fn count_only(mut self) -> Self {
        self.kind = RecordKind::Count;
        self.extraction_rule = Some(ExtractionRule::class_attributes("moCount"));
        self.with_query("rsp-subtree-include", "count")
    }

    pub fn resource_class(&self) -> &str {
        &self.resource_class
    }

    /// The namespace of the keys this descriptor's records are stored under
    pub fn output_prefix(&self) -> &str {
        self.output_prefix.as_deref().unwrap_or(&self.resource_class)
    }

    pub fn query_modifiers(&self) -> &[QueryParam] {
        &self.query_modifiers
    }

    /// The explicitly configured extraction rule, see [`effective_rule`] for the one in use
    pub fn extraction_rule(&self) -> Option<&ExtractionRule> {
        self.extraction_rule.as_ref()
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }
}

/// The rule used to extract records for `descriptor`: its own, or the default for its class
pub fn effective_rule(descriptor: &ResourceDescriptor) -> Cow<'_, ExtractionRule> {
    match descriptor.extraction_rule() {
        Some(rule) => Cow::Borrowed(rule),
        None => Cow::Owned(default_rule_for(descriptor.resource_class())),
    }
}

/// Select the attributes of every top-level object of `resource_class`
pub fn default_rule_for(resource_class: &str) -> ExtractionRule {
    ExtractionRule::class_attributes(resource_class)
}

/// An ordered list of [`ResourceDescriptor`]s
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    descriptors: Vec<ResourceDescriptor>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, descriptor: ResourceDescriptor) {
        self.descriptors.push(descriptor);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Check that every descriptor's keys are unique across the snapshot
    ///
    /// Output prefixes must be distinct, must not be the metadata key and must not contain
    /// [`KEY_SEPARATOR`].
    pub fn validate(&self) -> Result<(), Error> {
        let mut seen: HashMap<&str, &str> = HashMap::with_capacity(self.len());
        for d in self.iter() {
            let prefix = d.output_prefix();
            if prefix == METADATA_KEY {
                return Err(Error::ReservedPrefix {
                    prefix: prefix.to_owned(),
                    class: d.resource_class().to_owned(),
                });
            }
            if prefix.contains(KEY_SEPARATOR) {
                return Err(Error::SeparatorInPrefix {
                    prefix: prefix.to_owned(),
                    class: d.resource_class().to_owned(),
                });
            }
            if let Some(first_class) = seen.insert(d.output_prefix(), d.resource_class()) {
                return Err(Error::DuplicatePrefix {
                    prefix: d.output_prefix().to_owned(),
                    first_class: first_class.to_owned(),
                    second_class: d.resource_class().to_owned(),
                });
            }
        }
        Ok(())
    }

    /// The built-in catalog collected from an ACI fabric
    pub fn aci_default() -> Self {
        [
            // Infrastructure
            ResourceDescriptor::new("topSystem"),
            ResourceDescriptor::new("eqptBoard"),
            ResourceDescriptor::new("fabricNode"),
            ResourceDescriptor::new("fabricSetupP"),
            // Fabric-wide settings
            ResourceDescriptor::new("epLoopProtectP"),
            ResourceDescriptor::new("epControlP"),
            ResourceDescriptor::new("epIpAgingP"),
            ResourceDescriptor::new("infraSetPol"),
            ResourceDescriptor::new("infraPortTrackPol"),
            ResourceDescriptor::new("coopPol"),
            // Tenants
            ResourceDescriptor::new("fvAEPg"),
            ResourceDescriptor::new("fvRsBd"),
            ResourceDescriptor::new("fvBD"),
            ResourceDescriptor::new("fvCtx"),
            ResourceDescriptor::new("fvTenant"),
            ResourceDescriptor::new("fvSubnet"),
            // Contracts
            ResourceDescriptor::new("vzBrCP"),
            ResourceDescriptor::new("vzFilter"),
            ResourceDescriptor::new("vzSubj"),
            ResourceDescriptor::new("vzRsSubjFiltAtt"),
            ResourceDescriptor::new("fvRsProv"),
            ResourceDescriptor::new("fvRsCons"),
            // L3outs
            ResourceDescriptor::new("l3extOut"),
            ResourceDescriptor::new("l3extLNodeP"),
            ResourceDescriptor::new("l3extRsNodeL3OutAtt"),
            ResourceDescriptor::new("l3extLIfP"),
            ResourceDescriptor::new("l3extInstP"),
            // Fabric policies
            ResourceDescriptor::new("isisDomPol"),
            ResourceDescriptor::new("bgpRRNodePEp"),
            ResourceDescriptor::new("l3IfPol"),
            ResourceDescriptor::new("fabricNodeControl"),
            ResourceDescriptor::new("fabricRsNodeCtrl"),
            ResourceDescriptor::new("fabricRsLeNodePGrp"),
            ResourceDescriptor::new("fabricNodeBlk"),
            // Fabric access: MCP
            ResourceDescriptor::new("mcpIfPol"),
            ResourceDescriptor::new("infraRsMcpIfPol"),
            ResourceDescriptor::new("infraRsAccBaseGrp"),
            ResourceDescriptor::new("infraRsAccPortP"),
            ResourceDescriptor::new("mcpInstPol"),
            // Fabric access: AEPs, domains and VLAN pools
            ResourceDescriptor::new("infraAttEntityP"),
            ResourceDescriptor::new("infraRsDomP"),
            ResourceDescriptor::new("infraRsVlanNs"),
            ResourceDescriptor::new("fvnsEncapBlk"),
            // Admin
            ResourceDescriptor::new("firmwareRunning"),
            ResourceDescriptor::new("firmwareCtrlrRunning"),
            ResourceDescriptor::new("pkiExportEncryptionKey"),
            // Live state
            ResourceDescriptor::new("faultInst"),
            ResourceDescriptor::new("fvcapRule"),
            ResourceDescriptor::new("fvCEp").count_only(),
            ResourceDescriptor::new("fvIp").count_only(),
            ResourceDescriptor::new("vnsCDev").count_only(),
            ResourceDescriptor::new("vnsGraphInst").count_only(),
            ResourceDescriptor::new("ctxClassCnt")
                .with_query("rsp-subtree-class", "l2BD,fvEpP,l3Dom"),
            // Fabric health
            ResourceDescriptor::new("fabricHealthTotal"),
            ResourceDescriptor::new("topSystem")
                .with_query("rsp-subtree-include", "health,no-scoped")
                .with_prefix("healthInst")
                .with_rule(ExtractionRule::class_attributes("healthInst")),
            // Switch capacity
            ResourceDescriptor::new("eqptcapacityVlanUsage5min"),
            ResourceDescriptor::new("eqptcapacityPolUsage5min"),
            ResourceDescriptor::new("eqptcapacityL2Usage5min"),
            ResourceDescriptor::new("eqptcapacityL2RemoteUsage5min"),
            ResourceDescriptor::new("eqptcapacityL2TotalUsage5min"),
            ResourceDescriptor::new("eqptcapacityL3Usage5min"),
            ResourceDescriptor::new("eqptcapacityL3UsageCap5min"),
            ResourceDescriptor::new("eqptcapacityL3RemoteUsage5min"),
            ResourceDescriptor::new("eqptcapacityL3RemoteUsageCap5min"),
            ResourceDescriptor::new("eqptcapacityL3TotalUsage5min"),
            ResourceDescriptor::new("eqptcapacityL3TotalUsageCap5min"),
            ResourceDescriptor::new("eqptcapacityMcastUsage5min"),
        ]
        .into_iter()
        .collect()
    }
}

impl FromIterator<ResourceDescriptor> for Catalog {
    fn from_iter<I: IntoIterator<Item = ResourceDescriptor>>(iter: I) -> Self {
        Self {
            descriptors: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Catalog {
    type Item = &'a ResourceDescriptor;
    type IntoIter = std::slice::Iter<'a, ResourceDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.descriptors.iter()
    }
}

/// Render the catalog as a shell script of `icurl` commands
///
/// `icurl` is available in the APIC shell and talks to the local API without a login, so the
/// script can be run on the controller itself when the collector cannot reach it over the
/// network. Each command writes the raw response to `<prefix>.json`.
pub fn icurl_script(catalog: &Catalog, host: &str) -> String {
    let mut script = String::from("#!/bin/sh\n");
    for d in catalog {
        let _ = write!(
            script,
            "icurl -kG https://{host}/api/class/{}.json",
            d.resource_class()
        );
        for q in d.query_modifiers() {
            let _ = write!(script, " -d '{q}'");
        }
        let _ = writeln!(script, " > '{}.json'", d.output_prefix());
    }
    script
}

use std::collections::BTreeMap;

/// External-id key naming the owner type of a row.
pub const OWNER_TYPE_KEY: &str = "k8s.ovn.org/owner-type";

/// External-id key naming the controller that owns a row.
pub const OWNER_CONTROLLER_KEY: &str = "k8s.ovn.org/owner-controller";

/// External-id key holding the row's primary key.
pub const PRIMARY_ID_KEY: &str = "k8s.ovn.org/id";

/// The kinds of northbound rows that carry object ids.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    AddressSet,
    Acl,
}

/// Identifies which controller feature owns a row and, with it, which object-id keys the row
/// carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdsType {
    /// The address set holding the IPs of every pod in a namespace.
    AddressSetNamespace,

    /// The address set holding the resolved IPs of a DNS name used by egress firewalls.
    AddressSetEgressFirewallDns,

    /// An egress firewall rule's ACL.
    AclEgressFirewall,

    /// A namespace's multicast allow ACLs.
    AclMulticastNamespace,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectIdKey {
    ObjectName,
    Priority,
    PolicyDirection,
}

/// A deterministic descriptor of a northbound row's identity.
///
/// Two descriptors built from the same logical inputs always render the same primary key and the
/// same external ids, which is what lets reconciliation compare desired and existing rows by
/// identifier alone.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DbObjectIds {
    ids_type: IdsType,
    owner_controller: String,
    object_ids: BTreeMap<ObjectIdKey, String>,
}

// === impl IdsType ===

impl IdsType {
    const ALL: [IdsType; 4] = [
        Self::AddressSetNamespace,
        Self::AddressSetEgressFirewallDns,
        Self::AclEgressFirewall,
        Self::AclMulticastNamespace,
    ];

    pub fn object_kind(&self) -> ObjectKind {
        match self {
            Self::AddressSetNamespace | Self::AddressSetEgressFirewallDns => ObjectKind::AddressSet,
            Self::AclEgressFirewall | Self::AclMulticastNamespace => ObjectKind::Acl,
        }
    }

    pub fn owner_type(&self) -> &'static str {
        match self {
            Self::AddressSetNamespace => "Namespace",
            Self::AddressSetEgressFirewallDns => "EgressFirewallDNS",
            Self::AclEgressFirewall => "EgressFirewall",
            Self::AclMulticastNamespace => "MulticastNS",
        }
    }

    /// The object-id keys every row of this type must carry, in primary-key order.
    fn keys(&self) -> &'static [ObjectIdKey] {
        match self {
            Self::AddressSetNamespace | Self::AddressSetEgressFirewallDns => {
                &[ObjectIdKey::ObjectName]
            }
            Self::AclEgressFirewall => &[ObjectIdKey::ObjectName, ObjectIdKey::Priority],
            Self::AclMulticastNamespace => &[ObjectIdKey::ObjectName, ObjectIdKey::PolicyDirection],
        }
    }

    fn from_owner_type(kind: ObjectKind, owner_type: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.object_kind() == kind && t.owner_type() == owner_type)
    }
}

// === impl ObjectIdKey ===

impl ObjectIdKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ObjectName => "k8s.ovn.org/name",
            Self::Priority => "k8s.ovn.org/priority",
            Self::PolicyDirection => "direction",
        }
    }
}

// === impl DbObjectIds ===

impl DbObjectIds {
    pub fn new(ids_type: IdsType, owner_controller: impl Into<String>) -> Self {
        Self {
            ids_type,
            owner_controller: owner_controller.into(),
            object_ids: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: ObjectIdKey, value: impl ToString) -> Self {
        self.object_ids.insert(key, value.to_string());
        self
    }

    pub fn ids_type(&self) -> IdsType {
        self.ids_type
    }

    pub fn owner_controller(&self) -> &str {
        &self.owner_controller
    }

    pub fn get(&self, key: ObjectIdKey) -> Option<&str> {
        self.object_ids.get(&key).map(String::as_str)
    }

    /// Returns true if the row is owned by the given feature of the given controller.
    pub fn is_owned_by(&self, ids_type: IdsType, owner_controller: &str) -> bool {
        self.ids_type == ids_type && self.owner_controller == owner_controller
    }

    /// Renders `<controller>:<owner-type>:<id>...` with ids in key order.
    pub fn primary_key(&self) -> String {
        let mut key = format!("{}:{}", self.owner_controller, self.ids_type.owner_type());
        for k in self.ids_type.keys() {
            key.push(':');
            key.push_str(self.get(*k).unwrap_or_default());
        }
        key
    }

    pub fn external_ids(&self) -> BTreeMap<String, String> {
        let mut ids = self
            .object_ids
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.clone()))
            .collect::<BTreeMap<_, _>>();
        ids.insert(
            OWNER_TYPE_KEY.to_string(),
            self.ids_type.owner_type().to_string(),
        );
        ids.insert(
            OWNER_CONTROLLER_KEY.to_string(),
            self.owner_controller.clone(),
        );
        ids.insert(PRIMARY_ID_KEY.to_string(), self.primary_key());
        ids
    }

    /// Recovers the descriptor of a row from its external ids.
    ///
    /// Returns `None` for rows that were not written by this controller or that lack one of the
    /// keys their owner type requires.
    pub fn from_external_ids(kind: ObjectKind, ext: &BTreeMap<String, String>) -> Option<Self> {
        let ids_type = IdsType::from_owner_type(kind, ext.get(OWNER_TYPE_KEY)?)?;
        let owner_controller = ext.get(OWNER_CONTROLLER_KEY)?.clone();
        let mut object_ids = BTreeMap::new();
        for key in ids_type.keys() {
            object_ids.insert(*key, ext.get(key.as_str())?.clone());
        }
        Some(Self {
            ids_type,
            owner_controller,
            object_ids,
        })
    }

    /// The base from which address set row names are hashed.
    ///
    /// Namespace address sets keep the bare namespace name so that existing deployments continue
    /// to reference the same rows; other owners are qualified by their owner type.
    pub(crate) fn address_set_base_name(&self) -> String {
        let name = self.get(ObjectIdKey::ObjectName).unwrap_or_default();
        match self.ids_type {
            IdsType::AddressSetNamespace => name.to_string(),
            t => format!("{}_{}", t.owner_type(), name),
        }
    }
}

use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

use kubernetes::DynamicObject;

/// Identifies "the same resource" independently of its mutable body.
///
/// Two identities are equal iff kind, apiVersion, namespace and name (or
/// generateName, when no name is set) are equal. Resource version, uid,
/// spec and status never participate.
#[derive(Clone, Debug)]
pub struct ResourceIdentity {
    pub kind: String,
    pub api_version: String,
    pub name: Option<String>,
    pub generate_name: Option<String>,
    pub namespace: Option<String>,
}

impl ResourceIdentity {
    pub fn of(resource: &DynamicObject) -> Self {
        ResourceIdentity {
            kind: resource.kind.clone(),
            api_version: resource.api_version.clone(),
            name: resource.metadata.name.clone(),
            generate_name: resource.metadata.generate_name.clone(),
            namespace: resource.metadata.namespace.clone(),
        }
    }

    /// The name, or the generateName prefix when the name is not set yet.
    #[inline]
    pub fn handle(&self) -> Option<&str> {
        self.name.as_deref().or(self.generate_name.as_deref())
    }

    #[inline]
    pub fn has_name(&self) -> bool {
        self.handle().is_some()
    }

    /// Whether `resource` carries this identity.
    pub fn is_same(&self, resource: &DynamicObject) -> bool {
        *self == ResourceIdentity::of(resource)
    }

    /// Whether `resource` is of the same kind and api version.
    pub fn is_same_kind(&self, resource: &DynamicObject) -> bool {
        self.kind == resource.kind && self.api_version == resource.api_version
    }
}

/// Whether `a` and `b` denote the same resource, see [`ResourceIdentity`].
pub fn same_resource(a: &DynamicObject, b: &DynamicObject) -> bool {
    ResourceIdentity::of(a) == ResourceIdentity::of(b)
}

impl PartialEq for ResourceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.api_version == other.api_version
            && self.namespace == other.namespace
            && self.handle() == other.handle()
    }
}

impl Eq for ResourceIdentity {}

impl Hash for ResourceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.api_version.hash(state);
        self.namespace.hash(state);
        self.handle().hash(state);
    }
}

impl Display for ResourceIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ", self.kind)?;
        if let Some(namespace) = &self.namespace {
            write!(f, "{namespace}/")?;
        }

        match (&self.name, &self.generate_name) {
            (Some(name), _) => write!(f, "{name}")?,
            (None, Some(prefix)) => write!(f, "{prefix}*")?,
            (None, None) => f.write_str("<unnamed>")?,
        }

        write!(f, " ({})", self.api_version)
    }
}

//! Connectors: named dependencies on other modules' capabilities.
//!
//! Matching connectors to providers is the host registry's job. The registry
//! hands each module a [`ConnectorBinding`] per connector and keeps a clone
//! of it; rebinding through that clone is visible to the module on its next
//! accessor call. Targets are held weakly, so a connector never keeps the
//! module on the other end alive.
//!
//! ```rust,ignore
//! let meter: Arc<dyn PowerMeter> = Arc::new(Newport1830C::new());
//! let binding = ConnectorBinding::bound(ConnectorTarget::new("newport", "power_meter", &meter));
//! // later, from the registry:
//! binding.bind(ConnectorTarget::new("thorlabs", "power_meter", &other_meter));
//! ```

use crate::error::{AppResult, ModuleError};
use parking_lot::RwLock;
use std::any::{type_name, Any};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Declaration of a connector on a module type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorSpec {
    name: &'static str,
    capability: &'static str,
    optional: bool,
}

impl ConnectorSpec {
    /// Required connector.
    pub fn new(name: &'static str, capability: &'static str) -> Self {
        Self {
            name,
            capability,
            optional: false,
        }
    }

    /// Connector that may stay unbound.
    pub fn optional(name: &'static str, capability: &'static str) -> Self {
        Self {
            optional: true,
            ..Self::new(name, capability)
        }
    }

    /// Connector name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Capability the connected module must provide.
    pub fn capability(&self) -> &'static str {
        self.capability
    }

    /// Whether the connector may stay unbound.
    pub fn is_optional(&self) -> bool {
        self.optional
    }
}

/// A resolved connector target: a weak reference to another module's capability.
#[derive(Clone)]
pub struct ConnectorTarget {
    module: String,
    capability: String,
    // Holds a `Weak<T>` for the `T` given to `new`.
    object: Arc<dyn Any + Send + Sync>,
}

impl fmt::Debug for ConnectorTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorTarget")
            .field("module", &self.module)
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}

impl ConnectorTarget {
    /// Wrap a provider. `T` is usually a trait object such as `dyn PowerMeter`.
    pub fn new<T>(module: impl Into<String>, capability: impl Into<String>, target: &Arc<T>) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        Self {
            module: module.into(),
            capability: capability.into(),
            object: Arc::new(Arc::downgrade(target)),
        }
    }

    /// Name of the providing module.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Capability the provider exposes.
    pub fn capability(&self) -> &str {
        &self.capability
    }

    /// Upgrade to a strong reference of type `T`.
    ///
    /// `Err(true)` if the provider was dropped, `Err(false)` if `T` is wrong.
    fn upgrade<T>(&self) -> Result<Arc<T>, bool>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let weak = self.object.downcast_ref::<Weak<T>>().ok_or(false)?;
        weak.upgrade().ok_or(true)
    }
}

/// Shared, rebindable connector slot.
///
/// The registry and the module hold clones of the same binding.
#[derive(Clone, Default)]
pub struct ConnectorBinding {
    slot: Arc<RwLock<Option<ConnectorTarget>>>,
}

impl fmt::Debug for ConnectorBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorBinding")
            .field("target", &*self.slot.read())
            .finish()
    }
}

impl ConnectorBinding {
    /// Empty binding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binding that already holds a target.
    pub fn bound(target: ConnectorTarget) -> Self {
        let binding = Self::new();
        binding.bind(target);
        binding
    }

    /// Replace the target. Visible to every clone immediately.
    pub fn bind(&self, target: ConnectorTarget) {
        *self.slot.write() = Some(target);
    }

    /// Clear the target.
    pub fn unbind(&self) {
        *self.slot.write() = None;
    }

    /// Snapshot of the current target.
    pub fn target(&self) -> Option<ConnectorTarget> {
        self.slot.read().clone()
    }

    /// Whether a target is set.
    pub fn is_bound(&self) -> bool {
        self.slot.read().is_some()
    }
}

/// Connectors of one module instance, keyed by connector name.
#[derive(Debug, Clone, Default)]
pub struct Connectors {
    module: String,
    bindings: BTreeMap<&'static str, (ConnectorSpec, ConnectorBinding)>,
}

impl Connectors {
    /// Resolve every declared connector against the registry's bindings.
    ///
    /// Required connectors must be bound and every bound target must expose
    /// the declared capability. Bindings for undeclared names are ignored.
    pub(crate) fn bind(
        module: &str,
        declared: &[ConnectorSpec],
        connections: &BTreeMap<String, ConnectorBinding>,
    ) -> AppResult<Self> {
        let mut bindings = BTreeMap::new();
        for spec in declared {
            let binding = connections.get(spec.name()).cloned().unwrap_or_default();
            match binding.target() {
                Some(target) if target.capability() != spec.capability() => {
                    return Err(ModuleError::CapabilityMismatch {
                        module: module.to_string(),
                        connector: spec.name().to_string(),
                        expected: spec.capability().to_string(),
                        target: target.module().to_string(),
                        found: target.capability().to_string(),
                    });
                }
                Some(target) => {
                    debug!(module, connector = spec.name(), target = target.module(), "Connector bound");
                }
                None if spec.is_optional() => {
                    debug!(module, connector = spec.name(), "Optional connector left unbound");
                }
                None => {
                    return Err(ModuleError::UnresolvedConnector {
                        module: module.to_string(),
                        connector: spec.name().to_string(),
                        capability: spec.capability().to_string(),
                    });
                }
            }
            bindings.insert(spec.name(), (spec.clone(), binding));
        }

        for name in connections.keys() {
            if !bindings.contains_key(name.as_str()) {
                debug!(module, connector = %name, "Ignoring binding for undeclared connector");
            }
        }

        Ok(Self {
            module: module.to_string(),
            bindings,
        })
    }

    /// Live target of a connector, as `Arc<T>`.
    pub fn get<T>(&self, name: &str) -> AppResult<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let (_, binding) = self
            .bindings
            .get(name)
            .ok_or_else(|| ModuleError::UnknownConnector {
                module: self.module.clone(),
                connector: name.to_string(),
            })?;

        let unavailable = || ModuleError::ConnectorUnavailable {
            module: self.module.clone(),
            connector: name.to_string(),
        };

        let target = binding.target().ok_or_else(unavailable)?;
        target.upgrade::<T>().map_err(|dropped| {
            if dropped {
                unavailable()
            } else {
                ModuleError::ConnectorType {
                    module: self.module.clone(),
                    connector: name.to_string(),
                    requested: type_name::<T>(),
                }
            }
        })
    }

    /// Whether a connector currently has a live target.
    pub fn is_connected(&self, name: &str) -> bool {
        self.bindings
            .get(name)
            .and_then(|(_, binding)| binding.target())
            .is_some()
    }

    /// Declared connectors in name order.
    pub fn specs(&self) -> impl Iterator<Item = &ConnectorSpec> {
        self.bindings.values().map(|(spec, _)| spec)
    }
}

//! Status variables: module state that survives deactivate -> activate.
//!
//! A status variable ties a name in the [`StatusStore`] to a typed field of
//! the module struct through a field projection. On activation the stored
//! value (or the default) goes through the optional constructor into the
//! field; on deactivation the field goes through the optional representer
//! back into the store.
//!
//! ```rust,ignore
//! StatusVar::new("count", json!(0), |m: &mut Counter| &mut m.count)
//! StatusVar::new("window", json!(null), |m: &mut Viewer| &mut m.geometry)
//!     .with_representer(|_ctx, g: &Geometry| Ok(json!(g.to_hex())))
//!     .with_constructor(|_ctx, v| Geometry::from_hex(v.as_str().unwrap_or("")))
//! ```

use crate::error::{json_type_name, AppResult, ModuleError};
use crate::module::ModuleContext;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::error;

type Restore<M> = Arc<dyn Fn(&mut M, &ModuleContext, Value) -> anyhow::Result<()> + Send + Sync>;
type Represent<M> = Arc<dyn Fn(&mut M, &ModuleContext) -> anyhow::Result<Value> + Send + Sync>;

/// Declaration of one status variable of module type `M`.
pub struct StatusVar<M> {
    name: &'static str,
    default: Value,
    restore: Restore<M>,
    represent: Represent<M>,
}

impl<M> Clone for StatusVar<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            default: self.default.clone(),
            restore: Arc::clone(&self.restore),
            represent: Arc::clone(&self.represent),
        }
    }
}

impl<M> fmt::Debug for StatusVar<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusVar")
            .field("name", &self.name)
            .field("default", &self.default)
            .finish_non_exhaustive()
    }
}

impl<M: 'static> StatusVar<M> {
    /// Declare a status variable stored under `name` and bound to `field`.
    ///
    /// Without a constructor or representer the field is (de)serialized with serde.
    pub fn new<T>(name: &'static str, default: Value, field: fn(&mut M) -> &mut T) -> TypedStatusVar<M, T>
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        TypedStatusVar {
            name,
            default,
            field,
            constructor: None,
            representer: None,
        }
    }

    /// Name in the status store.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Value used when the store has no entry.
    pub fn default_value(&self) -> &Value {
        &self.default
    }

    /// Restore the field from the store (or the default).
    pub(crate) fn restore(&self, module: &mut M, ctx: &ModuleContext, store: &StatusStore) -> anyhow::Result<()> {
        let value = store
            .get(self.name)
            .cloned()
            .unwrap_or_else(|| self.default.clone());
        (self.restore)(module, ctx, value)
    }

    /// Representation of the current field value.
    pub(crate) fn represent(&self, module: &mut M, ctx: &ModuleContext) -> anyhow::Result<Value> {
        (self.represent)(module, ctx)
    }
}

/// Constructor callback: stored value -> field value.
pub type VarConstructor<T> = Arc<dyn Fn(&ModuleContext, Value) -> anyhow::Result<T> + Send + Sync>;

/// Representer callback: field value -> stored value.
pub type VarRepresenter<T> = Arc<dyn Fn(&ModuleContext, &T) -> anyhow::Result<Value> + Send + Sync>;

/// A status variable declaration that still knows its field type.
///
/// Converted into [`StatusVar`] when added to a schema.
pub struct TypedStatusVar<M, T> {
    name: &'static str,
    default: Value,
    field: fn(&mut M) -> &mut T,
    constructor: Option<VarConstructor<T>>,
    representer: Option<VarRepresenter<T>>,
}

impl<M, T> TypedStatusVar<M, T> {
    /// Convert the stored value into the field value.
    pub fn with_constructor<F>(mut self, constructor: F) -> Self
    where
        F: Fn(&ModuleContext, Value) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.constructor = Some(Arc::new(constructor));
        self
    }

    /// Convert the field value into the stored value.
    pub fn with_representer<F>(mut self, representer: F) -> Self
    where
        F: Fn(&ModuleContext, &T) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.representer = Some(Arc::new(representer));
        self
    }
}

impl<M, T> From<TypedStatusVar<M, T>> for StatusVar<M>
where
    M: 'static,
    T: Serialize + DeserializeOwned + 'static,
{
    fn from(var: TypedStatusVar<M, T>) -> Self {
        let field = var.field;
        let constructor = var.constructor;
        let representer = var.representer;

        let restore: Restore<M> = Arc::new(move |module: &mut M, ctx: &ModuleContext, value: Value| {
            let typed = match &constructor {
                Some(constructor) => constructor(ctx, value)?,
                None => serde_json::from_value(value)?,
            };
            *field(module) = typed;
            Ok(())
        });

        let represent: Represent<M> = Arc::new(move |module: &mut M, ctx: &ModuleContext| {
            let current = field(module);
            match &representer {
                Some(representer) => representer(ctx, &*current),
                None => Ok(serde_json::to_value(&*current)?),
            }
        });

        StatusVar {
            name: var.name,
            default: var.default,
            restore,
            represent,
        }
    }
}

/// Persisted status of one module instance: an ordered name -> value mapping.
///
/// Owned by exactly one instance. Reads hand out deep copies; writes replace
/// the whole mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusStore {
    values: Map<String, Value>,
}

impl StatusStore {
    /// Store seeded with persisted values.
    pub fn new(values: Map<String, Value>) -> Self {
        Self { values }
    }

    /// Stored value for `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Overwrite a single entry.
    pub(crate) fn insert(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_string(), value);
    }

    /// Deep copy of the whole mapping.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.values.clone()
    }

    /// Replace the whole mapping.
    pub fn replace(&mut self, values: Map<String, Value>) {
        self.values = values;
    }

    /// Replace the whole mapping from an untyped value.
    ///
    /// Anything but a JSON object is rejected: the error is logged and the
    /// store keeps its previous content.
    pub fn replace_from_value(&mut self, module: &str, value: Value) -> AppResult<()> {
        match value {
            Value::Object(values) => {
                self.values = values;
                Ok(())
            }
            other => {
                let err = ModuleError::InvalidStatusVariables {
                    module: module.to_string(),
                    found: json_type_name(&other),
                };
                error!(module, "{}", err);
                Err(err)
            }
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

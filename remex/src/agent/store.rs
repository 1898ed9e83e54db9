use crate::value::{Kwargs, Value};
use crate::{log, HashMap};
use color_eyre::eyre::{eyre, Report};
use std::path::Path;
use std::sync::Arc;

/// A callable registered under an identifier. Adapters apply any
/// `Remotable` load/dump transforms on their own arguments and return
/// value.
pub type RegisteredFn =
    Arc<dyn Fn(Kwargs) -> Result<Value, Report> + Send + Sync>;

/// Mapping from function identifiers to callables.
#[derive(Default, Clone)]
pub struct FunctionStore {
    funcs: HashMap<String, RegisteredFn>,
}

impl FunctionStore {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn register<F>(&mut self, identifier: impl Into<String>, func: F)
    where
        F: Fn(Kwargs) -> Result<Value, Report> + Send + Sync + 'static,
    {
        self.register_arc(identifier, Arc::new(func));
    }

    pub fn register_arc(
        &mut self,
        identifier: impl Into<String>,
        func: RegisteredFn,
    ) {
        let identifier = identifier.into();
        log!("[store] registered: {}", identifier);
        self.funcs.insert(identifier, func);
    }

    pub fn lookup(&self, identifier: &str) -> Option<RegisteredFn> {
        self.funcs.get(identifier).cloned()
    }

    pub fn identifiers(&self) -> Vec<String> {
        let mut identifiers: Vec<_> = self.funcs.keys().cloned().collect();
        identifiers.sort();
        identifiers
    }

    pub fn clear(&mut self) {
        self.funcs.clear();
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }
}

/// How an agent turns identifiers into callables.
///
/// `StaticResolver` serves a fixed registry; `DynamicResolver` also loads
/// user code from the agent's root directory on lookup miss.
pub trait Resolver {
    fn resolve(&mut self, identifier: &str) -> Result<RegisteredFn, Report>;

    /// Registered identifiers, without the admin set.
    fn identifiers(&self) -> Vec<String>;

    /// Drops cached code so the next resolution reloads it from disk.
    fn clean_cache(&mut self) -> Result<(), Report>;

    /// Root directory for dynamic loading and directory sync, if any.
    fn root_path(&self) -> Option<&Path> {
        None
    }
}

/// Resolver over a fixed, programmatically registered function set.
#[derive(Default, Clone)]
pub struct StaticResolver {
    store: FunctionStore,
}

impl StaticResolver {
    pub fn new(store: FunctionStore) -> Self {
        Self { store }
    }

    pub fn register<F>(&mut self, identifier: impl Into<String>, func: F)
    where
        F: Fn(Kwargs) -> Result<Value, Report> + Send + Sync + 'static,
    {
        self.store.register(identifier, func);
    }
}

impl Resolver for StaticResolver {
    fn resolve(&mut self, identifier: &str) -> Result<RegisteredFn, Report> {
        self.store
            .lookup(identifier)
            .ok_or_else(|| eyre!("unknown function identifier: {}", identifier))
    }

    fn identifiers(&self) -> Vec<String> {
        self.store.identifiers()
    }

    fn clean_cache(&mut self) -> Result<(), Report> {
        // nothing is loaded from disk, so there is nothing to reload and
        // clearing would lose the registry for good
        Err(eyre!("static agent has no module cache"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let mut resolver = StaticResolver::default();
        resolver.register("tasks:double", |kwargs| {
            let x: i64 = kwargs.get("x")?;
            Ok(Value::Int(x * 2))
        });

        let func = resolver.resolve("tasks:double").unwrap();
        let mut kwargs = Kwargs::new();
        kwargs.insert("x", 21i64);
        assert_eq!(func(kwargs).unwrap(), Value::Int(42));

        assert!(resolver.resolve("tasks:missing").is_err());
        assert_eq!(resolver.identifiers(), vec!["tasks:double".to_string()]);
    }

    #[test]
    fn static_resolver_has_no_cache() {
        let mut resolver = StaticResolver::default();
        resolver.register("tasks:noop", |_| Ok(Value::Null));
        assert!(resolver.clean_cache().is_err());
        // the registry is untouched
        assert!(resolver.resolve("tasks:noop").is_ok());
    }
}

//! Identifier resolution backed by loadable modules.
//!
//! A dynamic agent roots at a directory kept in step with the driver by the
//! sync protocol. An identifier `"<module>:<name>"` that misses the
//! function store is resolved by loading the shared library
//! `<root>/<prefix><module><suffix>` (platform naming) and binding the
//! exported symbol `<name>` (dots in qualified names map to underscores).
//!
//! The plugin ABI is byte-oriented so modules can be built by any
//! toolchain: the symbol receives bincode-encoded kwargs and hands back an
//! owned buffer holding a bincode-encoded `Value` (status 0) or a UTF-8
//! error message (nonzero status). Each module must also export
//! `remex_dealloc` to release buffers it allocated.

use super::store::{FunctionStore, RegisteredFn, Resolver};
use crate::value::Kwargs;
use crate::{log, HashMap};
use color_eyre::eyre::{eyre, Report, WrapErr};
use libloading::Library;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Signature of an exported plugin function.
pub type RawPluginFn = unsafe extern "C" fn(
    args_ptr: *const u8,
    args_len: usize,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32;

/// Signature of the buffer-release hook every module exports.
pub type RawDeallocFn = unsafe extern "C" fn(ptr: *mut u8, len: usize);

const DEALLOC_SYMBOL: &[u8] = b"remex_dealloc";

struct LoadedModule {
    library: Library,
    dealloc: RawDeallocFn,
}

/// Resolver that loads user modules from a root directory on demand.
pub struct DynamicResolver {
    root: PathBuf,
    /// programmatic registrations; survive cache cleans
    builtins: FunctionStore,
    /// callables bound from loaded modules
    store: FunctionStore,
    modules: HashMap<String, Arc<LoadedModule>>,
}

impl DynamicResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            builtins: FunctionStore::new(),
            store: FunctionStore::new(),
            modules: HashMap::new(),
        }
    }

    /// Registers a callable that wins over dynamic loading and, like the
    /// admin set, survives `clean_cache`.
    pub fn register<F>(&mut self, identifier: impl Into<String>, func: F)
    where
        F: Fn(Kwargs) -> Result<crate::value::Value, Report>
            + Send
            + Sync
            + 'static,
    {
        self.builtins.register(identifier, func);
    }

    fn module_path(&self, module: &str) -> PathBuf {
        let file_name = format!(
            "{}{}{}",
            std::env::consts::DLL_PREFIX,
            module,
            std::env::consts::DLL_SUFFIX
        );
        self.root.join(file_name)
    }

    fn load_module(&mut self, module: &str) -> Result<Arc<LoadedModule>, Report> {
        if let Some(loaded) = self.modules.get(module) {
            return Ok(loaded.clone());
        }
        let path = self.module_path(module);
        // Safety: the library is user code synced by the driver; loading it
        // runs its initializers, which is the point of a dynamic agent.
        let library = unsafe { Library::new(&path) }
            .wrap_err_with(|| format!("failed to load module {:?}", path))?;
        let dealloc = unsafe {
            library
                .get::<RawDeallocFn>(DEALLOC_SYMBOL)
                .map(|symbol| *symbol)
                .wrap_err_with(|| {
                    format!("module {:?} does not export remex_dealloc", path)
                })?
        };
        log!("[dynamic] loaded module {:?}", path);
        let loaded = Arc::new(LoadedModule { library, dealloc });
        self.modules.insert(module.to_string(), loaded.clone());
        Ok(loaded)
    }

    fn bind_symbol(
        loaded: &Arc<LoadedModule>,
        func_name: &str,
    ) -> Result<RegisteredFn, Report> {
        let symbol_name = func_name.replace('.', "_");
        let raw: RawPluginFn = unsafe {
            loaded
                .library
                .get::<RawPluginFn>(symbol_name.as_bytes())
                .map(|symbol| *symbol)
                .wrap_err_with(|| {
                    format!("module does not export '{}'", symbol_name)
                })?
        };
        // the closure keeps the module handle alive for as long as the
        // callable is cached
        let loaded = loaded.clone();
        let func: RegisteredFn = Arc::new(move |kwargs: Kwargs| {
            let input = bincode::serialize(&kwargs)
                .wrap_err("error while encoding plugin arguments")?;
            let mut out_ptr: *mut u8 = std::ptr::null_mut();
            let mut out_len: usize = 0;
            let status = unsafe {
                raw(input.as_ptr(), input.len(), &mut out_ptr, &mut out_len)
            };
            let output = if out_ptr.is_null() {
                Vec::new()
            } else {
                let bytes = unsafe {
                    std::slice::from_raw_parts(out_ptr, out_len)
                }
                .to_vec();
                unsafe { (loaded.dealloc)(out_ptr, out_len) };
                bytes
            };
            if status == 0 {
                bincode::deserialize::<crate::value::Value>(&output)
                    .wrap_err("plugin returned a malformed value")
            } else {
                Err(eyre!("{}", String::from_utf8_lossy(&output)))
            }
        });
        Ok(func)
    }
}

impl Resolver for DynamicResolver {
    fn resolve(&mut self, identifier: &str) -> Result<RegisteredFn, Report> {
        if let Some(func) = self.builtins.lookup(identifier) {
            return Ok(func);
        }
        if let Some(func) = self.store.lookup(identifier) {
            return Ok(func);
        }
        let (module, func_name) =
            crate::protocol::split_identifier(identifier);
        let module = module.ok_or_else(|| {
            eyre!("identifier '{}' names no module", identifier)
        })?;
        let loaded = self.load_module(module)?;
        let func = Self::bind_symbol(&loaded, func_name)?;
        self.store.register_arc(identifier, func.clone());
        Ok(func)
    }

    fn identifiers(&self) -> Vec<String> {
        let mut identifiers = self.builtins.identifiers();
        identifiers.extend(self.store.identifiers());
        identifiers.sort();
        identifiers.dedup();
        identifiers
    }

    /// Reloads every cached module from disk and forgets the callables
    /// bound from them, so code written by a patch becomes visible.
    fn clean_cache(&mut self) -> Result<(), Report> {
        self.store.clear();
        let names: Vec<String> = self.modules.keys().cloned().collect();
        // drop the handles first so the loader re-reads the files
        self.modules.clear();
        for name in names {
            self.load_module(&name)?;
        }
        Ok(())
    }

    fn root_path(&self) -> Option<&Path> {
        Some(&self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn module_path_uses_platform_naming() {
        let resolver = DynamicResolver::new("/srv/agent");
        let path = resolver.module_path("tasks");
        let file_name = path.file_name().unwrap().to_str().unwrap();
        assert!(file_name.contains("tasks"));
        assert_eq!(path.parent().unwrap(), Path::new("/srv/agent"));
    }

    #[test]
    fn registered_functions_win_over_loading() {
        let mut resolver = DynamicResolver::new("/nonexistent");
        resolver.register("tasks:answer", |_| Ok(Value::Int(42)));
        let func = resolver.resolve("tasks:answer").unwrap();
        assert_eq!(func(Kwargs::new()).unwrap(), Value::Int(42));
    }

    #[test]
    fn missing_module_fails_to_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let mut resolver = DynamicResolver::new(dir.path());
        assert!(resolver.resolve("absent:func").is_err());
        assert!(resolver.resolve("_adm_hello").is_err());
    }

    #[test]
    fn clean_cache_keeps_registered_callables() {
        let mut resolver = DynamicResolver::new("/nonexistent");
        resolver.register("tasks:answer", |_| Ok(Value::Int(42)));
        resolver.clean_cache().unwrap();
        // registered callables behave like the admin set and survive
        assert!(resolver.resolve("tasks:answer").is_ok());
        assert_eq!(resolver.identifiers(), vec!["tasks:answer".to_string()]);
    }
}

//! Capability shim registration via Wasmtime linker.
//!
//! Registers the four capability functions of an [`Abi`] with the Wasmtime
//! `Linker`. Each function:
//! 1. Extracts memory and HostState from the Caller
//! 2. Validates offset/length arguments against linear memory
//! 3. Delegates to the [`CapabilityShim`] implementation on HostState
//! 4. Returns a non-negative result or a negative error code
//!
//! Nothing here traps: every failure becomes an [`ErrorCode`] the guest can
//! inspect.

use std::collections::HashSet;

use wasmtime::{Caller, ExternType, Linker, Memory, Module, Val};

use water_hostapi::{CapabilityShim, ErrorCode};

use crate::abi::{Abi, MEMORY_EXPORT};
use crate::error::WaterError;
use crate::host_impl::HostState;
use crate::memory;
use crate::validation::is_i32_func;

/// Get the guest's exported memory from a Caller.
fn get_memory(caller: &mut Caller<'_, HostState>) -> Option<Memory> {
    caller.get_export(MEMORY_EXPORT).and_then(|e| e.into_memory())
}

fn link_err(e: anyhow::Error) -> WaterError {
    WaterError::Instantiate(format!("linker: {e}"))
}

/// Register every capability function of `abi` with the linker.
pub fn register_capability_shim(
    linker: &mut Linker<HostState>,
    abi: &Abi,
) -> Result<(), WaterError> {
    register_connect(linker, abi)?;
    register_host_read(linker, abi)?;
    register_host_write(linker, abi)?;
    register_host_close(linker, abi)?;
    Ok(())
}

fn register_connect(linker: &mut Linker<HostState>, abi: &Abi) -> Result<(), WaterError> {
    linker
        .func_wrap(
            abi.import_module,
            abi.connect,
            |mut caller: Caller<'_, HostState>| -> i32 {
                match caller.data_mut().connect() {
                    Ok(handle) => handle,
                    Err(e) => e.to_error_code(),
                }
            },
        )
        .map_err(link_err)?;
    Ok(())
}

fn register_host_read(linker: &mut Linker<HostState>, abi: &Abi) -> Result<(), WaterError> {
    linker
        .func_wrap(
            abi.import_module,
            abi.host_read,
            |mut caller: Caller<'_, HostState>, handle: i32, off: i32, len: i32| -> i32 {
                let mem = match get_memory(&mut caller) {
                    Some(m) => m,
                    None => return ErrorCode::Internal.as_i32(),
                };
                let (data, state) = mem.data_and_store_mut(&mut caller);
                let buf = match memory::slice_mut(data, off, len) {
                    Ok(b) => b,
                    Err(code) => return code,
                };
                match state.host_read(handle, buf) {
                    Ok(n) => {
                        tracing::trace!(handle, n, "host_read");
                        n as i32
                    }
                    Err(e) => e.to_error_code(),
                }
            },
        )
        .map_err(link_err)?;
    Ok(())
}

fn register_host_write(linker: &mut Linker<HostState>, abi: &Abi) -> Result<(), WaterError> {
    linker
        .func_wrap(
            abi.import_module,
            abi.host_write,
            |mut caller: Caller<'_, HostState>, handle: i32, off: i32, len: i32| -> i32 {
                let mem = match get_memory(&mut caller) {
                    Some(m) => m,
                    None => return ErrorCode::Internal.as_i32(),
                };
                let (data, state) = mem.data_and_store_mut(&mut caller);
                let buf = match memory::slice(data, off, len) {
                    Ok(b) => b,
                    Err(code) => return code,
                };
                match state.host_write(handle, buf) {
                    Ok(n) => {
                        tracing::trace!(handle, n, "host_write");
                        n as i32
                    }
                    Err(e) => e.to_error_code(),
                }
            },
        )
        .map_err(link_err)?;
    Ok(())
}

fn register_host_close(linker: &mut Linker<HostState>, abi: &Abi) -> Result<(), WaterError> {
    linker
        .func_wrap(
            abi.import_module,
            abi.host_close,
            |mut caller: Caller<'_, HostState>, handle: i32| -> i32 {
                match caller.data_mut().host_close(handle) {
                    Ok(()) => 0,
                    Err(e) => e.to_error_code(),
                }
            },
        )
        .map_err(link_err)?;
    Ok(())
}

/// Bind every other function `module` imports from the ABI namespace to a
/// stub returning `ERR_NOT_IMPLEMENTED`.
///
/// Only imports returning a single i32 can be stubbed; anything else makes
/// the module fail instantiation.
pub fn stub_unknown_imports(
    linker: &mut Linker<HostState>,
    module: &Module,
    abi: &Abi,
) -> Result<(), WaterError> {
    let mut stubbed = HashSet::new();
    for import in module.imports() {
        if import.module() != abi.import_module || abi.is_capability(import.name()) {
            continue;
        }
        let ty = match import.ty() {
            ExternType::Func(ty) => ty,
            _ => continue,
        };
        if !stubbed.insert(import.name().to_string()) {
            continue;
        }
        if !is_i32_func(&ty, ty.params().len()) {
            return Err(WaterError::Instantiate(format!(
                "import '{}' is not a known capability and cannot be stubbed",
                import.name()
            )));
        }
        let name = import.name().to_string();
        tracing::debug!(import = %name, "binding unknown capability to not-implemented stub");
        linker
            .func_new(abi.import_module, import.name(), ty, move |_caller, _params, results| {
                tracing::trace!(import = %name, "guest called unimplemented capability");
                results[0] = Val::I32(ErrorCode::NotImplemented.as_i32());
                Ok(())
            })
            .map_err(link_err)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::conn::ConnShared;
    use crate::host_impl::Binding;
    use crate::v0::ABI;
    use wasmtime::{Engine, Store};

    fn instantiate(wat: &str, binding: Binding) -> (Store<HostState>, wasmtime::Instance) {
        let engine = Engine::default();
        let module = Module::new(&engine, wat).unwrap();
        let shared = ConnShared::new();
        shared.activate();
        let mut store = Store::new(&engine, HostState::new(binding, shared, &Config::default()));
        let mut linker = Linker::new(&engine);
        register_capability_shim(&mut linker, &ABI).unwrap();
        stub_unknown_imports(&mut linker, &module, &ABI).unwrap();
        let instance = linker.instantiate(&mut store, &module).unwrap();
        (store, instance)
    }

    #[test]
    fn test_unbound_connect_returns_not_implemented() {
        let wat = r#"
            (module
                (import "water_host" "connect" (func $connect (result i32)))
                (memory (export "memory") 1)
                (func (export "run") (result i32) call $connect))
        "#;
        let (mut store, instance) = instantiate(wat, Binding::Unbound);
        let run = instance.get_typed_func::<(), i32>(&mut store, "run").unwrap();
        assert_eq!(run.call(&mut store, ()).unwrap(), ErrorCode::NotImplemented.as_i32());
    }

    #[test]
    fn test_host_read_rejects_bad_pointer() {
        let wat = r#"
            (module
                (import "water_host" "host_read" (func $read (param i32 i32 i32) (result i32)))
                (memory (export "memory") 1)
                (func (export "run") (result i32)
                    (call $read (i32.const 1) (i32.const 65530) (i32.const 100))))
        "#;
        let (mut store, instance) = instantiate(wat, Binding::Unbound);
        let run = instance.get_typed_func::<(), i32>(&mut store, "run").unwrap();
        assert_eq!(run.call(&mut store, ()).unwrap(), ErrorCode::BadPointer.as_i32());
    }

    #[test]
    fn test_host_write_unknown_handle() {
        let wat = r#"
            (module
                (import "water_host" "host_write" (func $write (param i32 i32 i32) (result i32)))
                (memory (export "memory") 1)
                (func (export "run") (result i32)
                    (call $write (i32.const 9) (i32.const 0) (i32.const 4))))
        "#;
        let (mut store, instance) = instantiate(wat, Binding::Unbound);
        let run = instance.get_typed_func::<(), i32>(&mut store, "run").unwrap();
        assert_eq!(run.call(&mut store, ()).unwrap(), ErrorCode::InvalidFd.as_i32());
    }

    #[test]
    fn test_unknown_import_is_stubbed() {
        let wat = r#"
            (module
                (import "water_host" "listen" (func $listen (param i32) (result i32)))
                (memory (export "memory") 1)
                (func (export "run") (result i32) (call $listen (i32.const 0))))
        "#;
        let (mut store, instance) = instantiate(wat, Binding::Unbound);
        let run = instance.get_typed_func::<(), i32>(&mut store, "run").unwrap();
        assert_eq!(run.call(&mut store, ()).unwrap(), ErrorCode::NotImplemented.as_i32());
    }

    #[test]
    fn test_unstubbable_import_rejected() {
        let engine = Engine::default();
        let module = Module::new(
            &engine,
            r#"(module (import "water_host" "tick" (func)) (memory (export "memory") 1))"#,
        )
        .unwrap();
        let mut linker = Linker::new(&engine);
        let err = stub_unknown_imports(&mut linker, &module, &ABI).unwrap_err();
        assert!(err.to_string().contains("tick"));
    }
}

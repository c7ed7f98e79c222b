//! Transport module validation: ABI conformance checks.
//!
//! Runs against the compiled module before instantiation, so a module built
//! for a different ABI generation is rejected at construction time rather
//! than at its first call. Checks:
//!
//! 1. `memory` is exported
//! 2. Required exports present with all-i32 signatures
//! 3. All imports are functions from the ABI's import namespace
//! 4. Known capability imports have the expected signature

use wasmtime::{ExternType, FuncType, Module, ValType};

use crate::abi::{Abi, MEMORY_EXPORT};
use crate::error::WaterError;

fn is_i32(vt: &ValType) -> bool {
    matches!(vt, ValType::I32)
}

fn invalid(msg: String) -> WaterError {
    WaterError::Instantiate(msg)
}

/// True if `ty` takes `params` i32s and returns exactly one i32.
pub(crate) fn is_i32_func(ty: &FuncType, params: usize) -> bool {
    let p: Vec<ValType> = ty.params().collect();
    let r: Vec<ValType> = ty.results().collect();
    p.len() == params && p.iter().all(is_i32) && r.len() == 1 && is_i32(&r[0])
}

/// Validate that a transport module conforms to `abi`.
pub fn validate_module(module: &Module, abi: &Abi) -> Result<(), WaterError> {
    validate_exports(module, abi)?;
    validate_imports(module, abi)?;
    Ok(())
}

fn validate_exports(module: &Module, abi: &Abi) -> Result<(), WaterError> {
    let has_memory = module
        .exports()
        .any(|e| e.name() == MEMORY_EXPORT && matches!(e.ty(), ExternType::Memory(_)));
    if !has_memory {
        return Err(invalid(format!("module must export '{MEMORY_EXPORT}'")));
    }

    for (name, param_count, result_count) in abi.exports() {
        let export = module
            .exports()
            .find(|e| e.name() == name)
            .ok_or_else(|| invalid(format!("missing required export: {name}")))?;

        let func_ty = match export.ty() {
            ExternType::Func(ft) => ft,
            _ => return Err(invalid(format!("export '{name}' must be a function"))),
        };

        let params: Vec<ValType> = func_ty.params().collect();
        let results: Vec<ValType> = func_ty.results().collect();

        if params.len() != param_count || !params.iter().all(is_i32) {
            return Err(invalid(format!(
                "export '{name}' has wrong param signature: expected {param_count} i32 params, got {} params",
                params.len()
            )));
        }
        if results.len() != result_count || !results.iter().all(is_i32) {
            return Err(invalid(format!(
                "export '{name}' has wrong result signature: expected {result_count} i32 results, got {} results",
                results.len()
            )));
        }
    }

    Ok(())
}

fn validate_imports(module: &Module, abi: &Abi) -> Result<(), WaterError> {
    for import in module.imports() {
        let module_name = import.module();

        if module_name.starts_with("wasi") {
            return Err(invalid(format!(
                "WASI import not allowed: {}::{}",
                module_name,
                import.name()
            )));
        }

        if module_name != abi.import_module {
            return Err(invalid(format!(
                "import from unknown module '{}' (only '{}' allowed): {}",
                module_name,
                abi.import_module,
                import.name()
            )));
        }

        let func_ty = match import.ty() {
            ExternType::Func(ft) => ft,
            _ => {
                return Err(invalid(format!(
                    "non-function import not allowed: {}::{}",
                    module_name,
                    import.name()
                )));
            }
        };

        if let Some((_, params)) = abi.imports().into_iter().find(|(n, _)| *n == import.name()) {
            if !is_i32_func(&func_ty, params) {
                return Err(invalid(format!(
                    "import '{}' has wrong signature: expected {params} i32 params and one i32 result",
                    import.name()
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v0::ABI;
    use wasmtime::Engine;

    const EXPORTS: &str = r#"
        (memory (export "memory") 1)
        (func (export "_water_init") (result i32) i32.const 0)
        (func (export "_water_read") (param i32 i32) (result i32) i32.const 0)
        (func (export "_water_write") (param i32 i32) (result i32) i32.const 0)
        (func (export "_water_close") (param i32 i32) (result i32) i32.const 0)
    "#;

    fn compile(body: &str) -> Module {
        let engine = Engine::default();
        Module::new(&engine, format!("(module {body})")).unwrap()
    }

    #[test]
    fn test_validate_minimal_valid_module() {
        validate_module(&compile(EXPORTS), &ABI).unwrap();
    }

    #[test]
    fn test_accept_capability_imports() {
        let body = format!(
            r#"
            (import "water_host" "connect" (func (result i32)))
            (import "water_host" "host_read" (func (param i32 i32 i32) (result i32)))
            (import "water_host" "host_write" (func (param i32 i32 i32) (result i32)))
            (import "water_host" "host_close" (func (param i32) (result i32)))
            {EXPORTS}"#
        );
        validate_module(&compile(&body), &ABI).unwrap();
    }

    #[test]
    fn test_reject_missing_export() {
        let module = compile(
            r#"
            (memory (export "memory") 1)
            (func (export "_water_init") (result i32) i32.const 0)
        "#,
        );
        let err = validate_module(&module, &ABI).unwrap_err();
        assert!(matches!(err, WaterError::Instantiate(_)));
        assert!(err.to_string().contains("_water_read"));
    }

    #[test]
    fn test_reject_wrong_export_signature() {
        let module = compile(
            r#"
            (memory (export "memory") 1)
            (func (export "_water_init") (param i32) (result i32) i32.const 0)
            (func (export "_water_read") (param i32 i32) (result i32) i32.const 0)
            (func (export "_water_write") (param i32 i32) (result i32) i32.const 0)
            (func (export "_water_close") (param i32 i32) (result i32) i32.const 0)
        "#,
        );
        let err = validate_module(&module, &ABI).unwrap_err();
        assert!(matches!(err, WaterError::Instantiate(_)));
    }

    #[test]
    fn test_reject_missing_memory() {
        let module = compile(
            r#"
            (func (export "_water_init") (result i32) i32.const 0)
            (func (export "_water_read") (param i32 i32) (result i32) i32.const 0)
            (func (export "_water_write") (param i32 i32) (result i32) i32.const 0)
            (func (export "_water_close") (param i32 i32) (result i32) i32.const 0)
        "#,
        );
        assert!(validate_module(&module, &ABI).is_err());
    }

    #[test]
    fn test_reject_wasi_import() {
        let body = format!(
            r#"(import "wasi_snapshot_preview1" "sock_open" (func (param i32 i32 i32) (result i32))) {EXPORTS}"#
        );
        let err = validate_module(&compile(&body), &ABI).unwrap_err();
        assert!(err.to_string().contains("WASI"));
    }

    #[test]
    fn test_reject_unknown_module_import() {
        let body = format!(r#"(import "env" "dial_any" (func (result i32))) {EXPORTS}"#);
        let err = validate_module(&compile(&body), &ABI).unwrap_err();
        assert!(err.to_string().contains("env"));
    }

    #[test]
    fn test_reject_capability_with_wrong_signature() {
        let body = format!(r#"(import "water_host" "connect" (func (param i32) (result i32))) {EXPORTS}"#);
        let err = validate_module(&compile(&body), &ABI).unwrap_err();
        assert!(err.to_string().contains("connect"));
    }

    #[test]
    fn test_accept_unknown_capability_name() {
        // Bound to a not-implemented stub at link time.
        let body = format!(r#"(import "water_host" "listen" (func (param i32) (result i32))) {EXPORTS}"#);
        validate_module(&compile(&body), &ABI).unwrap();
    }
}

//! Validation and layout of a module before code generation.
//!
//! Everything that can be decided without generating code is decided here:
//! which intrinsic each import binds to, where `apply` and the start
//! function are, the table contents and the initial memory image. The
//! code generator only has to emit instructions for the function bodies.
use crate::error::CompileError;
use sysvmoc_types::constraints::{
    MAXIMUM_LINEAR_MEMORY_PAGES, MAXIMUM_MUTABLE_GLOBALS, MAXIMUM_SECTION_ELEMENTS,
    MAXIMUM_TABLE_ELEMENTS, WASM_PAGE_SIZE,
};
use sysvmoc_types::intrinsics::{
    find_intrinsic_index, IntrinsicSignature, IntrinsicValue, INTRINSIC_SIGNATURES,
};
use wasmparser::{
    CompositeInnerType, ConstExpr, DataKind, ElementItems, ElementKind, ExternalKind, Operator,
    Parser, Payload, TypeRef, Validator,
};

pub use wasmparser::ValType;

/// A function type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Parameter types.
    pub params: Vec<ValType>,
    /// Result types.
    pub results: Vec<ValType>,
}

impl Signature {
    fn matches(&self, intrinsic: &IntrinsicSignature) -> bool {
        fn same(wasm: &[ValType], host: &[IntrinsicValue]) -> bool {
            wasm.len() == host.len()
                && wasm.iter().zip(host).all(|(wasm, host)| {
                    matches!(
                        (wasm, host),
                        (ValType::I32, IntrinsicValue::I32) | (ValType::I64, IntrinsicValue::I64)
                    )
                })
        }
        same(&self.params, intrinsic.params) && same(&self.results, intrinsic.results)
    }
}

/// An imported function, bound to a host intrinsic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionImport {
    /// Jump table slot of the intrinsic.
    pub ordinal: usize,
    /// Index into [`ModuleLayout::signatures`].
    pub signature: u32,
}

/// A function defined by the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Function<'data> {
    /// Index into [`ModuleLayout::signatures`].
    pub signature: u32,
    /// The encoded body, locals included.
    pub body: &'data [u8],
}

/// Initial value of a global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalInit {
    /// An `i32.const`.
    I32(i32),
    /// An `i64.const`.
    I64(i64),
    /// Bit pattern of an `f32`.
    F32(u32),
    /// Bit pattern of an `f64`.
    F64(u64),
    /// Value of another global.
    GlobalGet(u32),
}

/// A global defined by the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Global {
    /// Value type.
    pub ty: ValType,
    /// Whether code may store to the global.
    pub mutable: bool,
    /// Initial value.
    pub init: GlobalInit,
}

/// A validated module, ready for code generation.
///
/// Function indexes follow wasm numbering: imports first, then the
/// functions defined by the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleLayout<'data> {
    /// Function types, by type index.
    pub signatures: Vec<Signature>,
    /// Imported functions, in import order.
    pub imports: Vec<FunctionImport>,
    /// Functions defined by the module.
    pub functions: Vec<Function<'data>>,
    /// Globals defined by the module.
    pub globals: Vec<Global>,
    /// Function index stored in each table element, `None` when unset.
    pub table: Vec<Option<u32>>,
    /// Function index of the exported `apply`, always a defined function.
    pub apply: u32,
    /// Function index of the start function.
    pub start: Option<u32>,
    /// Initial size of linear memory.
    pub starting_memory_pages: u32,
    /// Image of linear memory up to the last byte written by a data
    /// segment.
    pub initial_memory: Vec<u8>,
}

impl ModuleLayout<'_> {
    /// Number of imported functions, which is also the index of the first
    /// defined function.
    pub fn num_imported_functions(&self) -> u32 {
        self.imports.len() as u32
    }

    /// Position of function `index` in [`ModuleLayout::functions`], `None`
    /// for imports.
    pub fn defined_index(&self, index: u32) -> Option<usize> {
        index
            .checked_sub(self.num_imported_functions())
            .map(|i| i as usize)
            .filter(|i| *i < self.functions.len())
    }

    /// Signature of function `index`.
    pub fn function_signature(&self, index: u32) -> Option<&Signature> {
        let signature = match self.defined_index(index) {
            Some(defined) => self.functions[defined].signature,
            None => self.imports.get(index as usize)?.signature,
        };
        self.signatures.get(signature as usize)
    }
}

#[derive(Default)]
struct Builder<'data> {
    signatures: Vec<Signature>,
    imports: Vec<FunctionImport>,
    function_signatures: Vec<u32>,
    bodies: Vec<&'data [u8]>,
    globals: Vec<Global>,
    table: Vec<Option<u32>>,
    apply: Option<u32>,
    start: Option<u32>,
    has_memory: bool,
    starting_memory_pages: u32,
    initial_memory: Vec<u8>,
}

fn check_count(section: &str, count: u32) -> Result<(), CompileError> {
    if u64::from(count) > MAXIMUM_SECTION_ELEMENTS {
        return Err(CompileError::LimitExceeded(format!(
            "{section} section has {count} elements"
        )));
    }
    Ok(())
}

/// Validates `wasm` and lays it out for code generation.
pub fn prepare(wasm: &[u8]) -> Result<ModuleLayout<'_>, CompileError> {
    Validator::new().validate_all(wasm)?;

    let mut builder = Builder::default();
    for payload in Parser::new(0).parse_all(wasm) {
        match payload? {
            Payload::TypeSection(types) => {
                for rec_group in types {
                    for sub_type in rec_group?.into_types() {
                        let CompositeInnerType::Func(func) = &sub_type.composite_type.inner else {
                            return Err(CompileError::Invalid("only function types are supported".into()));
                        };
                        builder.signatures.push(Signature {
                            params: func.params().to_vec(),
                            results: func.results().to_vec(),
                        });
                    }
                }
            }

            Payload::ImportSection(imports) => {
                check_count("import", imports.count())?;
                for import in imports {
                    let import = import?;
                    let TypeRef::Func(signature) = import.ty else {
                        return Err(CompileError::Invalid(format!(
                            "{}.{}: only functions may be imported",
                            import.module, import.name
                        )));
                    };
                    let ordinal = find_intrinsic_index(import.module, import.name).ok_or_else(
                        || CompileError::UnknownImport {
                            module: import.module.into(),
                            name: import.name.into(),
                        },
                    )?;
                    let expected = &INTRINSIC_SIGNATURES[ordinal];
                    let declared = builder.signatures.get(signature as usize);
                    if !declared.is_some_and(|declared| declared.matches(expected)) {
                        return Err(CompileError::ImportSignatureMismatch {
                            module: import.module.into(),
                            name: import.name.into(),
                        });
                    }
                    builder.imports.push(FunctionImport { ordinal, signature });
                }
            }

            Payload::FunctionSection(functions) => {
                check_count("function", functions.count())?;
                for signature in functions {
                    builder.function_signatures.push(signature?);
                }
            }

            Payload::TableSection(tables) => {
                for table in tables {
                    let table = table?;
                    if !builder.table.is_empty() {
                        return Err(CompileError::Invalid("at most one table is supported".into()));
                    }
                    let initial = u64::from(table.ty.initial);
                    if initial > MAXIMUM_TABLE_ELEMENTS {
                        return Err(CompileError::LimitExceeded(format!(
                            "table of {initial} elements"
                        )));
                    }
                    builder.table = vec![None; initial as usize];
                }
            }

            Payload::MemorySection(memories) => {
                for memory in memories {
                    let memory = memory?;
                    if memory.memory64 || memory.shared || builder.has_memory {
                        return Err(CompileError::Invalid(
                            "only one unshared 32 bit memory is supported".into(),
                        ));
                    }
                    if memory.initial > MAXIMUM_LINEAR_MEMORY_PAGES {
                        return Err(CompileError::LimitExceeded(format!(
                            "memory of {} pages",
                            memory.initial
                        )));
                    }
                    builder.has_memory = true;
                    builder.starting_memory_pages = memory.initial as u32;
                }
            }

            Payload::GlobalSection(globals) => {
                check_count("global", globals.count())?;
                let mut mutable_bytes = 0u64;
                for global in globals {
                    let global = global?;
                    if global.ty.mutable {
                        mutable_bytes += value_size(global.ty.content_type);
                    }
                    builder.globals.push(Global {
                        ty: global.ty.content_type,
                        mutable: global.ty.mutable,
                        init: global_init(&global.init_expr)?,
                    });
                }
                if mutable_bytes > MAXIMUM_MUTABLE_GLOBALS {
                    return Err(CompileError::LimitExceeded(format!(
                        "{mutable_bytes} bytes of mutable globals"
                    )));
                }
            }

            Payload::ExportSection(exports) => {
                check_count("export", exports.count())?;
                for export in exports {
                    let export = export?;
                    if export.name == "apply" && export.kind == ExternalKind::Func {
                        builder.apply = Some(export.index);
                    }
                }
            }

            Payload::StartSection { func, .. } => builder.start = Some(func),

            Payload::ElementSection(elements) => {
                check_count("element", elements.count())?;
                for element in elements {
                    let element = element?;
                    let offset = match element.kind {
                        ElementKind::Active { offset_expr, .. } => const_offset(&offset_expr)?,
                        ElementKind::Declared => continue,
                        ElementKind::Passive => {
                            return Err(CompileError::Invalid(
                                "passive element segments are not supported".into(),
                            ));
                        }
                    };
                    let mut functions = Vec::new();
                    match element.items {
                        ElementItems::Functions(indexes) => {
                            for index in indexes {
                                functions.push(Some(index?));
                            }
                        }
                        ElementItems::Expressions(_, exprs) => {
                            for expr in exprs {
                                functions.push(element_function(&expr?)?);
                            }
                        }
                    }
                    let slots = builder
                        .table
                        .get_mut(offset..offset + functions.len())
                        .ok_or_else(|| {
                            CompileError::Invalid("element segment does not fit the table".into())
                        })?;
                    slots.copy_from_slice(&functions);
                }
            }

            Payload::DataSection(data) => {
                check_count("data", data.count())?;
                let memory_size = u64::from(builder.starting_memory_pages) * WASM_PAGE_SIZE;
                for segment in data {
                    let segment = segment?;
                    let DataKind::Active { offset_expr, .. } = segment.kind else {
                        return Err(CompileError::Invalid(
                            "passive data segments are not supported".into(),
                        ));
                    };
                    let offset = const_offset(&offset_expr)?;
                    let end = offset + segment.data.len();
                    if end as u64 > memory_size {
                        return Err(CompileError::Invalid(format!(
                            "data segment ends at {end}, past the initial memory"
                        )));
                    }
                    if builder.initial_memory.len() < end {
                        builder.initial_memory.resize(end, 0);
                    }
                    builder.initial_memory[offset..end].copy_from_slice(segment.data);
                }
            }

            Payload::CodeSectionEntry(body) => builder.bodies.push(&wasm[body.range()]),

            _ => {}
        }
    }
    builder.finish()
}

impl<'data> Builder<'data> {
    fn finish(self) -> Result<ModuleLayout<'data>, CompileError> {
        let functions = self
            .function_signatures
            .iter()
            .zip(&self.bodies)
            .map(|(signature, body)| Function {
                signature: *signature,
                body,
            })
            .collect();
        let mut layout = ModuleLayout {
            signatures: self.signatures,
            imports: self.imports,
            functions,
            globals: self.globals,
            table: self.table,
            apply: 0,
            start: self.start,
            starting_memory_pages: self.starting_memory_pages,
            initial_memory: self.initial_memory,
        };

        let apply = self.apply.ok_or(CompileError::MissingApply)?;
        if layout.defined_index(apply).is_none() {
            return Err(CompileError::MissingApply);
        }
        let expected = [ValType::I64, ValType::I64, ValType::I64];
        if layout
            .function_signature(apply)
            .is_none_or(|sig| sig.params != expected || !sig.results.is_empty())
        {
            return Err(CompileError::Invalid(
                "apply must take (i64, i64, i64) and return nothing".into(),
            ));
        }
        layout.apply = apply;
        Ok(layout)
    }
}

fn value_size(ty: ValType) -> u64 {
    match ty {
        ValType::I32 | ValType::F32 => 4,
        ValType::I64 | ValType::F64 | ValType::Ref(_) => 8,
        ValType::V128 => 16,
    }
}

fn global_init(expr: &ConstExpr<'_>) -> Result<GlobalInit, CompileError> {
    Ok(match expr.get_operators_reader().read()? {
        Operator::I32Const { value } => GlobalInit::I32(value),
        Operator::I64Const { value } => GlobalInit::I64(value),
        Operator::F32Const { value } => GlobalInit::F32(value.bits()),
        Operator::F64Const { value } => GlobalInit::F64(value.bits()),
        Operator::GlobalGet { global_index } => GlobalInit::GlobalGet(global_index),
        _ => {
            return Err(CompileError::Invalid(
                "unsupported global initializer".into(),
            ));
        }
    })
}

/// Offset of an active segment, which must be a non negative constant.
fn const_offset(expr: &ConstExpr<'_>) -> Result<usize, CompileError> {
    match expr.get_operators_reader().read()? {
        Operator::I32Const { value } if value >= 0 => Ok(value as usize),
        _ => Err(CompileError::Invalid(
            "segment offset must be a non negative i32.const".into(),
        )),
    }
}

fn element_function(expr: &ConstExpr<'_>) -> Result<Option<u32>, CompileError> {
    match expr.get_operators_reader().read()? {
        Operator::RefFunc { function_index } => Ok(Some(function_index)),
        Operator::RefNull { .. } => Ok(None),
        _ => Err(CompileError::Invalid("unsupported element expression".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn wasm(text: &str) -> Vec<u8> {
        wat::parse_str(text).unwrap()
    }

    #[test]
    fn lays_out_a_contract() {
        let bytes = wasm(
            r#"(module
                (import "env" "sysio_assert" (func $assert (param i32 i32)))
                (import "env" "prints_l" (func $print (param i32 i32)))
                (memory 2)
                (table 4 funcref)
                (global $g (mut i64) (i64.const 7))
                (elem (i32.const 1) $helper $apply)
                (data (i32.const 16) "hi")
                (func $helper)
                (func $apply (export "apply") (param i64 i64 i64)
                    i32.const 1 i32.const 0 call $assert)
            )"#,
        );
        let layout = prepare(&bytes).unwrap();
        assert_eq!(
            layout.imports.iter().map(|i| i.ordinal).collect::<Vec<_>>(),
            vec![
                find_intrinsic_index("env", "sysio_assert").unwrap(),
                find_intrinsic_index("env", "prints_l").unwrap(),
            ]
        );
        assert_eq!(layout.functions.len(), 2);
        assert_eq!(layout.apply, 3);
        assert_eq!(layout.defined_index(3), Some(1));
        assert_eq!(layout.defined_index(1), None);
        assert_eq!(layout.table, vec![None, Some(2), Some(3), None]);
        assert_eq!(layout.starting_memory_pages, 2);
        assert_eq!(layout.initial_memory.len(), 18);
        assert_eq!(&layout.initial_memory[16..], b"hi");
        assert_eq!(
            layout.globals,
            vec![Global {
                ty: ValType::I64,
                mutable: true,
                init: GlobalInit::I64(7),
            }]
        );
        assert_eq!(layout.start, None);
    }

    #[test]
    fn apply_is_required() {
        let bytes = wasm(r#"(module (func (export "main") (param i64 i64 i64)))"#);
        assert!(matches!(prepare(&bytes), Err(CompileError::MissingApply)));

        let imported = wasm(
            r#"(module (import "env" "sysio_exit" (func (param i32)))
                (export "apply" (func 0)))"#,
        );
        assert!(matches!(prepare(&imported), Err(CompileError::MissingApply)));
    }

    #[test]
    fn apply_signature_is_checked() {
        let bytes = wasm(r#"(module (func (export "apply") (param i32)))"#);
        assert!(matches!(prepare(&bytes), Err(CompileError::Invalid(_))));
    }

    #[test]
    fn unknown_imports_are_rejected() {
        let bytes = wasm(
            r#"(module
                (import "env" "memcpy" (func (param i32 i32 i32) (result i32)))
                (func (export "apply") (param i64 i64 i64)))"#,
        );
        match prepare(&bytes) {
            Err(CompileError::UnknownImport { module, name }) => {
                assert_eq!((module.as_str(), name.as_str()), ("env", "memcpy"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn imports_must_use_the_intrinsic_signature() {
        let bytes = wasm(
            r#"(module
                (import "env" "sysio_exit" (func $exit (result i64)))
                (func (export "apply") (param i64 i64 i64)))"#,
        );
        match prepare(&bytes) {
            Err(CompileError::ImportSignatureMismatch { module, name }) => {
                assert_eq!((module.as_str(), name.as_str()), ("env", "sysio_exit"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let swapped = wasm(
            r#"(module
                (import "env" "sysio_assert_code" (func (param i64 i32)))
                (func (export "apply") (param i64 i64 i64)))"#,
        );
        assert!(matches!(
            prepare(&swapped),
            Err(CompileError::ImportSignatureMismatch { .. })
        ));
    }

    #[test]
    fn invalid_wasm_is_rejected() {
        assert!(matches!(prepare(b"\0asm\x01\0\0\0\x01"), Err(CompileError::Invalid(_))));
        let bytes = wasm(r#"(module (func (export "apply") (param i64 i64 i64) i32.add))"#);
        assert!(matches!(prepare(&bytes), Err(CompileError::Invalid(_))));
    }

    #[test]
    fn memory_and_table_limits() {
        let big_memory = wasm(r#"(module (memory 529) (func (export "apply") (param i64 i64 i64)))"#);
        assert!(matches!(prepare(&big_memory), Err(CompileError::LimitExceeded(_))));

        let big_table = wasm(r#"(module (table 1025 funcref) (func (export "apply") (param i64 i64 i64)))"#);
        assert!(matches!(prepare(&big_table), Err(CompileError::LimitExceeded(_))));

        let outside = wasm(
            r#"(module (memory 1) (data (i32.const 65535) "ab")
                (func (export "apply") (param i64 i64 i64)))"#,
        );
        assert!(matches!(prepare(&outside), Err(CompileError::Invalid(_))));
    }

    #[test]
    fn mutable_global_budget() {
        let globals: String = (0..129)
            .map(|i| format!("(global $g{i} (mut i64) (i64.const 0))"))
            .collect();
        let bytes = wasm(&format!(
            r#"(module {globals} (func (export "apply") (param i64 i64 i64)))"#
        ));
        assert!(matches!(prepare(&bytes), Err(CompileError::LimitExceeded(_))));

        // immutable globals do not count
        let globals: String = (0..129)
            .map(|i| format!("(global $g{i} i64 (i64.const 0))"))
            .collect();
        let bytes = wasm(&format!(
            r#"(module {globals} (func (export "apply") (param i64 i64 i64)))"#
        ));
        assert!(prepare(&bytes).is_ok());
    }

    #[test]
    fn start_function_is_recorded() {
        let bytes = wasm(
            r#"(module
                (import "env" "sysio_exit" (func $exit (param i32)))
                (func $init)
                (start $init)
                (func (export "apply") (param i64 i64 i64)))"#,
        );
        assert_eq!(prepare(&bytes).unwrap().start, Some(1));
    }
}

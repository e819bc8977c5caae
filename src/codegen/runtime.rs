//! Fixed module items the generated functions rely on.

/// Host functions every module imports.
pub const IMPORTS: &[&str] = &[r#"(import "imports" "println" (func $println (param i32)))"#];

/// A single page of memory and a bump allocator over it.
///
/// Allocation never reuses memory and `$memory_deallocate` does nothing. The
/// first four bytes hold an allocation bitmap that the bump allocator leaves
/// untouched, so the bump pointer starts right after it.
pub const MEMORY_MANAGEMENT: &[&str] = &[
    "(memory 1)",
    r#"(export "memory" (memory 0))"#,
    "(global $mem_alloc_ptr (mut i32) (i32.const 4))",
    r#"(data (i32.const 0) "\00\00\00\00")"#,
    "(func $memory_allocate (param $size i32) (result i32)",
    "  (call $find_free_block (local.get $size))",
    ")",
    "(func $memory_deallocate (param $ptr i32)",
    "  (call $mark_block_free (local.get $ptr))",
    ")",
    "(func $find_free_block (param $size i32) (result i32)",
    "  (local $ptr i32)",
    "  (local.set $ptr (global.get $mem_alloc_ptr))",
    "  (global.set $mem_alloc_ptr (i32.add (global.get $mem_alloc_ptr) (local.get $size)))",
    "  (local.get $ptr)",
    ")",
    "(func $mark_block_free (param $ptr i32))",
];

/// Memory for modules that allocate without the bump allocator.
pub const BARE_MEMORY: &[&str] = &["(memory 1)", r#"(export "memory" (memory 0))"#];

pub const ALLOCATE: &str = "$memory_allocate";
pub const DEALLOCATE: &str = "$memory_deallocate";

/// Grows the memory by one page, evaluating to the address of the new page.
pub const GROW_PAGE: &str = "(i32.mul (memory.grow (i32.const 1)) (i32.const 65536))";

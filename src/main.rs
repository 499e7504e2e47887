//! `IrScope` command-line entry point
//!
//! This binary crate only hands off to the library.

fn main() -> anyhow::Result<()> {
    ir_scope_lib::run()
}

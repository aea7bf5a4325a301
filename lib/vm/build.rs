//! Compiles the C shim that sets up the non-local exit used to leave
//! native code on traps.

fn main() {
    println!("cargo:rerun-if-changed=src/trap/handlers.c");

    cc::Build::new()
        .warnings(true)
        .file("src/trap/handlers.c")
        .compile("handlers");
}

use std::env;
use std::path::PathBuf;

const LIB_NAME: &str = "nvr";

fn main() {
    println!("cargo:rerun-if-changed=src");

    let crate_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    let header = PathBuf::from(env::var("OUT_DIR").unwrap()).join(format!("{}.h", LIB_NAME));

    // A header failure must not break the library build
    match cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_language(cbindgen::Language::C)
        .with_include_guard("NVR_H")
        .with_cpp_compat(true)
        .generate()
    {
        Ok(bindings) => {
            bindings.write_to_file(&header);
        }
        Err(err) => println!("cargo:warning=C header not generated: {}", err),
    }
}

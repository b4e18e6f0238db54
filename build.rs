use std::env;
use std::path::PathBuf;

fn main() {
    // C header for hosts linking the static library
    let crate_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    let include_dir = PathBuf::from(&crate_dir).join("include");
    let output_file = include_dir.join("whisper_queue.h");

    std::fs::create_dir_all(&include_dir).unwrap();

    let mut config = cbindgen::Config::from_file("cbindgen.toml").unwrap_or_default();
    config.language = cbindgen::Language::C;
    config.include_guard = Some("WHISPER_QUEUE_H".to_string());

    match cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .generate()
    {
        Ok(bindings) => {
            bindings.write_to_file(&output_file);
        }
        Err(e) => {
            println!("cargo:warning=Unable to generate C header: {}", e);
        }
    }

    println!("cargo:rerun-if-changed=src/ffi.rs");
    println!("cargo:rerun-if-changed=cbindgen.toml");
}

use std::env;
use std::path::PathBuf;

fn main() {
    // Only run bindgen and linking logic if the `xisl-sdk` feature is enabled.
    // This allows the crate to compile without the SDK if the feature is not active.
    #[cfg(feature = "xisl-sdk")]
    {
        println!("cargo:rerun-if-env-changed=XISL_SDK_DIR");
        println!("cargo:rerun-if-changed=wrapper.h");

        let sdk_dir = env::var("XISL_SDK_DIR").expect(
            "XISL_SDK_DIR environment variable must be set when `xisl-sdk` feature is enabled.",
        );

        let sdk_include_path = PathBuf::from(&sdk_dir).join("include");

        // Allow XISL_LIB_DIR to override the default lib path
        let sdk_lib_path = if let Ok(lib_dir) = env::var("XISL_LIB_DIR") {
            PathBuf::from(lib_dir)
        } else {
            PathBuf::from(&sdk_dir).join("lib")
        };

        if !sdk_include_path.exists() {
            panic!(
                "XISL SDK include path does not exist: {:?}",
                sdk_include_path
            );
        }
        if !sdk_lib_path.exists() {
            eprintln!(
                "Warning: XISL SDK lib path does not exist: {:?}",
                sdk_lib_path
            );
        }

        let bindings = bindgen::Builder::default()
            .header("wrapper.h")
            .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
            .clang_arg(format!("-I{}", sdk_include_path.display()))
            // Every XISL entry point is prefixed with `Acquisition_`
            .allowlist_function("Acquisition_.*")
            .allowlist_type("HACQDESC|ACQDESCPOS")
            .allowlist_type("CHwHeaderInfo.*")
            // Status codes, sync modes, board types and sequence flags
            .allowlist_var("HIS_.*")
            .generate()
            .expect("Unable to generate bindings");

        let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
        bindings
            .write_to_file(out_path.join("bindings.rs"))
            .expect("Couldn't write bindings!");

        println!("cargo:rustc-link-search=native={}", sdk_lib_path.display());
        println!("cargo:rustc-link-lib=XISL");
    }
    #[cfg(not(feature = "xisl-sdk"))]
    {
        // Without the SDK, emit a dummy bindings file so src/lib.rs compiles.
        let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
        std::fs::write(
            out_path.join("bindings.rs"),
            "// Dummy bindings when xisl-sdk feature is not enabled\npub mod xisl_bindings {}\n",
        )
        .expect("Couldn't write dummy bindings!");
    }
}

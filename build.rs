use std::env;
use std::fs;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // The USB-bridge binding is opt-in; the native and simulated buses need no vendor libraries
    if env::var_os("CARGO_FEATURE_FTDI").is_none() {
        return;
    }

    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    let project_root = PathBuf::from(&manifest_dir);

    // Vendor SDKs are expected next to the crate, or wherever FTDI_LIB_DIR points
    let vendor_root = env::var("FTDI_LIB_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| project_root.join("vendor"));

    let mpsse_lib_path = vendor_root.join("FTDI MPSSE").join("build").join("Win32").join("DLL");
    let d2xx_lib_path = vendor_root.join("FTDI-D2XX-Drivers-Win-2.12.36.20U").join("x86");

    println!("cargo:rustc-link-search=native={}", mpsse_lib_path.display());
    println!("cargo:rustc-link-search=native={}", d2xx_lib_path.display());

    // libmpsse.dll loads FTD2XX.dll at runtime
    println!("cargo:rustc-link-lib=dylib=libmpsse");
    println!("cargo:rerun-if-env-changed=FTDI_LIB_DIR");

    // Copy runtime DLLs next to the executable
    if let Ok(profile) = env::var("PROFILE") {
        let target_dir = project_root
            .join("target")
            .join("i686-pc-windows-msvc")
            .join(&profile);

        if target_dir.exists() {
            let _ = fs::copy(mpsse_lib_path.join("libmpsse.dll"), target_dir.join("libmpsse.dll"));
            let _ = fs::copy(d2xx_lib_path.join("FTD2XX.dll"), target_dir.join("FTD2XX.dll"));

            println!("cargo:warning=Copied runtime DLLs to {}", target_dir.display());
        }
    }
}

// build.rs - Tongsuo detection for the `ntls` feature
use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Common Tongsuo installation locations
const TONGSUO_LOCATIONS: &[&str] = &[
    "/opt/tongsuo",
    "/usr/local/tongsuo",
    "/opt/babassl",
    "/usr/local/babassl",
];

/// Check if the `openssl`/`tongsuo` binary under `dir` reports a Tongsuo build
fn is_tongsuo(dir: &Path) -> bool {
    ["tongsuo", "openssl"].iter().any(|bin| {
        Command::new(dir.join("bin").join(bin))
            .arg("version")
            .output()
            .map(|output| {
                let version = String::from_utf8_lossy(&output.stdout);
                version.contains("Tongsuo") || version.contains("BabaSSL")
            })
            .unwrap_or(false)
    })
}

fn find_tongsuo() -> Option<PathBuf> {
    if let Ok(dir) = env::var("TONGSUO_DIR") {
        return Some(PathBuf::from(dir));
    }
    // openssl-sys links whatever OPENSSL_DIR points at
    if let Ok(dir) = env::var("OPENSSL_DIR") {
        let dir = PathBuf::from(dir);
        if is_tongsuo(&dir) {
            return Some(dir);
        }
    }
    TONGSUO_LOCATIONS
        .iter()
        .map(PathBuf::from)
        .find(|dir| dir.exists() && is_tongsuo(dir))
}

fn main() {
    println!("cargo:rerun-if-env-changed=TONGSUO_DIR");
    println!("cargo:rerun-if-env-changed=OPENSSL_DIR");

    // Stock OpenSSL is enough without TLCP
    if env::var_os("CARGO_FEATURE_NTLS").is_none() {
        return;
    }

    let Some(dir) = find_tongsuo() else {
        println!("cargo:warning=ntls enabled but no Tongsuo installation found; set TONGSUO_DIR and OPENSSL_DIR");
        return;
    };
    println!("cargo:warning=Using Tongsuo at: {}", dir.display());

    if env::var("OPENSSL_DIR").map(PathBuf::from).ok().as_deref() != Some(dir.as_path()) {
        println!(
            "cargo:warning=OPENSSL_DIR does not point at {}; openssl-sys may link a library without NTLS",
            dir.display()
        );
    }

    for lib in ["lib", "lib64"] {
        let lib_dir = dir.join(lib);
        if lib_dir.exists() {
            println!("cargo:rustc-link-search=native={}", lib_dir.display());
            println!("cargo:rustc-link-arg=-Wl,-rpath,{}", lib_dir.display());
        }
    }
    println!("cargo:rerun-if-changed={}", dir.display());
}

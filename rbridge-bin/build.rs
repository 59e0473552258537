use std::fs::File;
use std::io::prelude::*;

fn main() {
    let mut cargo_text = String::new();
    File::open("Cargo.toml").and_then(|mut f| f.read_to_string(&mut cargo_text)).unwrap();
    let decoded: toml::Value = toml::from_str(&cargo_text).unwrap();

    version(&decoded);
}

fn version(decoded: &toml::Value) {
    //`version.workspace = true` is a table, fall back to the crate version cargo hands us
    let version = decoded
        .get("package")
        .and_then(|package| package.get("version"))
        .and_then(|v| v.as_str())
        .map(|v| v.to_owned())
        .unwrap_or_else(|| std::env::var("CARGO_PKG_VERSION").unwrap());
    let build_time = chrono::Local::now().format("%Y%m%d%H%M%S").to_string();
    let server_version = format!("rbridge/{}-{}", &version, &build_time);

    let out = std::env::var("OUT_DIR").unwrap();
    let mut version_file = File::create(format!("{}/{}", out, "version.rs")).unwrap();
    version_file.write_all(b"\n/// rbridge version").unwrap();
    version_file
        .write_all(format!("\npub const VERSION: &str = \"{}\";", server_version).as_bytes())
        .unwrap();
}

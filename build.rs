fn main() {
    // CI stamps releases through RUSTY_FAT_VERSION; local builds use the crate version.
    let release = std::env::var("RUSTY_FAT_VERSION").ok();
    let base = release
        .clone()
        .unwrap_or_else(|| std::env::var("CARGO_PKG_VERSION").unwrap_or_default());

    let version = match (release, std::env::var("PROFILE").as_deref()) {
        (None, Ok("debug")) => format!("{base}-dev"),
        _ => base,
    };

    println!("cargo:rustc-env=APP_VERSION={version}");
    println!("cargo:rerun-if-env-changed=RUSTY_FAT_VERSION");
}

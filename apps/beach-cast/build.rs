use chrono::Utc;

fn main() {
    // Stamp the binary so `beach-cast --version` identifies the exact build.
    let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
    println!("cargo:rustc-env=BUILD_TIMESTAMP={timestamp}");
    println!("cargo:rerun-if-changed=build.rs");
}

use std::fs;
use std::path::Path;

fn main() {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR missing");
    let obs_file = Path::new(&manifest_dir).join("src").join("observability.rs");
    println!("cargo:rerun-if-changed={}", obs_file.display());
    if obs_file.exists() {
        let contents = fs::read_to_string(&obs_file)
            .unwrap_or_else(|e| panic!("Failed to read {}: {}", obs_file.display(), e));
        enforce_observability_guards(&contents, &obs_file);
    }
}

// Counters must stay aggregate: no addresses, identities, wall-clock time or log output.
fn enforce_observability_guards(contents: &str, path: &Path) {
    let forbidden = [
        "std::net",
        "SocketAddr",
        "IpAddr",
        "ContainerId",
        "ProfileId",
        "Destination",
        "SystemTime",
        "Instant",
        "tracing",
        "println!(",
        "eprintln!(",
    ];

    for token in forbidden {
        if contents.contains(token) {
            panic!(
                "Forbidden token `{}` in observability module: {}",
                token,
                path.display()
            );
        }
    }
}

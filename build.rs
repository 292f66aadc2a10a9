use std::env;

/// Forwards an optional `SCL_CYCLE_PER_US` build-time override into the crate
/// as `env!("SCL_CYCLE_PER_US")`. Left unset, `platform::time` falls back to
/// runtime self-calibration.
fn main() {
    println!("cargo:rerun-if-env-changed=SCL_CYCLE_PER_US");
    if let Ok(val) = env::var("SCL_CYCLE_PER_US") {
        println!("cargo:rustc-env=SCL_CYCLE_PER_US={val}");
    }
}

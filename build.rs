//! Build script for gpustage.
//!
//! Reports enabled backends and integration features so misconfigured
//! builds are obvious at compile time.

use std::env;

fn main() {
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_VULKAN");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_BEVY");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_PARKING_LOT");

    let vulkan_enabled = env::var("CARGO_FEATURE_VULKAN").is_ok();
    let bevy_enabled = env::var("CARGO_FEATURE_BEVY").is_ok();
    let parking_lot_enabled = env::var("CARGO_FEATURE_PARKING_LOT").is_ok();

    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    let is_release = profile == "release";

    // =========================================================================
    // Backend selection
    // =========================================================================

    if vulkan_enabled {
        emit_info("Vulkan backend enabled (ash)");
    } else if is_release {
        emit_warning("No GPU backend enabled in a release build");
        emit_note("Only DummyDevice is available. Enable the backend with:");
        emit_note("  gpustage = { version = \"0.1\", features = [\"vulkan\"] }");
    }

    // =========================================================================
    // Integrations
    // =========================================================================

    if bevy_enabled {
        emit_info("Bevy integration enabled");
        emit_note("Add GpuStagePlugin to your App to flush staged uploads in Last:");
        emit_note("  app.add_plugins(gpustage::bevy::GpuStagePlugin::new(device, config))");
    }

    if parking_lot_enabled {
        emit_info("Using parking_lot for backend mutexes");
    }

    check_target();
}

fn emit_info(msg: &str) {
    println!("cargo:warning=[gpustage] {}", msg);
}

fn emit_note(msg: &str) {
    println!("cargo:warning=[gpustage]    {}", msg);
}

fn emit_warning(msg: &str) {
    println!("cargo:warning=[gpustage] warning: {}", msg);
}

fn check_target() {
    let target = env::var("TARGET").unwrap_or_default();

    if target.contains("wasm") && env::var("CARGO_FEATURE_VULKAN").is_ok() {
        emit_warning("the vulkan feature has no loader on WebAssembly targets");
    }
}

// build.rs
// Compiles the GLSL sources under assets/shaders into target/shaders

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

const RASTER_STAGES: &[&str] = &["vert", "frag", "comp", "geom"];
const RAY_TRACING_STAGES: &[&str] = &["rgen", "rmiss", "rchit", "rahit"];

fn main() {
    println!("cargo:rerun-if-changed=../../assets/shaders");
    println!("cargo:rerun-if-env-changed=VULKAN_SDK");
    println!("cargo:rerun-if-env-changed=SKIP_SHADERS");

    if env::var("SKIP_SHADERS").is_ok() {
        eprintln!("info: Skipping shader compilation (SKIP_SHADERS set)");
        return;
    }

    let Ok(vulkan_sdk) = env::var("VULKAN_SDK") else {
        eprintln!("warning: VULKAN_SDK not set, shader compilation skipped");
        eprintln!("hint: Install Vulkan SDK and set VULKAN_SDK environment variable");
        return;
    };

    let glslc = if cfg!(target_os = "windows") {
        format!("{}\\Bin\\glslc.exe", vulkan_sdk)
    } else {
        format!("{}/bin/glslc", vulkan_sdk)
    };
    if !Path::new(&glslc).exists() {
        eprintln!("error: glslc not found at: {}", glslc);
        panic!("Shader compiler not found");
    }

    let shader_dir = PathBuf::from("../../assets/shaders");
    let target_dir = PathBuf::from("../../target/shaders");
    if let Err(e) = std::fs::create_dir_all(&target_dir) {
        eprintln!("warning: Failed to create target directory: {}", e);
        return;
    }

    let entries = match std::fs::read_dir(&shader_dir) {
        Ok(entries) => entries,
        Err(_) => {
            eprintln!("info: No shader directory found at: {:?}", shader_dir);
            return;
        }
    };

    let mut compiled = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
            continue;
        };
        let ray_tracing = RAY_TRACING_STAGES.contains(&ext);
        if !ray_tracing && !RASTER_STAGES.contains(&ext) {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        // simple_shader.vert -> simple_shader.vert.spv
        let out_file = target_dir.join(format!("{}.spv", file_name));
        if is_up_to_date(&path, &out_file) {
            continue;
        }

        let mut command = Command::new(&glslc);
        if ray_tracing {
            command.arg("--target-env=vulkan1.2");
        }
        let status = command.arg(&path).arg("-o").arg(&out_file).status();
        match status {
            Ok(s) if s.success() => {
                eprintln!("info: Compiled {} -> {:?}", file_name, out_file);
                compiled += 1;
            }
            Ok(s) => {
                eprintln!("error: glslc failed for {} with exit code: {}", file_name, s.code().unwrap_or(-1));
                panic!("Shader compilation failed");
            }
            Err(e) => {
                eprintln!("error: Failed to run glslc for {}: {}", file_name, e);
                panic!("Failed to execute shader compiler");
            }
        }
    }

    if compiled > 0 {
        eprintln!("info: Successfully compiled {} shader(s)", compiled);
    } else {
        eprintln!("info: All shaders are up to date");
    }
}

fn is_up_to_date(source: &Path, output: &Path) -> bool {
    let modified = |path: &Path| std::fs::metadata(path).and_then(|meta| meta.modified()).ok();
    match (modified(source), modified(output)) {
        (Some(src), Some(dst)) => src <= dst,
        _ => false,
    }
}

//! Lumen editor
//!
//! Opens a demo scene in the editor viewport. Left click selects the mesh
//! under the cursor, Escape clears the selection. An optional `.toml` or
//! `.ron` config path may be passed as the first argument.

use lumen_engine::config::Config;
use lumen_engine::foundation::logging;
use lumen_engine::prelude::*;
use lumen_engine::render::backends::vulkan::{CommandRecorder, VulkanResult};
use lumen_engine::render::FrameInfo;

/// Tracks what the viewport shows for the status log
#[derive(Default)]
struct EditorOverlay {
    last_selected: Option<Entity>,
}

impl UiOverlay for EditorOverlay {
    fn record(&mut self, frame: &FrameInfo, _recorder: &mut CommandRecorder) -> VulkanResult<()> {
        if frame.selected != self.last_selected {
            let name = frame
                .selected
                .and_then(|entity| frame.scene.get::<NameComponent>(entity))
                .map_or("nothing", |name| name.0.as_str());
            log::info!("Selected {}", name);
            self.last_selected = frame.selected;
        }
        Ok(())
    }
}

fn load_config() -> Result<ApplicationConfig, AppError> {
    match std::env::args().nth(1) {
        Some(path) => {
            log::info!("Loading config from {}", path);
            Ok(ApplicationConfig::load_from_file(path)?)
        }
        None => Ok(ApplicationConfig::default()),
    }
}

fn build_demo_scene(app: &mut Application) -> Result<(), AppError> {
    let (scene, renderer) = app.scene_and_renderer();
    let cube = renderer.upload_mesh(&Mesh::cube(Vec3::new(0.85, 0.35, 0.2)))?;
    let floor = renderer.upload_mesh(&Mesh::quad(Vec3::new(0.6, 0.6, 0.65)))?;

    let ground = scene.create_entity();
    scene.insert(ground, NameComponent("floor".to_string()));
    scene.insert(ground, TransformComponent::default().with_uniform_scale(12.0));
    scene.insert(ground, MeshComponent { mesh: floor });

    for (index, x) in [-2.0, 0.0, 2.0].into_iter().enumerate() {
        let entity = scene.create_entity();
        scene.insert(entity, NameComponent(format!("cube {}", index)));
        let yaw = Quat::from_axis_angle(&Vec3::y_axis(), 0.4 * index as f32);
        scene.insert(
            entity,
            TransformComponent::from_position(Vec3::new(x, 0.5, 0.0)).with_rotation(yaw),
        );
        scene.insert(entity, MeshComponent { mesh: cube });
    }

    for (position, color) in [
        (Vec3::new(-3.0, 3.0, 2.0), Vec3::new(1.0, 0.85, 0.7)),
        (Vec3::new(3.0, 2.5, -1.5), Vec3::new(0.5, 0.6, 1.0)),
    ] {
        let light = scene.create_entity();
        scene.insert(light, NameComponent("light".to_string()));
        scene.insert(light, TransformComponent::from_position(position));
        scene.insert(
            light,
            PointLightComponent {
                color,
                intensity: 4.0,
                radius: 12.0,
            },
        );
    }

    let mut view = Camera::perspective(Vec3::new(0.0, 3.5, 7.0), 55.0, 16.0 / 9.0, 0.1, 100.0);
    view.look_at(Vec3::zeros(), Vec3::y());
    let camera = scene.create_entity();
    scene.insert(camera, NameComponent("camera".to_string()));
    scene.insert(camera, CameraComponent { camera: view });
    log::info!(
        "Demo scene: {} entities, {} viewport",
        scene.len(),
        if renderer.ray_tracing_active() { "ray traced" } else { "raster" }
    );
    Ok(())
}

fn run() -> Result<(), AppError> {
    let config = load_config()?;
    logging::init(&config.engine.log_level);
    let mut app = Application::new(&config)?;
    build_demo_scene(&mut app)?;
    app.run(&mut EditorOverlay::default())
}

fn main() {
    if let Err(e) = run() {
        log::error!("Editor failed: {}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

//! End-to-end frames on a real device
//!
//! These need a Vulkan driver, a display and compiled shaders:
//! `cargo test -p lumen_engine -- --ignored`

use std::path::PathBuf;

use approx::assert_relative_eq;
use ash::vk;
use lumen_engine::prelude::*;

fn test_config() -> RendererConfig {
    let mut config = RendererConfig::new("lumen gpu tests");
    // Integration tests run from the crate directory
    config.shader_dirs = vec![PathBuf::from("../../target/shaders"), PathBuf::from("../../assets/shaders")];
    config
}

fn camera_for(extent: vk::Extent2D) -> Camera {
    let aspect = extent.width as f32 / extent.height.max(1) as f32;
    let mut camera = Camera::perspective(Vec3::new(0.0, 1.5, 6.0), 60.0, aspect, 0.1, 100.0);
    camera.look_at(Vec3::zeros(), Vec3::y());
    camera
}

fn draw(renderer: &mut Renderer, window: &mut Window, scene: &Scene) -> FrameOutcome {
    window.poll_events(|_| {});
    let camera = camera_for(renderer.viewport_extent());
    renderer
        .draw_frame(window, scene, &camera, 1.0 / 60.0, &mut ())
        .expect("frame should record and present")
}

#[test]
#[ignore = "needs a Vulkan device and a display"]
fn test_resize_between_frames_rebuilds_offscreen_targets() {
    let mut window = Window::new("resize", 1280, 720).expect("window");
    let mut renderer = Renderer::new(&mut window, &test_config()).expect("renderer");
    let scene = Scene::new();

    for _ in 0..3 {
        draw(&mut renderer, &mut window, &scene);
    }
    window.set_size(640, 480);
    for _ in 0..3 {
        draw(&mut renderer, &mut window, &scene);
    }
    renderer.wait_idle().expect("idle");

    let viewport = renderer.systems().viewport_ref();
    let extent = renderer.target_extent(viewport).expect("viewport target");
    assert_eq!((extent.width, extent.height), (640, 480));
    assert_eq!(renderer.viewport_extent(), extent);
}

#[test]
#[ignore = "needs a Vulkan device and a display"]
fn test_selection_stencils_and_outlines_one_entity() {
    let mut window = Window::new("selection", 1280, 720).expect("window");
    let mut renderer = Renderer::new(&mut window, &test_config()).expect("renderer");
    let cube = renderer.upload_mesh(&Mesh::cube(Vec3::new(0.6, 0.6, 0.6))).expect("upload");

    let mut scene = Scene::new();
    let first = scene.create_entity();
    scene.insert(first, TransformComponent::from_position(Vec3::new(-1.5, 0.0, 0.0)));
    scene.insert(first, MeshComponent { mesh: cube });
    let second = scene.create_entity();
    scene.insert(second, TransformComponent::from_position(Vec3::new(1.5, 0.0, 0.0)));
    scene.insert(second, MeshComponent { mesh: cube });

    renderer.select(Some(second));
    draw(&mut renderer, &mut window, &scene);

    let systems = renderer.systems();
    let stats = systems.depth_prepass.last_stats();
    assert_eq!(stats.fill_draws, 2);
    assert_eq!(stats.stencil_draws, 1);

    let (outlined, model) = systems.outline.last_outlined().expect("outline drawn");
    assert_eq!(outlined, second);
    let expected = TransformComponent::from_position(Vec3::new(1.5, 0.0, 0.0)).matrix();
    assert_relative_eq!(model[(0, 0)], expected[(0, 0)] * 1.02, epsilon = 1e-5);
    assert_relative_eq!(model[(0, 3)], expected[(0, 3)], epsilon = 1e-5);
}

#[test]
#[ignore = "needs a Vulkan device and a display"]
fn test_pick_at_cursor_reports_entity_in_front() {
    let mut window = Window::new("picking", 800, 600).expect("window");
    let mut renderer = Renderer::new(&mut window, &test_config()).expect("renderer");
    let cube = renderer.upload_mesh(&Mesh::cube(Vec3::new(0.2, 0.7, 0.3))).expect("upload");

    let mut scene = Scene::new();
    let entity = scene.create_entity();
    scene.insert(entity, TransformComponent::default().with_uniform_scale(2.0));
    scene.insert(entity, MeshComponent { mesh: cube });

    let extent = renderer.viewport_extent();
    renderer.request_pick((f64::from(extent.width) / 2.0, f64::from(extent.height) / 2.0));

    let mut result = None;
    for _ in 0..4 {
        draw(&mut renderer, &mut window, &scene);
        result = renderer.take_pick_result().or(result);
        if !renderer.pick_pending() {
            break;
        }
    }
    renderer.wait_idle().expect("idle");
    draw(&mut renderer, &mut window, &scene);
    let result = renderer.take_pick_result().or(result);
    assert_eq!(result, Some(PickResult::Hit(entity)));
}
